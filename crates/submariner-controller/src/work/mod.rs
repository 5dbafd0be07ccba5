//! Agent ManifestWork 协调
//!
//! 每个集群命名空间中最多有两个由本 Addon 管理的 ManifestWork：安装 Operator 的
//! `submariner-operator` 与实例化 Submariner 资源的 `submariner-resource`。
//! 协调是集合式的：计算期望的 Work，与观察到的 Work 对比，创建缺失的、按内容哈希
//! 更新变化的、删除不再需要的。
//!
//! 删除时先删除资源 Work，只有在其完全消失后才删除 Operator Work。带有外部
//! Finalizer 的 Work 只会被请求删除，Finalizer 永远由其所有者移除。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde_json::Value;
use submariner_common::constants::{
    broker_cluster_account, broker_cluster_token_secret, broker_namespace, ADDON_NAME,
    ADDON_WORK_LABEL, AGENT_CLEANUP_FINALIZER, BROKER_CLUSTER_LABEL, IPSEC_PSK_SECRET,
    MANIFEST_HASH_ANNOTATION, OPERATOR_WORK_NAME, RESOURCE_WORK_NAME,
};
use submariner_common::error::{Error, Result};
use submariner_common::models::{
    cluster_set_for, ManagedCluster, ManagedClusterAddOn, ManagedClusterSet, ManifestWork,
    ManifestWorkSpec, ManifestsTemplate, WorkDeletionState,
};
use submariner_common::store::{
    add_finalizer, apply, delete_ignore_not_found, remove_finalizer, ApplyOutcome, ObjectStore,
    StoreObject,
};
use tracing::{debug, info};

use crate::broker::{observe_broker, remove_cluster_rbac, BrokerState};
use crate::config::AddOnConfig;
use crate::manifests::{assets, ClusterRbacConfig, ManifestRenderer, OperatorConfig, SubmarinerConfig};
use crate::utils::{api_server_from_kubeconfig, encode_base64, manifests_hash, strip_scheme};

/// Hub 的 cluster-info 所在位置
const CLUSTER_INFO_NAMESPACE: &str = "kube-public";
const CLUSTER_INFO_NAME: &str = "cluster-info";

/// 单个集群上 Agent 的部署状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    /// 两个 ManifestWork 均已就位
    Deployed,
    /// 期望部署，但依赖尚未就绪
    Pending(String),
    /// 正在拆除，等待删除完成
    Deleting(String),
    /// 已拆除
    Absent,
}

impl AgentState {
    /// 是否需要尽快重新协调
    pub fn is_waiting(&self) -> bool {
        matches!(self, AgentState::Pending(_) | AgentState::Deleting(_))
    }
}

/// 单个 ManifestWork 的同步结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkSync {
    Applied(ApplyOutcome),
    Deleting,
}

/// 期望状态的判定结果
enum Desired {
    Deploy { set_name: String },
    Wait(String),
    Teardown,
}

/// Agent ManifestWork 控制器
pub struct AgentWorkController<S> {
    store: Arc<S>,
    renderer: Arc<ManifestRenderer>,
    config: Arc<AddOnConfig>,
}

impl<S: ObjectStore> AgentWorkController<S> {
    pub fn new(store: Arc<S>, renderer: Arc<ManifestRenderer>, config: Arc<AddOnConfig>) -> Self {
        Self {
            store,
            renderer,
            config,
        }
    }

    /// 协调一个集群的 Agent
    pub async fn reconcile(&self, cluster_name: &str) -> Result<AgentState> {
        let store = self.store.as_ref();
        let cluster = store.get::<ManagedCluster>(None, cluster_name).await?;
        let addon = store
            .get::<ManagedClusterAddOn>(Some(cluster_name), ADDON_NAME)
            .await?;

        let state = match self.desired(cluster.as_ref(), addon.as_ref()).await? {
            Desired::Deploy { set_name } => match (&cluster, &addon) {
                (Some(cluster), Some(addon)) => self.deploy(cluster, addon, &set_name).await?,
                _ => AgentState::Absent,
            },
            Desired::Wait(reason) => AgentState::Pending(reason),
            Desired::Teardown => {
                self.teardown(cluster_name, cluster.as_ref(), addon.as_ref())
                    .await?
            }
        };
        debug!(cluster = %cluster_name, ?state, "Agent 协调完成");
        Ok(state)
    }

    async fn desired(
        &self,
        cluster: Option<&ManagedCluster>,
        addon: Option<&ManagedClusterAddOn>,
    ) -> Result<Desired> {
        let (Some(cluster), Some(addon)) = (cluster, addon) else {
            return Ok(Desired::Teardown);
        };
        if cluster.is_deleting() || addon.is_deleting() {
            return Ok(Desired::Teardown);
        }

        let sets = self.store.list::<ManagedClusterSet>(None, None).await?;
        let Some(set) = cluster_set_for(cluster, &sets) else {
            return Ok(Desired::Teardown);
        };
        if set.is_deleting() {
            return Ok(Desired::Teardown);
        }

        let set_name = set.name_any();
        match observe_broker(self.store.as_ref(), &set_name).await? {
            BrokerState::Present => Ok(Desired::Deploy { set_name }),
            other => Ok(Desired::Wait(format!("ClusterSet {set_name} 的 Broker 状态为 {other}"))),
        }
    }

    async fn deploy(
        &self,
        cluster: &ManagedCluster,
        addon: &ManagedClusterAddOn,
        set_name: &str,
    ) -> Result<AgentState> {
        let store = self.store.as_ref();
        let cluster_name = cluster.name_any();
        let broker_ns = broker_namespace(set_name);

        // 上一轮拆除尚未完成时不重新部署，避免资源 Work 指向正在删除的 Operator
        for name in [OPERATOR_WORK_NAME, RESOURCE_WORK_NAME] {
            let live = store.get::<ManifestWork>(Some(&cluster_name), name).await?;
            if live.is_some_and(|work| work.metadata.deletion_timestamp.is_some()) {
                debug!(cluster = %cluster_name, work = name, "ManifestWork 正在删除，等待后再部署");
                return Ok(AgentState::Pending(format!("等待 {name} 删除完成")));
            }
        }

        add_finalizer(store, cluster, AGENT_CLEANUP_FINALIZER).await?;
        add_finalizer(store, addon, AGENT_CLEANUP_FINALIZER).await?;

        let rbac = ClusterRbacConfig {
            cluster_name: cluster_name.clone(),
            broker_namespace: broker_ns.clone(),
            account_name: broker_cluster_account(&cluster_name),
            token_secret_name: broker_cluster_token_secret(&cluster_name),
        };
        for object in self.renderer.render_objects(assets::CLUSTER_RBAC, &rbac)? {
            object.apply(store).await?;
        }
        self.remove_broker_rbac(&cluster_name, Some(&broker_ns)).await?;
        self.remove_unknown_works(&cluster_name).await?;

        let install_namespace = addon
            .spec
            .install_namespace
            .clone()
            .unwrap_or_else(|| self.config.install_namespace.clone());

        let operator = OperatorConfig {
            install_namespace: install_namespace.clone(),
            operator_image: self.config.operator_image.clone(),
            agent_image: self.config.agent_image.clone(),
            cluster_name: cluster_name.clone(),
        };
        let manifests = self
            .renderer
            .render_objects(assets::OPERATOR, &operator)?
            .iter()
            .map(|object| object.to_value())
            .collect::<Result<Vec<_>>>()?;
        let operator_sync = self
            .sync_work(&cluster_name, OPERATOR_WORK_NAME, manifests)
            .await?;

        let Some((token, ca)) = self.broker_credentials(&broker_ns, &cluster_name).await? else {
            return Ok(AgentState::Pending(format!(
                "等待 {broker_ns} 中集群 {cluster_name} 的令牌"
            )));
        };
        let resource = SubmarinerConfig {
            install_namespace,
            broker_api_server: self.hub_api_server().await?,
            broker_token: token,
            broker_ca: ca,
            broker_namespace: broker_ns.clone(),
            cable_driver: self.config.cable_driver.clone(),
            ipsec_psk: self.ipsec_psk(&broker_ns).await?,
            ipsec_ike_port: self.config.ipsec_ike_port,
            ipsec_natt_port: self.config.ipsec_natt_port,
            cluster_name: cluster_name.clone(),
            nat_enabled: self.config.nat_enabled,
        };
        let manifest = self
            .renderer
            .render_object(assets::SUBMARINER, &resource)?
            .to_value()?;
        let resource_sync = self
            .sync_work(&cluster_name, RESOURCE_WORK_NAME, vec![manifest])
            .await?;

        if operator_sync == WorkSync::Deleting || resource_sync == WorkSync::Deleting {
            return Ok(AgentState::Pending("等待旧的 ManifestWork 删除完成".to_string()));
        }
        Ok(AgentState::Deployed)
    }

    /// 按内容哈希创建或更新 ManifestWork；正在删除的 Work 不触碰
    async fn sync_work(&self, namespace: &str, name: &str, manifests: Vec<Value>) -> Result<WorkSync> {
        let hash = manifests_hash(&manifests)?;
        let live = self
            .store
            .get::<ManifestWork>(Some(namespace), name)
            .await?;

        if let Some(live) = &live {
            if live.metadata.deletion_timestamp.is_some() {
                debug!(cluster = namespace, work = name, "ManifestWork 正在删除，暂不更新");
                return Ok(WorkSync::Deleting);
            }
            if live.annotations().get(MANIFEST_HASH_ANNOTATION) == Some(&hash) {
                return Ok(WorkSync::Applied(ApplyOutcome::Unchanged));
            }
        }

        let desired = ManifestWork {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(ADDON_WORK_LABEL.to_string(), "true".to_string())])),
                annotations: Some(BTreeMap::from([(MANIFEST_HASH_ANNOTATION.to_string(), hash)])),
                ..Default::default()
            },
            spec: ManifestWorkSpec {
                workload: ManifestsTemplate { manifests },
                delete_option: None,
            },
            status: None,
        };
        let outcome = apply(self.store.as_ref(), &desired).await?;
        info!(cluster = namespace, work = name, ?outcome, "已同步 ManifestWork");
        Ok(WorkSync::Applied(outcome))
    }

    async fn broker_credentials(&self, broker_ns: &str, cluster: &str) -> Result<Option<(String, String)>> {
        let secret = self
            .store
            .get::<Secret>(Some(broker_ns), &broker_cluster_token_secret(cluster))
            .await?;
        let Some(data) = secret.and_then(|secret| secret.data) else {
            return Ok(None);
        };
        match (data.get("token"), data.get("ca.crt")) {
            (Some(token), Some(ca)) if !token.0.is_empty() => Ok(Some((
                String::from_utf8_lossy(&token.0).into_owned(),
                encode_base64(&ca.0),
            ))),
            _ => Ok(None),
        }
    }

    async fn ipsec_psk(&self, broker_ns: &str) -> Result<String> {
        self.store
            .get::<Secret>(Some(broker_ns), IPSEC_PSK_SECRET)
            .await?
            .and_then(|secret| secret.data)
            .and_then(|data| data.get("psk").map(|psk| encode_base64(&psk.0)))
            .ok_or_else(|| Error::InvalidObject(format!("{broker_ns}/{IPSEC_PSK_SECRET} 缺少 psk")))
    }

    async fn hub_api_server(&self) -> Result<String> {
        if let Some(server) = &self.config.hub_api_server {
            return Ok(strip_scheme(server).to_string());
        }
        let kubeconfig = self
            .store
            .get::<ConfigMap>(Some(CLUSTER_INFO_NAMESPACE), CLUSTER_INFO_NAME)
            .await?
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove("kubeconfig"))
            .ok_or_else(|| {
                Error::Config(format!(
                    "未配置 hub_api_server，且 {CLUSTER_INFO_NAMESPACE}/{CLUSTER_INFO_NAME} 不可用"
                ))
            })?;
        let server = api_server_from_kubeconfig(&kubeconfig)?;
        Ok(strip_scheme(&server).to_string())
    }

    /// 删除集群在 `keep` 以外的所有 Broker 命名空间中的 RBAC
    async fn remove_broker_rbac(&self, cluster: &str, keep: Option<&str>) -> Result<()> {
        let store = self.store.as_ref();
        let selector = format!("{BROKER_CLUSTER_LABEL}={cluster}");
        let mut namespaces = BTreeSet::new();
        namespaces.extend(namespaces_of(store.list::<RoleBinding>(None, Some(&selector)).await?));
        namespaces.extend(namespaces_of(store.list::<ServiceAccount>(None, Some(&selector)).await?));
        namespaces.extend(namespaces_of(store.list::<Secret>(None, Some(&selector)).await?));

        for namespace in namespaces.iter().filter(|ns| Some(ns.as_str()) != keep) {
            info!(cluster, namespace = %namespace, "删除集群在 Broker 中的 RBAC");
            remove_cluster_rbac(store, namespace, cluster).await?;
        }
        Ok(())
    }

    /// 删除带有本 Addon 标签、但名称不在期望集合中的 Work
    async fn remove_unknown_works(&self, cluster: &str) -> Result<()> {
        let selector = format!("{ADDON_WORK_LABEL}=true");
        let works = self
            .store
            .list::<ManifestWork>(Some(cluster), Some(&selector))
            .await?;
        for work in works {
            let name = work.name_any();
            if name != OPERATOR_WORK_NAME && name != RESOURCE_WORK_NAME {
                self.delete_work(cluster, &name).await?;
            }
        }
        Ok(())
    }

    /// 请求删除 Work 并返回重新观察到的删除状态
    async fn delete_work(&self, cluster: &str, name: &str) -> Result<WorkDeletionState> {
        let store = self.store.as_ref();
        let live = store.get::<ManifestWork>(Some(cluster), name).await?;
        if WorkDeletionState::observe(live.as_ref()) == WorkDeletionState::Active {
            info!(cluster, work = name, "删除 ManifestWork");
            delete_ignore_not_found::<_, ManifestWork>(store, Some(cluster), name).await?;
        }

        let state = WorkDeletionState::observe(
            store.get::<ManifestWork>(Some(cluster), name).await?.as_ref(),
        );
        if let WorkDeletionState::DeletingBlocked { finalizers } = &state {
            info!(cluster, work = name, ?finalizers, "ManifestWork 删除被 Finalizer 阻塞，等待");
        }
        Ok(state)
    }

    async fn teardown(
        &self,
        cluster_name: &str,
        cluster: Option<&ManagedCluster>,
        addon: Option<&ManagedClusterAddOn>,
    ) -> Result<AgentState> {
        let store = self.store.as_ref();

        self.remove_unknown_works(cluster_name).await?;

        let resource = self.delete_work(cluster_name, RESOURCE_WORK_NAME).await?;
        if !resource.is_clear() {
            return Ok(AgentState::Deleting(format!(
                "{RESOURCE_WORK_NAME} 状态为 {resource:?}"
            )));
        }
        let operator = self.delete_work(cluster_name, OPERATOR_WORK_NAME).await?;
        if !operator.is_clear() {
            return Ok(AgentState::Deleting(format!(
                "{OPERATOR_WORK_NAME} 状态为 {operator:?}"
            )));
        }

        self.remove_broker_rbac(cluster_name, None).await?;

        let mut released = false;
        if let Some(cluster) = cluster {
            released |= remove_finalizer(store, cluster, AGENT_CLEANUP_FINALIZER).await?;
        }
        if let Some(addon) = addon {
            released |= remove_finalizer(store, addon, AGENT_CLEANUP_FINALIZER).await?;
        }
        if released {
            info!(cluster = %cluster_name, "Agent 已拆除");
        }
        Ok(AgentState::Absent)
    }
}

fn namespaces_of<K: StoreObject>(objects: Vec<K>) -> impl Iterator<Item = String> {
    objects.into_iter().filter_map(|object| object.namespace())
}
