//! Broker 生命周期
//!
//! 每个 ClusterSet 对应一个 Broker 命名空间 `<clusterset>-broker`。ClusterSet 有
//! 成员时创建命名空间、CRD、集群 Role、IPsec 预共享密钥以及 Broker 资源；
//! ClusterSet 被删除或失去最后一个成员时进入清理流程，只有在命名空间中不再有
//! 引用现存集群的 RoleBinding 时才移除命名空间上的清理 Finalizer。
//!
//! 协调是电平触发的：每次都根据重新观察到的状态推导动作，可以被任意次重复调用。

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::{Resource, ResourceExt};
use submariner_common::constants::{
    broker_cluster_account, broker_cluster_token_secret, broker_namespace, ADDON_NAME,
    BROKER_CLEANUP_FINALIZER, BROKER_CLUSTER_LABEL, CLUSTER_SET_FINALIZER, IPSEC_PSK_LENGTH,
    IPSEC_PSK_SECRET,
};
use submariner_common::error::{Error, Result};
use submariner_common::models::{ClusterManagementAddOn, ManagedCluster, ManagedClusterSet};
use submariner_common::store::{
    add_finalizer, delete_ignore_not_found, remove_finalizer, ObjectStore,
};
use tracing::{debug, info};

use crate::manifests::{assets, BrokerConfig, ManifestObject, ManifestRenderer};
use crate::utils::generate_psk;

/// Broker 的生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// 不存在
    Absent,
    /// 创建中（等待上一轮的命名空间删除完成，或资源尚未全部就绪）
    Provisioning,
    /// 已就绪
    Present,
    /// 清理中
    Terminating,
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BrokerState::Absent => "Absent",
            BrokerState::Provisioning => "Provisioning",
            BrokerState::Present => "Present",
            BrokerState::Terminating => "Terminating",
        };
        f.write_str(name)
    }
}

/// 根据观察到的资源推导 ClusterSet 的 Broker 状态
pub async fn observe_broker<S: ObjectStore>(store: &S, set_name: &str) -> Result<BrokerState> {
    let namespace_name = broker_namespace(set_name);
    let set = store.get::<ManagedClusterSet>(None, set_name).await?;
    let namespace = store.get::<Namespace>(None, &namespace_name).await?;

    let state = match (set, namespace) {
        (_, None) => BrokerState::Absent,
        (None, Some(_)) => BrokerState::Terminating,
        (Some(set), Some(_)) if set.is_deleting() => BrokerState::Terminating,
        (Some(_), Some(ns)) if ns.metadata.deletion_timestamp.is_some() => BrokerState::Terminating,
        (Some(_), Some(_)) => {
            if store
                .get::<Secret>(Some(&namespace_name), IPSEC_PSK_SECRET)
                .await?
                .is_some()
            {
                BrokerState::Present
            } else {
                BrokerState::Provisioning
            }
        }
    };
    Ok(state)
}

/// 删除 Broker 命名空间中某个集群的 RBAC 资源，不存在视为成功
pub async fn remove_cluster_rbac<S: ObjectStore>(
    store: &S,
    namespace: &str,
    cluster: &str,
) -> Result<()> {
    let account = broker_cluster_account(cluster);
    delete_ignore_not_found::<_, RoleBinding>(store, Some(namespace), &account).await?;
    delete_ignore_not_found::<_, Secret>(store, Some(namespace), &broker_cluster_token_secret(cluster))
        .await?;
    delete_ignore_not_found::<_, ServiceAccount>(store, Some(namespace), &account).await?;
    debug!(cluster, namespace, "已删除集群在 Broker 中的 RBAC");
    Ok(())
}

/// Broker 生命周期控制器
pub struct BrokerController<S> {
    store: Arc<S>,
    renderer: Arc<ManifestRenderer>,
}

impl<S: ObjectStore> BrokerController<S> {
    pub fn new(store: Arc<S>, renderer: Arc<ManifestRenderer>) -> Self {
        Self { store, renderer }
    }

    /// 协调一个 ClusterSet 的 Broker
    pub async fn reconcile(&self, set_name: &str) -> Result<BrokerState> {
        let namespace = broker_namespace(set_name);
        let set = self.store.get::<ManagedClusterSet>(None, set_name).await?;
        let clusters = self.store.list::<ManagedCluster>(None, None).await?;

        let state = match &set {
            Some(set) if !set.is_deleting() && !set.members(&clusters).is_empty() => {
                self.provision(set, &namespace).await?
            }
            _ => self.terminate(set.as_ref(), &namespace, &clusters).await?,
        };
        debug!(cluster_set = %set_name, %state, "Broker 协调完成");
        Ok(state)
    }

    async fn provision(&self, set: &ManagedClusterSet, namespace: &str) -> Result<BrokerState> {
        let store = self.store.as_ref();
        let set_name = set.name_any();

        add_finalizer(store, set, CLUSTER_SET_FINALIZER).await?;

        match store.get::<Namespace>(None, namespace).await? {
            Some(ns) if ns.metadata.deletion_timestamp.is_some() => {
                info!(cluster_set = %set_name, namespace, "等待上一个 Broker 命名空间删除完成");
                return Ok(BrokerState::Provisioning);
            }
            Some(_) => {}
            None => info!(cluster_set = %set_name, namespace, "ClusterSet 有成员，开始创建 Broker"),
        }

        let ctx = BrokerConfig {
            cluster_set_name: set_name,
            broker_namespace: namespace.to_string(),
            ipsec_psk: String::new(),
        };
        self.renderer
            .render_object(assets::BROKER_NAMESPACE, &ctx)?
            .apply(store)
            .await?;

        let owner = store
            .get::<ClusterManagementAddOn>(None, ADDON_NAME)
            .await?
            .and_then(|addon| addon.controller_owner_ref(&()));
        for asset in assets::BROKER_CRDS {
            let mut object = self.renderer.render_object(asset, &ctx)?;
            if let (Some(owner), ManifestObject::CustomResourceDefinition(crd)) = (&owner, &mut object) {
                crd.metadata.owner_references = Some(vec![owner.clone()]);
            }
            object.apply(store).await?;
        }

        self.renderer
            .render_object(assets::BROKER_CLUSTER_ROLE, &ctx)?
            .apply(store)
            .await?;
        self.ensure_psk(ctx.clone()).await?;
        self.renderer
            .render_object(assets::BROKER, &ctx)?
            .apply(store)
            .await?;

        Ok(BrokerState::Present)
    }

    /// 预共享密钥只在不存在时生成一次
    async fn ensure_psk(&self, mut ctx: BrokerConfig) -> Result<()> {
        let store = self.store.as_ref();
        if store
            .get::<Secret>(Some(&ctx.broker_namespace), IPSEC_PSK_SECRET)
            .await?
            .is_some()
        {
            return Ok(());
        }

        ctx.ipsec_psk = generate_psk(IPSEC_PSK_LENGTH);
        let ManifestObject::Secret(secret) = self.renderer.render_object(assets::BROKER_IPSEC_PSK, &ctx)? else {
            return Err(Error::Decode {
                asset: assets::BROKER_IPSEC_PSK.to_string(),
                message: "期望 Secret".to_string(),
            });
        };
        match store.create(&secret).await {
            Ok(_) => {
                info!(namespace = %ctx.broker_namespace, "已生成 IPsec 预共享密钥");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn terminate(
        &self,
        set: Option<&ManagedClusterSet>,
        namespace: &str,
        clusters: &[ManagedCluster],
    ) -> Result<BrokerState> {
        let store = self.store.as_ref();

        let Some(ns) = store.get::<Namespace>(None, namespace).await? else {
            if let Some(set) = set {
                if remove_finalizer(store, set, CLUSTER_SET_FINALIZER).await? {
                    info!(cluster_set = %set.name_any(), "Broker 已清理完成");
                }
            }
            return Ok(BrokerState::Absent);
        };

        let bindings = store
            .list::<RoleBinding>(Some(namespace), Some(BROKER_CLUSTER_LABEL))
            .await?;
        let mut waiting = Vec::new();
        for binding in &bindings {
            let cluster = binding
                .labels()
                .get(BROKER_CLUSTER_LABEL)
                .cloned()
                .unwrap_or_default();
            if clusters.iter().any(|c| c.name_any() == cluster) {
                waiting.push(cluster);
            } else {
                remove_cluster_rbac(store, namespace, &cluster).await?;
            }
        }
        if !waiting.is_empty() {
            info!(namespace, ?waiting, "Broker 中仍有现存集群的 RoleBinding，等待其移除");
            return Ok(BrokerState::Terminating);
        }

        if ns.metadata.deletion_timestamp.is_none() {
            info!(namespace, "删除 Broker 命名空间");
            delete_ignore_not_found::<_, Namespace>(store, None, namespace).await?;
        }
        if let Some(ns) = store.get::<Namespace>(None, namespace).await? {
            remove_finalizer(store, &ns, BROKER_CLEANUP_FINALIZER).await?;
        }

        if store.get::<Namespace>(None, namespace).await?.is_some() {
            debug!(namespace, "Broker 命名空间仍在删除中");
            return Ok(BrokerState::Terminating);
        }
        if let Some(set) = set {
            remove_finalizer(store, set, CLUSTER_SET_FINALIZER).await?;
        }
        info!(namespace, "Broker 已清理完成");
        Ok(BrokerState::Absent)
    }
}
