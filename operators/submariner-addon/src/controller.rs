//! 控制器模块
//!
//! 把 `submariner-controller` 中的协调逻辑接入 kube-runtime：每类资源一个
//! Controller，同一对象的协调串行执行，不同对象之间并行。相关资源的变化通过
//! `watches` 映射回主资源，从而保持电平触发。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::api::{ApiResource, DynamicObject};
use kube::runtime::controller::Action;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};
use submariner_common::constants::{
    ADDON_NAME, ADDON_WORK_LABEL, BROKER_CLUSTER_LABEL, BROKER_CLUSTER_SET_LABEL,
    CSR_ADDON_LABEL, SUBMARINER_CR_NAME,
};
use submariner_common::error::{Error, Result};
use submariner_common::models::{
    ManagedCluster, ManagedClusterAddOn, ManagedClusterSet, ManifestWork, Submariner,
};
use submariner_common::store::KubeStore;
use submariner_controller::{
    AddOnConfig, AgentWorkController, BrokerController, BrokerState, CsrApprovalController,
    ManifestRenderer, RegistrationController, StatusAggregator,
};
use tracing::{debug, error, info, warn};

use crate::Shutdown;

/// 控制器运行 future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

const BROKER_NAMESPACE_SUFFIX: &str = "-broker";

/// Watch 超时（秒），需小于客户端读超时
const WATCH_TIMEOUT_SECS: u32 = 25;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Hub 控制器共享的上下文
pub struct HubContext {
    pub brokers: BrokerController<KubeStore>,
    pub agents: AgentWorkController<KubeStore>,
    pub registration: RegistrationController<KubeStore>,
    pub csr: CsrApprovalController<KubeStore>,
    pub config: Arc<AddOnConfig>,
}

impl HubContext {
    pub fn new(client: Client, renderer: Arc<ManifestRenderer>, config: Arc<AddOnConfig>) -> Self {
        let store = Arc::new(KubeStore::new(client));
        Self {
            brokers: BrokerController::new(Arc::clone(&store), Arc::clone(&renderer)),
            agents: AgentWorkController::new(
                Arc::clone(&store),
                Arc::clone(&renderer),
                Arc::clone(&config),
            ),
            registration: RegistrationController::new(Arc::clone(&store), renderer),
            csr: CsrApprovalController::new(store),
            config,
        }
    }
}

/// Agent 控制器上下文
pub struct AgentContext {
    pub aggregator: StatusAggregator<KubeStore>,
    pub cluster_name: String,
    pub config: Arc<AddOnConfig>,
}

/// 错误处理策略：构建期契约错误不重试，其余错误延迟重新入队
fn requeue_on_error(kind: &str, name: &str, error: &Error, config: &AddOnConfig) -> Action {
    if error.is_permanent() {
        error!(kind, name, error = %error, "协调失败且不可重试，等待资源变化");
        return Action::await_change();
    }
    warn!(
        kind,
        name,
        error = %error,
        retry_secs = config.error_requeue_seconds,
        "协调失败，稍后重试"
    );
    Action::requeue(config.error_requeue_interval())
}

fn hub_error_policy<K>(object: Arc<K>, error: &Error, ctx: Arc<HubContext>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    requeue_on_error(&K::kind(&()), &object.name_any(), error, &ctx.config)
}

fn agent_error_policy(object: Arc<DynamicObject>, error: &Error, ctx: Arc<AgentContext>) -> Action {
    requeue_on_error("Submariner", &object.name_any(), error, &ctx.config)
}

async fn reconcile_broker(set: Arc<ManagedClusterSet>, ctx: Arc<HubContext>) -> Result<Action> {
    let state = ctx.brokers.reconcile(&set.name_any()).await?;
    Ok(match state {
        BrokerState::Present | BrokerState::Absent => Action::requeue(ctx.config.requeue_interval()),
        BrokerState::Provisioning | BrokerState::Terminating => {
            Action::requeue(ctx.config.error_requeue_interval())
        }
    })
}

async fn reconcile_agent(cluster: Arc<ManagedCluster>, ctx: Arc<HubContext>) -> Result<Action> {
    let state = ctx.agents.reconcile(&cluster.name_any()).await?;
    if state.is_waiting() {
        debug!(cluster = %cluster.name_any(), ?state, "Agent 等待中");
        return Ok(Action::requeue(ctx.config.error_requeue_interval()));
    }
    Ok(Action::requeue(ctx.config.requeue_interval()))
}

async fn reconcile_registration(addon: Arc<ManagedClusterAddOn>, ctx: Arc<HubContext>) -> Result<Action> {
    let Some(cluster) = addon.namespace() else {
        return Ok(Action::await_change());
    };
    ctx.registration.reconcile(&cluster).await?;
    Ok(Action::requeue(ctx.config.requeue_interval()))
}

async fn reconcile_csr(csr: Arc<CertificateSigningRequest>, ctx: Arc<HubContext>) -> Result<Action> {
    if ctx.csr.reconcile(&csr.name_any()).await? {
        return Ok(Action::await_change());
    }
    Ok(Action::requeue(ctx.config.requeue_interval()))
}

async fn reconcile_submariner(submariner: Arc<DynamicObject>, ctx: Arc<AgentContext>) -> Result<Action> {
    ctx.aggregator
        .aggregate(&ctx.cluster_name, submariner.data.get("status"))
        .await?;
    Ok(Action::requeue(ctx.config.requeue_interval()))
}

fn all_refs<K>(store: &Store<K>) -> Vec<ObjectRef<K>>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store
        .state()
        .iter()
        .map(|object| ObjectRef::from_obj(object.as_ref()))
        .collect()
}

/// Broker 命名空间 -> ClusterSet
fn set_of_namespace(namespace: Namespace) -> Option<ObjectRef<ManagedClusterSet>> {
    namespace
        .labels()
        .get(BROKER_CLUSTER_SET_LABEL)
        .map(|set| ObjectRef::new(set))
}

/// `<set>-broker` 中的 RoleBinding -> ClusterSet
fn set_of_binding(binding: RoleBinding) -> Option<ObjectRef<ManagedClusterSet>> {
    binding
        .namespace()
        .and_then(|ns| ns.strip_suffix(BROKER_NAMESPACE_SUFFIX).map(ObjectRef::new))
}

/// 集群命名空间中的对象 -> ManagedCluster
fn cluster_of_namespace<K: Resource>(object: &K) -> Option<ObjectRef<ManagedCluster>> {
    object.namespace().map(|ns| ObjectRef::new(&ns))
}

/// Broker 中的集群令牌 -> ManagedCluster
fn cluster_of_secret(secret: Secret) -> Option<ObjectRef<ManagedCluster>> {
    secret
        .labels()
        .get(BROKER_CLUSTER_LABEL)
        .map(|cluster| ObjectRef::new(cluster))
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(std::result::Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => debug!(?action, "{} 协调完成", controller_name),
            Err(e) => error!(error = ?e, "{} 协调出错", controller_name),
        }
        std::future::ready(())
    }
}

/// 构建 Hub 上的所有控制器
pub fn build_hub_controllers(
    client: Client,
    ctx: Arc<HubContext>,
    shutdown: Shutdown,
) -> Vec<ControllerFuture> {
    let broker_ctrl = Controller::new(Api::<ManagedClusterSet>::all(client.clone()), watcher_config());
    let sets = broker_ctrl.store();
    let broker_ctrl = broker_ctrl
        .watches(
            Api::<ManagedCluster>::all(client.clone()),
            watcher_config(),
            move |_cluster| all_refs(&sets),
        )
        .watches(
            Api::<Namespace>::all(client.clone()),
            watcher_config().labels(BROKER_CLUSTER_SET_LABEL),
            set_of_namespace,
        )
        .watches(
            Api::<RoleBinding>::all(client.clone()),
            watcher_config().labels(BROKER_CLUSTER_LABEL),
            set_of_binding,
        )
        .graceful_shutdown_on(shutdown.clone())
        .run(reconcile_broker, hub_error_policy::<ManagedClusterSet>, Arc::clone(&ctx))
        .for_each(log_reconcile_result("Broker"));

    let agent_ctrl = Controller::new(Api::<ManagedCluster>::all(client.clone()), watcher_config());
    let clusters = agent_ctrl.store();
    let clusters_for_namespaces = clusters.clone();
    let agent_ctrl = agent_ctrl
        .watches(
            Api::<ManagedClusterAddOn>::all(client.clone()),
            watcher_config(),
            |addon| cluster_of_namespace(&addon),
        )
        .watches(
            Api::<ManifestWork>::all(client.clone()),
            watcher_config().labels(&format!("{ADDON_WORK_LABEL}=true")),
            |work| cluster_of_namespace(&work),
        )
        .watches(
            Api::<ManagedClusterSet>::all(client.clone()),
            watcher_config(),
            move |_set| all_refs(&clusters),
        )
        .watches(
            Api::<Namespace>::all(client.clone()),
            watcher_config().labels(BROKER_CLUSTER_SET_LABEL),
            move |_namespace| all_refs(&clusters_for_namespaces),
        )
        .watches(
            Api::<Secret>::all(client.clone()),
            watcher_config().labels(BROKER_CLUSTER_LABEL),
            cluster_of_secret,
        )
        .graceful_shutdown_on(shutdown.clone())
        .run(reconcile_agent, hub_error_policy::<ManagedCluster>, Arc::clone(&ctx))
        .for_each(log_reconcile_result("Agent"));

    let registration_ctrl = Controller::new(
        Api::<ManagedClusterAddOn>::all(client.clone()),
        watcher_config().fields(&format!("metadata.name={ADDON_NAME}")),
    )
    .watches(
        Api::<ManagedCluster>::all(client.clone()),
        watcher_config(),
        |cluster| Some(ObjectRef::new(ADDON_NAME).within(&cluster.name_any())),
    )
    .graceful_shutdown_on(shutdown.clone())
    .run(
        reconcile_registration,
        hub_error_policy::<ManagedClusterAddOn>,
        Arc::clone(&ctx),
    )
    .for_each(log_reconcile_result("Registration"));

    let csr_ctrl = Controller::new(
        Api::<CertificateSigningRequest>::all(client),
        watcher_config().labels(&format!("{CSR_ADDON_LABEL}={ADDON_NAME}")),
    )
    .graceful_shutdown_on(shutdown)
    .run(reconcile_csr, hub_error_policy::<CertificateSigningRequest>, ctx)
    .for_each(log_reconcile_result("CSR"));

    info!("- Broker 控制器");
    info!("- Agent ManifestWork 控制器");
    info!("- 注册控制器");
    info!("- CSR 审批控制器");

    vec![
        Box::pin(broker_ctrl),
        Box::pin(agent_ctrl),
        Box::pin(registration_ctrl),
        Box::pin(csr_ctrl),
    ]
}

/// 构建托管集群上的状态汇聚控制器
///
/// Submariner 资源以 `DynamicObject` 读取，格式错误的状态不会阻断 watch。
pub fn build_agent_controller(
    local: Client,
    hub: Client,
    cluster_name: String,
    config: Arc<AddOnConfig>,
    shutdown: Shutdown,
) -> ControllerFuture {
    let resource = ApiResource::erase::<Submariner>(&());
    let submariners = Api::<DynamicObject>::all_with(local, &resource);
    let ctx = Arc::new(AgentContext {
        aggregator: StatusAggregator::new(Arc::new(KubeStore::new(hub))),
        cluster_name,
        config,
    });

    Box::pin(
        Controller::new_with(
            submariners,
            watcher_config().fields(&format!("metadata.name={SUBMARINER_CR_NAME}")),
            resource,
        )
        .graceful_shutdown_on(shutdown)
        .run(reconcile_submariner, agent_error_policy, ctx)
        .for_each(log_reconcile_result("Submariner")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use kube::runtime::reflector::store::Writer;
    use kube::runtime::watcher::Event;
    use submariner_common::constants::broker_namespace;

    fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_broker_objects_map_to_cluster_set() {
        let mut namespace = Namespace {
            metadata: meta(&broker_namespace("set1"), None),
            ..Default::default()
        };
        namespace.metadata.labels =
            Some([(BROKER_CLUSTER_SET_LABEL.to_string(), "set1".to_string())].into());
        assert_eq!(set_of_namespace(namespace), Some(ObjectRef::new("set1")));

        let unlabeled = Namespace {
            metadata: meta("default", None),
            ..Default::default()
        };
        assert_eq!(set_of_namespace(unlabeled), None);

        let binding = RoleBinding {
            metadata: meta("cluster-c1", Some(&broker_namespace("set1"))),
            ..Default::default()
        };
        assert_eq!(set_of_binding(binding), Some(ObjectRef::new("set1")));

        let stray = RoleBinding {
            metadata: meta("cluster-c1", Some("kube-system")),
            ..Default::default()
        };
        assert_eq!(set_of_binding(stray), None);
    }

    #[test]
    fn test_cluster_scoped_objects_map_to_cluster() {
        let work = ManifestWork {
            metadata: meta("submariner-operator", Some("c1")),
            spec: Default::default(),
            status: None,
        };
        assert_eq!(cluster_of_namespace(&work), Some(ObjectRef::new("c1")));

        let mut secret = Secret {
            metadata: meta("cluster-c2-token", Some(&broker_namespace("set1"))),
            ..Default::default()
        };
        secret.metadata.labels = Some([(BROKER_CLUSTER_LABEL.to_string(), "c2".to_string())].into());
        assert_eq!(cluster_of_secret(secret), Some(ObjectRef::new("c2")));
    }

    #[test]
    fn test_all_refs_enumerates_store() {
        let mut writer = Writer::<ManagedClusterSet>::default();
        for name in ["a", "b"] {
            writer.apply_watcher_event(&Event::Applied(ManagedClusterSet {
                metadata: meta(name, None),
                spec: Default::default(),
                status: None,
            }));
        }
        let store = writer.as_reader();

        let mut names: Vec<String> = all_refs(&store).into_iter().map(|r| r.name).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }
}
