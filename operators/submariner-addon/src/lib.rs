//! Submariner Addon Operator - 在 Hub 与托管集群上运行协调循环
//!
//! Hub 侧运行 Broker、Agent ManifestWork、注册与证书审批四个控制器，
//! 通过 Lease 选主保证同一时间只有一个实例在写；托管集群侧运行 Agent，
//! 把本地 Submariner 资源的状态汇聚到 Hub 上的 Addon。

pub mod controller;
pub mod leader;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use kube::Client;
use submariner_controller::{AddOnConfig, ManifestRenderer};
use tokio::sync::oneshot;
use tracing::info;

/// 可被多个控制器同时等待的关闭信号
pub type Shutdown = Shared<BoxFuture<'static, ()>>;

/// 创建关闭信号；触发端被丢弃同样视为关闭
pub fn shutdown_channel() -> (oneshot::Sender<()>, Shutdown) {
    let (tx, rx) = oneshot::channel::<()>();
    let shutdown = async move {
        let _ = rx.await;
    }
    .boxed()
    .shared();
    (tx, shutdown)
}

/// Hub 侧 Operator
pub struct HubOperator {
    /// Kubernetes 客户端
    client: Client,
    /// Addon 配置
    config: Arc<AddOnConfig>,
    /// 清单渲染器
    renderer: Arc<ManifestRenderer>,
}

impl HubOperator {
    /// 创建新的 Operator 实例
    pub fn new(client: Client, config: AddOnConfig) -> Result<Self> {
        let renderer = ManifestRenderer::new().context("加载内置清单模板失败")?;
        Ok(Self {
            client,
            config: Arc::new(config),
            renderer: Arc::new(renderer),
        })
    }

    /// 运行所有 Hub 控制器直到收到关闭信号
    pub async fn run(self, shutdown: Shutdown) {
        let ctx = Arc::new(controller::HubContext::new(
            self.client.clone(),
            self.renderer,
            self.config,
        ));
        let controllers = controller::build_hub_controllers(self.client, ctx, shutdown);
        info!(count = controllers.len(), "Hub 控制器已启动");
        futures::future::join_all(controllers).await;
        info!("Hub 控制器已停止");
    }
}

/// 托管集群侧 Agent
pub struct AgentOperator {
    /// 托管集群客户端
    local: Client,
    /// Hub 客户端
    hub: Client,
    /// 本集群在 Hub 上的名称
    cluster_name: String,
    /// Addon 配置
    config: Arc<AddOnConfig>,
}

impl AgentOperator {
    pub fn new(local: Client, hub: Client, cluster_name: String, config: AddOnConfig) -> Self {
        Self {
            local,
            hub,
            cluster_name,
            config: Arc::new(config),
        }
    }

    /// 运行状态汇聚控制器直到收到关闭信号
    pub async fn run(self, shutdown: Shutdown) {
        info!(cluster = %self.cluster_name, "Agent 已启动");
        controller::build_agent_controller(
            self.local,
            self.hub,
            self.cluster_name,
            self.config,
            shutdown,
        )
        .await;
        info!("Agent 已停止");
    }
}
