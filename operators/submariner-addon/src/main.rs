//! Submariner Addon - Hub 控制器与托管集群 Agent 的入口

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::{Args, Parser, Subcommand};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use submariner_common::KubeStore;
use submariner_controller::AddOnConfig;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use submariner_addon::leader::{LeaderElector, LeaseConfig, SystemClock};
use submariner_addon::{shutdown_channel, AgentOperator, HubOperator};

/// Submariner 集群集网络 Addon
#[derive(Parser, Debug)]
#[command(name = "submariner-addon", version, about, long_about = None)]
struct Cli {
    /// 日志级别，RUST_LOG 优先
    #[arg(long, default_value = "info")]
    log_level: String,

    /// 配置文件（YAML 或 JSON）
    #[arg(long, env = "SUBMARINER_ADDON_CONFIG")]
    config: Option<PathBuf>,

    /// 覆盖配置中的 Agent 镜像
    #[arg(long, env = "AGENT_IMAGE")]
    agent_image: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 在 Hub 上运行 Broker、ManifestWork、注册与证书审批控制器
    Hub(HubArgs),
    /// 在托管集群上运行状态汇聚 Agent
    Agent(AgentArgs),
}

#[derive(Args, Debug)]
struct HubArgs {
    /// 租约时长（秒）
    #[arg(long, default_value_t = 137)]
    lease_duration: u64,

    /// 续约截止时间（秒）
    #[arg(long, default_value_t = 107)]
    renew_deadline: u64,

    /// 获取与续约间隔（秒）
    #[arg(long, default_value_t = 26)]
    retry_period: u64,

    /// 选主租约所在命名空间
    #[arg(long, env = "POD_NAMESPACE", default_value = "open-cluster-management")]
    lease_namespace: String,

    /// 本实例标识
    #[arg(long, env = "POD_NAME", default_value = "submariner-addon")]
    identity: String,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// 本集群在 Hub 上的名称
    #[arg(long, env = "CLUSTER_NAME")]
    cluster_name: String,

    /// 访问 Hub 的 kubeconfig
    #[arg(long, env = "HUB_KUBECONFIG")]
    hub_kubeconfig: PathBuf,
}

const LEASE_NAME: &str = "submariner-addon-leader";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let mut config = AddOnConfig::load(cli.config.as_deref()).context("加载 Addon 配置失败")?;
    if let Some(image) = cli.agent_image {
        config.agent_image = image;
    }

    match cli.command {
        Command::Hub(args) => run_hub(args, config).await,
        Command::Agent(args) => run_agent(args, config).await,
    }
}

async fn run_hub(args: HubArgs, config: AddOnConfig) -> Result<()> {
    let client = Client::try_default()
        .await
        .context("创建 Kubernetes 客户端失败")?;

    info!(
        lease_duration_secs = args.lease_duration,
        renew_deadline_secs = args.renew_deadline,
        retry_period_secs = args.retry_period,
        "启动 Hub 控制器"
    );
    let elector = LeaderElector::new(
        Arc::new(KubeStore::new(client.clone())),
        SystemClock,
        LeaseConfig {
            name: LEASE_NAME.to_string(),
            namespace: args.lease_namespace,
            identity: args.identity,
            lease_duration: Duration::from_secs(args.lease_duration),
            renew_deadline: Duration::from_secs(args.renew_deadline),
            retry_period: Duration::from_secs(args.retry_period),
        },
    );

    tokio::select! {
        _ = elector.acquire() => {}
        _ = shutdown_signal() => {
            info!("获得领导权前收到退出信号");
            return Ok(());
        }
    }

    let operator = HubOperator::new(client, config)?;
    let (stop, shutdown) = shutdown_channel();
    let controllers = tokio::spawn(operator.run(shutdown));

    let lost = tokio::select! {
        _ = elector.hold() => true,
        _ = shutdown_signal() => false,
    };

    let _ = stop.send(());
    controllers.await.context("Hub 控制器异常退出")?;

    if lost {
        bail!("实例 {} 失去领导权", elector.identity());
    }
    if let Err(e) = elector.release().await {
        warn!(error = %e, "释放租约失败");
    }
    Ok(())
}

async fn run_agent(args: AgentArgs, config: AddOnConfig) -> Result<()> {
    let local = Client::try_default()
        .await
        .context("创建本地 Kubernetes 客户端失败")?;
    let hub = hub_client(&args.hub_kubeconfig).await?;

    let (stop, shutdown) = shutdown_channel();
    let agent = tokio::spawn(AgentOperator::new(local, hub, args.cluster_name, config).run(shutdown));

    shutdown_signal().await;
    let _ = stop.send(());
    agent.await.context("Agent 异常退出")?;
    Ok(())
}

async fn hub_client(path: &Path) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("读取 Hub kubeconfig {} 失败", path.display()))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("解析 Hub kubeconfig 失败")?;
    Client::try_from(config).context("创建 Hub 客户端失败")
}

/// 等待 SIGINT 或 SIGTERM
async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "无法监听 SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("收到 SIGINT"),
        _ = terminate => info!("收到 SIGTERM"),
    }
}
