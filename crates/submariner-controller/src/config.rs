//! 配置管理模块
//!
//! 该模块负责加载 Addon 的配置：可选的 YAML/JSON 配置文件，叠加以
//! `SUBMARINER_ADDON__` 为前缀的环境变量，缺省字段使用内置默认值。

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use submariner_common::error::{Error, Result};
use tracing::debug;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "SUBMARINER_ADDON";

/// Addon 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddOnConfig {
    /// Submariner Operator 镜像
    pub operator_image: String,
    /// Addon Agent 镜像
    pub agent_image: String,
    /// 托管集群上 Submariner 的安装命名空间
    pub install_namespace: String,
    /// 隧道驱动
    pub cable_driver: String,
    /// IPsec IKE 端口
    pub ipsec_ike_port: u16,
    /// IPsec NAT-T 端口
    pub ipsec_natt_port: u16,
    /// 是否启用 NAT 穿越
    pub nat_enabled: bool,
    /// Hub API Server 地址；为空时从 `kube-public/cluster-info` 读取
    pub hub_api_server: Option<String>,
    /// 成功协调后的重新检查间隔（秒）
    pub requeue_seconds: u64,
    /// 协调失败后的重试间隔（秒）
    pub error_requeue_seconds: u64,
}

impl Default for AddOnConfig {
    fn default() -> Self {
        Self {
            operator_image: "quay.io/submariner/submariner-operator:0.16.0".to_string(),
            agent_image: "quay.io/stolostron/submariner-addon:latest".to_string(),
            install_namespace: "submariner-operator".to_string(),
            cable_driver: "libreswan".to_string(),
            ipsec_ike_port: 500,
            ipsec_natt_port: 4500,
            nat_enabled: true,
            hub_api_server: None,
            requeue_seconds: 300,
            error_requeue_seconds: 30,
        }
    }
}

impl AddOnConfig {
    /// 加载配置：文件（可选）< 环境变量
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            let file = path
                .to_str()
                .ok_or_else(|| Error::Config(format!("配置路径无效: {:?}", path)))?;
            let format = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml") | Some("yml") => FileFormat::Yaml,
                Some("json") => FileFormat::Json,
                _ => {
                    return Err(Error::Config(
                        "不支持的配置文件格式，仅支持 YAML 或 JSON".to_string(),
                    ))
                }
            };
            builder = builder.add_source(File::with_name(file).format(format));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(format!("构建配置失败: {e}")))?;

        let addon_config = config
            .try_deserialize::<AddOnConfig>()
            .map_err(|e| Error::Config(format!("配置格式错误: {e}")))?;
        debug!(?addon_config, "已加载 Addon 配置");
        Ok(addon_config)
    }

    /// 成功协调后的重新检查间隔
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_seconds)
    }

    /// 协调失败后的重试间隔
    pub fn error_requeue_interval(&self) -> Duration {
        Duration::from_secs(self.error_requeue_seconds)
    }
}
