//! Submariner 资源模型
//!
//! 托管集群上的 Submariner 自定义资源（由 ManifestWork 下发）以及
//! Broker 命名空间中的 Broker 自定义资源。

use k8s_openapi::api::apps::v1::DaemonSetStatus;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Submariner 部署规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "submariner.io",
    version = "v1alpha1",
    kind = "Submariner",
    namespaced,
    status = "SubmarinerStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct SubmarinerSpec {
    /// Broker 类型
    pub broker: String,
    /// Broker API Server 地址（不含协议）
    pub broker_k8s_api_server: String,
    /// Broker 访问令牌
    pub broker_k8s_api_server_token: String,
    /// Broker CA 证书（Base64）
    #[serde(rename = "brokerK8sCA")]
    pub broker_k8s_ca: String,
    /// Broker 命名空间
    pub broker_k8s_remote_namespace: String,
    /// 隧道驱动
    pub cable_driver: String,
    /// IPsec 预共享密钥（Base64）
    #[serde(rename = "ceIPSecPSK")]
    pub ce_ipsec_psk: String,
    /// IPsec IKE 端口
    #[serde(rename = "ceIPSecIKEPort")]
    pub ce_ipsec_ike_port: i32,
    /// IPsec NAT-T 端口
    #[serde(rename = "ceIPSecNATTPort")]
    pub ce_ipsec_natt_port: i32,
    /// 集群 ID
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    /// Submariner 组件运行的命名空间
    pub namespace: String,
    /// 是否启用 NAT 穿越
    #[serde(default)]
    pub nat_enabled: bool,
    /// 是否开启调试
    #[serde(default)]
    pub debug: bool,
    /// 镜像仓库
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// 镜像版本
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Submariner 部署状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmarinerStatus {
    /// 是否启用 NAT
    #[serde(default)]
    pub nat_enabled: bool,
    /// 集群 ID
    #[serde(default, rename = "clusterID")]
    pub cluster_id: String,
    /// Gateway 状态列表
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateways: Option<Vec<GatewayStatus>>,
    /// Gateway DaemonSet 状态
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_daemon_set_status: Option<DaemonSetStatusWrapper>,
    /// Route Agent DaemonSet 状态
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_agent_daemon_set_status: Option<DaemonSetStatusWrapper>,
}

/// DaemonSet 状态包装
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSetStatusWrapper {
    /// 容器镜像是否与期望不一致
    #[serde(default)]
    pub mismatched_container_images: bool,
    /// DaemonSet 原生状态
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DaemonSetStatus>,
}

impl DaemonSetStatusWrapper {
    /// DaemonSet 是否全部就绪且镜像一致
    pub fn is_ready(&self) -> bool {
        if self.mismatched_container_images {
            return false;
        }
        match &self.status {
            Some(status) => {
                status.number_unavailable.unwrap_or(0) == 0
                    && status.number_ready >= status.desired_number_scheduled
            }
            None => false,
        }
    }
}

/// 单个 Gateway 状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    /// active / passive
    #[serde(default)]
    pub ha_status: String,
    /// 本端 Endpoint
    #[serde(default)]
    pub local_endpoint: EndpointSpec,
    /// 与远端集群的连接
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// 失败原因
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status_failure: String,
}

/// Endpoint 标识
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct EndpointSpec {
    /// 集群 ID
    #[serde(default)]
    pub cluster_id: String,
    /// 主机名
    #[serde(default)]
    pub hostname: String,
}

/// 与远端集群的连接
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// connecting / connected / error
    #[serde(default)]
    pub status: String,
    /// 状态描述
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status_message: String,
    /// 远端 Endpoint
    #[serde(default)]
    pub endpoint: EndpointSpec,
}

/// 连接已建立
pub const CONNECTION_CONNECTED: &str = "connected";

/// Broker 规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "submariner.io",
    version = "v1alpha1",
    kind = "Broker",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSpec {
    /// 是否启用 Globalnet
    #[serde(default)]
    pub globalnet_enabled: bool,
    /// 启用的组件
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<String>,
}
