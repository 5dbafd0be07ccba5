//! 模板配置记录
//!
//! 每个记录序列化为模板上下文，字段名即模板占位符名称。

use serde::Serialize;

/// Broker 命名空间资源
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BrokerConfig {
    pub cluster_set_name: String,
    pub broker_namespace: String,
    #[serde(rename = "IPSecPSK")]
    pub ipsec_psk: String,
}

/// Broker 命名空间中按集群创建的 RBAC
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterRbacConfig {
    pub cluster_name: String,
    pub broker_namespace: String,
    pub account_name: String,
    pub token_secret_name: String,
}

/// Submariner Operator 安装清单
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OperatorConfig {
    pub install_namespace: String,
    pub operator_image: String,
    pub agent_image: String,
    pub cluster_name: String,
}

/// Submariner 自定义资源
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubmarinerConfig {
    pub install_namespace: String,
    #[serde(rename = "BrokerAPIServer")]
    pub broker_api_server: String,
    pub broker_token: String,
    #[serde(rename = "BrokerCA")]
    pub broker_ca: String,
    pub broker_namespace: String,
    pub cable_driver: String,
    #[serde(rename = "IPSecPSK")]
    pub ipsec_psk: String,
    #[serde(rename = "IPSecIKEPort")]
    pub ipsec_ike_port: u16,
    #[serde(rename = "IPSecNATTPort")]
    pub ipsec_natt_port: u16,
    pub cluster_name: String,
    #[serde(rename = "NATEnabled")]
    pub nat_enabled: bool,
}

/// Agent 更新自身 Addon 状态所需的 RBAC
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddOnRbacConfig {
    pub cluster_name: String,
    pub group: String,
}
