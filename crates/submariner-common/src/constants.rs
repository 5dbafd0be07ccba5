//! 命名约定与常量
//!
//! Hub 与托管集群之间约定的名称、标签、Finalizer 以及证书身份格式。

/// Addon 名称
pub const ADDON_NAME: &str = "submariner";

/// ManagedCluster 上标识所属 ClusterSet 的标签
pub const CLUSTER_SET_LABEL: &str = "cluster.open-cluster-management.io/clusterset";

/// ClusterSet 在 Broker 存在期间携带的 Finalizer
pub const CLUSTER_SET_FINALIZER: &str = "cluster.open-cluster-management.io/submariner-cleanup";

/// Broker 命名空间上的清理 Finalizer
pub const BROKER_CLEANUP_FINALIZER: &str = "submariner.io/broker-cleanup";

/// ManagedCluster 与 Addon 在 ManifestWork 存在期间携带的 Finalizer
pub const AGENT_CLEANUP_FINALIZER: &str =
    "cluster.open-cluster-management.io/submariner-agent-cleanup";

/// Broker 命名空间上标识所属 ClusterSet 的标签
pub const BROKER_CLUSTER_SET_LABEL: &str = "submariner.io/clusterset";

/// Broker 命名空间中按集群创建的 RBAC 资源标签
pub const BROKER_CLUSTER_LABEL: &str = "submariner.io/broker-cluster";

/// Broker 命名空间中集群使用的 Role
pub const BROKER_CLUSTER_ROLE: &str = "submariner-k8s-broker-cluster";

/// Broker 自定义资源名称
pub const BROKER_NAME: &str = "submariner-broker";

/// IPsec 预共享密钥 Secret 名称
pub const IPSEC_PSK_SECRET: &str = "submariner-ipsec-psk";

/// IPsec 预共享密钥长度（字节）
pub const IPSEC_PSK_LENGTH: usize = 48;

/// 安装 Submariner Operator 的 ManifestWork 名称
pub const OPERATOR_WORK_NAME: &str = "submariner-operator";

/// 实例化 Submariner 自定义资源的 ManifestWork 名称
pub const RESOURCE_WORK_NAME: &str = "submariner-resource";

/// 由本 Addon 管理的 ManifestWork 标签
pub const ADDON_WORK_LABEL: &str = "submariner.io/addon-work";

/// ManifestWork 清单内容哈希注解
pub const MANIFEST_HASH_ANNOTATION: &str = "submariner.io/manifest-hash";

/// 托管集群上 Submariner 自定义资源名称
pub const SUBMARINER_CR_NAME: &str = "submariner";

/// Agent 客户端证书签发者
pub const KUBE_APISERVER_CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client";

/// 所有已认证用户所属的组
pub const AUTHENTICATED_GROUP: &str = "system:authenticated";

/// 所有集群上的 Submariner Addon Agent 共享的组
pub const ADDON_GROUP: &str = "system:open-cluster-management:addon:submariner";

/// Agent 的名称
pub const AGENT_NAME: &str = "submariner-addon-agent";

/// CSR 上标识集群名称的标签
pub const CSR_CLUSTER_LABEL: &str = "open-cluster-management.io/cluster-name";

/// CSR 上标识 Addon 名称的标签
pub const CSR_ADDON_LABEL: &str = "open-cluster-management.io/addon-name";

/// 字段管理者名称
pub const FIELD_MANAGER: &str = "submariner-addon";

/// Addon 状态条件类型
pub mod conditions {
    /// 跨集群连接降级
    pub const CONNECTION_DEGRADED: &str = "SubmarinerConnectionDegraded";
    /// Gateway / Route Agent 降级
    pub const AGENT_DEGRADED: &str = "SubmarinerAgentDegraded";
    /// Gateway 节点已标记
    pub const GATEWAY_NODES_LABELED: &str = "SubmarinerGatewayNodesLabeled";
}

/// ClusterSet 对应的 Broker 命名空间
pub fn broker_namespace(cluster_set: &str) -> String {
    format!("{cluster_set}-broker")
}

/// 集群专属的 Addon 组
pub fn cluster_addon_group(cluster: &str) -> String {
    format!("system:open-cluster-management:cluster:{cluster}:addon:{ADDON_NAME}")
}

/// 集群上 Agent 的证书用户名（CN）
pub fn agent_user(cluster: &str) -> String {
    format!("{}:agent:{AGENT_NAME}", cluster_addon_group(cluster))
}

/// Broker 命名空间中集群的 ServiceAccount / RoleBinding 名称
pub fn broker_cluster_account(cluster: &str) -> String {
    format!("cluster-{cluster}")
}

/// Broker 命名空间中集群 ServiceAccount 的令牌 Secret 名称
pub fn broker_cluster_token_secret(cluster: &str) -> String {
    format!("cluster-{cluster}-token")
}
