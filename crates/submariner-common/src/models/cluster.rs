//! 集群与 Addon 资源模型
//!
//! Hub 上由 Open Cluster Management 定义的 ManagedCluster、ManagedClusterSet、
//! ManagedClusterAddOn 与 ClusterManagementAddOn，以及集群集成员关系的计算。

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::constants::CLUSTER_SET_LABEL;

/// 托管集群规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "cluster.open-cluster-management.io",
    version = "v1",
    kind = "ManagedCluster",
    status = "ManagedClusterStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    /// Hub 是否接受该集群
    #[serde(default)]
    pub hub_accepts_client: bool,

    /// 集群 API Server 访问端点
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_cluster_client_configs: Vec<ClientConfig>,

    /// 租约时长（秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_duration_seconds: Option<i32>,
}

/// 集群 API Server 访问端点
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// API Server 地址
    pub url: String,
    /// CA 证书（Base64）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
}

/// 托管集群状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ManagedClusterStatus {
    /// 状态条件
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ManagedCluster {
    /// 集群通过独占标签声明的 ClusterSet
    pub fn cluster_set_label(&self) -> Option<&str> {
        self.labels().get(CLUSTER_SET_LABEL).map(String::as_str)
    }

    /// 是否正在删除
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

/// 集群集规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "cluster.open-cluster-management.io",
    version = "v1beta2",
    kind = "ManagedClusterSet",
    status = "ManagedClusterSetStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSetSpec {
    /// 成员选择器
    #[serde(default)]
    pub cluster_selector: ClusterSelector,
}

/// 集群集成员选择器
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSelector {
    /// 选择器类型
    #[serde(default)]
    pub selector_type: SelectorType,

    /// 当类型为 LabelSelector 时使用的标签选择器
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
}

/// 选择器类型
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum SelectorType {
    /// 通过 `cluster.open-cluster-management.io/clusterset` 标签独占归属
    #[default]
    ExclusiveClusterSetLabel,
    /// 通过任意标签选择器归属
    LabelSelector,
}

/// 集群集状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ManagedClusterSetStatus {
    /// 状态条件
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ManagedClusterSet {
    /// 判断集群是否属于该集群集
    pub fn selects(&self, cluster: &ManagedCluster) -> bool {
        let selector = &self.spec.cluster_selector;
        match selector.selector_type {
            SelectorType::ExclusiveClusterSetLabel => {
                cluster.cluster_set_label() == Some(self.name_any().as_str())
            }
            SelectorType::LabelSelector => match &selector.label_selector {
                Some(label_selector) => label_selector_matches(label_selector, cluster.labels()),
                None => false,
            },
        }
    }

    /// 从集群列表中筛选出成员（忽略正在删除的集群）
    pub fn members<'a>(&self, clusters: &'a [ManagedCluster]) -> Vec<&'a ManagedCluster> {
        clusters
            .iter()
            .filter(|cluster| !cluster.is_deleting() && self.selects(cluster))
            .collect()
    }

    /// 是否正在删除
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

/// 找到集群所属的集群集
///
/// 独占标签优先；否则按名称排序取第一个通过标签选择器选中该集群的集群集。
pub fn cluster_set_for<'a>(
    cluster: &ManagedCluster,
    sets: &'a [ManagedClusterSet],
) -> Option<&'a ManagedClusterSet> {
    if let Some(label) = cluster.cluster_set_label() {
        if let Some(set) = sets.iter().find(|set| {
            set.name_any() == label
                && set.spec.cluster_selector.selector_type == SelectorType::ExclusiveClusterSetLabel
        }) {
            return Some(set);
        }
    }

    let mut candidates: Vec<&ManagedClusterSet> = sets
        .iter()
        .filter(|set| {
            set.spec.cluster_selector.selector_type == SelectorType::LabelSelector
                && set.selects(cluster)
        })
        .collect();
    candidates.sort_by_key(|set| set.name_any());
    candidates.into_iter().next()
}

/// 标签选择器匹配（matchLabels 与 matchExpressions 同时满足）
pub fn label_selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        if match_labels.iter().any(|(k, v)| labels.get(k) != Some(v)) {
            return false;
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let values = expr.values.as_deref().unwrap_or_default();
            let actual = labels.get(&expr.key);
            let matched = match expr.operator.as_str() {
                "In" => actual.map_or(false, |v| values.contains(v)),
                "NotIn" => actual.map_or(true, |v| !values.contains(v)),
                "Exists" => actual.is_some(),
                "DoesNotExist" => actual.is_none(),
                _ => false,
            };
            if !matched {
                return false;
            }
        }
    }

    true
}

/// 集群上的 Addon 声明
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "addon.open-cluster-management.io",
    version = "v1alpha1",
    kind = "ManagedClusterAddOn",
    namespaced,
    status = "ManagedClusterAddOnStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterAddOnSpec {
    /// Agent 安装命名空间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_namespace: Option<String>,
}

/// Addon 状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterAddOnStatus {
    /// 状态条件（按类型唯一）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Agent 注册配置
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub registrations: Vec<RegistrationConfig>,
}

/// Agent 注册配置：期望的签发者与证书主体
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationConfig {
    /// 签发者名称
    pub signer_name: String,
    /// 证书主体
    #[serde(default)]
    pub subject: Subject,
}

/// 证书主体
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Subject {
    /// 用户名（CN）
    #[serde(default)]
    pub user: String,
    /// 组（O）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

impl ManagedClusterAddOn {
    /// 是否正在删除
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

/// Hub 级别的 Addon 注册
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "addon.open-cluster-management.io",
    version = "v1alpha1",
    kind = "ClusterManagementAddOn",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterManagementAddOnSpec {
    /// Addon 元数据
    #[serde(default)]
    pub add_on_meta: AddOnMeta,
}

/// Addon 元数据
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddOnMeta {
    /// 显示名称
    #[serde(default)]
    pub display_name: String,
    /// 描述
    #[serde(default)]
    pub description: String,
}
