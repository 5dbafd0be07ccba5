//! ManifestWork 资源模型
//!
//! ManifestWork 位于 Hub 上集群同名命名空间中，携带一组原始清单，
//! 由集群上的 work agent 同步到托管集群。

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ManifestWork 规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "work.open-cluster-management.io",
    version = "v1",
    kind = "ManifestWork",
    namespaced,
    status = "ManifestWorkStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ManifestWorkSpec {
    /// 待下发的清单
    #[serde(default)]
    pub workload: ManifestsTemplate,

    /// 删除传播策略
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_option: Option<DeleteOption>,
}

/// 清单集合
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ManifestsTemplate {
    /// 原始资源清单
    #[serde(default)]
    pub manifests: Vec<serde_json::Value>,
}

/// 删除传播策略
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOption {
    /// Foreground / Orphan / SelectivelyOrphan
    pub propagation_policy: String,
}

/// ManifestWork 状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ManifestWorkStatus {
    /// 状态条件
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// 单个 ManifestWork 在删除流程中的状态
///
/// 每次都由重新观察到的对象推导，不依赖 "已经删除过" 的内存假设。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkDeletionState {
    /// 存在且未被删除
    Active,
    /// 已请求删除，但仍被 Finalizer 阻塞
    DeletingBlocked {
        /// 阻塞删除的 Finalizer
        finalizers: Vec<String>,
    },
    /// 已请求删除，等待服务端完成
    DeletingPending,
    /// 已不存在
    DeletingClear,
}

impl WorkDeletionState {
    /// 根据观察到的 ManifestWork 推导删除状态
    pub fn observe(work: Option<&ManifestWork>) -> Self {
        let Some(work) = work else {
            return WorkDeletionState::DeletingClear;
        };
        if work.metadata.deletion_timestamp.is_none() {
            return WorkDeletionState::Active;
        }
        match work.metadata.finalizers.as_deref() {
            Some(finalizers) if !finalizers.is_empty() => WorkDeletionState::DeletingBlocked {
                finalizers: finalizers.to_vec(),
            },
            _ => WorkDeletionState::DeletingPending,
        }
    }

    /// 是否已完全删除
    pub fn is_clear(&self) -> bool {
        matches!(self, WorkDeletionState::DeletingClear)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    #[test]
    fn test_observe_deletion_state() {
        assert_eq!(WorkDeletionState::observe(None), WorkDeletionState::DeletingClear);

        let mut work = ManifestWork::new("w", ManifestWorkSpec::default());
        assert_eq!(WorkDeletionState::observe(Some(&work)), WorkDeletionState::Active);

        work.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_eq!(
            WorkDeletionState::observe(Some(&work)),
            WorkDeletionState::DeletingPending
        );

        work.metadata.finalizers = Some(vec!["test/block".to_string()]);
        assert_eq!(
            WorkDeletionState::observe(Some(&work)),
            WorkDeletionState::DeletingBlocked {
                finalizers: vec!["test/block".to_string()]
            }
        );
    }
}
