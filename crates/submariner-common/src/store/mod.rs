//! 资源存储抽象
//!
//! 所有控制器只通过 [`ObjectStore`] 读写声明式资源：生产环境由 [`KubeStore`]
//! 直接访问 API Server，测试中由 [`MemoryStore`] 在内存中模拟资源版本、
//! 冲突、Finalizer 与命名空间级联删除。

mod kube_store;
#[cfg(any(test, feature = "testing"))]
mod memory;

pub use kube_store::KubeStore;
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryStore;

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{
    Broker, ClusterManagementAddOn, ManagedCluster, ManagedClusterAddOn, ManagedClusterSet,
    ManifestWork, Submariner,
};
use crate::retry::{retry_on_conflict, RetryConfig};

/// 可以通过存储读写的资源类型
pub trait StoreObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// 构造该类型的 API 句柄；集群级资源忽略命名空间
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced_objects {
    ($($ty:ty),* $(,)?) => {
        $(
            impl StoreObject for $ty {
                fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                    match namespace {
                        Some(ns) => Api::namespaced(client, ns),
                        None => Api::all(client),
                    }
                }
            }
        )*
    };
}

macro_rules! cluster_objects {
    ($($ty:ty),* $(,)?) => {
        $(
            impl StoreObject for $ty {
                fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                    Api::all(client)
                }
            }
        )*
    };
}

namespaced_objects!(
    Secret,
    ServiceAccount,
    ConfigMap,
    Role,
    RoleBinding,
    Deployment,
    Lease,
    ManagedClusterAddOn,
    ManifestWork,
    Submariner,
    Broker,
);

cluster_objects!(
    Namespace,
    ClusterRole,
    ClusterRoleBinding,
    CustomResourceDefinition,
    CertificateSigningRequest,
    ManagedCluster,
    ManagedClusterSet,
    ClusterManagementAddOn,
);

/// 声明式资源存储
///
/// 不存在的资源在 `get` 中表现为 `None`；写操作通过 `resourceVersion`
/// 实现乐观并发，版本不匹配时返回 [`Error::Conflict`]。
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// 读取单个资源
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>;

    /// 列出资源，可按标签选择器过滤（`k=v,k2`）
    async fn list<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>>;

    /// 创建资源
    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// 整体替换资源（不含 status）
    async fn replace<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// 替换子资源，例如 `status` 或 CSR 的 `approval`
    async fn replace_subresource<K: StoreObject>(&self, subresource: &str, obj: &K) -> Result<K>;

    /// 删除资源；带 Finalizer 的资源只会被标记删除
    async fn delete<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<()>;
}

/// `apply` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// 创建或合并更新资源
///
/// 期望字段合并到现有资源之上，不相关的字段保持不变；合并结果与现有资源相同时
/// 不发出写请求。冲突时整体重试。
pub async fn apply<S: ObjectStore, K: StoreObject>(store: &S, desired: &K) -> Result<ApplyOutcome> {
    let name = desired.meta().name.clone().ok_or_else(|| {
        Error::InvalidObject(format!("{} 缺少名称", K::kind(&())))
    })?;
    let namespace = desired.namespace();
    let desired_value = serde_json::to_value(desired)?;

    retry_on_conflict(&RetryConfig::default(), "apply", || {
        let name = name.as_str();
        let namespace = namespace.as_deref();
        let desired_value = &desired_value;
        async move {
            let Some(live) = store.get::<K>(namespace, name).await? else {
                store.create(desired).await?;
                debug!(kind = %K::kind(&()), name, "已创建资源");
                return Ok(ApplyOutcome::Created);
            };

            let live_value = serde_json::to_value(&live)?;
            let mut merged = live_value.clone();
            merge_value(&mut merged, desired_value);
            if merged == live_value {
                return Ok(ApplyOutcome::Unchanged);
            }

            let updated: K = serde_json::from_value(merged)?;
            store.replace(&updated).await?;
            debug!(kind = %K::kind(&()), name, "已更新资源");
            Ok(ApplyOutcome::Updated)
        }
    })
    .await
}

/// 将 `patch` 递归合并到 `target`：对象按键合并，其余值整体替换，`null` 忽略
pub fn merge_value(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    continue;
                }
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_value(existing, value)
                    }
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => {
            if !patch.is_null() {
                *target = patch.clone();
            }
        }
    }
}

/// 确保资源带有指定 Finalizer，返回是否发生了写入
pub async fn add_finalizer<S: ObjectStore, K: StoreObject>(
    store: &S,
    obj: &K,
    finalizer: &str,
) -> Result<bool> {
    if obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(false);
    }
    mutate_finalizers(store, obj, |finalizers| {
        if finalizers.iter().any(|f| f == finalizer) {
            false
        } else {
            finalizers.push(finalizer.to_string());
            true
        }
    })
    .await
}

/// 移除资源上的指定 Finalizer，返回是否发生了写入；资源不存在视为成功
pub async fn remove_finalizer<S: ObjectStore, K: StoreObject>(
    store: &S,
    obj: &K,
    finalizer: &str,
) -> Result<bool> {
    if !obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(false);
    }
    mutate_finalizers(store, obj, |finalizers| {
        let before = finalizers.len();
        finalizers.retain(|f| f != finalizer);
        finalizers.len() != before
    })
    .await
}

async fn mutate_finalizers<S, K, F>(store: &S, obj: &K, mutate: F) -> Result<bool>
where
    S: ObjectStore,
    K: StoreObject,
    F: Fn(&mut Vec<String>) -> bool,
{
    let name = obj.name_any();
    let namespace = obj.namespace();

    retry_on_conflict(&RetryConfig::default(), "finalizer", || {
        let name = name.as_str();
        let namespace = namespace.as_deref();
        let mutate = &mutate;
        async move {
            let Some(mut live) = store.get::<K>(namespace, name).await? else {
                return Ok(false);
            };
            let finalizers = live.meta_mut().finalizers.get_or_insert_with(Vec::new);
            if !mutate(finalizers) {
                return Ok(false);
            }
            match store.replace(&live).await {
                Ok(_) => Ok(true),
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            }
        }
    })
    .await
}

/// 删除资源，不存在视为成功
pub async fn delete_ignore_not_found<S: ObjectStore, K: StoreObject>(
    store: &S,
    namespace: Option<&str>,
    name: &str,
) -> Result<()> {
    crate::error::ignore_not_found(store.delete::<K>(namespace, name).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn config_map(data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_value_preserves_unrelated_fields() {
        let mut target = json!({"a": 1, "b": {"c": 2, "d": 3}, "list": [1, 2]});
        merge_value(&mut target, &json!({"b": {"c": 5}, "list": [9], "e": null}));
        assert_eq!(target, json!({"a": 1, "b": {"c": 5, "d": 3}, "list": [9]}));
    }

    #[tokio::test]
    async fn test_apply_create_update_unchanged() {
        let store = MemoryStore::new();

        let outcome = apply(&store, &config_map(&[("k", "v1")])).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Created);

        let outcome = apply(&store, &config_map(&[("k", "v1")])).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Unchanged);

        let outcome = apply(&store, &config_map(&[("k", "v2")])).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Updated);

        let live: ConfigMap = store.get(Some("ns"), "cm").await.unwrap().unwrap();
        assert_eq!(live.data.unwrap()["k"], "v2");
    }

    #[tokio::test]
    async fn test_apply_keeps_fields_set_by_others() {
        let store = MemoryStore::new();
        let mut existing = config_map(&[("k", "v1")]);
        existing.metadata.labels = Some([("owner".to_string(), "someone".to_string())].into());
        store.create(&existing).await.unwrap();

        apply(&store, &config_map(&[("k", "v2")])).await.unwrap();

        let live: ConfigMap = store.get(Some("ns"), "cm").await.unwrap().unwrap();
        assert_eq!(live.labels()["owner"], "someone");
        assert_eq!(live.data.unwrap()["k"], "v2");
    }

    #[tokio::test]
    async fn test_apply_retries_conflicts() {
        let store = MemoryStore::new();
        store.create(&config_map(&[("k", "v1")])).await.unwrap();
        store.inject_conflicts(2);

        let outcome = apply(&store, &config_map(&[("k", "v2")])).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Updated);
    }

    #[tokio::test]
    async fn test_finalizer_helpers() {
        let store = MemoryStore::new();
        let created = store.create(&config_map(&[])).await.unwrap();

        assert!(add_finalizer(&store, &created, "test/f").await.unwrap());
        let live: ConfigMap = store.get(Some("ns"), "cm").await.unwrap().unwrap();
        assert!(!add_finalizer(&store, &live, "test/f").await.unwrap());
        assert_eq!(live.finalizers(), &["test/f".to_string()]);

        assert!(remove_finalizer(&store, &live, "test/f").await.unwrap());
        let live: ConfigMap = store.get(Some("ns"), "cm").await.unwrap().unwrap();
        assert!(live.finalizers().is_empty());
    }

    #[tokio::test]
    async fn test_delete_ignore_not_found() {
        let store = MemoryStore::new();
        delete_ignore_not_found::<_, ConfigMap>(&store, Some("ns"), "missing")
            .await
            .unwrap();
    }
}
