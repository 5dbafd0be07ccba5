//! 内存存储
//!
//! 用于测试的 [`ObjectStore`] 实现，模拟 API Server 的关键语义：
//! 递增的 `resourceVersion` 与乐观并发冲突、带 Finalizer 资源的延迟删除、
//! 命名空间删除时的级联清理、主资源写入不修改 status，以及按类型注入的写失败。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::error::ErrorResponse;
use kube::Resource;
use serde_json::{json, Value};

use super::{ObjectStore, StoreObject};
use crate::error::{Error, Result};

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    conflicts: u32,
    failures: HashMap<String, String>,
}

/// 内存中的资源存储
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    version: AtomicU64,
    writes: AtomicU64,
}

fn type_key<K: StoreObject>() -> String {
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}

fn namespace_type_key() -> String {
    type_key::<Namespace>()
}

fn key_of<K: StoreObject>(namespace: Option<&str>, name: &str) -> Key {
    (type_key::<K>(), namespace.unwrap_or_default().to_string(), name.to_string())
}

fn identity<K: StoreObject>(obj: &K) -> Result<Key> {
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::InvalidObject(format!("{} 缺少名称", K::kind(&()))))?;
    Ok(key_of::<K>(obj.meta().namespace.as_deref(), &name))
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::from(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn resource_version(value: &Value) -> Option<&str> {
    value.pointer("/metadata/resourceVersion").and_then(Value::as_str)
}

fn has_finalizers(value: &Value) -> bool {
    value
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .map_or(false, |f| !f.is_empty())
}

fn is_deleting(value: &Value) -> bool {
    value
        .pointer("/metadata/deletionTimestamp")
        .map_or(false, |t| !t.is_null())
}

/// 解析 `k=v,k2==v2,k3` 形式的标签选择器
fn selector_matches(selector: &str, labels: Option<&Value>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            let label = |key: &str| labels.and_then(|l| l.get(key)).and_then(Value::as_str);
            if let Some((key, value)) = term.split_once("!=") {
                label(key.trim()) != Some(value.trim())
            } else if let Some((key, value)) = term.split_once('=') {
                let value = value.trim_start_matches('=');
                label(key.trim()) == Some(value.trim())
            } else if let Some(key) = term.strip_prefix('!') {
                label(key).is_none()
            } else {
                label(term).is_some()
            }
        })
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接下来的 `n` 次写操作返回冲突
    pub fn inject_conflicts(&self, n: u32) {
        self.lock().conflicts = n;
    }

    /// 让该类型的所有写操作失败，直到调用 [`MemoryStore::clear_failures`]
    pub fn fail_writes<K: StoreObject>(&self, message: &str) {
        self.lock()
            .failures
            .insert(type_key::<K>(), message.to_string());
    }

    /// 清除注入的写失败
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// 成功写操作的次数
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// 该类型当前的资源数量（含正在删除的）
    pub fn count<K: StoreObject>(&self) -> usize {
        let type_key = type_key::<K>();
        self.lock()
            .objects
            .keys()
            .filter(|(t, _, _)| *t == type_key)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn check_write<K: StoreObject>(&self, state: &mut State, name: &str) -> Result<()> {
        if let Some(message) = state.failures.get(&type_key::<K>()) {
            return Err(api_error(500, "InternalError", format!("{name}: {message}")));
        }
        Ok(())
    }

    fn check_conflict(state: &mut State, stored: &Value, incoming: &Value, name: &str) -> Result<()> {
        if state.conflicts > 0 {
            state.conflicts -= 1;
            return Err(api_error(409, "Conflict", format!("{name}: 注入的冲突")));
        }
        if let Some(rv) = resource_version(incoming) {
            if Some(rv) != resource_version(stored) {
                return Err(api_error(
                    409,
                    "Conflict",
                    format!("{name}: resourceVersion {rv} 已过期"),
                ));
            }
        }
        Ok(())
    }

    /// 移除对象；命名空间被移除时级联删除其中的所有对象
    fn remove(state: &mut State, key: &Key) {
        state.objects.remove(key);
        if key.0 == namespace_type_key() {
            let namespace = key.2.clone();
            state.objects.retain(|(_, ns, _), _| *ns != namespace);
        }
    }

    fn decode<K: StoreObject>(value: &Value) -> Result<K> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        let state = self.lock();
        state
            .objects
            .get(&key_of::<K>(namespace, name))
            .map(Self::decode)
            .transpose()
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>> {
        let type_key = type_key::<K>();
        let state = self.lock();
        state
            .objects
            .iter()
            .filter(|((t, ns, _), _)| *t == type_key && namespace.map_or(true, |n| n == ns))
            .filter(|(_, value)| {
                label_selector.map_or(true, |s| {
                    selector_matches(s, value.pointer("/metadata/labels"))
                })
            })
            .map(|(_, value)| Self::decode(value))
            .collect()
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let key = identity(obj)?;
        let mut state = self.lock();
        self.check_write::<K>(&mut state, &key.2)?;
        if state.objects.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} {} 已存在", K::kind(&()), key.2),
            ));
        }
        if !key.1.is_empty() && is_terminating_namespace(&state, &key.1) {
            return Err(api_error(
                403,
                "Forbidden",
                format!("命名空间 {} 正在删除", key.1),
            ));
        }

        let mut value = serde_json::to_value(obj)?;
        value["apiVersion"] = json!(K::api_version(&()));
        value["kind"] = json!(K::kind(&()));
        let metadata = &mut value["metadata"];
        metadata["resourceVersion"] = json!(self.next_version());
        metadata["uid"] = json!(format!("uid-{}", self.version.load(Ordering::SeqCst)));
        metadata["creationTimestamp"] = json!(Time(Utc::now()));
        if let Some(map) = metadata.as_object_mut() {
            map.remove("deletionTimestamp");
        }

        let created = Self::decode(&value)?;
        state.objects.insert(key, value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn replace<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let key = identity(obj)?;
        let mut state = self.lock();
        self.check_write::<K>(&mut state, &key.2)?;
        let Some(stored) = state.objects.get(&key).cloned() else {
            return Err(api_error(404, "NotFound", format!("{} {} 不存在", K::kind(&()), key.2)));
        };
        let mut incoming = serde_json::to_value(obj)?;
        Self::check_conflict(&mut state, &stored, &incoming, &key.2)?;

        incoming["apiVersion"] = stored["apiVersion"].clone();
        incoming["kind"] = stored["kind"].clone();
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            match stored["metadata"].get(field) {
                Some(v) => incoming["metadata"][field] = v.clone(),
                None => {
                    if let Some(map) = incoming["metadata"].as_object_mut() {
                        map.remove(field);
                    }
                }
            }
        }
        match stored.get("status") {
            Some(status) => incoming["status"] = status.clone(),
            None => {
                if let Some(map) = incoming.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        incoming["metadata"]["resourceVersion"] = json!(self.next_version());

        let replaced = Self::decode(&incoming)?;
        if is_deleting(&incoming) && !has_finalizers(&incoming) {
            Self::remove(&mut state, &key);
        } else {
            state.objects.insert(key, incoming);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(replaced)
    }

    async fn replace_subresource<K: StoreObject>(&self, subresource: &str, obj: &K) -> Result<K> {
        let key = identity(obj)?;
        let mut state = self.lock();
        self.check_write::<K>(&mut state, &key.2)?;
        let Some(mut stored) = state.objects.get(&key).cloned() else {
            return Err(api_error(
                404,
                "NotFound",
                format!("{} {} 不存在", K::kind(&()), key.2),
            ));
        };
        let incoming = serde_json::to_value(obj)?;
        Self::check_conflict(&mut state, &stored, &incoming, &key.2)?;

        match subresource {
            "status" | "approval" => match incoming.get("status") {
                Some(status) if !status.is_null() => stored["status"] = status.clone(),
                _ => {
                    if let Some(map) = stored.as_object_mut() {
                        map.remove("status");
                    }
                }
            },
            other => {
                return Err(api_error(
                    404,
                    "NotFound",
                    format!("不支持的子资源 {other}"),
                ))
            }
        }
        stored["metadata"]["resourceVersion"] = json!(self.next_version());

        let replaced = Self::decode(&stored)?;
        state.objects.insert(key, stored);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(replaced)
    }

    async fn delete<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let key = key_of::<K>(namespace, name);
        let mut state = self.lock();
        self.check_write::<K>(&mut state, name)?;
        let Some(stored) = state.objects.get_mut(&key) else {
            return Err(api_error(404, "NotFound", format!("{} {name} 不存在", K::kind(&()))));
        };

        if has_finalizers(stored) {
            if !is_deleting(stored) {
                stored["metadata"]["deletionTimestamp"] = json!(Time(Utc::now()));
                stored["metadata"]["resourceVersion"] = json!(self.next_version());
            }
        } else {
            Self::remove(&mut state, &key);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn is_terminating_namespace(state: &State, namespace: &str) -> bool {
    state
        .objects
        .get(&(namespace_type_key(), String::new(), namespace.to_string()))
        .map_or(false, is_deleting)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Secret};
    use kube::api::ObjectMeta;
    use kube::ResourceExt;

    fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(str::to_string),
            ..Default::default()
        }
    }

    fn namespace(name: &str) -> Namespace {
        Namespace {
            metadata: meta(name, None),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_conflicts_and_versions() {
        let store = MemoryStore::new();
        let cm = ConfigMap {
            metadata: meta("cm", Some("ns")),
            ..Default::default()
        };
        let created = store.create(&cm).await.unwrap();
        assert!(created.resource_version().is_some());
        assert!(store.create(&cm).await.unwrap_err().is_already_exists());

        let updated = store.replace(&created).await.unwrap();
        assert_ne!(updated.resource_version(), created.resource_version());

        // 旧版本写入失败
        assert!(store.replace(&created).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_finalizer_gated_delete() {
        let store = MemoryStore::new();
        let mut ns = namespace("broker");
        ns.metadata.finalizers = Some(vec!["test/f".to_string()]);
        store.create(&ns).await.unwrap();

        store.delete::<Namespace>(None, "broker").await.unwrap();
        let mut live: Namespace = store.get(None, "broker").await.unwrap().unwrap();
        assert!(live.metadata.deletion_timestamp.is_some());

        live.metadata.finalizers = None;
        store.replace(&live).await.unwrap();
        assert!(store.get::<Namespace>(None, "broker").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_namespace_cascade() {
        let store = MemoryStore::new();
        store.create(&namespace("ns")).await.unwrap();
        store
            .create(&Secret {
                metadata: meta("s", Some("ns")),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .create(&Secret {
                metadata: meta("s", Some("other")),
                ..Default::default()
            })
            .await
            .unwrap();

        store.delete::<Namespace>(None, "ns").await.unwrap();
        assert!(store.get::<Secret>(Some("ns"), "s").await.unwrap().is_none());
        assert!(store.get::<Secret>(Some("other"), "s").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_label_selector_and_failures() {
        let store = MemoryStore::new();
        let mut labeled = ConfigMap {
            metadata: meta("a", Some("ns")),
            ..Default::default()
        };
        labeled.metadata.labels = Some([("app".to_string(), "x".to_string())].into());
        store.create(&labeled).await.unwrap();
        store
            .create(&ConfigMap {
                metadata: meta("b", Some("ns")),
                ..Default::default()
            })
            .await
            .unwrap();

        let all: Vec<ConfigMap> = store.list(None, None).await.unwrap();
        assert_eq!(all.len(), 2);
        let selected: Vec<ConfigMap> = store.list(Some("ns"), Some("app=x")).await.unwrap();
        assert_eq!(selected.len(), 1);
        let exists: Vec<ConfigMap> = store.list(None, Some("app")).await.unwrap();
        assert_eq!(exists[0].name_any(), "a");

        store.fail_writes::<ConfigMap>("boom");
        assert!(matches!(
            store.delete::<ConfigMap>(Some("ns"), "a").await,
            Err(Error::Kube(_))
        ));
        store.clear_failures();
        store.delete::<ConfigMap>(Some("ns"), "a").await.unwrap();
        assert_eq!(store.count::<ConfigMap>(), 1);
    }
}
