//! 基于 kube `Api<K>` 的存储实现

use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};

use super::{ObjectStore, StoreObject};
use crate::constants::FIELD_MANAGER;
use crate::error::{Error, Result};

/// 直接访问 API Server 的存储
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn post_params() -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_string()),
        }
    }
}

fn object_name<K: StoreObject>(obj: &K) -> Result<String> {
    obj.meta()
        .name
        .clone()
        .ok_or_else(|| Error::InvalidObject(format!("{} 缺少名称", K::kind(&()))))
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        let api = K::api(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>> {
        let api = K::api(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let api = K::api(self.client.clone(), obj.namespace().as_deref());
        Ok(api.create(&Self::post_params(), obj).await?)
    }

    async fn replace<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let api = K::api(self.client.clone(), obj.namespace().as_deref());
        Ok(api.replace(&name, &Self::post_params(), obj).await?)
    }

    async fn replace_subresource<K: StoreObject>(&self, subresource: &str, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let api = K::api(self.client.clone(), obj.namespace().as_deref());
        let data = serde_json::to_vec(obj)?;
        Ok(api
            .replace_subresource(subresource, &name, &Self::post_params(), data)
            .await?)
    }

    async fn delete<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let api = K::api(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::background()).await?;
        Ok(())
    }
}
