//! 条件式状态更新
//!
//! 以 "读取 - 在副本上应用变更函数 - 深比较 - 只写 status" 的方式更新资源状态。
//! 没有变化时不发出写请求；遇到冲突时整个流程重试；目标不存在不视为错误。

use std::fmt::Debug;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::ResourceExt;
use tracing::debug;

use crate::condition::upsert_condition;
use crate::error::Result;
use crate::models::{ManagedClusterAddOn, ManagedClusterAddOnStatus, RegistrationConfig};
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::store::{ObjectStore, StoreObject};

/// 带有 status 子资源的资源
pub trait HasStatus: StoreObject {
    type Status: Clone + Debug + Default + PartialEq + Send + Sync;

    fn status(&self) -> Option<&Self::Status>;
    fn status_mut(&mut self) -> &mut Option<Self::Status>;
}

impl HasStatus for ManagedClusterAddOn {
    type Status = ManagedClusterAddOnStatus;

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut Option<Self::Status> {
        &mut self.status
    }
}

/// 状态变更函数，可以失败
pub type StatusMutator<S> = Box<dyn Fn(&mut S) -> Result<()> + Send + Sync>;

/// 状态更新结果
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdateOutcome<S> {
    /// 计算出的新状态；目标不存在时为 `None`
    pub status: Option<S>,
    /// 是否实际写入
    pub changed: bool,
}

/// 条件式状态更新器
pub struct StatusUpdater<S> {
    store: Arc<S>,
    retry: RetryConfig,
}

impl<S> Clone for StatusUpdater<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            retry: self.retry.clone(),
        }
    }
}

impl<S: ObjectStore> StatusUpdater<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// 依次应用变更函数并在状态变化时写入
    ///
    /// 任一变更函数失败则整体放弃，不写入任何部分结果。
    pub async fn update_status<K: HasStatus>(
        &self,
        namespace: Option<&str>,
        name: &str,
        mutators: &[StatusMutator<K::Status>],
    ) -> Result<StatusUpdateOutcome<K::Status>> {
        let store = self.store.as_ref();

        retry_on_conflict(&self.retry, "update_status", || async move {
            let Some(mut object) = store.get::<K>(namespace, name).await? else {
                debug!(name, "状态更新目标不存在，跳过");
                return Ok(StatusUpdateOutcome {
                    status: None,
                    changed: false,
                });
            };

            let old_status = object.status().cloned().unwrap_or_default();
            let mut new_status = old_status.clone();
            for mutate in mutators {
                mutate(&mut new_status)?;
            }

            if new_status == old_status {
                return Ok(StatusUpdateOutcome {
                    status: Some(new_status),
                    changed: false,
                });
            }

            *object.status_mut() = Some(new_status.clone());
            match store.replace_subresource("status", &object).await {
                Ok(_) => {
                    debug!(name = %object.name_any(), "状态已更新");
                    Ok(StatusUpdateOutcome {
                        status: Some(new_status),
                        changed: true,
                    })
                }
                Err(e) if e.is_not_found() => Ok(StatusUpdateOutcome {
                    status: None,
                    changed: false,
                }),
                Err(e) => Err(e),
            }
        })
        .await
    }
}

/// Addon 状态条件的 upsert 变更函数
pub fn update_condition_fn(condition: Condition) -> StatusMutator<ManagedClusterAddOnStatus> {
    Box::new(move |status| {
        upsert_condition(&mut status.conditions, condition.clone());
        Ok(())
    })
}

/// 设置 Addon 注册配置的变更函数
pub fn update_registrations_fn(
    registrations: Vec<RegistrationConfig>,
) -> StatusMutator<ManagedClusterAddOnStatus> {
    Box::new(move |status| {
        status.registrations = registrations.clone();
        Ok(())
    })
}
