//! Lease 选主
//!
//! 基于 coordination.k8s.io/v1 Lease 的选主，只有持有租约的实例运行 Hub 控制器。
//! 所有写入都携带读取时的 resourceVersion，两个实例同时抢占时只有一个会成功。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use submariner_common::error::Result;
use submariner_common::ObjectStore;
use tracing::{debug, info, warn};

/// 时间来源
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 选主参数
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Lease 名称
    pub name: String,
    /// Lease 所在命名空间
    pub namespace: String,
    /// 本实例标识
    pub identity: String,
    /// 租约时长
    pub lease_duration: Duration,
    /// 续约截止时间，超过后放弃领导权
    pub renew_deadline: Duration,
    /// 获取与续约的间隔
    pub retry_period: Duration,
}

/// 选主器
pub struct LeaderElector<S, C = SystemClock> {
    store: Arc<S>,
    clock: C,
    config: LeaseConfig,
}

impl<S: ObjectStore, C: Clock> LeaderElector<S, C> {
    pub fn new(store: Arc<S>, clock: C, config: LeaseConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// 阻塞直到获得领导权
    pub async fn acquire(&self) {
        info!(
            identity = %self.config.identity,
            lease = %self.config.name,
            "等待领导权..."
        );
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.config.identity, "已获得领导权");
                    return;
                }
                Ok(false) => debug!(identity = %self.config.identity, "租约由其他实例持有"),
                Err(e) => warn!(identity = %self.config.identity, error = %e, "获取租约失败，稍后重试"),
            }
            tokio::time::sleep(self.config.retry_period).await;
        }
    }

    /// 持续续约，失去领导权后返回
    ///
    /// 租约被其他实例接管时立即返回；续约持续出错超过 `renew_deadline` 时同样返回。
    pub async fn hold(&self) {
        let mut last_renewed = self.clock.now();
        loop {
            tokio::time::sleep(self.config.retry_period).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewed = self.clock.now(),
                Ok(false) => {
                    warn!(identity = %self.config.identity, "租约已被其他实例接管");
                    return;
                }
                Err(e) => {
                    let elapsed = (self.clock.now() - last_renewed)
                        .to_std()
                        .unwrap_or_default();
                    if elapsed >= self.config.renew_deadline {
                        warn!(identity = %self.config.identity, error = %e, "续约超时，放弃领导权");
                        return;
                    }
                    warn!(identity = %self.config.identity, error = %e, "续约失败");
                }
            }
        }
    }

    /// 获取或续约租约，返回本实例是否持有领导权
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = self.clock.now();
        let Some(lease) = self
            .store
            .get::<Lease>(Some(&self.config.namespace), &self.config.name)
            .await?
        else {
            return self.create_lease(now).await;
        };

        let spec = lease.spec.clone().unwrap_or_default();
        if spec.holder_identity.as_deref() == Some(self.config.identity.as_str()) {
            return self.write_lease(lease, spec, now).await;
        }

        if !self.is_expired(&spec, now) {
            return Ok(false);
        }

        let transitions = spec.lease_transitions.unwrap_or(0) + 1;
        let spec = LeaseSpec {
            holder_identity: Some(self.config.identity.clone()),
            lease_duration_seconds: Some(self.lease_seconds()),
            acquire_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..spec
        };
        let acquired = self.write_lease(lease, spec, now).await?;
        if acquired {
            info!(identity = %self.config.identity, transitions, "已接管过期租约");
        }
        Ok(acquired)
    }

    /// 主动释放租约，使其他实例无需等待过期
    pub async fn release(&self) -> Result<()> {
        let Some(mut lease) = self
            .store
            .get::<Lease>(Some(&self.config.namespace), &self.config.name)
            .await?
        else {
            return Ok(());
        };
        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(self.config.identity.as_str()) {
            debug!(identity = %self.config.identity, "未持有租约，无需释放");
            return Ok(());
        }

        spec.holder_identity = None;
        match self.store.replace(&lease).await {
            Ok(_) => {
                info!(identity = %self.config.identity, "已释放租约");
                Ok(())
            }
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn is_expired(&self, spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
        if spec.holder_identity.is_none() {
            return true;
        }
        match (&spec.renew_time, spec.lease_duration_seconds) {
            (Some(renewed), Some(seconds)) => {
                renewed.0 + chrono::Duration::seconds(i64::from(seconds)) < now
            }
            _ => true,
        }
    }

    fn lease_seconds(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    async fn create_lease(&self, now: DateTime<Utc>) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.config.name.clone()),
                namespace: Some(self.config.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.config.identity.clone()),
                lease_duration_seconds: Some(self.lease_seconds()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        match self.store.create(&lease).await {
            Ok(_) => {
                info!(identity = %self.config.identity, "已创建租约");
                Ok(true)
            }
            Err(e) if e.is_already_exists() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// 以读取时的 resourceVersion 写回租约，版本冲突视为竞争失败
    async fn write_lease(&self, mut lease: Lease, mut spec: LeaseSpec, now: DateTime<Utc>) -> Result<bool> {
        spec.renew_time = Some(MicroTime(now));
        lease.spec = Some(spec);
        match self.store.replace(&lease).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => {
                debug!(identity = %self.config.identity, "租约写入冲突");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
