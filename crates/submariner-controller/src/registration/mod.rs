//! Agent 注册
//!
//! Hub 侧的注册握手：在 Addon 状态中声明 Agent 的证书主体并分配权限，
//! 以及对 Agent 提交的证书请求进行自动审批。

pub mod csr_approval;
pub mod permission;

pub use csr_approval::approve;
pub use permission::PermissionProvisioner;

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use submariner_common::constants::{
    agent_user, cluster_addon_group, ADDON_GROUP, ADDON_NAME, AUTHENTICATED_GROUP,
    CSR_ADDON_LABEL, CSR_CLUSTER_LABEL, KUBE_APISERVER_CLIENT_SIGNER,
};
use submariner_common::error::Result;
use submariner_common::models::{ManagedCluster, ManagedClusterAddOn, RegistrationConfig, Subject};
use submariner_common::status::{update_registrations_fn, StatusUpdater};
use submariner_common::store::ObjectStore;
use tracing::{debug, info};

use crate::manifests::ManifestRenderer;

/// 集群上 Agent 的注册配置
pub fn registration_config(cluster: &str) -> RegistrationConfig {
    RegistrationConfig {
        signer_name: KUBE_APISERVER_CLIENT_SIGNER.to_string(),
        subject: Subject {
            user: agent_user(cluster),
            groups: vec![
                cluster_addon_group(cluster),
                ADDON_GROUP.to_string(),
                AUTHENTICATED_GROUP.to_string(),
            ],
        },
    }
}

/// 注册配置与权限控制器
pub struct RegistrationController<S> {
    store: Arc<S>,
    updater: StatusUpdater<S>,
    provisioner: PermissionProvisioner<S>,
}

impl<S: ObjectStore> RegistrationController<S> {
    pub fn new(store: Arc<S>, renderer: Arc<ManifestRenderer>) -> Self {
        Self {
            updater: StatusUpdater::new(Arc::clone(&store)),
            provisioner: PermissionProvisioner::new(Arc::clone(&store), renderer),
            store,
        }
    }

    /// 协调集群命名空间中的 Addon
    pub async fn reconcile(&self, cluster_name: &str) -> Result<()> {
        let Some(addon) = self
            .store
            .get::<ManagedClusterAddOn>(Some(cluster_name), ADDON_NAME)
            .await?
        else {
            debug!(cluster = %cluster_name, "Addon 不存在，跳过注册");
            return Ok(());
        };
        if addon.is_deleting() {
            return Ok(());
        }
        let Some(cluster) = self.store.get::<ManagedCluster>(None, cluster_name).await? else {
            debug!(cluster = %cluster_name, "集群不存在，跳过注册");
            return Ok(());
        };

        let outcome = self
            .updater
            .update_status::<ManagedClusterAddOn>(
                Some(cluster_name),
                ADDON_NAME,
                &[update_registrations_fn(vec![registration_config(cluster_name)])],
            )
            .await?;
        if outcome.changed {
            info!(cluster = %cluster_name, "已更新 Agent 注册配置");
        }

        self.provisioner.provision(&cluster, &addon).await
    }
}

/// 证书请求自动审批控制器
pub struct CsrApprovalController<S> {
    store: Arc<S>,
}

impl<S: ObjectStore> CsrApprovalController<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// 协调单个证书请求，返回是否批准
    ///
    /// 不满足身份策略的请求保持待处理状态。
    pub async fn reconcile(&self, csr_name: &str) -> Result<bool> {
        let Some(mut csr) = self
            .store
            .get::<CertificateSigningRequest>(None, csr_name)
            .await?
        else {
            return Ok(false);
        };

        let labels = csr.labels();
        if labels.get(CSR_ADDON_LABEL).map(String::as_str) != Some(ADDON_NAME) {
            return Ok(false);
        }
        let Some(cluster_name) = labels.get(CSR_CLUSTER_LABEL).cloned() else {
            return Ok(false);
        };
        if is_decided(&csr) {
            return Ok(false);
        }

        let Some(cluster) = self.store.get::<ManagedCluster>(None, &cluster_name).await? else {
            debug!(csr = %csr_name, cluster = %cluster_name, "集群不存在，保持待处理");
            return Ok(false);
        };
        let Some(addon) = self
            .store
            .get::<ManagedClusterAddOn>(Some(&cluster_name), ADDON_NAME)
            .await?
        else {
            debug!(csr = %csr_name, cluster = %cluster_name, "Addon 不存在，保持待处理");
            return Ok(false);
        };

        if !approve(&cluster, &addon, &csr) {
            info!(csr = %csr_name, cluster = %cluster_name, "证书请求不符合 Agent 身份策略，保持待处理");
            return Ok(false);
        }

        let now = Time(Utc::now());
        csr.status
            .get_or_insert_with(Default::default)
            .conditions
            .get_or_insert_with(Vec::new)
            .push(CertificateSigningRequestCondition {
                type_: "Approved".to_string(),
                status: "True".to_string(),
                reason: Some("AutoApprovedBySubmarinerAddon".to_string()),
                message: Some("Auto approving Submariner addon agent certificate".to_string()),
                last_update_time: Some(now.clone()),
                last_transition_time: Some(now),
            });
        self.store.replace_subresource("approval", &csr).await?;
        info!(csr = %csr_name, cluster = %cluster_name, "已批准 Agent 证书请求");
        Ok(true)
    }
}

fn is_decided(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map_or(false, |conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Approved" || c.type_ == "Denied")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use csr_approval::tests::{csr, csr_pem, valid_pem};
    use k8s_openapi::api::rbac::v1::RoleBinding;
    use submariner_common::models::{ManagedClusterAddOnSpec, ManagedClusterSpec};
    use submariner_common::store::MemoryStore;

    async fn seed(store: &MemoryStore) {
        store
            .create(&ManagedCluster::new("cluster1", ManagedClusterSpec::default()))
            .await
            .unwrap();
        let mut addon = ManagedClusterAddOn::new(ADDON_NAME, ManagedClusterAddOnSpec::default());
        addon.metadata.namespace = Some("cluster1".to_string());
        store.create(&addon).await.unwrap();
    }

    fn labelled(mut request: CertificateSigningRequest) -> CertificateSigningRequest {
        request.metadata.labels = Some(
            [
                (CSR_ADDON_LABEL.to_string(), ADDON_NAME.to_string()),
                (CSR_CLUSTER_LABEL.to_string(), "cluster1".to_string()),
            ]
            .into(),
        );
        request
    }

    #[tokio::test]
    async fn test_registration_sets_status_and_permissions() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let controller =
            RegistrationController::new(Arc::clone(&store), Arc::new(ManifestRenderer::new().unwrap()));

        controller.reconcile("cluster1").await.unwrap();

        let addon: ManagedClusterAddOn = store.get(Some("cluster1"), ADDON_NAME).await.unwrap().unwrap();
        let registrations = addon.status.unwrap().registrations;
        assert_eq!(registrations, vec![registration_config("cluster1")]);
        let bindings: Vec<RoleBinding> = store.list(Some("cluster1"), None).await.unwrap();
        assert_eq!(bindings.len(), 1);

        let writes = store.writes();
        controller.reconcile("cluster1").await.unwrap();
        assert_eq!(store.writes(), writes);
    }

    #[tokio::test]
    async fn test_valid_csr_is_approved_once() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        store
            .create(&labelled(csr("csr1", KUBE_APISERVER_CLIENT_SIGNER, valid_pem("cluster1"))))
            .await
            .unwrap();
        let controller = CsrApprovalController::new(Arc::clone(&store));

        assert!(controller.reconcile("csr1").await.unwrap());
        let approved: CertificateSigningRequest = store.get(None, "csr1").await.unwrap().unwrap();
        assert!(is_decided(&approved));

        assert!(!controller.reconcile("csr1").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_csr_stays_pending() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let pem = csr_pem(&[AUTHENTICATED_GROUP, ADDON_GROUP], &agent_user("cluster1"));
        store
            .create(&labelled(csr("csr1", KUBE_APISERVER_CLIENT_SIGNER, pem)))
            .await
            .unwrap();
        let controller = CsrApprovalController::new(Arc::clone(&store));

        assert!(!controller.reconcile("csr1").await.unwrap());
        let pending: CertificateSigningRequest = store.get(None, "csr1").await.unwrap().unwrap();
        assert!(!is_decided(&pending));
    }

    #[tokio::test]
    async fn test_unlabelled_csr_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        store
            .create(&csr("csr1", KUBE_APISERVER_CLIENT_SIGNER, valid_pem("cluster1")))
            .await
            .unwrap();
        let controller = CsrApprovalController::new(Arc::clone(&store));
        assert!(!controller.reconcile("csr1").await.unwrap());
    }
}
