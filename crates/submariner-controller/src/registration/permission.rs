//! Agent 权限分配
//!
//! 在集群命名空间中创建 Role / RoleBinding，使 Agent 只能更新自己的
//! ManagedClusterAddOn 状态。逐个 apply，失败聚合返回，已成功的部分不回滚。

use std::sync::Arc;

use kube::ResourceExt;
use submariner_common::constants::cluster_addon_group;
use submariner_common::error::{Error, Result};
use submariner_common::models::{ManagedCluster, ManagedClusterAddOn};
use submariner_common::store::ObjectStore;
use tracing::{debug, warn};

use crate::manifests::{assets, AddOnRbacConfig, ManifestRenderer};

/// 权限分配器
pub struct PermissionProvisioner<S> {
    store: Arc<S>,
    renderer: Arc<ManifestRenderer>,
}

impl<S: ObjectStore> PermissionProvisioner<S> {
    pub fn new(store: Arc<S>, renderer: Arc<ManifestRenderer>) -> Self {
        Self { store, renderer }
    }

    /// 为集群上的 Agent 分配最小权限
    pub async fn provision(&self, cluster: &ManagedCluster, addon: &ManagedClusterAddOn) -> Result<()> {
        let cluster_name = cluster.name_any();
        let ctx = AddOnRbacConfig {
            cluster_name: cluster_name.clone(),
            group: cluster_addon_group(&cluster_name),
        };
        let objects = self.renderer.render_objects(assets::ADDON_RBAC, &ctx)?;

        let mut errors = Vec::new();
        for object in &objects {
            match object.apply(self.store.as_ref()).await {
                Ok(outcome) => {
                    debug!(cluster = %cluster_name, name = %object.name(), ?outcome, "已应用 Agent 权限")
                }
                Err(e) => {
                    warn!(cluster = %cluster_name, name = %object.name(), "应用 Agent 权限失败: {}", e);
                    errors.push(e);
                }
            }
        }

        debug!(cluster = %cluster_name, addon = %addon.name_any(), "Agent 权限分配完成");
        Error::aggregate(errors)
    }
}
