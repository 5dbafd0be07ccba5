//! Submariner Addon Controller - Hub 侧的协调逻辑
//!
//! 该模块实现 Submariner Addon 在 Hub 上的全部协调逻辑：
//! - Broker：按 ClusterSet 创建与清理 Broker 命名空间及其资源
//! - Agent：按集群下发 Operator 与 Submariner 资源的 ManifestWork
//! - 状态汇聚：将 Submariner 资源状态折叠为 Addon 状态条件
//! - 注册：Agent 证书请求审批与最小权限分配
//!
//! 所有控制器都只通过 [`ObjectStore`](submariner_common::ObjectStore) 读写资源，
//! 协调过程是电平触发、可重复执行的。

pub mod broker;
pub mod config;
pub mod manifests;
pub mod registration;
pub mod status;
pub mod utils;
pub mod work;

pub use broker::{BrokerController, BrokerState};
pub use config::AddOnConfig;
pub use manifests::ManifestRenderer;
pub use registration::{CsrApprovalController, PermissionProvisioner, RegistrationController};
pub use status::StatusAggregator;
pub use work::{AgentState, AgentWorkController};
