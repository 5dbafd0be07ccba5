//! Submariner Addon Common - 跨模块共享的资源模型与基础设施
//!
//! 该模块提供 Hub 与 Agent 两侧共享的资源模型（ManagedCluster、ManifestWork、
//! Submariner 等）、统一错误类型、状态条件工具、冲突重试、条件式状态更新器
//! 以及对象存储抽象。

pub mod condition;
pub mod constants;
pub mod error;
pub mod models;
pub mod retry;
pub mod status;
pub mod store;

/// 重新导出常用类型，方便使用
pub use error::Error;
pub use error::Result;
pub use models::*;
pub use status::{StatusMutator, StatusUpdateOutcome, StatusUpdater};
pub use store::{KubeStore, ObjectStore, StoreObject};
#[cfg(any(test, feature = "testing"))]
pub use store::MemoryStore;
