//! 资源模型
//!
//! Hub 与托管集群上所有被协调的自定义资源类型。

pub mod cluster;
pub mod submariner;
pub mod work;

pub use cluster::*;
pub use submariner::*;
pub use work::*;
