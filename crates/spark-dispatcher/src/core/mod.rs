//! # core 模块说明
//!
//! ## 设计定位（Why）
//! - 承载引擎与宿主之间的全部契约：领域值类型、共享表的标记值、外部协作方 trait；
//! - 提供单节点可用的内存实现，测试与单机部署无需外部集群表。
//!
//! ## 扩展提示（How）
//! - 接入真实宿主时只需为其句柄实现 [`runtime::ProxyRuntime`]，为集群表实现
//!   [`runtime::AffinityStore`] 与 [`runtime::ContactRegistry`]。

pub mod clock;
pub mod memory;
pub mod runtime;
pub mod types;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::{MemoryAffinityStore, MemoryContactRegistry};
pub use runtime::{AffinityStore, Authorization, ContactRegistry, ProxyRuntime, SaveMode};
pub use types::{Aor, Binding, CorrelationKey, Destination, SelectionAlgorithm, SubscriberFormat};
pub use value::StoredValue;
