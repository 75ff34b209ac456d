//! # spark-dispatcher
//!
//! ## 定位与职责（Why）
//! - 为 SIP 注册与呼叫建立请求在后端集群间分发，并维护足够的集群级状态，使路由在重传、重试与后端重启之间保持一致；
//! - 报文解析、事务簿记、鉴权与底层转发由宿主 Proxy Runtime 提供，本 crate 只实现有状态的
//!   “目的地亲和 + 故障转移 + 绑定容量”引擎。
//!
//! ## 架构嵌入（Where）
//! - `core` 模块定义领域值类型、共享表的标记值以及外部协作方契约，并附带内存实现；
//! - `applications` 模块承载选择器、三张亲和表的视图、故障转移状态机、容量淘汰器与分发流水线；
//! - `config` 模块集中声明全部开关与 TTL，支持热切换；
//! - `error` 模块集中定义错误类型与协议层拒绝结果。
//!
//! ## 使用方式（How）
//! ```
//! use std::sync::Arc;
//!
//! use spark_dispatcher::{
//!     DispatchConfig, DispatchPipeline, DispatchRuntimeConfig, MemoryAffinityStore,
//!     MemoryContactRegistry,
//! };
//!
//! let config = DispatchConfig::from_toml_str("subscriber_affinity = true").unwrap();
//! let pipeline = DispatchPipeline::new(
//!     Arc::new(DispatchRuntimeConfig::new(config).unwrap()),
//!     Arc::new(MemoryAffinityStore::new()),
//!     Arc::new(MemoryContactRegistry::new()),
//! );
//! assert!(pipeline.runtime_config().snapshot().subscriber_affinity);
//! ```

/// 分发引擎的策略组件与流水线。
///
/// - **意图说明 (Why)**：每个组件对应一条独立的路由策略，由流水线按固定优先级串联；
/// - **契约定位 (What)**：组件只依赖 `core` 中的 trait，不感知宿主实现。
pub mod applications;

/// 配置结构与热切换容器。
pub mod config;

/// 领域值类型与外部协作方契约。
///
/// - **意图说明 (Why)**：引擎的每个决策都落到对外部表或 Runtime 的一次同步调用上，契约集中于此便于审计；
/// - **扩展指引 (How)**：宿主实现 `ProxyRuntime`、`AffinityStore`、`ContactRegistry` 即可接入。
pub mod core;

/// 错误类型与诊断信息集中声明处。
///
/// - **意图说明 (Why)**：区分“拒绝本次请求”与“记录后继续”的失败；
/// - **风险提示 (Trade-offs)**：fail-open 的错误绝不能被映射为拒绝，否则注册会因外部表抖动而失败。
pub mod error;

pub use crate::applications::{
    affinity::{AffinityCache, AffinitySource},
    call_cache::CallDestinationCache,
    evictor::{Admission, BindingCapacityEvictor, eviction_target},
    failover::{BranchEvent, FailoverAction, FailoverController, FailoverState, FailoverStep},
    locality::{LocalityMap, LocalityRecord, Release},
    pipeline::{
        DispatchPipeline, Disposition, InboundRequest, Method, ReplyOutcome, RouteSource,
        TransactionContext,
    },
    selector::DestinationSelector,
};
pub use crate::config::{
    DispatchConfig, DispatchRuntimeConfig, MAX_TTL_SECS, RegistrationMode, TableNames,
};
pub use crate::core::{
    AffinityStore, Aor, Authorization, Binding, Clock, ContactRegistry, CorrelationKey,
    Destination, ManualClock, MemoryAffinityStore, MemoryContactRegistry, ProxyRuntime, SaveMode,
    SelectionAlgorithm, StoredValue, SubscriberFormat, SystemClock,
};
pub use crate::error::{DispatchError, RegistryError, RejectReason, RelayError, StoreError};
