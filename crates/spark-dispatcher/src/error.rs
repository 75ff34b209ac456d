//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为分发引擎对外暴露的错误语义提供集中定义，区分“拒绝本次请求”与“记录后继续”两类失败；
//! - 归档订阅者校验、目的地选择、外部表访问、故障转移状态机等不同类别，方便运维与观测。
//!
//! ## 设计要求（What）
//! - 所有错误类型均派生 `thiserror::Error`，兼容 `std::error::Error`；
//! - 每个变体提供稳定错误码（`dispatch.*`），便于告警规则与日志检索；
//! - 终止请求的错误可经 [`DispatchError::reject_reason`] 映射到有限的协议结果集合 [`RejectReason`]。
//!
//! ## 扩展建议（How）
//! - 新增变体时需同步补齐 `code` 与 `reject_reason`，否则上层无法给出确定的拒绝响应；
//! - 外部协作方（Proxy Runtime、亲和表、注册表）的错误保持独立类型，避免引擎错误枚举随宿主实现膨胀。

use thiserror::Error;

use crate::applications::failover::{BranchEvent, FailoverState};

/// 分发引擎核心错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合单次请求处理过程中可能出现的失败，并为上层统一转换为拒绝结果做准备；
/// - **契约 (What)**：
///   - 所有变体均为 `Send + Sync + 'static`，可安全跨线程传播；
///   - 所有失败都局限于一次请求的处理，不存在跨请求的致命错误；
/// - **设计权衡 (Trade-offs)**：使用 `String` 保存上下文，牺牲少量堆分配换取易读性。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum DispatchError {
    /// Contact 中无法提取合法的订阅者标识。
    ///
    /// - **意图 (Why)**：订阅者是亲和与容量策略的主键，非法标识必须在修改任何状态前被拒绝；
    /// - **契约 (What)**：`contact` 为原始 Contact 文本，可能为空串。
    #[error("contact `{contact}` does not carry a valid subscriber")]
    InvalidSubscriber { contact: String },

    /// 目的地集合中没有可用目的地。
    ///
    /// - **契约 (What)**：对当前决策是终态，不会自动重试。
    #[error("no destination available in set {set_id}")]
    NoDestination { set_id: u32 },

    /// 注册表不可达。
    ///
    /// - **风险 (Trade-offs)**：淘汰器按“无已知绑定”处理该错误，绝不阻塞注册。
    #[error("binding lookup for `{aor}` failed: {detail}")]
    RegistryLookup { aor: String, detail: String },

    /// 向目的地转发失败。
    #[error("relay toward `{destination}` failed: {detail}")]
    Relay { destination: String, detail: String },

    /// Proxy Runtime 未能持久化当前请求携带的注册。
    #[error("saving registration for `{aor}` failed: {detail}")]
    Registration { aor: String, detail: String },

    /// 淘汰最旧绑定时被注册表拒绝。
    #[error("evicting `{address}` of `{aor}` failed: {detail}")]
    Eviction {
        aor: String,
        address: String,
        detail: String,
    },

    /// 共享键值表访问失败。
    #[error("affinity table `{table}` access failed: {detail}")]
    Store { table: String, detail: String },

    /// 故障转移状态机拒绝非法事件。
    ///
    /// - **意图 (Why)**：保证重试流程只沿着合法路径推进，帮助定位宿主回调顺序错误。
    #[error("failover state {from:?} cannot accept {event:?}")]
    InvalidTransition {
        from: FailoverState,
        event: BranchEvent,
    },

    /// 配置不合法。
    #[error("invalid dispatch configuration: {detail}")]
    Config { detail: String },
}

impl DispatchError {
    /// 返回稳定的机器可读错误码。
    ///
    /// - **契约 (What)**：错误码前缀固定为 `dispatch.`，与变体一一对应，可直接作为日志字段或指标标签。
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::InvalidSubscriber { .. } => "dispatch.subscriber.invalid",
            DispatchError::NoDestination { .. } => "dispatch.destination.unavailable",
            DispatchError::RegistryLookup { .. } => "dispatch.registry.lookup",
            DispatchError::Relay { .. } => "dispatch.relay.failure",
            DispatchError::Registration { .. } => "dispatch.registry.save",
            DispatchError::Eviction { .. } => "dispatch.registry.evict",
            DispatchError::Store { .. } => "dispatch.store.failure",
            DispatchError::InvalidTransition { .. } => "dispatch.failover.invalid_transition",
            DispatchError::Config { .. } => "dispatch.config.invalid",
        }
    }

    /// 将终止请求的错误映射为协议层拒绝结果。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：保证“无法继续的决策总是降级为确定的拒绝响应”，而不是让流水线崩溃；
    /// - **契约 (What)**：返回 `None` 表示该错误按约定只记录日志、不终止请求（淘汰失败、注册表查询失败、键值表失败）；
    /// - **执行 (How)**：订阅者非法 → `NotFound`；无目的地 → `NoDestinationAvailable`；
    ///   转发、保存注册以及状态机错误统一视为服务端失败，以 `ServerError` 回应。
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            DispatchError::InvalidSubscriber { .. } => Some(RejectReason::NotFound),
            DispatchError::NoDestination { .. } => Some(RejectReason::NoDestinationAvailable),
            DispatchError::Relay { .. }
            | DispatchError::Registration { .. }
            | DispatchError::InvalidTransition { .. }
            | DispatchError::Config { .. } => Some(RejectReason::ServerError),
            DispatchError::RegistryLookup { .. }
            | DispatchError::Eviction { .. }
            | DispatchError::Store { .. } => None,
        }
    }
}

/// 面向协议层的拒绝结果。
///
/// # 教案式说明
/// - **意图 (Why)**：引擎只负责判定“以哪类结果拒绝”，具体报文由 Proxy Runtime 负责格式化；
/// - **契约 (What)**：集合封闭，[`RejectReason::status_code`] 给出业界惯用的 SIP 状态码，宿主可直接采用；
/// - **风险 (Trade-offs)**：`ServerError` 对应 Runtime 的 `sl_reply_error` 语义，由宿主决定最终状态码。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RejectReason {
    /// 订阅者或目标不存在。
    NotFound,
    /// Max-Forwards 耗尽。
    TooManyHops,
    /// 报文未通过完整性检查。
    MalformedMessage,
    /// 需要发起鉴权挑战。
    AuthenticationChallenge,
    /// Request-URI 缺少用户部分。
    AddressIncomplete,
    /// 目的地集合无可用成员。
    NoDestinationAvailable,
    /// 转发或持久化失败，由 Runtime 以内部错误响应。
    ServerError,
}

impl RejectReason {
    /// 惯用状态码。
    pub fn status_code(self) -> u16 {
        match self {
            RejectReason::NotFound | RejectReason::NoDestinationAvailable => 404,
            RejectReason::TooManyHops => 483,
            RejectReason::MalformedMessage => 400,
            RejectReason::AuthenticationChallenge => 401,
            RejectReason::AddressIncomplete => 484,
            RejectReason::ServerError => 500,
        }
    }

    /// 惯用原因短语。
    pub fn reason_phrase(self) -> &'static str {
        match self {
            RejectReason::NotFound => "Not found",
            RejectReason::TooManyHops => "Too Many Hops",
            RejectReason::MalformedMessage => "Bad Request",
            RejectReason::AuthenticationChallenge => "Unauthorized",
            RejectReason::AddressIncomplete => "Address Incomplete",
            RejectReason::NoDestinationAvailable => "No destination",
            RejectReason::ServerError => "Server Internal Error",
        }
    }
}

/// 共享键值表的访问错误。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{detail}")]
pub struct StoreError {
    pub detail: String,
}

impl StoreError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// 注册表（ContactRegistry 或 Runtime 的保存操作）返回的错误。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{detail}")]
pub struct RegistryError {
    pub detail: String,
}

impl RegistryError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// Runtime 同步转发失败。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{detail}")]
pub struct RelayError {
    pub detail: String,
}

impl RelayError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}
