//! # DispatchPipeline：请求、分支响应与注册事件的统一入口
//!
//! ## 核心意图（Why）
//! - 多份近乎相同的路由脚本（NAT、呼叫亲和、归属映射各一份）本质上是同一套设计的增量演进；
//!   这里把它们收敛为一条由 [`DispatchConfig`] 参数化的流水线；
//! - Proxy Runtime 只需调用三个入口：[`DispatchPipeline::handle_request`]（每个入站请求一次）、
//!   [`DispatchPipeline::handle_reply`]（每个分支事件一次）与
//!   [`DispatchPipeline::handle_binding_expired`]（绑定过期通知）。
//!
//! ## 处理顺序（How）
//! 1. 预检：Max-Forwards 与报文完整性；
//! 2. CANCEL 仅在匹配事务时转发；无对话 ACK 一律吸收；
//! 3. 对话内请求：松散路由成功则应用呼叫记录后转发，否则 ACK 交给事务层、其余 404；
//! 4. 来自目的地集合的请求原样转发；
//! 5. REGISTER：校验订阅者 → 鉴权 → 注销或“容量准入 + 保存”（本地/转发两种模式）；
//! 6. SUBSCRIBE/PUBLISH 以 404 拒绝；Request-URI 缺少用户以 484 拒绝；
//! 7. 分发：呼叫记录 → 订阅者亲和 → 新选择，写回缓存，必要时挂载故障转移，最后转发。
//!
//! ## 并发模型（Trade-offs）
//! - 流水线本身不持有可变状态，可在任意多个 Worker 间共享；每个请求只读取一份配置快照，
//!   快照随 [`TransactionContext`] 保存，后续分支事件沿用同一份配置；
//! - 跨 Worker 的状态全部位于外部表中，写入“后写者胜”，不做 CAS。

use std::sync::Arc;

use crate::applications::{
    affinity::{AffinityCache, AffinitySource},
    call_cache::CallDestinationCache,
    evictor::{Admission, BindingCapacityEvictor, contact_uri},
    failover::{BranchEvent, FailoverController, FailoverState},
    locality::{LocalityMap, Release},
    selector::DestinationSelector,
};
use crate::config::{DispatchConfig, DispatchRuntimeConfig, RegistrationMode};
use crate::core::{
    runtime::{AffinityStore, Authorization, ContactRegistry, ProxyRuntime, SaveMode},
    types::{Aor, CorrelationKey, Destination},
};
use crate::error::{DispatchError, RejectReason};

/// 请求方法。流水线只区分会改变路由决策的几类。
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Subscribe,
    Publish,
    Other(String),
}

impl Method {
    /// 由请求行中的方法名构造（大小写敏感，与 SIP 一致）。
    pub fn from_name(name: &str) -> Self {
        match name {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "SUBSCRIBE" => Method::Subscribe,
            "PUBLISH" => Method::Publish,
            other => Method::Other(other.to_owned()),
        }
    }

    pub fn is_presence(&self) -> bool {
        matches!(self, Method::Subscribe | Method::Publish)
    }
}

impl From<&str> for Method {
    fn from(name: &str) -> Self {
        Method::from_name(name)
    }
}

/// Runtime 解析后交给流水线的请求摘要。
///
/// - **契约 (What)**：
///   - `contact`：Contact 头原文，订阅者从其中提取；
///   - `request_user`：Request-URI 的用户部分；
///   - `correlation_key`：呼叫关联键（Call-ID）；
///   - `in_dialog`：To 头是否带 tag；
///   - `expires`：Expires 头的值，Contact 参数中的 `expires` 另行解析。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InboundRequest {
    pub method: Method,
    pub contact: Option<String>,
    pub request_user: Option<String>,
    pub correlation_key: CorrelationKey,
    pub in_dialog: bool,
    pub expires: Option<u32>,
}

impl InboundRequest {
    pub fn new(method: Method, correlation_key: impl Into<CorrelationKey>) -> Self {
        Self {
            method,
            contact: None,
            request_user: None,
            correlation_key: correlation_key.into(),
            in_dialog: false,
            expires: None,
        }
    }

    #[must_use]
    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }

    #[must_use]
    pub fn with_request_user(mut self, user: impl Into<String>) -> Self {
        self.request_user = Some(user.into());
        self
    }

    #[must_use]
    pub fn with_expires(mut self, expires: u32) -> Self {
        self.expires = Some(expires);
        self
    }

    #[must_use]
    pub fn within_dialog(mut self) -> Self {
        self.in_dialog = true;
        self
    }

    /// 是否为注销：Expires 头或 Contact 的 `expires` 参数为 0。
    pub fn is_unregister(&self) -> bool {
        self.expires == Some(0)
            || self
                .contact
                .as_deref()
                .and_then(contact_expires)
                .is_some_and(|expires| expires == 0)
    }
}

fn contact_expires(contact: &str) -> Option<u32> {
    let params = contact.rfind('>').map_or(contact, |end| &contact[end + 1..]);
    params.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("expires") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// 本次转发的目的地从何而来。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteSource {
    /// 呼叫记录命中。
    CallRecord,
    /// 订阅者亲和命中。
    Affinity,
    /// 新选择。
    Selected,
    /// 由 Runtime 按请求自身路由（对话内、CANCEL、后端发起）。
    Runtime,
}

/// 随事务携带的流水线状态。
///
/// # 教案式说明
/// - **意图 (Why)**：取代“注册具名回调、回调内再注册自己”的续体风格；分支事件到来时，
///   Runtime 把同一个上下文交回 [`DispatchPipeline::handle_reply`]；
/// - **契约 (What)**：持有请求时的配置快照、关联键、目的地与可选的故障转移状态机。
#[derive(Clone, Debug)]
pub struct TransactionContext {
    config: Arc<DispatchConfig>,
    correlation_key: CorrelationKey,
    method: Method,
    subscriber: Option<Aor>,
    destination: Option<Destination>,
    source: RouteSource,
    failover: Option<FailoverController>,
    call_record: bool,
    pending_locality: Option<Aor>,
}

impl TransactionContext {
    fn new(config: Arc<DispatchConfig>, request: &InboundRequest) -> Self {
        Self {
            config,
            correlation_key: request.correlation_key.clone(),
            method: request.method.clone(),
            subscriber: None,
            destination: None,
            source: RouteSource::Runtime,
            failover: None,
            call_record: false,
            pending_locality: None,
        }
    }

    pub fn correlation_key(&self) -> &CorrelationKey {
        &self.correlation_key
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn subscriber(&self) -> Option<&Aor> {
        self.subscriber.as_ref()
    }

    /// 当前分支的目的地；由 Runtime 自行路由时为 `None`。
    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    pub fn source(&self) -> RouteSource {
        self.source
    }

    pub fn failover(&self) -> Option<&FailoverController> {
        self.failover.as_ref()
    }

    pub fn failover_state(&self) -> Option<FailoverState> {
        self.failover.as_ref().map(FailoverController::state)
    }

    /// 该事务的终结响应是否需要清理呼叫记录。
    pub fn tracks_call_record(&self) -> bool {
        self.call_record
    }

    /// 请求处理时使用的配置快照。
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }
}

/// 一次请求处理的结论。
#[derive(Clone, Debug)]
pub enum Disposition {
    /// 已转发，上下文需在分支事件到来时交回。
    Relayed(TransactionContext),
    /// 本地注册完成，Runtime 已回应终端。
    Registered { aor: Aor, admission: Admission },
    /// 本地注销完成。
    Unregistered { aor: Aor, release: Release },
    /// 以协议结果拒绝。
    Rejected(RejectReason),
    /// 静默吸收（由事务层处理或丢弃）。
    Absorbed,
}

impl Disposition {
    pub fn rejection(&self) -> Option<RejectReason> {
        match self {
            Disposition::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }

    pub fn context(&self) -> Option<&TransactionContext> {
        match self {
            Disposition::Relayed(context) => Some(context),
            _ => None,
        }
    }

    pub fn into_context(self) -> Option<TransactionContext> {
        match self {
            Disposition::Relayed(context) => Some(context),
            _ => None,
        }
    }
}

/// 一次分支事件的处理结论。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReplyOutcome {
    /// 照常把响应交给上游。
    Forward,
    /// 已转向新的目的地，当前失败响应应被抑制。
    Retried(Destination),
    /// 故障转移结束，最后收到的响应原样上行。
    Propagate { last_status: Option<u16> },
}

/// 分发流水线。
pub struct DispatchPipeline {
    config: Arc<DispatchRuntimeConfig>,
    store: Arc<dyn AffinityStore>,
    registry: Arc<dyn ContactRegistry>,
}

impl DispatchPipeline {
    pub fn new(
        config: Arc<DispatchRuntimeConfig>,
        store: Arc<dyn AffinityStore>,
        registry: Arc<dyn ContactRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
        }
    }

    /// 运行时配置容器，粘滞模式等开关通过它切换。
    pub fn runtime_config(&self) -> &Arc<DispatchRuntimeConfig> {
        &self.config
    }

    /// 处理一个入站请求。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：从不 panic，也从不返回错误；无法继续的决策一律降级为
    ///   [`Disposition::Rejected`]，具体状态码由 Runtime 格式化；
    /// - **执行 (How)**：读取一份配置快照后按模块文档中的顺序逐级分派。
    pub fn handle_request<R>(&self, runtime: &mut R, request: &InboundRequest) -> Disposition
    where
        R: ProxyRuntime + ?Sized,
    {
        let config = self.config.snapshot();
        match self.route_request(runtime, request, config) {
            Ok(disposition) => disposition,
            Err(err) => {
                let reason = err.reject_reason().unwrap_or(RejectReason::ServerError);
                tracing::warn!(
                    call_id = %request.correlation_key,
                    error = %err,
                    code = err.code(),
                    status = reason.status_code(),
                    "request rejected"
                );
                Disposition::Rejected(reason)
            }
        }
    }

    fn route_request<R>(
        &self,
        runtime: &mut R,
        request: &InboundRequest,
        config: Arc<DispatchConfig>,
    ) -> Result<Disposition, DispatchError>
    where
        R: ProxyRuntime + ?Sized,
    {
        if !runtime.check_max_forwards(config.max_forwards) {
            return Ok(Disposition::Rejected(RejectReason::TooManyHops));
        }
        if !runtime.sanity_check() {
            tracing::info!(call_id = %request.correlation_key, "malformed message");
            return Ok(Disposition::Rejected(RejectReason::MalformedMessage));
        }

        match request.method {
            Method::Cancel => {
                if !runtime.has_transaction() {
                    tracing::debug!(call_id = %request.correlation_key, "CANCEL without transaction absorbed");
                    return Ok(Disposition::Absorbed);
                }
                let context = TransactionContext::new(config, request);
                return self.relay(runtime, context).map(Disposition::Relayed);
            }
            Method::Ack if !request.in_dialog => {
                let matched = runtime.has_transaction();
                tracing::debug!(call_id = %request.correlation_key, matched, "out-of-dialog ACK absorbed");
                return Ok(Disposition::Absorbed);
            }
            _ => {}
        }

        if request.in_dialog {
            return self.route_within_dialog(runtime, request, config);
        }

        if runtime.is_from_destination_set(config.destination_set) {
            tracing::debug!(call_id = %request.correlation_key, "request from destination set relayed as-is");
            let context = TransactionContext::new(config, request);
            return self.relay(runtime, context).map(Disposition::Relayed);
        }

        if request.method == Method::Register {
            return self.route_register(runtime, request, config);
        }
        if request.method.is_presence() {
            return Ok(Disposition::Rejected(RejectReason::NotFound));
        }
        if request
            .request_user
            .as_deref()
            .is_none_or(|user| user.is_empty())
        {
            return Ok(Disposition::Rejected(RejectReason::AddressIncomplete));
        }

        self.route_dispatch(runtime, request, config)
    }

    fn route_within_dialog<R>(
        &self,
        runtime: &mut R,
        request: &InboundRequest,
        config: Arc<DispatchConfig>,
    ) -> Result<Disposition, DispatchError>
    where
        R: ProxyRuntime + ?Sized,
    {
        if runtime.loose_route() {
            let mut context = TransactionContext::new(config, request);
            if context.config.call_affinity {
                context.call_record = true;
                let calls = CallDestinationCache::from_config(self.store.as_ref(), &context.config);
                match calls.get(&request.correlation_key) {
                    Ok(Some(destination)) => {
                        tracing::debug!(
                            call_id = %request.correlation_key,
                            destination = %destination,
                            "call record applied to in-dialog request"
                        );
                        runtime.set_destination(&destination);
                        context.destination = Some(destination);
                        context.source = RouteSource::CallRecord;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(call_id = %request.correlation_key, error = %err, "call record lookup failed")
                    }
                }
            }
            return self.relay(runtime, context).map(Disposition::Relayed);
        }

        if request.method == Method::Ack {
            if runtime.has_transaction() {
                let context = TransactionContext::new(config, request);
                return self.relay(runtime, context).map(Disposition::Relayed);
            }
            return Ok(Disposition::Absorbed);
        }
        Ok(Disposition::Rejected(RejectReason::NotFound))
    }

    fn route_register<R>(
        &self,
        runtime: &mut R,
        request: &InboundRequest,
        config: Arc<DispatchConfig>,
    ) -> Result<Disposition, DispatchError>
    where
        R: ProxyRuntime + ?Sized,
    {
        let contact = request.contact.as_deref().unwrap_or_default();
        let aor = config
            .subscriber_format
            .subscriber_from_contact(contact)
            .ok_or_else(|| DispatchError::InvalidSubscriber {
                contact: contact.to_owned(),
            })?;

        if runtime.authorize() == Authorization::Challenge {
            return Ok(Disposition::Rejected(RejectReason::AuthenticationChallenge));
        }

        let mode = config.registration_mode;
        let save_mode = match mode {
            RegistrationMode::Local => SaveMode::Reply,
            RegistrationMode::Forward => SaveMode::Silent,
        };

        if request.is_unregister() {
            tracing::info!(aor = %aor, contact, "un-registration received");
            save_binding(runtime, &aor, save_mode)?;
            let release = self.release_unbound(&config, &aor);
            return match mode {
                RegistrationMode::Local => Ok(Disposition::Unregistered { aor, release }),
                RegistrationMode::Forward => {
                    let context = TransactionContext::new(config, request);
                    self.forward_register(runtime, context, aor)
                }
            };
        }

        tracing::info!(aor = %aor, contact, "registration received");
        let evictor = BindingCapacityEvictor::new(self.registry.as_ref(), config.max_bindings);
        let admission = evictor.admit(&aor, contact_uri(contact));
        save_binding(runtime, &aor, save_mode)?;

        match mode {
            RegistrationMode::Local => {
                if config.locality {
                    let locality = LocalityMap::from_config(self.store.as_ref(), &config);
                    if let Err(err) = locality.record_if_absent(&aor, &config.node_destination()) {
                        tracing::warn!(aor = %aor, error = %err, "locality record write failed");
                    }
                }
                Ok(Disposition::Registered { aor, admission })
            }
            RegistrationMode::Forward => {
                let mut context = TransactionContext::new(config, request);
                if context.config.locality {
                    context.pending_locality = Some(aor.clone());
                }
                self.forward_register(runtime, context, aor)
            }
        }
    }

    fn forward_register<R>(
        &self,
        runtime: &mut R,
        mut context: TransactionContext,
        aor: Aor,
    ) -> Result<Disposition, DispatchError>
    where
        R: ProxyRuntime + ?Sized,
    {
        let mut selector = DestinationSelector::from_config(&context.config);
        self.resolve_destination(runtime, &mut selector, &mut context, &aor, false)?;
        context.subscriber = Some(aor);
        self.arm_and_relay(runtime, context)
    }

    fn route_dispatch<R>(
        &self,
        runtime: &mut R,
        request: &InboundRequest,
        config: Arc<DispatchConfig>,
    ) -> Result<Disposition, DispatchError>
    where
        R: ProxyRuntime + ?Sized,
    {
        let contact = request.contact.as_deref().unwrap_or_default();
        let aor = config
            .subscriber_format
            .subscriber_from_contact(contact)
            .ok_or_else(|| DispatchError::InvalidSubscriber {
                contact: contact.to_owned(),
            })?;

        let mut context = TransactionContext::new(config, request);
        let mut selector = DestinationSelector::from_config(&context.config);
        let use_call_record = context.config.call_affinity;
        self.resolve_destination(runtime, &mut selector, &mut context, &aor, use_call_record)?;
        context.subscriber = Some(aor);
        context.call_record = use_call_record;
        self.arm_and_relay(runtime, context)
    }

    /// 按“呼叫记录 → 订阅者亲和 → 新选择”的优先级解析目的地。
    ///
    /// - **后置条件**：成功时 Runtime 的当前目标已指向返回的目的地，`context` 记录了来源。
    fn resolve_destination<R>(
        &self,
        runtime: &mut R,
        selector: &mut DestinationSelector,
        context: &mut TransactionContext,
        aor: &Aor,
        use_call_record: bool,
    ) -> Result<(), DispatchError>
    where
        R: ProxyRuntime + ?Sized,
    {
        let config = Arc::clone(&context.config);
        if use_call_record {
            let calls = CallDestinationCache::from_config(self.store.as_ref(), &config);
            match calls.get(&context.correlation_key) {
                Ok(Some(destination)) => {
                    tracing::debug!(
                        call_id = %context.correlation_key,
                        destination = %destination,
                        "call record hit"
                    );
                    runtime.set_destination(&destination);
                    context.destination = Some(destination);
                    context.source = RouteSource::CallRecord;
                    return Ok(());
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(call_id = %context.correlation_key, error = %err, "call record lookup failed")
                }
            }
        }

        let (destination, source) = if config.subscriber_affinity {
            let affinity = AffinityCache::from_config(self.store.as_ref(), &config);
            let (destination, source) =
                affinity.resolve(runtime, selector, aor, config.refresh_affinity_on_hit)?;
            let source = match source {
                AffinitySource::Cached => RouteSource::Affinity,
                AffinitySource::Selected => RouteSource::Selected,
            };
            (destination, source)
        } else {
            (selector.select(runtime, aor)?, RouteSource::Selected)
        };
        context.destination = Some(destination);
        context.source = source;
        Ok(())
    }

    /// 新选择且未开启粘滞模式时挂载故障转移，然后转发；转发成功后写入呼叫记录。
    fn arm_and_relay<R>(
        &self,
        runtime: &mut R,
        mut context: TransactionContext,
    ) -> Result<Disposition, DispatchError>
    where
        R: ProxyRuntime + ?Sized,
    {
        if !context.config.subscriber_affinity && context.source == RouteSource::Selected {
            context.failover = Some(FailoverController::new(
                context.config.retry_statuses.clone(),
            ));
        }
        let mut context = self.relay(runtime, context)?;

        if let (Some(failover), Some(destination)) =
            (context.failover.as_mut(), context.destination.clone())
        {
            failover.on_relayed(destination)?;
        }
        if context.call_record && context.source != RouteSource::CallRecord {
            if let Some(destination) = context.destination.as_ref() {
                let calls = CallDestinationCache::from_config(self.store.as_ref(), &context.config);
                if let Err(err) = calls.put(&context.correlation_key, destination, calls.ttl()) {
                    tracing::warn!(call_id = %context.correlation_key, error = %err, "call record write failed");
                }
            }
        }
        Ok(Disposition::Relayed(context))
    }

    fn relay<R>(
        &self,
        runtime: &mut R,
        context: TransactionContext,
    ) -> Result<TransactionContext, DispatchError>
    where
        R: ProxyRuntime + ?Sized,
    {
        match runtime.relay() {
            Ok(()) => {
                tracing::debug!(
                    call_id = %context.correlation_key,
                    destination = ?context.destination,
                    source = ?context.source,
                    "request relayed"
                );
                Ok(context)
            }
            Err(err) => Err(DispatchError::Relay {
                destination: context
                    .destination
                    .as_ref()
                    .map_or_else(|| "<runtime route>".to_owned(), |dst| dst.to_string()),
                detail: err.detail,
            }),
        }
    }

    /// 处理一个分支事件（响应、分支超时或取消）。
    ///
    /// # 教案式注释
    /// - **执行 (How)**：
    ///   1. 挂载了故障转移时先交给状态机；若已转向新目的地，开启呼叫亲和时改写呼叫记录并返回 `Retried`；
    ///   2. 终结响应（任何 ≥300 的最终响应、分支超时、非 INVITE 的 2xx）清除呼叫记录；
    ///   3. 转发模式 REGISTER 收到 2xx 时写入归属记录，归属者为实际处理注册的后端。
    /// - **契约 (What)**：状态机报告非法事件时记录告警并照常上行响应，不中断事务。
    pub fn handle_reply<R>(
        &self,
        runtime: &mut R,
        context: &mut TransactionContext,
        event: BranchEvent,
    ) -> ReplyOutcome
    where
        R: ProxyRuntime + ?Sized,
    {
        let mut outcome = ReplyOutcome::Forward;
        if let Some(failover) = context.failover.as_mut() {
            match failover.on_branch(runtime, event.clone()) {
                Ok(step) => {
                    if let Some(destination) = step.relayed_to {
                        context.destination = Some(destination.clone());
                        if context.call_record {
                            let calls =
                                CallDestinationCache::from_config(self.store.as_ref(), &context.config);
                            if let Err(err) =
                                calls.put(&context.correlation_key, &destination, calls.ttl())
                            {
                                tracing::warn!(call_id = %context.correlation_key, error = %err, "call record rewrite failed");
                            }
                        }
                        return ReplyOutcome::Retried(destination);
                    }
                    if step.propagate {
                        outcome = ReplyOutcome::Propagate {
                            last_status: step.last_status,
                        };
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        call_id = %context.correlation_key,
                        error = %err,
                        code = err.code(),
                        "failover event ignored"
                    );
                }
            }
        }

        let terminal = match event {
            BranchEvent::Reply { status } if status >= 300 => true,
            BranchEvent::Reply { status } if (200..300).contains(&status) => {
                context.method != Method::Invite
            }
            BranchEvent::Timeout { .. } => true,
            _ => false,
        };
        if terminal && context.call_record {
            let calls = CallDestinationCache::from_config(self.store.as_ref(), &context.config);
            if let Err(err) = calls.delete(&context.correlation_key) {
                tracing::warn!(call_id = %context.correlation_key, error = %err, "call record delete failed");
            }
        }

        if let BranchEvent::Reply { status: 200..=299 } = event {
            if let (Some(aor), Some(owner)) =
                (context.pending_locality.take(), context.destination.as_ref())
            {
                let locality = LocalityMap::from_config(self.store.as_ref(), &context.config);
                if let Err(err) = locality.record_if_absent(&aor, owner) {
                    tracing::warn!(aor = %aor, error = %err, "locality record write failed");
                }
            }
        }
        outcome
    }

    /// 处理注册表的绑定过期通知。
    ///
    /// - **契约 (What)**：`address` 为过期绑定的地址；无法提取订阅者时返回 `None`；
    ///   否则执行与注销相同的归属清理，并返回清理结果。
    pub fn handle_binding_expired(&self, address: &str) -> Option<Release> {
        let uri = contact_uri(address);
        tracing::info!(contact = %uri, "binding expired");
        let Some(aor) = Aor::from_contact(uri) else {
            tracing::warn!(address, "expired binding carries no subscriber");
            return None;
        };
        let config = self.config.snapshot();
        Some(self.release_unbound(&config, &aor))
    }

    /// 管理性重置：删除订阅者的亲和记录，下一次决策将重新选择。
    pub fn reset_affinity(&self, aor: &Aor) -> Result<(), DispatchError> {
        let config = self.config.snapshot();
        AffinityCache::from_config(self.store.as_ref(), &config).invalidate(aor)
    }

    /// 订阅者已无绑定时清理归属记录（以及按配置清理亲和记录）。
    fn release_unbound(&self, config: &DispatchConfig, aor: &Aor) -> Release {
        let release = if config.locality {
            LocalityMap::from_config(self.store.as_ref(), config)
                .release_if_unbound(self.registry.as_ref(), aor)
                .unwrap_or_else(|err| {
                    tracing::warn!(aor = %aor, error = %err, "locality release failed");
                    Release::Unknown
                })
        } else {
            match self.registry.lookup_bindings(aor) {
                Ok(bindings) if bindings.is_empty() => Release::Released,
                Ok(bindings) => Release::Retained {
                    remaining: bindings.len(),
                },
                Err(err) => {
                    tracing::warn!(aor = %aor, error = %err, "binding lookup failed during cleanup");
                    Release::Unknown
                }
            }
        };

        if release == Release::Released && config.invalidate_affinity_on_empty {
            let affinity = AffinityCache::from_config(self.store.as_ref(), config);
            if let Err(err) = affinity.invalidate(aor) {
                tracing::warn!(aor = %aor, error = %err, "affinity invalidation failed");
            }
        }
        release
    }
}

fn save_binding<R>(runtime: &mut R, aor: &Aor, mode: SaveMode) -> Result<(), DispatchError>
where
    R: ProxyRuntime + ?Sized,
{
    runtime
        .save_binding(mode)
        .map_err(|err| DispatchError::Registration {
            aor: aor.to_string(),
            detail: err.detail,
        })?;
    tracing::info!(aor = %aor, ?mode, "binding saved");
    Ok(())
}
