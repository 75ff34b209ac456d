//! # 分发配置
//!
//! ## 核心意图（Why）
//! - 粘滞模式、呼叫亲和、归属映射等开关过去散落在全局标志与设置表中，每个请求临时读取；
//! - 这里将它们收拢为一个显式的 [`DispatchConfig`]，在构造流水线时注入，并由
//!   [`DispatchRuntimeConfig`] 提供“读无锁、写原子替换”的运行时切换能力。
//!
//! ## 行为契约（What）
//! - 所有字段都有默认值，TOML 文档只需写出需要覆盖的键；
//! - [`DispatchConfig::validate`] 拒绝无法工作的取值，[`DispatchConfig::from_toml_str`] 在解析后自动校验；
//! - 单个请求只读取一份快照，运行时切换不会在请求处理中途改变行为。

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use serde::Deserialize;

use crate::core::types::{Destination, SelectionAlgorithm, SubscriberFormat};
use crate::error::DispatchError;

/// 各类亲和 TTL 的上限（十年），保证过期时刻始终可由单调时钟表示。
pub const MAX_TTL_SECS: u64 = 10 * 365 * 86_400;

/// REGISTER 的处理方式。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationMode {
    /// 在本节点保存绑定并直接回应终端。
    #[default]
    Local,
    /// 本节点静默保存绑定后，把 REGISTER 转发给亲和选出的后端。
    Forward,
}

/// 共享表的表名。
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableNames {
    /// 订阅者亲和记录（AOR → 目的地）。
    pub affinity: String,
    /// 呼叫亲和记录（关联键 → 目的地）。
    pub call: String,
    /// 归属映射记录（AOR → 持有绑定的节点/目的地）。
    pub locality: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            affinity: "sticky".to_owned(),
            call: "callmap".to_owned(),
            locality: "regmap".to_owned(),
        }
    }
}

/// 分发流水线的全部配置。
///
/// # 教案式说明
/// - **意图 (Why)**：把“同一套设计的多个脚本分叉”收敛为一条由配置参数化的流水线；
/// - **契约 (What)**：
///   - `subscriber_affinity`：粘滞模式，开启后同一订阅者在 TTL 内固定到同一目的地；
///   - `call_affinity`：呼叫亲和，对话内请求复用首个请求选中的目的地，优先级高于订阅者亲和；
///   - `locality`：多前端部署下记录绑定的归属节点；
///   - `max_bindings`：每个订阅者允许的并发绑定上限；
///   - `retry_statuses`：触发故障转移的最终响应码；
///   - `invalidate_affinity_on_empty`：订阅者最后一条绑定消失时是否立即删除其亲和记录（默认保持惰性过期）。
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub subscriber_affinity: bool,
    pub call_affinity: bool,
    pub locality: bool,
    pub registration_mode: RegistrationMode,
    pub node_id: String,
    pub destination_set: u32,
    pub algorithm: SelectionAlgorithm,
    pub max_bindings: usize,
    pub subscriber_affinity_ttl_secs: u64,
    pub call_affinity_ttl_secs: u64,
    pub locality_ttl_secs: u64,
    pub refresh_affinity_on_hit: bool,
    pub invalidate_affinity_on_empty: bool,
    pub retry_statuses: Vec<u16>,
    pub max_forwards: u32,
    pub subscriber_format: SubscriberFormat,
    pub tables: TableNames,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            subscriber_affinity: false,
            call_affinity: true,
            locality: false,
            registration_mode: RegistrationMode::Local,
            node_id: "local".to_owned(),
            destination_set: 1,
            algorithm: SelectionAlgorithm::ROUND_ROBIN,
            max_bindings: 5,
            subscriber_affinity_ttl_secs: 86_400,
            call_affinity_ttl_secs: 3_600,
            locality_ttl_secs: 86_400,
            refresh_affinity_on_hit: false,
            invalidate_affinity_on_empty: false,
            retry_statuses: vec![500],
            max_forwards: 10,
            subscriber_format: SubscriberFormat::default(),
            tables: TableNames::default(),
        }
    }
}

impl DispatchConfig {
    /// 解析 TOML 文档并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self, DispatchError> {
        let config: Self = toml::from_str(raw).map_err(|err| DispatchError::Config {
            detail: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置是否可用。
    pub fn validate(&self) -> Result<(), DispatchError> {
        let invalid = |detail: &str| {
            Err(DispatchError::Config {
                detail: detail.to_owned(),
            })
        };
        if self.max_bindings == 0 {
            return invalid("max_bindings must be at least 1");
        }
        if self.subscriber_affinity_ttl_secs == 0
            || self.call_affinity_ttl_secs == 0
            || self.locality_ttl_secs == 0
        {
            return invalid("affinity TTLs must be positive");
        }
        if self.subscriber_affinity_ttl_secs > MAX_TTL_SECS
            || self.call_affinity_ttl_secs > MAX_TTL_SECS
            || self.locality_ttl_secs > MAX_TTL_SECS
        {
            return invalid("affinity TTLs must not exceed ten years");
        }
        if self.retry_statuses.is_empty() {
            return invalid("retry_statuses must name at least one status");
        }
        if self.retry_statuses.iter().any(|status| *status < 300) {
            return invalid("retry_statuses may only hold final failure statuses");
        }
        if self.tables.affinity.is_empty()
            || self.tables.call.is_empty()
            || self.tables.locality.is_empty()
        {
            return invalid("table names must not be empty");
        }
        if self.node_id.is_empty() {
            return invalid("node_id must not be empty");
        }
        if self.subscriber_format.digits == 0 && self.subscriber_format.prefix.is_empty() {
            return invalid("subscriber_format accepts only empty usernames");
        }
        Ok(())
    }

    pub fn subscriber_affinity_ttl(&self) -> Duration {
        Duration::from_secs(self.subscriber_affinity_ttl_secs)
    }

    pub fn call_affinity_ttl(&self) -> Duration {
        Duration::from_secs(self.call_affinity_ttl_secs)
    }

    pub fn locality_ttl(&self) -> Duration {
        Duration::from_secs(self.locality_ttl_secs)
    }

    /// 本地注册模式下写入归属记录的节点标识。
    pub fn node_destination(&self) -> Destination {
        Destination::from(self.node_id.as_str())
    }
}

/// 热更新友好的配置容器。
///
/// ### 设计目的（Why）
/// - 结合 [`ArcSwap`] 与纪元计数，实现“读无锁、写常数时间”的配置切换，粘滞模式开关即通过它生效；
///
/// ### 契约说明（What）
/// - `snapshot`：返回当前快照的 `Arc`，请求处理期间持有同一快照；
/// - `replace`：校验后原子替换并递增纪元，校验失败时保留旧配置。
#[derive(Debug)]
pub struct DispatchRuntimeConfig {
    epoch: AtomicU64,
    settings: ArcSwap<DispatchConfig>,
}

impl DispatchRuntimeConfig {
    pub fn new(initial: DispatchConfig) -> Result<Self, DispatchError> {
        initial.validate()?;
        Ok(Self {
            epoch: AtomicU64::new(0),
            settings: ArcSwap::new(Arc::new(initial)),
        })
    }

    pub fn snapshot(&self) -> Arc<DispatchConfig> {
        self.settings.load_full()
    }

    /// 配置纪元（从 0 开始），可用于调试日志确认切换是否生效。
    pub fn config_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn replace(&self, settings: DispatchConfig) -> Result<(), DispatchError> {
        settings.validate()?;
        self.settings.store(Arc::new(settings));
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(epoch, "dispatch configuration replaced");
        Ok(())
    }

    /// 切换粘滞模式，其余字段保持不变。
    pub fn set_subscriber_affinity(&self, enabled: bool) -> Result<(), DispatchError> {
        let mut next = DispatchConfig::clone(&self.snapshot());
        next.subscriber_affinity = enabled;
        self.replace(next)
    }
}
