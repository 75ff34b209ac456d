//! # AffinityCache：订阅者级粘滞绑定
//!
//! ## 核心意图（Why）
//! - 粘滞模式下，同一订阅者的重复注册与呼叫在 TTL 内固定到同一后端，保证后端侧状态连续；
//! - 记录存放在集群共享表中，任何 Worker 都能命中其它 Worker 写下的选择。
//!
//! ## 行为契约（What）
//! - 表项为 `AOR → 目的地`，写入时设定 TTL（默认 24 小时），覆盖写即重新选择；
//! - 没有显式逐出，仅依赖 TTL 过期或管理性重置触发的删除；
//! - 读失败按未命中处理（fail-open），写失败只记录日志。

use std::time::Duration;

use crate::applications::selector::DestinationSelector;
use crate::config::DispatchConfig;
use crate::core::{
    runtime::{AffinityStore, ProxyRuntime},
    types::{Aor, Destination},
    value::StoredValue,
};
use crate::error::DispatchError;

/// 亲和解析结果来自哪里。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AffinitySource {
    /// 命中已有记录。
    Cached,
    /// 未命中，经选择器新选出并写回。
    Selected,
}

/// 订阅者亲和表的视图。
///
/// - **契约 (What)**：视图只借用共享表与表名，按请求构造，不持有任何进程内可变状态。
#[derive(Clone, Copy)]
pub struct AffinityCache<'a> {
    store: &'a dyn AffinityStore,
    table: &'a str,
    ttl: Duration,
}

impl<'a> AffinityCache<'a> {
    pub fn new(store: &'a dyn AffinityStore, table: &'a str, ttl: Duration) -> Self {
        Self { store, table, ttl }
    }

    pub fn from_config(store: &'a dyn AffinityStore, config: &'a DispatchConfig) -> Self {
        Self::new(
            store,
            config.tables.affinity.as_str(),
            config.subscriber_affinity_ttl(),
        )
    }

    /// 查询订阅者的粘滞目的地。
    ///
    /// - **契约 (What)**：表项缺失、已过期或形状不是非空文本时返回 `Ok(None)`；共享表故障返回 `Err`。
    pub fn get(&self, aor: &Aor) -> Result<Option<Destination>, DispatchError> {
        let value = self.store.get(self.table, aor).map_err(|err| self.store_error(err))?;
        Ok(value.and_then(|value| {
            let destination = value.as_destination();
            if destination.is_none() {
                tracing::warn!(aor = %aor, table = self.table, ?value, "ignoring malformed affinity record");
            }
            destination
        }))
    }

    /// 写入（或覆盖）订阅者的粘滞目的地。
    pub fn put(
        &self,
        aor: &Aor,
        destination: &Destination,
        ttl: Duration,
    ) -> Result<(), DispatchError> {
        tracing::info!(
            aor = %aor,
            destination = %destination,
            ttl_secs = ttl.as_secs(),
            "affinity record stored"
        );
        self.store
            .set_with_expire(self.table, aor, StoredValue::destination(destination), ttl)
            .map_err(|err| self.store_error(err))
    }

    /// 删除订阅者的粘滞记录（管理性重置或最后一条绑定消失时使用）。
    pub fn invalidate(&self, aor: &Aor) -> Result<(), DispatchError> {
        tracing::info!(aor = %aor, "affinity record deleted");
        self.store
            .delete(self.table, aor)
            .map_err(|err| self.store_error(err))
    }

    /// 按粘滞策略为订阅者解析目的地。
    ///
    /// # 教案式注释
    /// - **执行 (How)**：
    ///   1. 查询亲和表；读失败记录告警后按未命中继续；
    ///   2. 命中：把目的地设为当前事务目标，`refresh` 为真时以配置 TTL 重新写入；
    ///   3. 未命中：调用选择器新选目的地，再写回亲和表；写失败不影响本次决策。
    /// - **契约 (What)**：只有选择器失败（无目的地）会返回 `Err`。
    pub fn resolve<R>(
        &self,
        runtime: &mut R,
        selector: &mut DestinationSelector,
        aor: &Aor,
        refresh: bool,
    ) -> Result<(Destination, AffinitySource), DispatchError>
    where
        R: ProxyRuntime + ?Sized,
    {
        let cached = self.get(aor).unwrap_or_else(|err| {
            tracing::warn!(aor = %aor, error = %err, "affinity lookup failed, selecting afresh");
            None
        });

        if let Some(destination) = cached {
            tracing::debug!(aor = %aor, destination = %destination, "affinity hit");
            runtime.set_destination(&destination);
            if refresh {
                self.put_or_warn(aor, &destination);
            }
            return Ok((destination, AffinitySource::Cached));
        }

        tracing::debug!(aor = %aor, "affinity miss");
        let destination = selector.select(runtime, aor)?;
        self.put_or_warn(aor, &destination);
        Ok((destination, AffinitySource::Selected))
    }

    fn put_or_warn(&self, aor: &Aor, destination: &Destination) {
        if let Err(err) = self.put(aor, destination, self.ttl) {
            tracing::warn!(aor = %aor, error = %err, "affinity write failed");
        }
    }

    fn store_error(&self, err: crate::error::StoreError) -> DispatchError {
        DispatchError::Store {
            table: self.table.to_owned(),
            detail: err.detail,
        }
    }
}
