//! # CallDestinationCache：呼叫级目的地绑定
//!
//! ## 核心意图（Why）
//! - 同一通呼叫的后续请求（ACK、BYE、re-INVITE 等）必须落到同一后端，否则后端会以“事务/对话不存在”拒绝；
//! - 该保证强于订阅者亲和：记录存在期间，无论粘滞模式是否开启，路由都必须复用其目的地。
//!
//! ## 行为契约（What）
//! - 表项为 `关联键 → 目的地`，默认 TTL 1 小时，仅作为漏删的兜底；
//! - 唯一的主动删除路径是 Runtime 通知的终结响应，由流水线调用 [`CallDestinationCache::delete`]。

use std::time::Duration;

use crate::config::DispatchConfig;
use crate::core::{
    runtime::AffinityStore,
    types::{CorrelationKey, Destination},
    value::StoredValue,
};
use crate::error::{DispatchError, StoreError};

/// 呼叫亲和表的视图。
#[derive(Clone, Copy)]
pub struct CallDestinationCache<'a> {
    store: &'a dyn AffinityStore,
    table: &'a str,
    ttl: Duration,
}

impl<'a> CallDestinationCache<'a> {
    pub fn new(store: &'a dyn AffinityStore, table: &'a str, ttl: Duration) -> Self {
        Self { store, table, ttl }
    }

    pub fn from_config(store: &'a dyn AffinityStore, config: &'a DispatchConfig) -> Self {
        Self::new(store, config.tables.call.as_str(), config.call_affinity_ttl())
    }

    /// 配置中的兜底 TTL。
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &CorrelationKey) -> Result<Option<Destination>, DispatchError> {
        let value = self.store.get(self.table, key).map_err(|err| self.store_error(err))?;
        Ok(value.and_then(|value| value.as_destination()))
    }

    pub fn put(
        &self,
        key: &CorrelationKey,
        destination: &Destination,
        ttl: Duration,
    ) -> Result<(), DispatchError> {
        tracing::debug!(call_id = %key, destination = %destination, "call record stored");
        self.store
            .set_with_expire(self.table, key, StoredValue::destination(destination), ttl)
            .map_err(|err| self.store_error(err))
    }

    pub fn delete(&self, key: &CorrelationKey) -> Result<(), DispatchError> {
        tracing::debug!(call_id = %key, "call record cleared");
        self.store
            .delete(self.table, key)
            .map_err(|err| self.store_error(err))
    }

    fn store_error(&self, err: StoreError) -> DispatchError {
        DispatchError::Store {
            table: self.table.to_owned(),
            detail: err.detail,
        }
    }
}
