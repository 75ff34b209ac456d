//! # LocalityMap（regmap）：绑定归属映射
//!
//! ## 核心意图（Why）
//! - 多个无状态前端并存时，注销与故障清理必须送到真正持有绑定的节点；
//! - 归属记录把订阅者映射到持有其绑定的集群成员/目的地，首次注册成功时写入，绑定全部消失时删除。
//!
//! ## 行为契约（What）
//! - 记录以结构化值存放：`owner`（归属目的地）与 `recorded_by`（写入记录的节点）；
//! - [`LocalityMap::record_if_absent`] 只在没有记录时写入，已有记录不被覆盖；
//! - [`LocalityMap::release_if_unbound`] 在注册表确认订阅者已无绑定时删除记录；
//!   注册表不可达时保留记录，宁可多留一条也不误删仍有效的归属。

use std::{collections::BTreeMap, time::Duration};

use crate::config::DispatchConfig;
use crate::core::{
    runtime::{AffinityStore, ContactRegistry},
    types::{Aor, Destination},
    value::StoredValue,
};
use crate::error::{DispatchError, StoreError};

const FIELD_OWNER: &str = "owner";
const FIELD_RECORDED_BY: &str = "recorded_by";

/// 一条归属记录。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LocalityRecord {
    pub owner: Destination,
    pub recorded_by: String,
}

impl LocalityRecord {
    pub fn to_value(&self) -> StoredValue {
        let mut record = BTreeMap::new();
        record.insert(FIELD_OWNER.to_owned(), self.owner.as_str().to_owned());
        record.insert(FIELD_RECORDED_BY.to_owned(), self.recorded_by.clone());
        StoredValue::Record(record)
    }

    /// 从表值还原；早期部署写入的纯文本值视为只有归属目的地的记录。
    pub fn from_value(value: &StoredValue) -> Option<Self> {
        if let Some(record) = value.as_record() {
            let owner = record.get(FIELD_OWNER).filter(|owner| !owner.is_empty())?;
            return Some(Self {
                owner: Destination::from(owner.as_str()),
                recorded_by: record.get(FIELD_RECORDED_BY).cloned().unwrap_or_default(),
            });
        }
        value.as_destination().map(|owner| Self {
            owner,
            recorded_by: String::new(),
        })
    }
}

/// 归属清理的结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Release {
    /// 订阅者已无绑定；启用归属映射时记录已删除。
    Released,
    /// 订阅者仍有 `remaining` 条绑定，记录保留。
    Retained { remaining: usize },
    /// 注册表不可达，记录保留。
    Unknown,
}

/// 归属表的视图。
#[derive(Clone, Copy)]
pub struct LocalityMap<'a> {
    store: &'a dyn AffinityStore,
    table: &'a str,
    ttl: Duration,
    node_id: &'a str,
}

impl<'a> LocalityMap<'a> {
    pub fn new(store: &'a dyn AffinityStore, table: &'a str, ttl: Duration, node_id: &'a str) -> Self {
        Self {
            store,
            table,
            ttl,
            node_id,
        }
    }

    pub fn from_config(store: &'a dyn AffinityStore, config: &'a DispatchConfig) -> Self {
        Self::new(
            store,
            config.tables.locality.as_str(),
            config.locality_ttl(),
            config.node_id.as_str(),
        )
    }

    pub fn get(&self, aor: &Aor) -> Result<Option<LocalityRecord>, DispatchError> {
        let value = self.store.get(self.table, aor).map_err(|err| self.store_error(err))?;
        Ok(value.as_ref().and_then(LocalityRecord::from_value))
    }

    /// 订阅者尚无归属记录时写入 `owner`。
    ///
    /// - **返回值**：写入返回 `true`；已有记录返回 `false`。
    pub fn record_if_absent(&self, aor: &Aor, owner: &Destination) -> Result<bool, DispatchError> {
        if self.get(aor)?.is_some() {
            return Ok(false);
        }
        let record = LocalityRecord {
            owner: owner.clone(),
            recorded_by: self.node_id.to_owned(),
        };
        self.store
            .set_with_expire(self.table, aor, record.to_value(), self.ttl)
            .map_err(|err| self.store_error(err))?;
        tracing::info!(aor = %aor, owner = %owner, "locality record created");
        Ok(true)
    }

    pub fn delete(&self, aor: &Aor) -> Result<(), DispatchError> {
        self.store
            .delete(self.table, aor)
            .map_err(|err| self.store_error(err))
    }

    /// 注册表确认订阅者已无绑定时删除归属记录。
    pub fn release_if_unbound(
        &self,
        registry: &dyn ContactRegistry,
        aor: &Aor,
    ) -> Result<Release, DispatchError> {
        let bindings = match registry.lookup_bindings(aor) {
            Ok(bindings) => bindings,
            Err(err) => {
                tracing::warn!(aor = %aor, error = %err, "binding lookup failed, locality record kept");
                return Ok(Release::Unknown);
            }
        };
        if !bindings.is_empty() {
            return Ok(Release::Retained {
                remaining: bindings.len(),
            });
        }
        self.delete(aor)?;
        tracing::info!(aor = %aor, "locality record released");
        Ok(Release::Released)
    }

    fn store_error(&self, err: StoreError) -> DispatchError {
        DispatchError::Store {
            table: self.table.to_owned(),
            detail: err.detail,
        }
    }
}
