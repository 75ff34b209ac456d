//! # 内存版外部表
//!
//! ## 核心意图（Why）
//! - 单节点部署或测试场景没有真正的集群共享表，用 `DashMap` 实现同一契约即可复用全部引擎逻辑；
//! - 作为 [`AffinityStore`] 与 [`ContactRegistry`] 的参考实现，明确 TTL 与幂等删除的语义。
//!
//! ## 行为契约（What）
//! - [`MemoryAffinityStore`]：TTL 在读取时惰性判定，过期表项在被读到时顺带清除；
//!   [`MemoryAffinityStore::purge_expired`] 供宿主定期整体清扫；
//! - [`MemoryContactRegistry`]：按首次注册顺序保存绑定，同一地址再次注册时原位刷新时间戳。
//!
//! ## 风险提示（Trade-offs）
//! - `DashMap` guard 持有期间会阻塞同分片写操作，本模块所有方法都在返回前释放 guard。

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;

use crate::core::{
    clock::{Clock, SystemClock},
    runtime::{AffinityStore, ContactRegistry},
    types::{Aor, Binding},
    value::StoredValue,
};
use crate::error::{RegistryError, StoreError};

#[derive(Clone, Debug)]
struct Slot {
    value: StoredValue,
    expires_at: Instant,
}

/// 进程内的亲和表实现。
#[derive(Debug, Clone)]
pub struct MemoryAffinityStore {
    slots: Arc<DashMap<(String, String), Slot>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryAffinityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAffinityStore {
    /// 使用系统时钟构造空表。
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// 使用指定时钟构造空表，测试中配合 `ManualClock` 推进时间。
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// 清除所有已过期表项，返回清除数量。
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut purged = 0;
        self.slots.retain(|_, slot| {
            let live = slot.expires_at > now;
            if !live {
                purged += 1;
            }
            live
        });
        purged
    }

    /// 当前表项数量（包含尚未被清扫的过期项）。
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl AffinityStore for MemoryAffinityStore {
    fn get(&self, table: &str, key: &str) -> Result<Option<StoredValue>, StoreError> {
        let slot_key = (table.to_owned(), key.to_owned());
        let now = self.clock.now();
        let live = self
            .slots
            .get(&slot_key)
            .map(|slot| (slot.expires_at > now, slot.value.clone()));
        match live {
            Some((true, value)) => Ok(Some(value)),
            Some((false, _)) => {
                self.slots
                    .remove_if(&slot_key, |_, slot| slot.expires_at <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set_with_expire(
        &self,
        table: &str,
        key: &str,
        value: StoredValue,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let expires_at = self.clock.now().checked_add(ttl).ok_or_else(|| {
            StoreError::new(format!("ttl of {}s exceeds the clock range", ttl.as_secs()))
        })?;
        self.slots
            .insert((table.to_owned(), key.to_owned()), Slot { value, expires_at });
        Ok(())
    }

    fn delete(&self, table: &str, key: &str) -> Result<(), StoreError> {
        self.slots.remove(&(table.to_owned(), key.to_owned()));
        Ok(())
    }
}

/// 进程内的绑定表实现。
///
/// # 教案式解读
/// - **意图（Why）**：保存 `Aor -> [Binding]` 映射，供淘汰器扫描与注销后的清理逻辑查询；
/// - **实现策略（How）**：内部持有 `Arc<DashMap<Aor, Vec<Binding>>>`，克隆实例共享同一张表；
/// - **后置条件**：`remove_binding` 对不存在的地址返回 `Ok(())`，订阅者最后一条绑定被移除时整条表项一并删除。
#[derive(Debug, Clone, Default)]
pub struct MemoryContactRegistry {
    inner: Arc<DashMap<Aor, Vec<Binding>>>,
}

impl MemoryContactRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册或刷新绑定。
    ///
    /// - **返回值**：若同一地址已存在，返回其旧的时间戳，便于调用方判断是否为刷新。
    pub fn upsert(&self, aor: Aor, binding: Binding) -> Option<u64> {
        let mut bindings = self.inner.entry(aor).or_default();
        match bindings
            .iter_mut()
            .find(|existing| existing.address == binding.address)
        {
            Some(existing) => {
                let previous = existing.last_modified;
                existing.last_modified = binding.last_modified;
                Some(previous)
            }
            None => {
                bindings.push(binding);
                None
            }
        }
    }

    /// 订阅者当前绑定数量。
    pub fn count(&self, aor: &Aor) -> usize {
        self.inner.get(aor).map_or(0, |bindings| bindings.len())
    }
}

impl ContactRegistry for MemoryContactRegistry {
    fn lookup_bindings(&self, aor: &Aor) -> Result<Vec<Binding>, RegistryError> {
        Ok(self
            .inner
            .get(aor)
            .map(|bindings| bindings.value().clone())
            .unwrap_or_default())
    }

    fn remove_binding(&self, aor: &Aor, address: &str) -> Result<(), RegistryError> {
        if let Some(mut bindings) = self.inner.get_mut(aor) {
            bindings.retain(|binding| binding.address != address);
        }
        self.inner.remove_if(aor, |_, bindings| bindings.is_empty());
        Ok(())
    }
}
