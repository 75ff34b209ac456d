//! 集成测试共享的脚本化 Proxy Runtime 与可注入故障的外部表。
//!
//! # 教案级说明
//! - **意图 (Why)**：引擎的全部副作用都经由 `ProxyRuntime`、`AffinityStore`、`ContactRegistry` 三个契约发生，
//!   用脚本化替身即可精确统计“选择几次、前进几次、转发到哪里”；
//! - **契约 (What)**：`ScriptedRuntime` 以固定顺序的目的地集合模拟轮询选择，`next_destination`
//!   依次给出所选成员之后的其余成员，集合耗尽返回 `None`；
//! - **用法 (How)**：同一个 Runtime 处理多个请求时，调用 [`ScriptedRuntime::next_request`] 清空事务级状态。

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use spark_dispatcher::{
    AffinityStore, Aor, Authorization, Binding, ContactRegistry, Destination,
    MemoryContactRegistry, ProxyRuntime, RegistryError, RelayError, SaveMode, SelectionAlgorithm,
    StoreError, StoredValue,
};

pub const SUBSCRIBER: &str = "s01234567890";
pub const CONTACT: &str = "<sip:s01234567890@198.51.100.7:5060;transport=udp>";
pub const CONTACT_ADDRESS: &str = "sip:s01234567890@198.51.100.7:5060;transport=udp";

pub fn aor() -> Aor {
    Aor::from(SUBSCRIBER)
}

pub fn dst(raw: &str) -> Destination {
    Destination::from(raw)
}

/// `save_binding` 被调用时对注册表施加的效果。
#[derive(Clone, Debug)]
pub enum SaveEffect {
    Nothing,
    Upsert(Aor, Binding),
    Remove(Aor, String),
}

#[derive(Debug)]
pub struct ScriptedRuntime {
    set: Vec<Destination>,
    round_robin: usize,
    remaining: VecDeque<Destination>,
    pub current: Option<Destination>,
    pub relay_results: VecDeque<Result<(), RelayError>>,
    pub relayed: Vec<Option<Destination>>,
    pub select_calls: usize,
    pub next_calls: usize,
    pub set_destination_calls: usize,
    pub cancelled: bool,
    pub authorization: Authorization,
    pub from_destination_set: bool,
    pub transaction_exists: bool,
    pub loose_routed: bool,
    pub max_forwards_ok: bool,
    pub sane: bool,
    pub saved: Vec<SaveMode>,
    pub save_fails: bool,
    pub save_effect: SaveEffect,
    pub registry: MemoryContactRegistry,
}

impl ScriptedRuntime {
    pub fn new(set: &[&str]) -> Self {
        Self::with_registry(set, MemoryContactRegistry::new())
    }

    pub fn with_registry(set: &[&str], registry: MemoryContactRegistry) -> Self {
        Self {
            set: set.iter().map(|raw| dst(raw)).collect(),
            round_robin: 0,
            remaining: VecDeque::new(),
            current: None,
            relay_results: VecDeque::new(),
            relayed: Vec::new(),
            select_calls: 0,
            next_calls: 0,
            set_destination_calls: 0,
            cancelled: false,
            authorization: Authorization::Authorized,
            from_destination_set: false,
            transaction_exists: false,
            loose_routed: false,
            max_forwards_ok: true,
            sane: true,
            saved: Vec::new(),
            save_fails: false,
            save_effect: SaveEffect::Nothing,
            registry,
        }
    }

    /// 开始处理下一个请求：清空事务级状态，保留计数与轮询位置。
    pub fn next_request(&mut self) {
        self.remaining.clear();
        self.current = None;
        self.cancelled = false;
        self.transaction_exists = false;
        self.loose_routed = false;
        self.save_effect = SaveEffect::Nothing;
    }

    pub fn relay_count(&self) -> usize {
        self.relayed.len()
    }
}

impl ProxyRuntime for ScriptedRuntime {
    fn check_max_forwards(&mut self, _limit: u32) -> bool {
        self.max_forwards_ok
    }

    fn sanity_check(&mut self) -> bool {
        self.sane
    }

    fn authorize(&mut self) -> Authorization {
        self.authorization
    }

    fn has_transaction(&mut self) -> bool {
        self.transaction_exists
    }

    fn loose_route(&mut self) -> bool {
        self.loose_routed
    }

    fn is_from_destination_set(&self, _set_id: u32) -> bool {
        self.from_destination_set
    }

    fn select_destination(
        &mut self,
        _set_id: u32,
        _algorithm: SelectionAlgorithm,
    ) -> Option<Destination> {
        self.select_calls += 1;
        if self.set.is_empty() {
            return None;
        }
        let index = self.round_robin % self.set.len();
        self.round_robin += 1;
        let len = self.set.len();
        self.remaining = (1..len)
            .map(|offset| self.set[(index + offset) % len].clone())
            .collect();
        let chosen = self.set[index].clone();
        self.current = Some(chosen.clone());
        Some(chosen)
    }

    fn next_destination(&mut self) -> Option<Destination> {
        self.next_calls += 1;
        let next = self.remaining.pop_front()?;
        self.current = Some(next.clone());
        Some(next)
    }

    fn set_destination(&mut self, destination: &Destination) {
        self.set_destination_calls += 1;
        self.current = Some(destination.clone());
    }

    fn relay(&mut self) -> Result<(), RelayError> {
        let result = self.relay_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.relayed.push(self.current.clone());
        }
        result
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    fn save_binding(&mut self, mode: SaveMode) -> Result<(), RegistryError> {
        if self.save_fails {
            return Err(RegistryError::new("usrloc write failed"));
        }
        self.saved.push(mode);
        match std::mem::replace(&mut self.save_effect, SaveEffect::Nothing) {
            SaveEffect::Nothing => {}
            SaveEffect::Upsert(aor, binding) => {
                self.registry.upsert(aor, binding);
            }
            SaveEffect::Remove(aor, address) => {
                self.registry.remove_binding(&aor, &address)?;
            }
        }
        Ok(())
    }
}

/// 一直不可达的共享表，用于验证 fail-open。
#[derive(Debug, Default)]
pub struct UnreachableStore;

impl AffinityStore for UnreachableStore {
    fn get(&self, _table: &str, _key: &str) -> Result<Option<StoredValue>, StoreError> {
        Err(StoreError::new("htable peer unreachable"))
    }

    fn set_with_expire(
        &self,
        _table: &str,
        _key: &str,
        _value: StoredValue,
        _ttl: std::time::Duration,
    ) -> Result<(), StoreError> {
        Err(StoreError::new("htable peer unreachable"))
    }

    fn delete(&self, _table: &str, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::new("htable peer unreachable"))
    }
}

/// 可按开关注入查询/移除失败的注册表。
#[derive(Debug, Clone, Default)]
pub struct FlakyRegistry {
    pub inner: MemoryContactRegistry,
    fail_lookup: Arc<AtomicBool>,
    fail_remove: Arc<AtomicBool>,
}

impl FlakyRegistry {
    pub fn new(inner: MemoryContactRegistry) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn fail_lookup(&self, fail: bool) {
        self.fail_lookup.store(fail, Ordering::SeqCst);
    }

    pub fn fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }
}

impl ContactRegistry for FlakyRegistry {
    fn lookup_bindings(&self, aor: &Aor) -> Result<Vec<Binding>, RegistryError> {
        if self.fail_lookup.load(Ordering::SeqCst) {
            return Err(RegistryError::new("ul.lookup timed out"));
        }
        self.inner.lookup_bindings(aor)
    }

    fn remove_binding(&self, aor: &Aor, address: &str) -> Result<(), RegistryError> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(RegistryError::new("unregister rejected"));
        }
        self.inner.remove_binding(aor, address)
    }
}
