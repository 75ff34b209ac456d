//! # 外部协作方契约
//!
//! ## 核心意图（Why）
//! - 报文解析、事务簿记、鉴权、转发与负载均衡算法都由宿主的 Proxy Runtime 提供，本 crate 只消费其能力；
//! - 将这些能力收敛为三个 trait，引擎代码只依赖契约，既可接入真实宿主，也可在测试中以脚本化替身驱动。
//!
//! ## 架构定位（Where）
//! - [`AffinityStore`]：集群共享的键值表（get / 带 TTL 的 set / delete），所有 Worker 可见；
//! - [`ContactRegistry`]：订阅者绑定表（lookup / remove）；
//! - [`ProxyRuntime`]：当前事务的句柄，一个请求由一个 Worker 独占处理。
//!
//! ## 并发与一致性（Trade-offs）
//! - 外部表没有 CAS 或事务语义，所有写入“后写者胜”；引擎只要求最终收敛；
//! - 所有调用都是同步、可能阻塞在网络 I/O 上的调用，返回结果或失败，从不“发出即忘”。

use std::{sync::Arc, time::Duration};

use crate::core::{
    types::{Aor, Binding, Destination, SelectionAlgorithm},
    value::StoredValue,
};
use crate::error::{RegistryError, RelayError, StoreError};

/// 集群共享的键值表。
///
/// # 契约说明
/// - `get`：过期或不存在的键返回 `Ok(None)`；
/// - `set_with_expire`：覆盖写，`ttl` 从写入时刻起算；
/// - `delete`：删除不存在的键视为成功（幂等）。
pub trait AffinityStore: Send + Sync {
    fn get(&self, table: &str, key: &str) -> Result<Option<StoredValue>, StoreError>;

    fn set_with_expire(
        &self,
        table: &str,
        key: &str,
        value: StoredValue,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    fn delete(&self, table: &str, key: &str) -> Result<(), StoreError>;
}

impl<T: AffinityStore + ?Sized> AffinityStore for Arc<T> {
    fn get(&self, table: &str, key: &str) -> Result<Option<StoredValue>, StoreError> {
        (**self).get(table, key)
    }

    fn set_with_expire(
        &self,
        table: &str,
        key: &str,
        value: StoredValue,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        (**self).set_with_expire(table, key, value, ttl)
    }

    fn delete(&self, table: &str, key: &str) -> Result<(), StoreError> {
        (**self).delete(table, key)
    }
}

/// 订阅者绑定表。
///
/// # 契约说明
/// - `lookup_bindings`：按注册表内部顺序返回当前绑定，淘汰器依赖该顺序做并列裁决；
/// - `remove_binding`：移除已不存在的绑定应视为成功或返回可忽略的错误，淘汰是幂等的。
pub trait ContactRegistry: Send + Sync {
    fn lookup_bindings(&self, aor: &Aor) -> Result<Vec<Binding>, RegistryError>;

    fn remove_binding(&self, aor: &Aor, address: &str) -> Result<(), RegistryError>;
}

impl<T: ContactRegistry + ?Sized> ContactRegistry for Arc<T> {
    fn lookup_bindings(&self, aor: &Aor) -> Result<Vec<Binding>, RegistryError> {
        (**self).lookup_bindings(aor)
    }

    fn remove_binding(&self, aor: &Aor, address: &str) -> Result<(), RegistryError> {
        (**self).remove_binding(aor, address)
    }
}

/// REGISTER 鉴权结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Authorization {
    /// 凭据有效，可继续处理。
    Authorized,
    /// 需要向终端发起挑战，Runtime 负责构造挑战响应。
    Challenge,
}

/// 保存注册时是否由 Runtime 直接回应终端。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SaveMode {
    /// 保存后由 Runtime 回应 200（本地注册模式）。
    Reply,
    /// 仅保存不回应，REGISTER 随后被转发给后端（转发注册模式）。
    Silent,
}

/// 当前事务在 Proxy Runtime 中的句柄。
///
/// # 教案式说明
/// - **意图 (Why)**：引擎的每个决策都要落到 Runtime 的一次同步调用上，集中在一个 trait 中便于审计调用次数；
/// - **契约 (What)**：
///   - `select_destination`：从配置的目的地集合中一次性选出目的地，并将其设为当前事务的目标；
///     同时把该集合关联到事务，供 `next_destination` 继续推进；
///   - `next_destination`：在已关联集合中前进一位并设为目标，集合耗尽返回 `None`；
///   - `set_destination`：将缓存命中的目的地设为当前事务目标；
///   - `relay`：同步地把当前请求转发到当前目标；
///   - `is_cancelled`：事务是否已被 CANCEL，故障转移在消费下一个目的地前必须轮询；
///   - 其余方法对应宿主的报文检查、事务匹配与注册持久化能力。
/// - **风险 (Trade-offs)**：超时由 Runtime 以离散信号送达，引擎内部不计时。
pub trait ProxyRuntime {
    /// Max-Forwards 检查，超过 `limit` 或已耗尽返回 `false`。
    fn check_max_forwards(&mut self, limit: u32) -> bool;

    /// 报文完整性检查。
    fn sanity_check(&mut self) -> bool;

    /// REGISTER 鉴权。
    fn authorize(&mut self) -> Authorization;

    /// 当前请求是否匹配已有事务（用于 CANCEL 与 ACK）。
    fn has_transaction(&mut self) -> bool;

    /// 对对话内请求执行松散路由，成功表示 Route 集已被采纳。
    fn loose_route(&mut self) -> bool;

    /// 请求来源是否为目的地集合 `set_id` 的成员。
    fn is_from_destination_set(&self, set_id: u32) -> bool;

    fn select_destination(
        &mut self,
        set_id: u32,
        algorithm: SelectionAlgorithm,
    ) -> Option<Destination>;

    fn next_destination(&mut self) -> Option<Destination>;

    fn set_destination(&mut self, destination: &Destination);

    fn relay(&mut self) -> Result<(), RelayError>;

    fn is_cancelled(&self) -> bool;

    /// 持久化当前请求携带的注册（含 `expires=0` 的注销）。
    fn save_binding(&mut self, mode: SaveMode) -> Result<(), RegistryError>;
}
