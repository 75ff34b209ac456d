//! # BindingCapacityEvictor：每订阅者的绑定容量上限
//!
//! ## 核心意图（Why）
//! - 终端频繁换网会留下大量陈旧绑定，放任增长会让呼叫分叉到不可达地址；
//! - 达到上限时淘汰最久未更新的一条，再接纳新绑定，效果等同一个有界的 LRU。
//!
//! ## 行为契约（What）
//! - 绑定数 `< max_bindings`：直接放行，不做任何淘汰；
//! - 否则扫描全部绑定，选出 `last_modified` 最小者；并列时保留扫描顺序中最先遇到的一条
//!   （严格小于才替换当前最小值）；
//! - 淘汰失败只记录日志，注册照常继续；注册表不可达按“没有已知绑定”处理（fail-open）。
//!
//! ## 一致性模型（Trade-offs）
//! - 先观察后动作，并非原子操作：不同 Worker 上的并发注册可能同时选中同一条最旧绑定并各自移除；
//!   移除是幂等的，因此这种重复无害。
//! - 淘汰始终以订阅者（AOR）为键，绑定以地址区分。

use crate::core::{
    runtime::ContactRegistry,
    types::{Aor, Binding},
};
use crate::error::DispatchError;

/// 一次准入检查的结论。
///
/// - **契约 (What)**：所有变体都允许注册继续，差别只在于是否以及如何执行了淘汰。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Admission {
    /// 未达上限。
    WithinCapacity { current: usize },
    /// 新地址已在绑定集合中，本次注册只是刷新，不会增加绑定数。
    Refresh,
    /// 已淘汰最旧绑定。
    Evicted(Binding),
    /// 选出了淘汰目标，但注册表拒绝移除。
    EvictionFailed(Binding),
    /// 注册表不可达，按无已知绑定放行。
    LookupFailed,
}

impl Admission {
    /// 注册是否可以继续：恒为真，淘汰问题从不阻塞注册。
    pub fn may_proceed(&self) -> bool {
        true
    }
}

/// 在绑定集合中选出淘汰目标。
///
/// # 教案式注释
/// - **契约 (What)**：集合大小 `< max_bindings` 时返回 `None`；否则返回 `last_modified` 最小且在扫描中最先出现的绑定；
/// - **执行 (How)**：单次线性扫描，仅在严格更小时替换候选，因而后出现的同值绑定不会取代先出现者。
pub fn eviction_target(bindings: &[Binding], max_bindings: usize) -> Option<&Binding> {
    if bindings.len() < max_bindings {
        return None;
    }
    let mut oldest: Option<&Binding> = None;
    for binding in bindings {
        match oldest {
            Some(current) if binding.last_modified >= current.last_modified => {}
            _ => oldest = Some(binding),
        }
    }
    oldest
}

/// 提取 Contact 中的 URI：优先取尖括号内部，否则截断到第一个参数分隔符。
pub fn contact_uri(contact: &str) -> &str {
    let trimmed = contact.trim();
    if let Some(start) = trimmed.find('<') {
        let rest = &trimmed[start + 1..];
        return rest.find('>').map_or(rest, |end| &rest[..end]);
    }
    trimmed.split(';').next().unwrap_or(trimmed)
}

/// 绑定容量淘汰器。
#[derive(Clone, Copy)]
pub struct BindingCapacityEvictor<'a> {
    registry: &'a dyn ContactRegistry,
    max_bindings: usize,
}

impl<'a> BindingCapacityEvictor<'a> {
    pub fn new(registry: &'a dyn ContactRegistry, max_bindings: usize) -> Self {
        Self {
            registry,
            max_bindings,
        }
    }

    /// 在接纳 `new_address` 之前执行容量检查。
    ///
    /// # 教案式注释
    /// - **执行 (How)**：
    ///   1. 查询订阅者当前绑定；失败记录告警并返回 [`Admission::LookupFailed`]；
    ///   2. 新地址已存在时返回 [`Admission::Refresh`]，刷新不占用新名额；
    ///   3. 通过 [`eviction_target`] 选出最旧绑定并请求移除；移除失败记录告警但仍放行。
    pub fn admit(&self, aor: &Aor, new_address: &str) -> Admission {
        let bindings = match self.registry.lookup_bindings(aor) {
            Ok(bindings) => bindings,
            Err(err) => {
                let err = DispatchError::RegistryLookup {
                    aor: aor.to_string(),
                    detail: err.detail,
                };
                tracing::warn!(aor = %aor, error = %err, code = err.code(), "binding lookup failed, admitting without eviction");
                return Admission::LookupFailed;
            }
        };
        tracing::debug!(aor = %aor, count = bindings.len(), max = self.max_bindings, "bindings found");

        if bindings.iter().any(|binding| binding.address == new_address) {
            return Admission::Refresh;
        }

        let Some(target) = eviction_target(&bindings, self.max_bindings) else {
            return Admission::WithinCapacity {
                current: bindings.len(),
            };
        };

        tracing::info!(
            aor = %aor,
            address = %target.address,
            last_modified = target.last_modified,
            max = self.max_bindings,
            "binding capacity reached, evicting oldest binding"
        );
        match self.registry.remove_binding(aor, &target.address) {
            Ok(()) => Admission::Evicted(target.clone()),
            Err(err) => {
                let err = DispatchError::Eviction {
                    aor: aor.to_string(),
                    address: target.address.clone(),
                    detail: err.detail,
                };
                tracing::warn!(aor = %aor, error = %err, code = err.code(), "eviction rejected, registration proceeds");
                Admission::EvictionFailed(target.clone())
            }
        }
    }
}
