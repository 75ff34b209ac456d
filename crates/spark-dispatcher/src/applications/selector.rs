//! # DestinationSelector：一次决策只调用一次外部选择原语
//!
//! ## 核心意图（Why）
//! - 负载均衡算法属于 Proxy Runtime，引擎只负责“什么时候调用、调用几次”；
//! - 同一次请求处理中可能有多处需要同一逻辑键的目的地（例如转发注册时的亲和记录与归属记录），
//!   以记忆化保证它们拿到同一个结果，且外部算法只被触发一次。
//!
//! ## 行为契约（What）
//! - [`DestinationSelector::select`]：记忆命中时不再调用外部原语，只把目标重新设置到当前事务；
//! - 外部原语返回空时立即以 [`DispatchError::NoDestination`] 终止本次决策，失败结果不做记忆，也从不自动重试；
//! - 选择器的生命周期等同于一次请求处理，不在 Worker 之间共享。

use std::collections::HashMap;

use crate::config::DispatchConfig;
use crate::core::{
    runtime::ProxyRuntime,
    types::{Destination, SelectionAlgorithm},
};
use crate::error::DispatchError;

/// 带记忆化的目的地选择器。
#[derive(Debug, Clone)]
pub struct DestinationSelector {
    set_id: u32,
    algorithm: SelectionAlgorithm,
    memo: HashMap<String, Destination>,
}

impl DestinationSelector {
    #[must_use]
    pub fn new(set_id: u32, algorithm: SelectionAlgorithm) -> Self {
        Self {
            set_id,
            algorithm,
            memo: HashMap::new(),
        }
    }

    #[must_use]
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(config.destination_set, config.algorithm)
    }

    /// 为逻辑键 `key` 选出目的地。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - **输入**：当前事务的 Runtime 句柄与逻辑键（通常是订阅者）；
    ///   - **输出**：选中的目的地，且 Runtime 的当前目标已指向它；
    ///   - **后置条件**：成功结果写入记忆表，同键再次调用不会触发外部原语。
    /// - **执行 (How)**：先查记忆表；未命中再调用 `select_destination`。
    pub fn select<R>(&mut self, runtime: &mut R, key: &str) -> Result<Destination, DispatchError>
    where
        R: ProxyRuntime + ?Sized,
    {
        if let Some(destination) = self.memo.get(key) {
            runtime.set_destination(destination);
            return Ok(destination.clone());
        }

        match runtime.select_destination(self.set_id, self.algorithm) {
            Some(destination) => {
                tracing::info!(
                    key,
                    destination = %destination,
                    set_id = self.set_id,
                    algorithm = %self.algorithm,
                    "destination selected"
                );
                self.memo.insert(key.to_owned(), destination.clone());
                Ok(destination)
            }
            None => {
                tracing::warn!(key, set_id = self.set_id, "no destination available");
                Err(DispatchError::NoDestination {
                    set_id: self.set_id,
                })
            }
        }
    }
}
