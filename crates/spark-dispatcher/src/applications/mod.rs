//! # applications 模块说明
//!
//! ## 设计定位（Why）
//! - 聚合分发引擎的各个策略组件，并由 [`pipeline::DispatchPipeline`] 按固定顺序串联；
//! - 每个组件只借用外部表与配置快照，按请求构造，不在 Worker 之间共享可变状态。
//!
//! ## 组件一览（What）
//! - `selector`：带记忆化的目的地选择；
//! - `affinity` / `call_cache` / `locality`：订阅者亲和、呼叫亲和与归属映射三张表的视图；
//! - `failover`：目的地集合内的有界重试状态机；
//! - `evictor`：每订阅者绑定容量与最旧绑定淘汰；
//! - `pipeline`：请求、分支事件与过期事件的入口。

pub mod affinity;
pub mod call_cache;
pub mod evictor;
pub mod failover;
pub mod locality;
pub mod pipeline;
pub mod selector;
