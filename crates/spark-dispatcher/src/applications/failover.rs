//! # FailoverController：目的地集合内的有界重试状态机
//!
//! ## 核心意图（Why）
//! - 后端返回服务端错误或分支超时时，在同一目的地集合中前进到下一个成员重新转发；
//! - 以显式状态机取代“注册具名失败回调、回调里再注册自己”的续体风格：状态随事务上下文携带，
//!   转换是 `(状态, 事件) → (状态, 动作)` 的纯函数，便于穷举测试。
//!
//! ## 状态机约束（What）
//! - `Idle → Dispatched → (Succeeded | Retrying | Exhausted | Failed | Cancelled)`；
//! - `Retrying` 只请求一次下一目的地：拿到则转发并回到 `Dispatched`，拿不到则 `Exhausted`，
//!   并让最后收到的响应原样上行；
//! - 任一非终态观察到取消即进入 `Cancelled`，此后不再请求目的地、不再转发；
//! - 终态吸收所有后续事件。重试次数因此由集合大小决定，而非固定上限。
//!
//! ## 教案式使用指南（How）
//! 1. 首次转发成功后调用 [`FailoverController::on_relayed`]；
//! 2. Runtime 送来分支响应、分支超时或取消时调用 [`FailoverController::on_branch`]；
//! 3. 根据返回的 [`FailoverStep`] 决定抑制响应（已重新转发）还是让响应上行。

use crate::core::{runtime::ProxyRuntime, types::Destination};
use crate::error::DispatchError;

/// 故障转移状态。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FailoverState {
    Idle,
    Dispatched,
    Retrying,
    Succeeded,
    Exhausted,
    /// 最终失败但不满足重试条件（例如 486），响应原样上行。
    Failed,
    Cancelled,
}

impl FailoverState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FailoverState::Succeeded
                | FailoverState::Exhausted
                | FailoverState::Failed
                | FailoverState::Cancelled
        )
    }

    /// 纯状态转换。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - `retry_statuses`：触发重试的最终响应码集合；
    ///   - 终态对任何事件返回 `(self, Nothing)`；
    ///   - 状态图之外的组合返回 [`DispatchError::InvalidTransition`]；
    /// - **执行 (How)**：先处理终态吸收与取消，再按 `(状态, 事件)` 查表。
    pub fn transition(
        self,
        event: &BranchEvent,
        retry_statuses: &[u16],
    ) -> Result<(FailoverState, FailoverAction), DispatchError> {
        use FailoverAction as A;
        use FailoverState as S;

        if self.is_terminal() {
            return Ok((self, A::Nothing));
        }
        if matches!(event, BranchEvent::Cancelled) {
            return Ok((S::Cancelled, A::Nothing));
        }

        let next = match (self, event) {
            (S::Idle, BranchEvent::Relayed) | (S::Retrying, BranchEvent::Relayed) => {
                (S::Dispatched, A::Nothing)
            }
            (S::Idle, BranchEvent::RelayRejected) => (S::Failed, A::Propagate),
            (S::Retrying, BranchEvent::RelayRejected) => (S::Exhausted, A::Propagate),
            (S::Dispatched, BranchEvent::Reply { status }) => match *status {
                0..=199 => (S::Dispatched, A::Nothing),
                200..=299 => (S::Succeeded, A::Nothing),
                status if retry_statuses.contains(&status) => {
                    (S::Retrying, A::RequestNextDestination)
                }
                _ => (S::Failed, A::Propagate),
            },
            (S::Dispatched, BranchEvent::Timeout { replied: false }) => {
                (S::Retrying, A::RequestNextDestination)
            }
            (S::Dispatched, BranchEvent::Timeout { replied: true }) => (S::Failed, A::Propagate),
            (S::Retrying, BranchEvent::NextDestination(Some(destination))) => {
                (S::Retrying, A::Relay(destination.clone()))
            }
            (S::Retrying, BranchEvent::NextDestination(None)) => (S::Exhausted, A::Propagate),
            (from, event) => {
                return Err(DispatchError::InvalidTransition {
                    from,
                    event: event.clone(),
                });
            }
        };
        Ok(next)
    }
}

/// 驱动状态机的事件。
///
/// - Runtime 送来的是 `Reply`、`Timeout` 与 `Cancelled`；`Relayed`、`RelayRejected`
///   与 `NextDestination` 由控制器在执行动作后自行产生。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BranchEvent {
    Relayed,
    RelayRejected,
    Reply { status: u16 },
    /// 分支超时；`replied` 表示超时前是否收到过任何响应。
    Timeout { replied: bool },
    NextDestination(Option<Destination>),
    Cancelled,
}

/// 状态转换附带的动作。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailoverAction {
    Nothing,
    RequestNextDestination,
    Relay(Destination),
    Propagate,
}

/// 一次 [`FailoverController::on_branch`] 的执行结果。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FailoverStep {
    pub state: FailoverState,
    /// 本步重新转发到的目的地。
    pub relayed_to: Option<Destination>,
    /// 是否应让最后收到的响应原样上行。
    pub propagate: bool,
    /// 最后收到的最终响应码；纯超时场景为 `None`。
    pub last_status: Option<u16>,
}

/// 随事务上下文携带的故障转移控制器。
#[derive(Clone, Debug)]
pub struct FailoverController {
    state: FailoverState,
    retry_statuses: Vec<u16>,
    current: Option<Destination>,
    last_status: Option<u16>,
    next_requests: u32,
    relays: u32,
}

impl FailoverController {
    #[must_use]
    pub fn new(retry_statuses: Vec<u16>) -> Self {
        Self {
            state: FailoverState::Idle,
            retry_statuses,
            current: None,
            last_status: None,
            next_requests: 0,
            relays: 0,
        }
    }

    pub fn state(&self) -> FailoverState {
        self.state
    }

    /// 当前分支的目的地。
    pub fn current(&self) -> Option<&Destination> {
        self.current.as_ref()
    }

    /// 已请求“下一目的地”的次数。
    pub fn next_requests(&self) -> u32 {
        self.next_requests
    }

    /// 成功发出的转发次数（含首次转发）。
    pub fn relays(&self) -> u32 {
        self.relays
    }

    /// 登记首次转发已成功发出。
    pub fn on_relayed(&mut self, destination: Destination) -> Result<(), DispatchError> {
        self.apply(&BranchEvent::Relayed)?;
        self.current = Some(destination);
        self.relays += 1;
        Ok(())
    }

    /// 处理 Runtime 送来的分支事件，并执行由此产生的全部动作。
    ///
    /// # 教案式注释
    /// - **执行 (How)**：
    ///   1. 非终态先轮询取消信号，已取消则直接进入 `Cancelled`；
    ///   2. 应用事件得到动作，循环执行：请求下一目的地前再次轮询取消，转发成功回到 `Dispatched`；
    ///   3. 每个失败信号至多触发一次 `next_destination`，转发被拒直接 `Exhausted`。
    /// - **契约 (What)**：返回本步最终状态、重新转发的目的地以及是否上行最后响应。
    pub fn on_branch<R>(
        &mut self,
        runtime: &mut R,
        event: BranchEvent,
    ) -> Result<FailoverStep, DispatchError>
    where
        R: ProxyRuntime + ?Sized,
    {
        let mut step = FailoverStep {
            state: self.state,
            relayed_to: None,
            propagate: false,
            last_status: self.last_status,
        };
        if self.state.is_terminal() {
            return Ok(step);
        }

        if runtime.is_cancelled() {
            self.apply(&BranchEvent::Cancelled)?;
            tracing::info!(destination = ?self.current, "transaction cancelled, failover stopped");
            step.state = self.state;
            return Ok(step);
        }

        if let BranchEvent::Reply { status } = event {
            if status >= 200 {
                self.last_status = Some(status);
            }
        }

        let mut action = self.apply(&event)?;
        loop {
            match action {
                FailoverAction::Nothing => break,
                FailoverAction::Propagate => {
                    step.propagate = true;
                    break;
                }
                FailoverAction::RequestNextDestination => {
                    if runtime.is_cancelled() {
                        action = self.apply(&BranchEvent::Cancelled)?;
                        continue;
                    }
                    let next = runtime.next_destination();
                    self.next_requests += 1;
                    tracing::info!(
                        failed = ?self.current,
                        next = ?next,
                        last_status = ?self.last_status,
                        "branch failed, advancing in destination set"
                    );
                    action = self.apply(&BranchEvent::NextDestination(next))?;
                }
                FailoverAction::Relay(destination) => match runtime.relay() {
                    Ok(()) => {
                        self.current = Some(destination.clone());
                        self.relays += 1;
                        step.relayed_to = Some(destination);
                        action = self.apply(&BranchEvent::Relayed)?;
                    }
                    Err(err) => {
                        tracing::warn!(destination = %destination, error = %err, "failover relay rejected");
                        action = self.apply(&BranchEvent::RelayRejected)?;
                    }
                },
            }
        }

        if self.state == FailoverState::Exhausted {
            tracing::warn!(last_status = ?self.last_status, "destination set exhausted");
        }
        step.state = self.state;
        step.last_status = self.last_status;
        Ok(step)
    }

    fn apply(&mut self, event: &BranchEvent) -> Result<FailoverAction, DispatchError> {
        let (next, action) = self.state.transition(event, &self.retry_statuses)?;
        self.state = next;
        Ok(action)
    }
}
