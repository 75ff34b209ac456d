//! # 领域值类型
//!
//! ## 核心意图（Why）
//! - 订阅者、目的地、关联键都以 `Arc<str>` 承载，克隆只增加引用计数，适合在缓存、日志与状态机之间零拷贝共享；
//! - 以新类型区分语义相同但角色不同的字符串，避免把 Call-ID 当作 AOR 写进亲和表这类低级错误。
//!
//! ## 行为契约（What）
//! - 所有类型实现 `Eq + Hash + Display`，可直接作为 `DashMap` 键或日志字段；
//! - [`Aor::from_contact`] 复刻“取 Contact 中 `@` 之前、第一个 `:` 之后的片段”这一提取规则，
//!   [`SubscriberFormat`] 负责校验提取结果。

use std::{fmt, ops::Deref, sync::Arc};

use serde::{Deserialize, Serialize};

macro_rules! shared_str {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
        pub struct $name(Arc<str>);

        impl $name {
            #[must_use]
            pub fn new(raw: impl Into<Arc<str>>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self::new(raw)
            }
        }
    };
}

shared_str! {
    /// `Aor`（订阅者）：亲和与容量策略的主键。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：集群内所有 Worker 必须以同一规则推导出同一主键，才能在共享表中命中同一条记录；
    /// - **契约 (What)**：内部保存订阅者用户名（例如 `s01234567890`），不含域名或参数；
    /// - **风险 (Trade-offs)**：`new` 不做校验，外部输入应走 [`Aor::from_contact`] 并配合 [`SubscriberFormat`]。
    Aor
}

shared_str! {
    /// 后端目的地（通常是 `sip:host:port` 形式的 Dst-URI），对引擎而言是不透明标识。
    Destination
}

shared_str! {
    /// 呼叫关联键：同一通呼叫的所有请求/响应共享（通常取 Call-ID）。
    CorrelationKey
}

impl Aor {
    /// 从 Contact 文本中提取订阅者用户名。
    ///
    /// # 教案式说明
    /// - **执行 (How)**：
    ///   1. 以第一个 `@` 切分，保留前半段（如 `<sip:s01234567890`）；
    ///   2. 以 `:` 切分前半段，取第二段作为用户名；
    /// - **契约 (What)**：缺少 `@`、缺少 `:` 或用户名为空时返回 `None`；
    /// - **边界情况**：`sip:user:password@host` 形式返回 `user`，与注册表的键规则一致。
    pub fn from_contact(contact: &str) -> Option<Self> {
        let (head, _) = contact.split_once('@')?;
        let mut parts = head.split(':');
        parts.next()?;
        let user = parts.next()?;
        if user.is_empty() {
            return None;
        }
        Some(Self::new(user))
    }
}

/// 注册表中的一条绑定：订阅者当前可达地址及最近更新时间戳。
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub address: String,
    pub last_modified: u64,
}

impl Binding {
    pub fn new(address: impl Into<String>, last_modified: u64) -> Self {
        Self {
            address: address.into(),
            last_modified,
        }
    }
}

/// 目的地选择算法标识，原样透传给外部选择原语。
///
/// - **契约 (What)**：数值语义由 Runtime 的负载均衡实现定义，引擎不解释；
/// - 默认 [`SelectionAlgorithm::ROUND_ROBIN`]（`4`）。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectionAlgorithm(pub u32);

impl SelectionAlgorithm {
    pub const ROUND_ROBIN: Self = Self(4);
}

impl Default for SelectionAlgorithm {
    fn default() -> Self {
        Self::ROUND_ROBIN
    }
}

impl fmt::Display for SelectionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 订阅者用户名格式：固定前缀 + 定长十进制数字。
///
/// # 教案式说明
/// - **意图 (Why)**：运营商账户体系约定用户名形如 `s` + 11 位数字，格式不符的注册/呼叫直接以 `NotFound` 拒绝；
/// - **契约 (What)**：`prefix` 区分大小写；`digits` 为前缀之后数字的精确位数。
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SubscriberFormat {
    pub prefix: String,
    pub digits: usize,
}

impl SubscriberFormat {
    /// 判断用户名是否满足格式。
    pub fn matches(&self, username: &str) -> bool {
        username.strip_prefix(self.prefix.as_str()).is_some_and(|rest| {
            rest.len() == self.digits && rest.bytes().all(|b| b.is_ascii_digit())
        })
    }

    /// 提取并校验 Contact 中的订阅者。
    pub fn subscriber_from_contact(&self, contact: &str) -> Option<Aor> {
        Aor::from_contact(contact).filter(|aor| self.matches(aor))
    }
}

impl Default for SubscriberFormat {
    fn default() -> Self {
        Self {
            prefix: "s".to_owned(),
            digits: 11,
        }
    }
}
