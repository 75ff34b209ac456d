//! # 共享表中的标记值
//!
//! ## 核心意图（Why）
//! - 亲和表在集群内被多个 Worker 共用，历史上同一张表既存数字又存字符串、还存序列化对象；
//! - 以封闭的枚举 [`StoredValue`] 固定这份契约，使读写双方在编译期就知道每个表项的形状。
//!
//! ## 行为契约（What）
//! - `Integer`/`Text` 对应外部表的原生整数与字符串槽位；
//! - `Record` 承载结构化记录，对只支持字符串的外部表可通过 [`StoredValue::encode`] 编码为 JSON 文本，
//!   再由 [`StoredValue::decode_record`] 还原。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::types::Destination;
use crate::error::StoreError;

/// 共享键值表的值类型。
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StoredValue {
    Integer(i64),
    Text(String),
    Record(BTreeMap<String, String>),
}

impl StoredValue {
    /// 以目的地构造文本值。
    pub fn destination(destination: &Destination) -> Self {
        StoredValue::Text(destination.as_str().to_owned())
    }

    /// 读取文本值；其它形状返回 `None`。
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StoredValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// 读取结构化记录；其它形状返回 `None`。
    pub fn as_record(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            StoredValue::Record(record) => Some(record),
            _ => None,
        }
    }

    /// 将值解释为目的地。
    ///
    /// - **契约 (What)**：仅 `Text` 且非空时成功；其余形状视为表项损坏，交由调用方按未命中处理。
    pub fn as_destination(&self) -> Option<Destination> {
        self.as_text()
            .filter(|text| !text.is_empty())
            .map(Destination::from)
    }

    /// 编码为外部表的字符串槽位。
    ///
    /// - `Integer` 输出十进制文本，`Text` 原样输出，`Record` 输出 JSON 对象文本。
    pub fn encode(&self) -> Result<String, StoreError> {
        match self {
            StoredValue::Integer(value) => Ok(value.to_string()),
            StoredValue::Text(text) => Ok(text.clone()),
            StoredValue::Record(record) => serde_json::to_string(record)
                .map_err(|err| StoreError::new(format!("encoding record failed: {err}"))),
        }
    }

    /// 将字符串槽位还原为结构化记录。
    pub fn decode_record(raw: &str) -> Result<Self, StoreError> {
        serde_json::from_str::<BTreeMap<String, String>>(raw)
            .map(StoredValue::Record)
            .map_err(|err| StoreError::new(format!("decoding record failed: {err}")))
    }
}

impl From<i64> for StoredValue {
    fn from(value: i64) -> Self {
        StoredValue::Integer(value)
    }
}

impl From<String> for StoredValue {
    fn from(value: String) -> Self {
        StoredValue::Text(value)
    }
}

impl From<&str> for StoredValue {
    fn from(value: &str) -> Self {
        StoredValue::Text(value.to_owned())
    }
}
