// 该文件是 Kanjian （看见） 项目的一部分。
// src/status.rs - 运行状态上报
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use serde_json::{Map, Value};
use tracing::trace;

pub const MODEL_COMPONENT: &str = "model";

pub const STATUS_INITIALIZING: &str = "Initializing";
pub const STATUS_OK: &str = "OK";
pub const STATUS_NOT_AVAILABLE: &str = "Not available";

#[derive(Debug, Clone, PartialEq)]
pub enum StatusValue {
  Bool(bool),
  Number(f64),
  Text(String),
}

impl From<bool> for StatusValue {
  fn from(value: bool) -> Self {
    StatusValue::Bool(value)
  }
}

impl From<usize> for StatusValue {
  fn from(value: usize) -> Self {
    StatusValue::Number(value as f64)
  }
}

impl From<&str> for StatusValue {
  fn from(value: &str) -> Self {
    StatusValue::Text(value.to_string())
  }
}

impl From<String> for StatusValue {
  fn from(value: String) -> Self {
    StatusValue::Text(value)
  }
}

impl From<&StatusValue> for Value {
  fn from(value: &StatusValue) -> Self {
    match value {
      StatusValue::Bool(b) => Value::Bool(*b),
      StatusValue::Number(n) => serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number),
      StatusValue::Text(s) => Value::String(s.clone()),
    }
  }
}

/// 状态上报通道
pub trait StatusSink: Send + Sync {
  fn set(&self, component: &str, field: &str, value: StatusValue);
}

/// 内存中的状态表
#[derive(Debug, Default)]
pub struct StatusBoard {
  entries: Mutex<BTreeMap<(String, String), StatusValue>>,
}

impl StatusBoard {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, component: &str, field: &str) -> Option<StatusValue> {
    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(&(component.to_string(), field.to_string()))
      .cloned()
  }

  /// 按组件分组导出为 JSON 对象
  pub fn to_json(&self) -> Value {
    let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    let mut root = Map::new();
    for ((component, field), value) in entries.iter() {
      let group = root
        .entry(component.clone())
        .or_insert_with(|| Value::Object(Map::new()));
      if let Value::Object(group) = group {
        group.insert(field.clone(), value.into());
      }
    }
    Value::Object(root)
  }
}

impl StatusSink for StatusBoard {
  fn set(&self, component: &str, field: &str, value: StatusValue) {
    trace!("状态 {}.{} = {:?}", component, field, value);
    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert((component.to_string(), field.to_string()), value);
  }
}
