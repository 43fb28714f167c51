// 该文件是 Kanjian （看见） 项目的一部分。
// src/settings.rs - 运行时设置
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

use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_CONFIDENCE: f64 = 60.0;
pub const DEFAULT_MODEL_WIDTH: u32 = 224;
pub const DEFAULT_MODEL_HEIGHT: u32 = 224;

#[derive(Error, Debug)]
pub enum SettingsError {
  #[error("无效的 JSON 数据: {0}")]
  InvalidJson(#[from] serde_json::Error),
  #[error("设置必须是 JSON 对象")]
  NotAnObject,
  #[error("设置项 {key} 的值无效: {reason}")]
  InvalidValue { key: String, reason: &'static str },
}

/// 运行时设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
  /// 置信度阈值 (0 - 100)
  pub confidence: f64,
  #[serde(alias = "modelWidth")]
  pub model_width: u32,
  // 旧版设置文件的拼写
  #[serde(alias = "modelHeigth", alias = "modelHeight")]
  pub model_height: u32,
  /// 标签文件路径，未设置时使用模型旁的 labels.txt
  pub labels: Option<PathBuf>,
}

impl Default for Settings {
  fn default() -> Self {
    Settings {
      confidence: DEFAULT_CONFIDENCE,
      model_width: DEFAULT_MODEL_WIDTH,
      model_height: DEFAULT_MODEL_HEIGHT,
      labels: None,
    }
  }
}

/// 一次覆盖操作的结果
#[derive(Debug, Clone)]
pub struct OverlayReport {
  pub applied: Vec<String>,
  pub ignored: Vec<String>,
  pub settings: Settings,
}

/// 设置存储，推理引擎每个周期读取一次
#[derive(Debug, Default)]
pub struct SettingsStore {
  inner: RwLock<Settings>,
}

impl SettingsStore {
  pub fn new(settings: Settings) -> Self {
    SettingsStore {
      inner: RwLock::new(settings),
    }
  }

  pub fn snapshot(&self) -> Settings {
    self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
  }

  pub fn confidence(&self) -> f64 {
    self.inner.read().unwrap_or_else(PoisonError::into_inner).confidence
  }

  pub fn geometry(&self) -> (u32, u32) {
    let settings = self.inner.read().unwrap_or_else(PoisonError::into_inner);
    (settings.model_width, settings.model_height)
  }

  pub fn apply_json(&self, json: &str) -> Result<OverlayReport, SettingsError> {
    match serde_json::from_str::<Value>(json)? {
      Value::Object(overlay) => self.apply_overlay(&overlay),
      _ => Err(SettingsError::NotAnObject),
    }
  }

  /// 用部分键值覆盖当前设置
  ///
  /// 只替换已有的设置项，未知键被忽略；任一已知键的值无效时整体拒绝。
  /// 模型尺寸的修改不会影响已经打开的会话。
  pub fn apply_overlay(&self, overlay: &Map<String, Value>) -> Result<OverlayReport, SettingsError> {
    // 整个覆盖过程持有写锁，并发的覆盖不会互相丢失修改
    let mut current = self.inner.write().unwrap_or_else(PoisonError::into_inner);
    let mut settings = current.clone();
    let mut applied = Vec::new();
    let mut ignored = Vec::new();

    for (key, value) in overlay {
      match key.as_str() {
        "confidence" => {
          settings.confidence = value
            .as_f64()
            .filter(|c| (0.0..=100.0).contains(c))
            .ok_or_else(|| invalid(key, "需要 0 到 100 之间的数值"))?;
        }
        "model_width" | "modelWidth" => settings.model_width = dimension(key, value)?,
        "model_height" | "modelHeight" | "modelHeigth" => {
          settings.model_height = dimension(key, value)?
        }
        "labels" => {
          settings.labels = match value {
            Value::Null => None,
            Value::String(path) => Some(PathBuf::from(path)),
            _ => return Err(invalid(key, "需要路径字符串")),
          };
        }
        _ => {
          warn!("忽略未知设置项: {}", key);
          ignored.push(key.clone());
          continue;
        }
      }
      applied.push(key.clone());
    }

    *current = settings.clone();
    drop(current);
    if !applied.is_empty() {
      info!("设置已更新: {:?}", applied);
    }
    debug!("当前设置: {:?}", settings);

    Ok(OverlayReport {
      applied,
      ignored,
      settings,
    })
  }
}

fn invalid(key: &str, reason: &'static str) -> SettingsError {
  SettingsError::InvalidValue {
    key: key.to_string(),
    reason,
  }
}

fn dimension(key: &str, value: &Value) -> Result<u32, SettingsError> {
  value
    .as_u64()
    .filter(|&v| v > 0)
    .and_then(|v| u32::try_from(v).ok())
    .ok_or_else(|| invalid(key, "需要正整数"))
}
