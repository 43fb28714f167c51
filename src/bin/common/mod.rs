// 该文件是 Kanjian （看见） 项目的一部分。
// src/bin/common/mod.rs - 可执行程序共用的参数与初始化
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

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};
use url::Url;

use kanjian::backend::Driver;
use kanjian::engine::{Engine, STATUS_NO_RESOLUTION, STATUS_SOURCE_FAILED};
use kanjian::input::InputWrapper;
use kanjian::settings::{Settings, SettingsStore};
use kanjian::status::StatusBoard;
use kanjian::url_path;

#[derive(clap::Args, Debug)]
pub struct CommonArgs {
  /// 模型文件，如 rknpu:///opt/model.rknn 或 larod:///opt/model.tflite
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源，如 gst://camera/dev/video0 或 image:///tmp/frame.png
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 标签文件路径，默认为模型旁的 labels.txt
  #[arg(long, value_name = "FILE")]
  pub labels: Option<PathBuf>,
  /// JSON 设置文件，启动时覆盖默认设置并写回
  #[arg(long, value_name = "FILE")]
  pub settings: Option<PathBuf>,
  /// 结果中的设备标识
  #[arg(long, default_value = "kanjian", value_name = "NAME")]
  pub device: String,
}

/// 读取设置文件并写回合并后的完整设置
pub fn load_settings(path: Option<&Path>) -> Result<SettingsStore> {
  let store = SettingsStore::default();
  let Some(path) = path else {
    return Ok(store);
  };

  match fs::read_to_string(path) {
    Ok(text) => {
      let report = store
        .apply_json(&text)
        .with_context(|| format!("设置文件无效: {}", path.display()))?;
      if !report.ignored.is_empty() {
        info!("设置文件中的未知项已忽略: {:?}", report.ignored);
      }
    }
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
      info!("设置文件 {} 不存在，使用默认设置", path.display());
    }
    Err(e) => return Err(e).with_context(|| format!("无法读取设置文件: {}", path.display())),
  }

  let json = serde_json::to_string_pretty(&store.snapshot())?;
  fs::write(path, json).with_context(|| format!("无法写入设置文件: {}", path.display()))?;
  Ok(store)
}

pub fn labels_path(args: &CommonArgs, settings: &Settings, model_path: &Path) -> PathBuf {
  args
    .labels
    .clone()
    .or_else(|| settings.labels.clone())
    .unwrap_or_else(|| model_path.with_file_name("labels.txt"))
}

/// 创建输入与推理引擎并完成初始化
pub fn open_engine<D: Driver>(
  args: &CommonArgs,
  driver: &D,
) -> Result<(Engine<D::Connection, InputWrapper>, Arc<StatusBoard>)> {
  let settings = Arc::new(load_settings(args.settings.as_deref())?);
  let status = Arc::new(StatusBoard::new());
  let engine = Engine::new(args.device.clone(), settings.clone(), status.clone());

  let model_path = url_path(&args.model);
  let labels_path = labels_path(args, &settings.snapshot(), &model_path);
  info!("模型文件路径: {}", model_path.display());
  info!("标签文件路径: {}", labels_path.display());
  info!("输入来源: {}", args.input);

  let input = InputWrapper::open(&args.input, settings.geometry()).map_err(|e| {
    engine.report_failure(if e.is_no_stream_resolution() {
      STATUS_NO_RESOLUTION
    } else {
      STATUS_SOURCE_FAILED
    });
    e
  })?;

  let result = engine.initialize(driver, input, &model_path, &labels_path);
  debug!("状态: {}", status.to_json());
  result?;
  Ok((engine, status))
}
