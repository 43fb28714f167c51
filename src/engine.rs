// 该文件是 Kanjian （看见） 项目的一部分。
// src/engine.rs - 推理引擎
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

//! # 推理引擎
//!
//! 引擎持有唯一的后端会话、帧源和标签表。一次推理周期依次为：
//! 取最新帧、转换缩放到输入缓冲区、执行推理、读取输出缓冲区并打分。
//!
//! 同一时刻只允许一个周期运行，其余请求立即得到 [`CycleError::Busy`]。

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backend::{Connection, Driver};
use crate::buffer::{BufferError, INPUT_BUFFER_PREFIX, OUTPUT_BUFFER_PREFIX, TensorBuffer};
use crate::convert::convert_crop_scale;
use crate::frame::{FrameSource, FrameSourceError, RGB_CHANNELS, VideoFrame};
use crate::labels::{LabelError, Labels};
use crate::session::{BindStage, Session, SessionError};
use crate::settings::SettingsStore;
use crate::status::{
  MODEL_COMPONENT, STATUS_INITIALIZING, STATUS_NOT_AVAILABLE, STATUS_OK, StatusSink, StatusValue,
};

pub const STATUS_INVALID_LABELS: &str = "Invalid labels file";
pub const STATUS_MODEL_MISSING: &str = "Model file does not exist";
pub const STATUS_NO_ARCHITECTURE: &str = "No compatible architecture found";
pub const STATUS_MODEL_LOAD_FAILED: &str = "Unable to load model";
pub const STATUS_INPUT_ALLOC_FAILED: &str = "Input data allocation failed";
pub const STATUS_OUTPUT_ALLOC_FAILED: &str = "Output data allocation failed";
pub const STATUS_INPUT_TENSOR_FAILED: &str = "Failed initializing input tensor";
pub const STATUS_OUTPUT_TENSOR_FAILED: &str = "Failed initializing output tensor";
pub const STATUS_REQUEST_FAILED: &str = "Failed creating inference request";
pub const STATUS_SOURCE_FAILED: &str = "Unable to start image provider";
pub const STATUS_NO_RESOLUTION: &str = "No valid stream resolutions";

const ARCHITECTURE_UNDEFINED: &str = "Undefined";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Detection {
  pub label: String,
  /// 百分比分数，向下取整
  ///
  /// 阈值比较使用取整前的分数，所以带小数的阈值下输出的分数可能低于阈值，
  /// 例如阈值 90.1 时 230 对应的 90.2 通过比较，输出为 90。
  pub score: u8,
}

/// 一次推理周期的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InferenceResult {
  pub device: String,
  /// Unix 时间戳（毫秒）
  pub timestamp: i64,
  /// 转换、推理与打分耗时（毫秒）
  pub duration: u64,
  pub list: Vec<Detection>,
}

#[derive(Error, Debug)]
pub enum SetupError {
  #[error("标签文件无效: {0}")]
  InvalidLabels(#[from] LabelError),
  #[error("标签文件为空: {}", .0.display())]
  EmptyLabels(PathBuf),
  #[error("模型文件不存在: {}", .0.display())]
  ModelMissing(PathBuf),
  #[error("无法打开模型文件: {0}")]
  ModelOpen(#[source] std::io::Error),
  #[error("后端会话初始化失败: {0}")]
  Session(#[from] SessionError),
  #[error("张量缓冲区分配失败: {0}")]
  Allocation(#[from] BufferError),
  #[error("帧源启动失败: {0}")]
  FrameSource(#[from] FrameSourceError),
}

#[derive(Error, Debug)]
pub enum CycleError {
  #[error("推理引擎未就绪")]
  NotReady,
  #[error("已有推理周期在运行")]
  Busy,
  #[error("没有可用的视频帧")]
  NoFrame,
  #[error("无法重置输出缓冲区: {0}")]
  Rewind(#[source] std::io::Error),
  #[error("推理失败: {0}")]
  Backend(#[source] SessionError),
}

impl CycleError {
  /// 周期中止但引擎仍可直接进行下一次推理
  pub fn is_recoverable(&self) -> bool {
    matches!(self, CycleError::Busy | CycleError::NoFrame)
  }
}

/// 把量化输出按阈值映射为带标签的检测结果，保持输出下标顺序
pub fn score_detections(scores: &[u8], labels: &Labels, threshold: f64) -> Vec<Detection> {
  scores
    .iter()
    .zip(labels.iter())
    .filter_map(|(&byte, label)| {
      let score = byte as f64 / 255.0 * 100.0;
      (score >= threshold).then(|| Detection {
        label: label.to_string(),
        score: score as u8,
      })
    })
    .collect()
}

struct Active<C: Connection, S: FrameSource> {
  session: Session<C>,
  source: S,
  labels: Labels,
  width: u32,
  height: u32,
}

/// 单次飞行标志，离开作用域时清除
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| FlightGuard(flag))
  }
}

impl Drop for FlightGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// 取到的帧在离开作用域时归还帧源
struct FrameGuard<'a, S: FrameSource> {
  source: &'a S,
  frame: Option<S::Frame>,
}

impl<'a, S: FrameSource> FrameGuard<'a, S> {
  fn acquire(source: &'a S) -> Option<Self> {
    let frame = source.acquire_latest()?;
    Some(FrameGuard {
      source,
      frame: Some(frame),
    })
  }

  fn frame(&self) -> Option<&S::Frame> {
    self.frame.as_ref()
  }
}

impl<S: FrameSource> Drop for FrameGuard<'_, S> {
  fn drop(&mut self) {
    if let Some(frame) = self.frame.take() {
      self.source.release(frame);
    }
  }
}

pub struct Engine<C: Connection, S: FrameSource> {
  device: String,
  settings: Arc<SettingsStore>,
  status: Arc<dyn StatusSink>,
  ready: AtomicBool,
  in_flight: AtomicBool,
  active: Mutex<Option<Active<C, S>>>,
}

impl<C: Connection, S: FrameSource> Engine<C, S> {
  pub fn new(
    device: impl Into<String>,
    settings: Arc<SettingsStore>,
    status: Arc<dyn StatusSink>,
  ) -> Self {
    Engine {
      device: device.into(),
      settings,
      status,
      ready: AtomicBool::new(false),
      in_flight: AtomicBool::new(false),
      active: Mutex::new(None),
    }
  }

  pub fn settings(&self) -> &SettingsStore {
    &self.settings
  }

  pub fn is_ready(&self) -> bool {
    self.ready.load(Ordering::Acquire)
  }

  fn report(&self, field: &str, value: impl Into<StatusValue>) {
    self.status.set(MODEL_COMPONENT, field, value.into());
  }

  /// 记录一次启动失败，引擎保持未就绪
  pub fn report_failure(&self, status: &str) {
    error!("推理引擎初始化失败: {}", status);
    self.report("state", false);
    self.report("status", status);
  }

  /// 加载标签与模型、分配并绑定张量缓冲区、启动帧源
  ///
  /// 任何一步失败都会释放已获取的资源并上报失败原因。已有会话会先被关闭。
  pub fn initialize<D>(
    &self,
    driver: &D,
    mut source: S,
    model_path: &Path,
    labels_path: &Path,
  ) -> Result<(), SetupError>
  where
    D: Driver<Connection = C>,
  {
    self.close();
    self.report("state", false);
    self.report("status", STATUS_INITIALIZING);
    self.report("architecture", ARCHITECTURE_UNDEFINED);

    let labels = match Labels::load(labels_path) {
      Ok(labels) if !labels.is_empty() => labels,
      Ok(_) => {
        self.report_failure(STATUS_INVALID_LABELS);
        return Err(SetupError::EmptyLabels(labels_path.to_path_buf()));
      }
      Err(e) => {
        self.report_failure(STATUS_INVALID_LABELS);
        return Err(e.into());
      }
    };
    info!("已加载 {} 个标签", labels.len());
    self.report("labels", labels.len());

    let model = File::open(model_path).map_err(|e| {
      if e.kind() == std::io::ErrorKind::NotFound {
        self.report_failure(STATUS_MODEL_MISSING);
        SetupError::ModelMissing(model_path.to_path_buf())
      } else {
        self.report_failure(STATUS_MODEL_LOAD_FAILED);
        SetupError::ModelOpen(e)
      }
    })?;
    let name = model_path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_default();

    let mut session = Session::open(driver, driver.candidates(), &model, &name).map_err(|e| {
      self.report_failure(match e {
        SessionError::NoCompatibleBackend => STATUS_NO_ARCHITECTURE,
        _ => STATUS_MODEL_LOAD_FAILED,
      });
      e
    })?;
    self.report(
      "architecture",
      session.chip().map_or(ARCHITECTURE_UNDEFINED, |chip| chip.name()),
    );

    let (width, height) = self.settings.geometry();
    let input_len = width as usize * height as usize * RGB_CHANNELS;
    debug!("输入缓冲区 {}x{}x{} = {} 字节", width, height, RGB_CHANNELS, input_len);
    let input = TensorBuffer::allocate(INPUT_BUFFER_PREFIX, input_len).map_err(|e| {
      self.report_failure(STATUS_INPUT_ALLOC_FAILED);
      e
    })?;
    let output = TensorBuffer::allocate(OUTPUT_BUFFER_PREFIX, labels.len()).map_err(|e| {
      self.report_failure(STATUS_OUTPUT_ALLOC_FAILED);
      e
    })?;

    session.bind_tensors(input, output).map_err(|e| {
      self.report_failure(match e {
        SessionError::BindFailed {
          stage: BindStage::Inputs,
          ..
        } => STATUS_INPUT_TENSOR_FAILED,
        SessionError::BindFailed {
          stage: BindStage::Outputs,
          ..
        } => STATUS_OUTPUT_TENSOR_FAILED,
        _ => STATUS_REQUEST_FAILED,
      });
      e
    })?;
    self.report("inputs", session.input_count());
    self.report("outputs", session.output_count());

    source.start().map_err(|e| {
      self.report_failure(STATUS_SOURCE_FAILED);
      e
    })?;

    *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(Active {
      session,
      source,
      labels,
      width,
      height,
    });
    self.ready.store(true, Ordering::Release);
    self.report("state", true);
    self.report("status", STATUS_OK);
    info!("推理引擎就绪");
    Ok(())
  }

  /// 执行一次推理周期
  pub fn run_cycle(&self) -> Result<InferenceResult, CycleError> {
    if !self.is_ready() {
      return Err(CycleError::NotReady);
    }
    let _flight = FlightGuard::acquire(&self.in_flight).ok_or_else(|| {
      debug!("推理周期进行中，拒绝新请求");
      CycleError::Busy
    })?;

    let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(Active {
      session,
      source,
      labels,
      width,
      height,
    }) = active.as_mut()
    else {
      return Err(CycleError::NotReady);
    };

    let guard = FrameGuard::acquire(&*source).ok_or_else(|| {
      warn!("没有可用的视频帧，跳过本次推理");
      CycleError::NoFrame
    })?;
    let started = Instant::now();

    let (Some(frame), Some(input)) = (guard.frame(), session.input_buffer_mut()) else {
      return Err(CycleError::NotReady);
    };
    if let Err(e) = convert_crop_scale(&frame.view(), input.as_mut_slice(), *width, *height) {
      warn!("帧转换失败，继续使用现有输入数据: {}", e);
    }

    session
      .output_buffer_mut()
      .ok_or(CycleError::NotReady)?
      .rewind()
      .map_err(|e| {
        error!("无法重置输出缓冲区: {}", e);
        CycleError::Rewind(e)
      })?;

    session.run().map_err(|e| {
      error!("推理执行失败: {}", e);
      CycleError::Backend(e)
    })?;

    let threshold = self.settings.confidence();
    let scores = session.output_buffer().ok_or(CycleError::NotReady)?;
    let list = score_detections(scores.as_slice(), labels, threshold);
    let duration = started.elapsed().as_millis() as u64;
    debug!("推理完成: {} 个结果，耗时 {} ms", list.len(), duration);

    Ok(InferenceResult {
      device: self.device.clone(),
      timestamp: chrono::Utc::now().timestamp_millis(),
      duration,
      list,
    })
  }

  /// 停止帧源并关闭会话，可重复调用
  pub fn close(&self) {
    self.ready.store(false, Ordering::Release);
    let active = self
      .active
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(Active {
      mut session,
      mut source,
      ..
    }) = active
    {
      source.stop();
      session.close();
      self.report("state", false);
      self.report("status", STATUS_NOT_AVAILABLE);
      self.report("architecture", ARCHITECTURE_UNDEFINED);
      info!("推理引擎已关闭");
    }
  }
}

impl<C: Connection, S: FrameSource> Drop for Engine<C, S> {
  fn drop(&mut self) {
    self.close();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn labels() -> Labels {
    Labels::parse("cat\ndog\nbird\n", '\n')
  }

  #[test]
  fn threshold_selects_confident_labels() {
    let list = score_detections(&[230, 10, 5], &labels(), 80.0);
    assert_eq!(
      list,
      [Detection {
        label: "cat".into(),
        score: 90
      }]
    );
  }

  #[test]
  fn scores_are_monotonic_and_bounded() {
    let all = Labels::parse(&(0..256).map(|i| format!("l{i}\n")).collect::<String>(), '\n');
    let bytes: Vec<u8> = (0..=255).collect();
    let list = score_detections(&bytes, &all, 0.0);
    assert_eq!(list.len(), 256);
    assert_eq!(list[0].score, 0);
    assert_eq!(list[255].score, 100);
    assert!(list.windows(2).all(|w| w[0].score <= w[1].score));
  }

  #[test]
  fn raising_threshold_only_removes() {
    let bytes = [0u8, 40, 128, 200, 255, 77];
    let labels = Labels::parse("a\nb\nc\nd\ne\nf", '\n');
    let raw = |label: &str| {
      let index = labels.iter().position(|l| l == label).unwrap();
      bytes[index] as f64 / 255.0 * 100.0
    };
    let mut previous = score_detections(&bytes, &labels, 0.0);
    for threshold in [10.0, 30.0, 50.0, 78.4, 90.0, 100.0] {
      let current = score_detections(&bytes, &labels, threshold);
      assert!(current.iter().all(|d| previous.contains(d)));
      assert!(current.iter().all(|d| raw(&d.label) >= threshold));
      previous = current;
    }
  }

  #[test]
  fn emitted_score_truncates_below_fractional_threshold() {
    let list = score_detections(&[230, 229], &labels(), 90.1);
    assert_eq!(
      list,
      [Detection {
        label: "cat".into(),
        score: 90
      }]
    );
    assert!((list[0].score as f64) < 90.1);
  }

  #[test]
  fn excess_scores_without_labels_are_dropped() {
    let list = score_detections(&[255, 255, 255, 255], &labels(), 50.0);
    assert_eq!(list.len(), 3);
    assert_eq!(list[2].label, "bird");
  }

  #[test]
  fn payload_keys() {
    let result = InferenceResult {
      device: "cam".into(),
      timestamp: 1,
      duration: 2,
      list: vec![Detection {
        label: "cat".into(),
        score: 90,
      }],
    };
    assert_eq!(
      serde_json::to_value(&result).unwrap(),
      serde_json::json!({
        "device": "cam",
        "timestamp": 1,
        "duration": 2,
        "list": [{"label": "cat", "score": 90}]
      })
    );
  }

  #[test]
  fn busy_and_no_frame_are_recoverable() {
    assert!(CycleError::Busy.is_recoverable());
    assert!(CycleError::NoFrame.is_recoverable());
    assert!(!CycleError::NotReady.is_recoverable());
  }
}
