// 该文件是 Kanjian （看见） 项目的一部分。
// src/backend.rs - 推理后端定义
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

use std::fs::File;
use std::os::fd::BorrowedFd;

use thiserror::Error;

/// 计算单元候选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chip {
  /// Google Edge TPU
  EdgeTpu,
  /// ARTPEC-8 深度学习处理单元
  Artpec8Dlpu,
  /// Rockchip NPU
  Rknpu,
  /// 通用 CPU（TFLite）
  TfliteCpu,
}

impl Chip {
  /// 状态上报时使用的名称
  pub fn name(&self) -> &'static str {
    match self {
      Chip::EdgeTpu => "EdgeTPU",
      Chip::Artpec8Dlpu => "ARTPEC-8",
      Chip::Rknpu => "RKNPU",
      Chip::TfliteCpu => "CPU",
    }
  }
}

impl std::fmt::Display for Chip {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

#[derive(Error, Debug)]
pub enum BackendError {
  #[error("后端错误 ({code}): {message}")]
  Driver { code: i32, message: String },
  #[error("不支持的计算单元: {0}")]
  ChipUnsupported(Chip),
  #[error("张量槽位数量不匹配: 期望 {expected}, 实际 {actual}")]
  TensorCount { expected: usize, actual: usize },
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

impl BackendError {
  pub fn driver(code: i32, message: impl Into<String>) -> Self {
    BackendError::Driver {
      code,
      message: message.into(),
    }
  }
}

/// 一组由模型声明的张量槽位
pub trait TensorSet {
  fn len(&self) -> usize;

  fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// 推理后端驱动，负责建立连接
pub trait Driver {
  type Connection: Connection;

  /// 按优先顺序排列的默认计算单元候选表
  fn candidates(&self) -> &[Chip];

  fn connect(&self) -> Result<Self::Connection, BackendError>;
}

/// 与推理后端的一条连接
///
/// 各句柄类型在 `Drop` 时自行销毁；会话负责按获取的逆序丢弃它们。
pub trait Connection {
  type Model;
  type Tensors: TensorSet;
  type Request;

  fn select_chip(&mut self, chip: Chip) -> Result<(), BackendError>;

  fn load_model(&mut self, model: &File, name: &str) -> Result<Self::Model, BackendError>;

  fn create_inputs(&mut self, model: &Self::Model) -> Result<Self::Tensors, BackendError>;

  fn create_outputs(&mut self, model: &Self::Model) -> Result<Self::Tensors, BackendError>;

  fn bind_fd(
    &mut self,
    tensors: &mut Self::Tensors,
    index: usize,
    fd: BorrowedFd<'_>,
  ) -> Result<(), BackendError>;

  fn create_request(
    &mut self,
    model: &Self::Model,
    inputs: &Self::Tensors,
    outputs: &Self::Tensors,
  ) -> Result<Self::Request, BackendError>;

  fn run(&mut self, request: &mut Self::Request) -> Result<(), BackendError>;
}

#[cfg(feature = "rknpu")]
mod rknpu;
#[cfg(feature = "rknpu")]
pub use self::rknpu::{RknpuConnection, RknpuDriver, RknpuDriverError};

#[cfg(feature = "larod")]
mod larod;
#[cfg(feature = "larod")]
pub use self::larod::{LarodConnection, LarodDriver, LarodDriverError};
