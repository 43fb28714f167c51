// 该文件是 Kanjian （看见） 项目的一部分。
// src/backend/rknpu.rs - RKNPU 推理后端
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
use std::io::{Read, Seek};
use std::os::fd::BorrowedFd;

use memmap2::MmapMut;
use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use super::{BackendError, Chip, Connection, Driver, TensorSet};
use crate::{FromUrl, FromUrlWithScheme};

const RKNPU_CANDIDATES: [Chip; 1] = [Chip::Rknpu];

#[derive(Error, Debug)]
pub enum RknpuDriverError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// RKNPU 驱动
///
/// RKNN 运行时没有独立的连接对象，加载模型时才创建推理上下文。
#[derive(Debug, Clone, Default)]
pub struct RknpuDriver;

impl FromUrlWithScheme for RknpuDriver {
  const SCHEME: &'static str = "rknpu";
}

impl FromUrl for RknpuDriver {
  type Error = RknpuDriverError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(RknpuDriverError::SchemeMismatch);
    }
    Ok(RknpuDriver)
  }
}

impl Driver for RknpuDriver {
  type Connection = RknpuConnection;

  fn candidates(&self) -> &[Chip] {
    &RKNPU_CANDIDATES
  }

  fn connect(&self) -> Result<Self::Connection, BackendError> {
    Ok(RknpuConnection { context: None })
  }
}

fn rknn_error(e: rknpu::Error) -> BackendError {
  BackendError::driver(-1, e.to_string())
}

pub struct RknpuConnection {
  context: Option<Context>,
}

// 上下文只在持有会话锁时访问
unsafe impl Send for RknpuConnection {}

pub struct RknpuModel {
  num_inputs: usize,
  num_outputs: usize,
}

pub struct RknpuTensors {
  files: Vec<Option<File>>,
}

impl TensorSet for RknpuTensors {
  fn len(&self) -> usize {
    self.files.len()
  }
}

impl RknpuTensors {
  fn with_len(len: usize) -> Self {
    RknpuTensors {
      files: (0..len).map(|_| None).collect(),
    }
  }

  fn map_first(&self) -> Result<MmapMut, BackendError> {
    let file = self
      .files
      .first()
      .and_then(Option::as_ref)
      .ok_or(BackendError::TensorCount {
        expected: 1,
        actual: 0,
      })?;
    Ok(unsafe { MmapMut::map_mut(file)? })
  }
}

pub struct RknpuRequest {
  input: MmapMut,
  output: MmapMut,
}

impl Connection for RknpuConnection {
  type Model = RknpuModel;
  type Tensors = RknpuTensors;
  type Request = RknpuRequest;

  fn select_chip(&mut self, chip: Chip) -> Result<(), BackendError> {
    match chip {
      Chip::Rknpu => Ok(()),
      other => Err(BackendError::ChipUnsupported(other)),
    }
  }

  fn load_model(&mut self, model: &File, name: &str) -> Result<Self::Model, BackendError> {
    let mut reader = model;
    reader.rewind()?;
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    debug!(
      "模型 {} 文件大小: {:.2} MB",
      name,
      data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&data, InitFlags::default()).map_err(rknn_error)?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!("查询 SDK 版本失败: {}", e);
        return Err(rknn_error(e));
      }
    }

    let num_inputs = context.num_inputs().map_err(rknn_error)? as usize;
    let num_outputs = context.num_outputs().map_err(rknn_error)? as usize;
    debug!("模型输入数量: {}, 输出数量: {}", num_inputs, num_outputs);

    self.context = Some(context);
    Ok(RknpuModel {
      num_inputs,
      num_outputs,
    })
  }

  fn create_inputs(&mut self, model: &Self::Model) -> Result<Self::Tensors, BackendError> {
    Ok(RknpuTensors::with_len(model.num_inputs))
  }

  fn create_outputs(&mut self, model: &Self::Model) -> Result<Self::Tensors, BackendError> {
    Ok(RknpuTensors::with_len(model.num_outputs))
  }

  fn bind_fd(
    &mut self,
    tensors: &mut Self::Tensors,
    index: usize,
    fd: BorrowedFd<'_>,
  ) -> Result<(), BackendError> {
    let actual = tensors.files.len();
    let slot = tensors
      .files
      .get_mut(index)
      .ok_or(BackendError::TensorCount {
        expected: index + 1,
        actual,
      })?;
    *slot = Some(File::from(fd.try_clone_to_owned()?));
    Ok(())
  }

  fn create_request(
    &mut self,
    _model: &Self::Model,
    inputs: &Self::Tensors,
    outputs: &Self::Tensors,
  ) -> Result<Self::Request, BackendError> {
    Ok(RknpuRequest {
      input: inputs.map_first()?,
      output: outputs.map_first()?,
    })
  }

  fn run(&mut self, request: &mut Self::Request) -> Result<(), BackendError> {
    let context = self
      .context
      .as_ref()
      .ok_or_else(|| BackendError::driver(-1, "推理上下文未创建"))?;

    debug!("设置模型输入");
    context
      .set_input(0, &request.input[..], TensorFormat::NHWC, TensorType::UInt8)
      .map_err(rknn_error)?;

    debug!("执行模型推理");
    context.run().map_err(rknn_error)?;

    let output = context.get_outputs().map_err(rknn_error)?;
    let scores = output
      .get_f32(0)
      .map_err(|e| BackendError::driver(-1, e.to_string()))?;

    // 运行时输出已反量化为 0.0 - 1.0，写回单字节分数
    for (dst, score) in request.output.iter_mut().zip(scores) {
      *dst = (score.clamp(0.0, 1.0) * 255.0).round() as u8;
    }
    Ok(())
  }
}
