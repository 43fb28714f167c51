// 该文件是 Kanjian （看见） 项目的一部分。
// src/session.rs - 推理后端会话
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

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, Chip, Connection, Driver, TensorSet};
use crate::buffer::TensorBuffer;

/// 本设计只支持单输入、单输出的模型
const SESSION_NUM_INPUTS: usize = 1;
const SESSION_NUM_OUTPUTS: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  Unconnected,
  ChipSelected,
  ModelLoaded,
  TensorsBound,
  Ready,
  Closed,
}

/// 绑定张量时失败的步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStage {
  Inputs,
  Outputs,
  Request,
}

#[derive(Error, Debug)]
pub enum SessionError {
  #[error("没有兼容的计算单元")]
  NoCompatibleBackend,
  #[error("模型加载失败: {0}")]
  ModelLoadFailed(#[source] BackendError),
  #[error("张量绑定失败（{stage:?}）: {source}")]
  BindFailed {
    stage: BindStage,
    #[source]
    source: BackendError,
  },
  #[error("推理执行失败: {0}")]
  RunFailed(#[source] BackendError),
  #[error("会话状态无效: {0:?}")]
  InvalidState(SessionState),
}

/// 推理后端会话
///
/// 持有连接、模型、张量句柄、推理请求以及两块张量缓冲区。
/// 关闭时按获取的逆序释放，每一步只释放确实持有的资源。
pub struct Session<C: Connection> {
  // 字段顺序即释放顺序
  request: Option<C::Request>,
  outputs: Option<C::Tensors>,
  inputs: Option<C::Tensors>,
  model: Option<C::Model>,
  connection: Option<C>,
  output_buffer: Option<TensorBuffer>,
  input_buffer: Option<TensorBuffer>,
  chip: Option<Chip>,
  state: SessionState,
}

impl<C: Connection> Session<C> {
  /// 尚未连接任何后端的会话
  pub fn new() -> Self {
    Session {
      request: None,
      outputs: None,
      inputs: None,
      model: None,
      connection: None,
      output_buffer: None,
      input_buffer: None,
      chip: None,
      state: SessionState::Unconnected,
    }
  }

  /// 按候选顺序选择计算单元并加载模型
  ///
  /// 每个候选只尝试一次；失败的连接在尝试下一个候选前即被释放。
  pub fn open<D>(driver: &D, candidates: &[Chip], model: &File, name: &str) -> Result<Self, SessionError>
  where
    D: Driver<Connection = C>,
  {
    let mut session = Session::new();
    session.select_chip(driver, candidates)?;
    session.load_model(model, name)?;
    Ok(session)
  }

  pub fn select_chip<D>(&mut self, driver: &D, candidates: &[Chip]) -> Result<Chip, SessionError>
  where
    D: Driver<Connection = C>,
  {
    self.expect_state(SessionState::Unconnected)?;
    let (connection, chip) = select_chip(driver, candidates)?;
    self.connection = Some(connection);
    self.chip = Some(chip);
    self.state = SessionState::ChipSelected;
    Ok(chip)
  }

  pub fn load_model(&mut self, model: &File, name: &str) -> Result<(), SessionError> {
    self.expect_state(SessionState::ChipSelected)?;
    let (Some(connection), Some(chip)) = (self.connection.as_mut(), self.chip) else {
      return Err(SessionError::InvalidState(self.state));
    };

    let model = connection.load_model(model, name).map_err(|e| {
      warn!("无法在 {} 上加载模型 {}: {}", chip, name, e);
      SessionError::ModelLoadFailed(e)
    })?;
    info!("模型 {} 已加载到 {}", name, chip);

    self.model = Some(model);
    self.state = SessionState::ModelLoaded;
    Ok(())
  }

  /// 将两块缓冲区绑定到模型声明的输入、输出张量，并创建推理请求
  ///
  /// 缓冲区无论成功与否都归会话所有，随会话一起释放。
  pub fn bind_tensors(&mut self, input: TensorBuffer, output: TensorBuffer) -> Result<(), SessionError> {
    self.expect_state(SessionState::ModelLoaded)?;

    self.input_buffer = Some(input);
    self.output_buffer = Some(output);

    let (Some(connection), Some(model)) = (self.connection.as_mut(), self.model.as_ref()) else {
      return Err(SessionError::InvalidState(self.state));
    };
    let input_fd = self.input_buffer.as_ref().and_then(TensorBuffer::fd);
    let output_fd = self.output_buffer.as_ref().and_then(TensorBuffer::fd);
    let (Some(input_fd), Some(output_fd)) = (input_fd, output_fd) else {
      return Err(bind_failed(BindStage::Inputs)(BackendError::driver(
        -1,
        "张量缓冲区已释放",
      )));
    };

    let mut inputs = connection
      .create_inputs(model)
      .map_err(bind_failed(BindStage::Inputs))?;
    expect_count(&inputs, SESSION_NUM_INPUTS).map_err(bind_failed(BindStage::Inputs))?;
    connection
      .bind_fd(&mut inputs, 0, input_fd)
      .map_err(bind_failed(BindStage::Inputs))?;

    let mut outputs = connection
      .create_outputs(model)
      .map_err(bind_failed(BindStage::Outputs))?;
    expect_count(&outputs, SESSION_NUM_OUTPUTS).map_err(bind_failed(BindStage::Outputs))?;
    connection
      .bind_fd(&mut outputs, 0, output_fd)
      .map_err(bind_failed(BindStage::Outputs))?;
    debug!("输入、输出张量已绑定");

    // 请求创建失败时会话停留在 TensorsBound，只能关闭
    let request = connection.create_request(model, &inputs, &outputs);
    self.inputs = Some(inputs);
    self.outputs = Some(outputs);
    self.state = SessionState::TensorsBound;

    self.request = Some(request.map_err(bind_failed(BindStage::Request))?);
    self.state = SessionState::Ready;
    info!("推理请求已创建，会话就绪");
    Ok(())
  }

  /// 执行一次推理请求
  pub fn run(&mut self) -> Result<(), SessionError> {
    match (self.connection.as_mut(), self.request.as_mut()) {
      (Some(connection), Some(request)) => connection.run(request).map_err(SessionError::RunFailed),
      _ => Err(SessionError::InvalidState(self.state)),
    }
  }

  pub fn state(&self) -> SessionState {
    self.state
  }

  pub fn is_ready(&self) -> bool {
    self.state == SessionState::Ready
  }

  /// 选定的计算单元，选择之前为 `None`
  pub fn chip(&self) -> Option<Chip> {
    self.chip
  }

  pub fn input_count(&self) -> usize {
    self.inputs.as_ref().map_or(0, TensorSet::len)
  }

  pub fn output_count(&self) -> usize {
    self.outputs.as_ref().map_or(0, TensorSet::len)
  }

  pub fn input_buffer_mut(&mut self) -> Option<&mut TensorBuffer> {
    self.input_buffer.as_mut()
  }

  pub fn output_buffer(&self) -> Option<&TensorBuffer> {
    self.output_buffer.as_ref()
  }

  pub fn output_buffer_mut(&mut self) -> Option<&mut TensorBuffer> {
    self.output_buffer.as_mut()
  }

  /// 按获取的逆序释放全部资源，可重复调用
  pub fn close(&mut self) {
    if self.state == SessionState::Closed {
      return;
    }
    drop(self.request.take());
    drop(self.outputs.take());
    drop(self.inputs.take());
    drop(self.model.take());
    drop(self.connection.take());
    if let Some(mut buffer) = self.output_buffer.take() {
      buffer.release();
    }
    if let Some(mut buffer) = self.input_buffer.take() {
      buffer.release();
    }
    self.state = SessionState::Closed;
    debug!("会话已关闭");
  }

  fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
    if self.state == expected {
      Ok(())
    } else {
      Err(SessionError::InvalidState(self.state))
    }
  }
}

impl<C: Connection> Default for Session<C> {
  fn default() -> Self {
    Session::new()
  }
}

impl<C: Connection> Drop for Session<C> {
  fn drop(&mut self) {
    self.close();
  }
}

fn select_chip<D: Driver>(driver: &D, candidates: &[Chip]) -> Result<(D::Connection, Chip), SessionError> {
  for &chip in candidates {
    let mut connection = match driver.connect() {
      Ok(connection) => connection,
      Err(e) => {
        warn!("连接推理后端失败（候选 {}）: {}", chip, e);
        continue;
      }
    };

    match connection.select_chip(chip) {
      Ok(()) => {
        info!("选定计算单元: {}", chip);
        return Ok((connection, chip));
      }
      Err(e) => debug!("计算单元 {} 不可用: {}", chip, e),
    }
  }

  warn!("没有找到兼容的计算单元");
  Err(SessionError::NoCompatibleBackend)
}

fn bind_failed(stage: BindStage) -> impl FnOnce(BackendError) -> SessionError {
  move |source| {
    warn!("张量绑定失败（{:?}）: {}", stage, source);
    SessionError::BindFailed { stage, source }
  }
}

fn expect_count<T: TensorSet>(tensors: &T, expected: usize) -> Result<(), BackendError> {
  if tensors.len() == expected {
    Ok(())
  } else {
    Err(BackendError::TensorCount {
      expected,
      actual: tensors.len(),
    })
  }
}
