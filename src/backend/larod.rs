// 该文件是 Kanjian （看见） 项目的一部分。
// src/backend/larod.rs - larod 推理后端
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

mod sys;

use std::ffi::{CStr, CString};
use std::fs::File;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr;

use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use super::{BackendError, Chip, Connection, Driver, TensorSet};
use crate::{FromUrl, FromUrlWithScheme};

const LAROD_DEFAULT_PACKAGE: &str = "kanjian";
const LAROD_CANDIDATES: [Chip; 3] = [Chip::EdgeTpu, Chip::Artpec8Dlpu, Chip::TfliteCpu];

#[derive(Error, Debug)]
pub enum LarodDriverError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// larod 服务驱动
#[derive(Debug, Clone)]
pub struct LarodDriver {
  package: String,
}

impl FromUrlWithScheme for LarodDriver {
  const SCHEME: &'static str = "larod";
}

impl FromUrl for LarodDriver {
  type Error = LarodDriverError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(LarodDriverError::SchemeMismatch);
    }

    let package = url
      .query_pairs()
      .find(|(k, _)| k == "package")
      .map(|(_, v)| v.into_owned())
      .unwrap_or_else(|| LAROD_DEFAULT_PACKAGE.to_string());

    Ok(LarodDriver { package })
  }
}

impl Default for LarodDriver {
  fn default() -> Self {
    LarodDriver {
      package: LAROD_DEFAULT_PACKAGE.to_string(),
    }
  }
}

impl LarodDriver {
  pub fn package(&self) -> &str {
    &self.package
  }
}

impl Driver for LarodDriver {
  type Connection = LarodConnection;

  fn candidates(&self) -> &[Chip] {
    &LAROD_CANDIDATES
  }

  fn connect(&self) -> Result<Self::Connection, BackendError> {
    let mut raw = ptr::null_mut();
    let mut err = ErrorSlot::new();
    if unsafe { sys::larodConnect(&mut raw, err.as_mut_ptr()) } {
      debug!("已连接 larod");
      Ok(LarodConnection {
        raw,
        package: self.package.clone(),
      })
    } else {
      let e = err.take();
      error!("无法连接 larod: {}", e);
      Err(e)
    }
  }
}

/// larod 返回的错误，丢弃时自动清理
struct ErrorSlot(*mut sys::larodError);

impl ErrorSlot {
  fn new() -> Self {
    ErrorSlot(ptr::null_mut())
  }

  fn as_mut_ptr(&mut self) -> *mut *mut sys::larodError {
    &mut self.0
  }

  fn take(&mut self) -> BackendError {
    if self.0.is_null() {
      return BackendError::driver(-1, "未知错误");
    }
    let (code, message) = unsafe {
      let raw = &*self.0;
      let message = if raw.msg.is_null() {
        String::new()
      } else {
        CStr::from_ptr(raw.msg).to_string_lossy().into_owned()
      };
      (raw.code, message)
    };
    unsafe { sys::larodClearError(&mut self.0) };
    BackendError::driver(code, message)
  }
}

impl Drop for ErrorSlot {
  fn drop(&mut self) {
    if !self.0.is_null() {
      unsafe { sys::larodClearError(&mut self.0) };
    }
  }
}

fn chip_id(chip: Chip) -> Result<sys::larodChip, BackendError> {
  match chip {
    Chip::EdgeTpu => Ok(sys::LAROD_CHIP_TPU),
    Chip::Artpec8Dlpu => Ok(sys::LAROD_CHIP_TFLITE_ARTPEC8DLPU),
    Chip::TfliteCpu => Ok(sys::LAROD_CHIP_TFLITE_CPU),
    Chip::Rknpu => Err(BackendError::ChipUnsupported(chip)),
  }
}

pub struct LarodConnection {
  raw: *mut sys::larodConnection,
  package: String,
}

// larod 句柄只在持有会话锁时使用
unsafe impl Send for LarodConnection {}

impl Drop for LarodConnection {
  fn drop(&mut self) {
    if !self.raw.is_null() {
      unsafe { sys::larodDisconnect(&mut self.raw, ptr::null_mut()) };
      debug!("已断开 larod 连接");
    }
  }
}

pub struct LarodModel {
  raw: *mut sys::larodModel,
}

unsafe impl Send for LarodModel {}

impl Drop for LarodModel {
  fn drop(&mut self) {
    if !self.raw.is_null() {
      unsafe { sys::larodDestroyModel(&mut self.raw) };
    }
  }
}

pub struct LarodTensors {
  raw: *mut *mut sys::larodTensor,
  len: usize,
}

unsafe impl Send for LarodTensors {}

impl TensorSet for LarodTensors {
  fn len(&self) -> usize {
    self.len
  }
}

impl Drop for LarodTensors {
  fn drop(&mut self) {
    if !self.raw.is_null() {
      unsafe { sys::larodDestroyTensors(&mut self.raw, self.len) };
    }
  }
}

pub struct LarodRequest {
  raw: *mut sys::larodInferenceRequest,
}

unsafe impl Send for LarodRequest {}

impl Drop for LarodRequest {
  fn drop(&mut self) {
    if !self.raw.is_null() {
      unsafe { sys::larodDestroyInferenceRequest(&mut self.raw) };
    }
  }
}

impl LarodConnection {
  fn create_tensors(
    model: &LarodModel,
    create: unsafe extern "C" fn(
      *const sys::larodModel,
      *mut usize,
      *mut *mut sys::larodError,
    ) -> *mut *mut sys::larodTensor,
  ) -> Result<LarodTensors, BackendError> {
    let mut len = 0usize;
    let mut err = ErrorSlot::new();
    let raw = unsafe { create(model.raw, &mut len, err.as_mut_ptr()) };
    if raw.is_null() {
      Err(err.take())
    } else {
      Ok(LarodTensors { raw, len })
    }
  }
}

impl Connection for LarodConnection {
  type Model = LarodModel;
  type Tensors = LarodTensors;
  type Request = LarodRequest;

  fn select_chip(&mut self, chip: Chip) -> Result<(), BackendError> {
    let id = chip_id(chip)?;
    let mut err = ErrorSlot::new();
    if unsafe { sys::larodSetChip(self.raw, id, err.as_mut_ptr()) } {
      Ok(())
    } else {
      Err(err.take())
    }
  }

  /// larod 以应用包名作为模型名称
  fn load_model(&mut self, model: &File, name: &str) -> Result<Self::Model, BackendError> {
    debug!("以 {} 的名义加载模型 {}", self.package, name);
    let name = CString::new(self.package.as_str()).map_err(|e| {
      BackendError::IoError(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    })?;
    let mut err = ErrorSlot::new();
    let raw = unsafe {
      sys::larodLoadModel(
        self.raw,
        model.as_raw_fd(),
        sys::LAROD_ACCESS_PRIVATE,
        name.as_ptr(),
        err.as_mut_ptr(),
      )
    };
    if raw.is_null() {
      Err(err.take())
    } else {
      Ok(LarodModel { raw })
    }
  }

  fn create_inputs(&mut self, model: &Self::Model) -> Result<Self::Tensors, BackendError> {
    Self::create_tensors(model, sys::larodCreateModelInputs)
  }

  fn create_outputs(&mut self, model: &Self::Model) -> Result<Self::Tensors, BackendError> {
    Self::create_tensors(model, sys::larodCreateModelOutputs)
  }

  fn bind_fd(
    &mut self,
    tensors: &mut Self::Tensors,
    index: usize,
    fd: BorrowedFd<'_>,
  ) -> Result<(), BackendError> {
    if index >= tensors.len {
      return Err(BackendError::TensorCount {
        expected: index + 1,
        actual: tensors.len,
      });
    }
    let mut err = ErrorSlot::new();
    let tensor = unsafe { *tensors.raw.add(index) };
    if unsafe { sys::larodSetTensorFd(tensor, fd.as_raw_fd(), err.as_mut_ptr()) } {
      Ok(())
    } else {
      Err(err.take())
    }
  }

  fn create_request(
    &mut self,
    model: &Self::Model,
    inputs: &Self::Tensors,
    outputs: &Self::Tensors,
  ) -> Result<Self::Request, BackendError> {
    let mut err = ErrorSlot::new();
    let raw = unsafe {
      sys::larodCreateInferenceRequest(
        model.raw,
        inputs.raw,
        inputs.len,
        outputs.raw,
        outputs.len,
        err.as_mut_ptr(),
      )
    };
    if raw.is_null() {
      Err(err.take())
    } else {
      Ok(LarodRequest { raw })
    }
  }

  fn run(&mut self, request: &mut Self::Request) -> Result<(), BackendError> {
    let mut err = ErrorSlot::new();
    if unsafe { sys::larodRunInference(self.raw, request.raw, err.as_mut_ptr()) } {
      Ok(())
    } else {
      Err(err.take())
    }
  }
}
