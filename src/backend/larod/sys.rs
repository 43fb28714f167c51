// 该文件是 Kanjian （看见） 项目的一部分。
// src/backend/larod/sys.rs - larod C 接口绑定
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

//! `liblarod` 的最小 FFI 子集，只覆盖会话建立、张量绑定与推理执行。
//!
//! 所有函数均为 `unsafe extern "C"`，安全封装见上级模块。

#![allow(non_camel_case_types, non_snake_case, dead_code)]

use std::os::raw::{c_char, c_int};

#[repr(C)]
pub struct larodConnection {
  _private: [u8; 0],
}

#[repr(C)]
pub struct larodModel {
  _private: [u8; 0],
}

#[repr(C)]
pub struct larodTensor {
  _private: [u8; 0],
}

#[repr(C)]
pub struct larodInferenceRequest {
  _private: [u8; 0],
}

#[repr(C)]
pub struct larodError {
  pub code: c_int,
  pub msg: *const c_char,
}

pub type larodChip = c_int;
pub const LAROD_CHIP_INVALID: larodChip = 0;
pub const LAROD_CHIP_TFLITE_CPU: larodChip = 2;
pub const LAROD_CHIP_TPU: larodChip = 4;
pub const LAROD_CHIP_TFLITE_ARTPEC8DLPU: larodChip = 12;

pub type larodAccess = c_int;
pub const LAROD_ACCESS_INVALID: larodAccess = 0;
pub const LAROD_ACCESS_PRIVATE: larodAccess = 1;
pub const LAROD_ACCESS_PUBLIC: larodAccess = 2;

#[link(name = "larod")]
unsafe extern "C" {
  pub fn larodConnect(conn: *mut *mut larodConnection, error: *mut *mut larodError) -> bool;

  pub fn larodDisconnect(conn: *mut *mut larodConnection, error: *mut *mut larodError) -> bool;

  pub fn larodSetChip(
    conn: *mut larodConnection,
    chip: larodChip,
    error: *mut *mut larodError,
  ) -> bool;

  pub fn larodLoadModel(
    conn: *mut larodConnection,
    fd: c_int,
    access: larodAccess,
    name: *const c_char,
    error: *mut *mut larodError,
  ) -> *mut larodModel;

  pub fn larodDestroyModel(model: *mut *mut larodModel);

  pub fn larodCreateModelInputs(
    model: *const larodModel,
    numTensors: *mut usize,
    error: *mut *mut larodError,
  ) -> *mut *mut larodTensor;

  pub fn larodCreateModelOutputs(
    model: *const larodModel,
    numTensors: *mut usize,
    error: *mut *mut larodError,
  ) -> *mut *mut larodTensor;

  pub fn larodDestroyTensors(tensors: *mut *mut *mut larodTensor, numTensors: usize);

  pub fn larodSetTensorFd(tensor: *mut larodTensor, fd: c_int, error: *mut *mut larodError)
  -> bool;

  pub fn larodCreateInferenceRequest(
    model: *const larodModel,
    inputTensors: *mut *mut larodTensor,
    numInputs: usize,
    outputTensors: *mut *mut larodTensor,
    numOutputs: usize,
    error: *mut *mut larodError,
  ) -> *mut larodInferenceRequest;

  pub fn larodDestroyInferenceRequest(infReq: *mut *mut larodInferenceRequest);

  pub fn larodRunInference(
    conn: *mut larodConnection,
    infReq: *const larodInferenceRequest,
    error: *mut *mut larodError,
  ) -> bool;

  pub fn larodClearError(error: *mut *mut larodError);
}
