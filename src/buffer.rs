// 该文件是 Kanjian （看见） 项目的一部分。
// src/buffer.rs - 张量共享内存缓冲区
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

//! 张量缓冲区
//!
//! 每个张量对应一块固定大小的共享内存，底层是一个创建后立即从文件系统
//! 删除的临时文件。推理后端通过文件描述符直接读写，转换步骤通过映射地址
//! 直接写入，两者之间不存在数据拷贝。

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;

use memmap2::MmapMut;
use thiserror::Error;
use tracing::{debug, warn};

pub const INPUT_BUFFER_PREFIX: &str = "kanjian.in.";
pub const OUTPUT_BUFFER_PREFIX: &str = "kanjian.out.";

/// 分配过程中出错的步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStage {
  Create,
  Size,
  Unlink,
  Map,
}

impl std::fmt::Display for AllocStage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let stage = match self {
      AllocStage::Create => "创建",
      AllocStage::Size => "设置大小",
      AllocStage::Unlink => "删除路径",
      AllocStage::Map => "内存映射",
    };
    f.write_str(stage)
  }
}

#[derive(Error, Debug)]
pub enum BufferError {
  #[error("张量缓冲区分配失败（{stage}）: {source}")]
  AllocationFailed {
    stage: AllocStage,
    #[source]
    source: std::io::Error,
  },
}

impl BufferError {
  fn at(stage: AllocStage) -> impl FnOnce(std::io::Error) -> Self {
    move |source| {
      warn!("张量缓冲区{}失败: {}", stage, source);
      BufferError::AllocationFailed { stage, source }
    }
  }

  pub fn stage(&self) -> AllocStage {
    match self {
      BufferError::AllocationFailed { stage, .. } => *stage,
    }
  }
}

/// 固定大小的共享内存张量缓冲区
///
/// 映射和描述符分别记录，释放时各自只在确实持有时才释放，
/// 因此对已释放或部分初始化的缓冲区调用 [`TensorBuffer::release`] 是安全的。
#[derive(Debug)]
pub struct TensorBuffer {
  // 字段顺序即释放顺序：先解除映射，再关闭描述符
  map: Option<MmapMut>,
  file: Option<File>,
  len: usize,
}

impl TensorBuffer {
  /// 在系统临时目录中分配 `len` 字节的缓冲区
  pub fn allocate(prefix: &str, len: usize) -> Result<Self, BufferError> {
    Self::allocate_in(std::env::temp_dir(), prefix, len)
  }

  pub fn allocate_in<P: AsRef<Path>>(dir: P, prefix: &str, len: usize) -> Result<Self, BufferError> {
    if len == 0 {
      return Err(BufferError::at(AllocStage::Size)(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        "缓冲区大小不能为 0",
      )));
    }

    let named = tempfile::Builder::new()
      .prefix(prefix)
      .tempfile_in(dir)
      .map_err(BufferError::at(AllocStage::Create))?;
    debug!("创建张量缓冲区文件: {}", named.path().display());

    // 出错时 `named` 被丢弃，文件随之关闭并删除
    named
      .as_file()
      .set_len(len as u64)
      .map_err(BufferError::at(AllocStage::Size))?;

    let (file, path) = named.into_parts();
    path.close().map_err(BufferError::at(AllocStage::Unlink))?;

    let map = unsafe { MmapMut::map_mut(&file) }.map_err(BufferError::at(AllocStage::Map))?;

    Ok(TensorBuffer {
      map: Some(map),
      file: Some(file),
      len,
    })
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn is_released(&self) -> bool {
    self.map.is_none() && self.file.is_none()
  }

  /// 映射后的内容；释放后为空切片
  pub fn as_slice(&self) -> &[u8] {
    self.map.as_deref().unwrap_or(&[])
  }

  pub fn as_mut_slice(&mut self) -> &mut [u8] {
    self.map.as_deref_mut().unwrap_or(&mut [])
  }

  /// 供推理后端绑定的文件描述符
  pub fn fd(&self) -> Option<BorrowedFd<'_>> {
    self.file.as_ref().map(AsFd::as_fd)
  }

  /// 将描述符的读写位置重置到开头
  pub fn rewind(&mut self) -> std::io::Result<()> {
    match self.file.as_mut() {
      Some(file) => file.seek(SeekFrom::Start(0)).map(|_| ()),
      None => Err(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "张量缓冲区已释放",
      )),
    }
  }

  /// 解除映射并关闭描述符，可重复调用
  pub fn release(&mut self) {
    if let Some(map) = self.map.take() {
      drop(map);
      debug!("解除张量缓冲区映射（{} 字节）", self.len);
    }
    if let Some(file) = self.file.take() {
      drop(file);
    }
  }
}

impl Drop for TensorBuffer {
  fn drop(&mut self) {
    self.release();
  }
}
