// 该文件是 Kanjian （看见） 项目的一部分。
// src/frame.rs - 视频帧与帧源定义
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

use std::sync::Arc;

use thiserror::Error;

pub const RGB_CHANNELS: usize = 3;

/// 帧的原生像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
  /// Y 平面后接交错的 UV 平面
  Nv12,
  Rgb,
  Bgr,
}

/// 对一帧像素数据的只读视图
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
  pub format: PixelFormat,
  pub width: u32,
  pub height: u32,
  /// 每行字节数（NV12 为 Y 平面的行宽）
  pub stride: usize,
  /// NV12 的 UV 平面起始偏移
  pub chroma_offset: usize,
  pub data: &'a [u8],
}

impl<'a> FrameView<'a> {
  /// 无行填充的紧凑布局
  pub fn packed(format: PixelFormat, width: u32, height: u32, data: &'a [u8]) -> Self {
    let stride = match format {
      PixelFormat::Nv12 => width as usize,
      PixelFormat::Rgb | PixelFormat::Bgr => width as usize * RGB_CHANNELS,
    };
    FrameView {
      format,
      width,
      height,
      stride,
      chroma_offset: stride * height as usize,
      data,
    }
  }
}

pub trait VideoFrame {
  fn view(&self) -> FrameView<'_>;
}

/// 自有内存的帧，克隆开销很小
#[derive(Debug, Clone)]
pub struct OwnedFrame {
  format: PixelFormat,
  width: u32,
  height: u32,
  data: Arc<[u8]>,
}

impl OwnedFrame {
  pub fn new(format: PixelFormat, width: u32, height: u32, data: Vec<u8>) -> Self {
    OwnedFrame {
      format,
      width,
      height,
      data: data.into(),
    }
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }
}

impl VideoFrame for OwnedFrame {
  fn view(&self) -> FrameView<'_> {
    FrameView::packed(self.format, self.width, self.height, &self.data)
  }
}

#[derive(Error, Debug)]
pub enum FrameSourceError {
  #[error("帧源启动失败: {0}")]
  StartFailed(String),
}

/// 连续视频流
///
/// 后台采集由实现者负责，核心只按需取最新帧并在使用后归还。
pub trait FrameSource {
  type Frame: VideoFrame;

  fn start(&mut self) -> Result<(), FrameSourceError> {
    Ok(())
  }

  fn stop(&mut self) {}

  /// 阻塞直到取得最新一帧；流结束或出错时返回 `None`
  fn acquire_latest(&self) -> Option<Self::Frame>;

  fn release(&self, frame: Self::Frame) {
    drop(frame);
  }
}
