// 该文件是 Kanjian （看见） 项目的一部分。
// src/input.rs - 视频/图像输入
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

use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::frame::{FrameSource, FrameSourceError, FrameView, VideoFrame};

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{
  GStreamerFrame, GStreamerInput, GStreamerInputError, GStreamerInputPipelineBuilder,
};

/// 设备不支持枚举时使用的常见分辨率
pub const DEFAULT_STREAM_RESOLUTIONS: [(u32, u32); 6] = [
  (320, 240),
  (480, 270),
  (640, 360),
  (640, 480),
  (1280, 720),
  (1920, 1080),
];

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("Image file input error: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer input error: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
  #[error("URI scheme mismatch")]
  SchemeMismatch,
}

impl InputError {
  /// 摄像头没有能覆盖模型输入尺寸的分辨率
  pub fn is_no_stream_resolution(&self) -> bool {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputError::GStreamerInputError(GStreamerInputError::NoStreamResolution { .. }) => true,
      _ => false,
    }
  }
}

/// 选出能覆盖模型输入尺寸的最小分辨率
pub fn choose_stream_resolution(
  model_w: u32,
  model_h: u32,
  available: &[(u32, u32)],
) -> Option<(u32, u32)> {
  available
    .iter()
    .copied()
    .filter(|&(w, h)| w >= model_w && h >= model_h)
    .min_by_key(|&(w, h)| (w as u64 * h as u64, w))
}

/// 查询摄像头支持的 NV12 分辨率，失败时退回默认列表
pub fn probe_stream_resolutions(device: &str) -> Vec<(u32, u32)> {
  use v4l::framesize::FrameSizeEnum;
  use v4l::video::Capture;

  let sizes = v4l::Device::with_path(device)
    .and_then(|dev| dev.enum_framesizes(v4l::FourCC::new(b"NV12")));

  let mut resolutions = Vec::new();
  match sizes {
    Ok(sizes) => {
      for size in sizes {
        match size.size {
          FrameSizeEnum::Discrete(d) => resolutions.push((d.width, d.height)),
          FrameSizeEnum::Stepwise(s) => resolutions.extend(
            DEFAULT_STREAM_RESOLUTIONS.iter().copied().filter(|&(w, h)| {
              (s.min_width..=s.max_width).contains(&w) && (s.min_height..=s.max_height).contains(&h)
            }),
          ),
        }
      }
    }
    Err(e) => warn!("无法枚举 {} 的分辨率: {}", device, e),
  }

  if resolutions.is_empty() {
    debug!("使用默认分辨率列表");
    resolutions.extend(DEFAULT_STREAM_RESOLUTIONS);
  }
  resolutions
}

pub enum InputWrapper {
  #[cfg(feature = "gstreamer_input")]
  GStreamerInput(GStreamerInput),
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
}

impl InputWrapper {
  /// 按 URI 方案创建输入，`geometry` 为模型输入尺寸
  pub fn open(url: &Url, geometry: (u32, u32)) -> Result<Self, InputError> {
    #[cfg(feature = "gstreamer_input")]
    {
      use crate::{FromUrl, FromUrlWithScheme};

      if url.scheme() == GStreamerInputPipelineBuilder::SCHEME {
        let input = GStreamerInputPipelineBuilder::from_url(url)?
          .model_geometry(geometry.0, geometry.1)?
          .build()?;
        return Ok(InputWrapper::GStreamerInput(input));
      }
    }
    #[cfg(feature = "read_image_file")]
    {
      use crate::{FromUrl, FromUrlWithScheme};

      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::from_url(url)?;
        debug!(
          "图像尺寸 {}x{}，模型尺寸 {}x{}",
          input.width(),
          input.height(),
          geometry.0,
          geometry.1
        );
        return Ok(InputWrapper::ReadImageFile(input));
      }
    }
    let _ = geometry;
    Err(InputError::SchemeMismatch)
  }
}

pub enum InputFrame {
  #[cfg(feature = "gstreamer_input")]
  GStreamer(GStreamerFrame),
  #[cfg(feature = "read_image_file")]
  Owned(crate::frame::OwnedFrame),
}

#[cfg(any(feature = "read_image_file", feature = "gstreamer_input"))]
impl VideoFrame for InputFrame {
  fn view(&self) -> FrameView<'_> {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputFrame::GStreamer(frame) => frame.view(),
      #[cfg(feature = "read_image_file")]
      InputFrame::Owned(frame) => frame.view(),
    }
  }
}

#[cfg(any(feature = "read_image_file", feature = "gstreamer_input"))]
impl FrameSource for InputWrapper {
  type Frame = InputFrame;

  fn start(&mut self) -> Result<(), FrameSourceError> {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.start(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.start(),
    }
  }

  fn stop(&mut self) {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.stop(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.stop(),
    }
  }

  fn acquire_latest(&self) -> Option<Self::Frame> {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.acquire_latest().map(InputFrame::GStreamer),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.acquire_latest().map(InputFrame::Owned),
    }
  }
}

// 没有任何输入特性时两个枚举都无法构造，`open` 总是返回 SchemeMismatch
#[cfg(not(any(feature = "read_image_file", feature = "gstreamer_input")))]
impl VideoFrame for InputFrame {
  fn view(&self) -> FrameView<'_> {
    match *self {}
  }
}

#[cfg(not(any(feature = "read_image_file", feature = "gstreamer_input")))]
impl FrameSource for InputWrapper {
  type Frame = InputFrame;

  fn start(&mut self) -> Result<(), FrameSourceError> {
    match *self {}
  }

  fn stop(&mut self) {
    match *self {}
  }

  fn acquire_latest(&self) -> Option<Self::Frame> {
    match *self {}
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn smallest_covering_resolution_wins() {
    assert_eq!(
      choose_stream_resolution(224, 224, &DEFAULT_STREAM_RESOLUTIONS),
      Some((320, 240))
    );
    assert_eq!(
      choose_stream_resolution(300, 300, &DEFAULT_STREAM_RESOLUTIONS),
      Some((640, 360))
    );
    assert_eq!(
      choose_stream_resolution(500, 500, &[(1920, 1080), (640, 480), (1280, 720)]),
      Some((1280, 720))
    );
  }

  #[test]
  fn no_covering_resolution() {
    assert_eq!(
      choose_stream_resolution(4096, 2160, &DEFAULT_STREAM_RESOLUTIONS),
      None
    );
    assert_eq!(choose_stream_resolution(224, 224, &[]), None);
  }

  #[test]
  fn missing_device_falls_back_to_defaults() {
    let resolutions = probe_stream_resolutions("/dev/kanjian-no-such-device");
    assert_eq!(resolutions, DEFAULT_STREAM_RESOLUTIONS);
  }

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = Url::parse("ftp://host/image.png").unwrap();
    assert!(matches!(
      InputWrapper::open(&url, (224, 224)),
      Err(InputError::SchemeMismatch)
    ));
  }
}
