// 该文件是 Kanjian （看见） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
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

//! # GStreamer 视频输入
//!
//! 支持两种 URI：
//!
//! - `gst://camera/dev/video0?fps=15&rotate=90`：V4L2 摄像头，输出 NV12
//! - `gst://file/path/to/video.mp4?rotate=180`：视频文件，解码后转为 NV12
//!
//! 摄像头的采集分辨率取能覆盖模型输入尺寸的最小分辨率。
//! 管道末端的 appsink 只保留最新的两帧，旧帧被丢弃。
//!
//! 使用前需要安装 GStreamer 开发库：
//!
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```

use std::collections::HashMap;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use super::{choose_stream_resolution, probe_stream_resolutions};
use crate::frame::{FrameSource, FrameSourceError, FrameView, PixelFormat, VideoFrame};
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum GStreamerInputError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  #[error("Unsupported video format: {0:?}")]
  UnsupportedFormat(gst_video::VideoFormat),
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  #[error("No stream resolution covers {width}x{height}")]
  NoStreamResolution { width: u32, height: u32 },
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

const DEFAULT_FPS: u32 = 15;

pub enum GStreamerInputBuilderItem {
  FileSource(String),
  CameraSource {
    camera: String,
    width: u32,
    height: u32,
    fps: u32,
  },
  TargetFormat {
    format: String,
  },
  VideoFlip {
    method: u32,
  },
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerInputBuilderItem::FileSource(path) => {
        format!("filesrc location={} ! decodebin", path)
      }
      GStreamerInputBuilderItem::CameraSource {
        camera,
        width,
        height,
        fps,
      } => format!(
        "v4l2src device={} ! videoscale ! video/x-raw,format=NV12,width={},height={},framerate={}/1",
        camera, width, height, fps
      ),
      GStreamerInputBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
      GStreamerInputBuilderItem::VideoFlip { method } => {
        format!("videoflip method={}", method)
      }
    }
  }
}

enum SourceKind {
  Camera(String),
  File(String),
}

/// GStreamer 输入管道构建器
pub struct GStreamerInputPipelineBuilder {
  source: SourceKind,
  fps: u32,
  flip: Option<GStreamerInputBuilderItem>,
  items: Vec<GStreamerInputBuilderItem>,
}

impl GStreamerInputPipelineBuilder {
  fn video_flip(rotate: Option<&str>) -> Option<GStreamerInputBuilderItem> {
    let method = match rotate? {
      "90" => 1,
      "180" => 2,
      "270" => 3,
      _ => return None,
    };
    Some(GStreamerInputBuilderItem::VideoFlip { method })
  }

  /// 按模型输入尺寸确定源分辨率并组装管道元素
  pub fn model_geometry(mut self, width: u32, height: u32) -> Result<Self, GStreamerInputError> {
    self.items.clear();
    match &self.source {
      SourceKind::Camera(camera) => {
        let available = probe_stream_resolutions(camera);
        let (stream_w, stream_h) = choose_stream_resolution(width, height, &available)
          .ok_or(GStreamerInputError::NoStreamResolution { width, height })?;
        info!("摄像头 {} 使用分辨率 {}x{}", camera, stream_w, stream_h);
        self.items.push(GStreamerInputBuilderItem::CameraSource {
          camera: camera.clone(),
          width: stream_w,
          height: stream_h,
          fps: self.fps,
        });
      }
      SourceKind::File(path) => {
        self
          .items
          .push(GStreamerInputBuilderItem::FileSource(path.clone()));
      }
    }
    if let Some(flip) = self.flip.take() {
      self.items.push(flip);
    }
    self.items.push(GStreamerInputBuilderItem::TargetFormat {
      format: "NV12".to_string(),
    });
    Ok(self)
  }

  pub fn pipeline_description(&self) -> String {
    let basic_pipeline = self
      .items
      .iter()
      .map(GStreamerInputBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    format!(
      "{} ! appsink max-buffers=1 drop=true name=sink",
      basic_pipeline
    )
  }

  /// 创建管道，调用 `start` 之前不会开始采集
  pub fn build(self) -> Result<GStreamerInput, GStreamerInputError> {
    if self.items.is_empty() {
      return Err(GStreamerInputError::PipelineError(
        "Pipeline has no elements".to_string(),
      ));
    }
    gst::init()?;

    let full_pipeline = self.pipeline_description();
    info!("GStreamer pipeline description: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    Ok(GStreamerInput { pipeline, appsink })
  }
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();
    let path = crate::url_path(url).to_string_lossy().into_owned();

    let source = match url.host_str() {
      Some("camera") => SourceKind::Camera(path),
      Some("file") => SourceKind::File(path),
      _ => return Err(GStreamerInputError::SchemeMismatch),
    };
    let fps = query
      .get("fps")
      .and_then(|v| v.parse::<u32>().ok())
      .unwrap_or(DEFAULT_FPS);

    Ok(GStreamerInputPipelineBuilder {
      source,
      fps,
      flip: Self::video_flip(query.get("rotate").map(String::as_str)),
      items: Vec::new(),
    })
  }
}

/// GStreamer 视频输入
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl FrameSource for GStreamerInput {
  type Frame = GStreamerFrame;

  fn start(&mut self) -> Result<(), FrameSourceError> {
    self
      .pipeline
      .set_state(gst::State::Playing)
      .map(|_| ())
      .map_err(|e| FrameSourceError::StartFailed(e.to_string()))
  }

  fn stop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }

  fn acquire_latest(&self) -> Option<Self::Frame> {
    let sample = self
      .appsink
      .pull_sample()
      .map_err(|e| error!("Failed to pull sample: {}", e))
      .ok()?;
    GStreamerFrame::from_sample(sample)
      .map_err(|e| error!("Failed to fetch sample: {}", e))
      .ok()
  }
}

/// 映射为可读的一帧，释放时归还给 GStreamer
pub struct GStreamerFrame {
  buffer: gst::buffer::MappedBuffer<gst::buffer::Readable>,
  format: PixelFormat,
  width: u32,
  height: u32,
  stride: usize,
  chroma_offset: usize,
}

impl GStreamerFrame {
  fn from_sample(sample: gst::Sample) -> Result<Self, GStreamerInputError> {
    let caps = sample
      .caps()
      .ok_or_else(|| GStreamerInputError::PipelineError("No caps in sample".to_string()))?;
    let video_info =
      gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

    let format = match video_info.format() {
      gst_video::VideoFormat::Nv12 => PixelFormat::Nv12,
      gst_video::VideoFormat::Rgb => PixelFormat::Rgb,
      gst_video::VideoFormat::Bgr => PixelFormat::Bgr,
      other => return Err(GStreamerInputError::UnsupportedFormat(other)),
    };
    let stride = video_info.stride().first().copied().unwrap_or(0).max(0) as usize;
    let chroma_offset = video_info.offset().get(1).copied().unwrap_or(0);

    let buffer = sample
      .buffer_owned()
      .ok_or_else(|| GStreamerInputError::PipelineError("No buffer in sample".to_string()))?
      .into_mapped_buffer_readable()
      .map_err(|_| {
        GStreamerInputError::PipelineError("Failed to map buffer for reading".to_string())
      })?;

    Ok(GStreamerFrame {
      buffer,
      format,
      width: video_info.width(),
      height: video_info.height(),
      stride,
      chroma_offset,
    })
  }
}

impl VideoFrame for GStreamerFrame {
  fn view(&self) -> FrameView<'_> {
    FrameView {
      format: self.format,
      width: self.width,
      height: self.height,
      stride: self.stride,
      chroma_offset: self.chroma_offset,
      data: self.buffer.as_slice(),
    }
  }
}
