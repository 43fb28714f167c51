// 该文件是 Kanjian （看见） 项目的一部分。
// src/convert.rs - 帧格式转换、裁剪与缩放
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

use crate::frame::{FrameView, PixelFormat, RGB_CHANNELS};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConvertError {
  #[error("图像尺寸为空: {width}x{height}")]
  EmptyGeometry { width: u32, height: u32 },
  #[error("目标缓冲区大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  DestinationSize { expected: usize, actual: usize },
  #[error("源帧数据不足: 期望至少 {expected} 字节, 实际 {actual} 字节")]
  SourceTooShort { expected: usize, actual: usize },
}

/// 源图像中参与缩放的区域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
  pub x: u32,
  pub y: u32,
  pub width: u32,
  pub height: u32,
}

/// 以中心为基准裁剪到目标宽高比
pub fn center_crop(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> CropRect {
  let (sw, sh, dw, dh) = (src_w as u64, src_h as u64, dst_w as u64, dst_h as u64);
  let (width, height) = if sw * dh > sh * dw {
    ((sh * dw / dh) as u32, src_h)
  } else {
    (src_w, (sw * dh / dw) as u32)
  };
  let (width, height) = (width.max(1), height.max(1));
  CropRect {
    x: (src_w - width) / 2,
    y: (src_h - height) / 2,
    width,
    height,
  }
}

/// 将一帧转换为交错 RGB，并裁剪、缩放到 `dst_w` x `dst_h`
///
/// `dst` 的长度必须正好是 `dst_w * dst_h * 3`。
pub fn convert_crop_scale(
  src: &FrameView<'_>,
  dst: &mut [u8],
  dst_w: u32,
  dst_h: u32,
) -> Result<(), ConvertError> {
  if src.width == 0 || src.height == 0 {
    return Err(ConvertError::EmptyGeometry {
      width: src.width,
      height: src.height,
    });
  }
  if dst_w == 0 || dst_h == 0 {
    return Err(ConvertError::EmptyGeometry {
      width: dst_w,
      height: dst_h,
    });
  }

  let expected = dst_w as usize * dst_h as usize * RGB_CHANNELS;
  if dst.len() != expected {
    return Err(ConvertError::DestinationSize {
      expected,
      actual: dst.len(),
    });
  }

  let needed = required_len(src);
  if src.data.len() < needed {
    return Err(ConvertError::SourceTooShort {
      expected: needed,
      actual: src.data.len(),
    });
  }

  let crop = center_crop(src.width, src.height, dst_w, dst_h);
  let xs = sample_positions(crop.x, crop.width, dst_w);
  let ys = sample_positions(crop.y, crop.height, dst_h);

  for (row, &sy) in dst.chunks_exact_mut(dst_w as usize * RGB_CHANNELS).zip(&ys) {
    for (pixel, &sx) in row.chunks_exact_mut(RGB_CHANNELS).zip(&xs) {
      let rgb = match src.format {
        PixelFormat::Nv12 => nv12_pixel(src, sx, sy),
        PixelFormat::Rgb => {
          let i = sy * src.stride + sx * RGB_CHANNELS;
          [src.data[i], src.data[i + 1], src.data[i + 2]]
        }
        PixelFormat::Bgr => {
          let i = sy * src.stride + sx * RGB_CHANNELS;
          [src.data[i + 2], src.data[i + 1], src.data[i]]
        }
      };
      pixel.copy_from_slice(&rgb);
    }
  }

  Ok(())
}

fn required_len(src: &FrameView<'_>) -> usize {
  let (w, h) = (src.width as usize, src.height as usize);
  match src.format {
    PixelFormat::Nv12 => {
      let luma = src.stride * (h - 1) + w;
      let chroma = src.chroma_offset + src.stride * (h.div_ceil(2) - 1) + w.div_ceil(2) * 2;
      luma.max(chroma)
    }
    PixelFormat::Rgb | PixelFormat::Bgr => src.stride * (h - 1) + w * RGB_CHANNELS,
  }
}

/// 最近邻采样，取每个目标像素中心对应的源坐标
fn sample_positions(offset: u32, span: u32, count: u32) -> Vec<usize> {
  let (span, count) = (span as u64, count as u64);
  (0..count)
    .map(|i| offset as usize + ((2 * i + 1) * span / (2 * count)) as usize)
    .collect()
}

/// BT.601 有限范围 YUV 转 RGB
fn nv12_pixel(src: &FrameView<'_>, x: usize, y: usize) -> [u8; 3] {
  let luma = src.data[y * src.stride + x] as i32;
  let uv = src.chroma_offset + (y / 2) * src.stride + (x / 2) * 2;
  let u = src.data[uv] as i32 - 128;
  let v = src.data[uv + 1] as i32 - 128;
  let c = 298 * (luma - 16);

  let clamp = |value: i32| ((value + 128) >> 8).clamp(0, 255) as u8;
  [
    clamp(c + 409 * v),
    clamp(c - 100 * u - 208 * v),
    clamp(c + 516 * u),
  ]
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rgb_same_size_is_a_copy() {
    let data: Vec<u8> = (0..2 * 2 * 3).collect();
    let src = FrameView::packed(PixelFormat::Rgb, 2, 2, &data);
    let mut dst = vec![0u8; 12];
    convert_crop_scale(&src, &mut dst, 2, 2).unwrap();
    assert_eq!(dst, data);
  }

  #[test]
  fn bgr_channels_are_swapped() {
    let data = [1u8, 2, 3];
    let src = FrameView::packed(PixelFormat::Bgr, 1, 1, &data);
    let mut dst = [0u8; 3];
    convert_crop_scale(&src, &mut dst, 1, 1).unwrap();
    assert_eq!(dst, [3, 2, 1]);
  }

  #[test]
  fn wide_source_is_center_cropped() {
    assert_eq!(
      center_crop(1920, 1080, 224, 224),
      CropRect {
        x: 420,
        y: 0,
        width: 1080,
        height: 1080
      }
    );

    // 4x2 缩放到 1x1 时只保留中间两列
    let data: Vec<u8> = [10u8, 20, 30, 40, 50, 60, 70, 80]
      .iter()
      .flat_map(|&v| [v, v, v])
      .collect();
    let src = FrameView::packed(PixelFormat::Rgb, 4, 2, &data);
    let mut dst = [0u8; 3];
    convert_crop_scale(&src, &mut dst, 1, 1).unwrap();
    assert_eq!(dst, [70, 70, 70]);
  }

  #[test]
  fn nv12_gray_maps_to_gray() {
    let (w, h) = (4u32, 2u32);
    let mut data = vec![126u8; (w * h) as usize];
    data.extend(vec![128u8; (w * h / 2) as usize]);
    let src = FrameView::packed(PixelFormat::Nv12, w, h, &data);
    let mut dst = vec![0u8; 2 * 2 * 3];
    convert_crop_scale(&src, &mut dst, 2, 2).unwrap();
    assert!(dst.iter().all(|&v| v == 128));
  }

  #[test]
  fn nv12_black_and_white_clamp() {
    let data = [0u8, 255, 0, 255, 128, 128];
    let src = FrameView::packed(PixelFormat::Nv12, 2, 2, &data);
    let mut dst = [0u8; 12];
    convert_crop_scale(&src, &mut dst, 2, 2).unwrap();
    assert_eq!(&dst[..3], &[0, 0, 0]);
    assert_eq!(&dst[3..6], &[255, 255, 255]);
  }

  #[test]
  fn destination_size_is_checked() {
    let data = [0u8; 3];
    let src = FrameView::packed(PixelFormat::Rgb, 1, 1, &data);
    let mut dst = [0u8; 5];
    assert_eq!(
      convert_crop_scale(&src, &mut dst, 1, 1),
      Err(ConvertError::DestinationSize {
        expected: 3,
        actual: 5
      })
    );
  }

  #[test]
  fn short_source_is_rejected() {
    let data = [0u8; 10];
    let src = FrameView::packed(PixelFormat::Nv12, 4, 4, &data);
    let mut dst = [0u8; 3];
    assert!(matches!(
      convert_crop_scale(&src, &mut dst, 1, 1),
      Err(ConvertError::SourceTooShort { .. })
    ));
  }
}
