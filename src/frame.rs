// 该文件是 Lugwatch （轮毂螺母监测） 项目的一部分。
// src/frame.rs - 帧定义
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

use image::RgbImage;
use thiserror::Error;

const RGB_CHANNELS: usize = 3;
const YUYV_BYTES_PER_PIXEL: usize = 2;

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  SizeMismatch { expected: usize, actual: usize },
  #[error("JPEG 解码错误: {0}")]
  Decode(#[from] image::ImageError),
}

/// 摄像头产生的一帧图像，只在一次循环内存活
#[derive(Debug, Clone)]
pub struct Frame {
  /// RGB 图像数据
  pub image: RgbImage,
  /// 帧索引
  pub index: u64,
  /// 时间戳（毫秒，自摄像头打开起）
  pub timestamp_ms: u64,
}

impl Frame {
  pub fn new(image: RgbImage, index: u64, timestamp_ms: u64) -> Self {
    Self {
      image,
      index,
      timestamp_ms,
    }
  }
}

/// 将 YUYV (4:2:2) 缓冲区转换为 RGB 图像
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
  let pixels = width as usize * height as usize;
  let expected = pixels * YUYV_BYTES_PER_PIXEL;
  if yuyv.len() < expected {
    return Err(FrameError::SizeMismatch {
      expected,
      actual: yuyv.len(),
    });
  }

  let mut rgb = Vec::with_capacity(pixels * RGB_CHANNELS);
  for chunk in yuyv[..expected].chunks_exact(4) {
    let y0 = chunk[0] as f32;
    let u = chunk[1] as f32 - 128.0;
    let y1 = chunk[2] as f32;
    let v = chunk[3] as f32 - 128.0;

    for y in [y0, y1] {
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
    }
  }

  let actual = rgb.len();
  RgbImage::from_raw(width, height, rgb).ok_or(FrameError::SizeMismatch {
    expected: pixels * RGB_CHANNELS,
    actual,
  })
}

/// 解码 MJPEG 帧
pub fn mjpeg_to_rgb(data: &[u8]) -> Result<RgbImage, FrameError> {
  let image = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)?;
  Ok(image.to_rgb8())
}
