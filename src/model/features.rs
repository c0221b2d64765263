// 该文件是 Lugwatch （轮毂螺母监测） 项目的一部分。
// src/model/features.rs - 图像特征提取
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

use image::{RgbImage, imageops, imageops::FilterType};

use super::ModelParameters;

/// 缩放方式，对应模型参数中的 `image_resize_mode`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeMode {
  /// 短边对齐后居中裁剪
  #[default]
  FitShortest,
  /// 直接拉伸
  Squash,
  /// 长边对齐后居中补黑边
  FitLongest,
}

impl ResizeMode {
  pub fn from_name(name: Option<&str>) -> Self {
    match name {
      Some("squash") => ResizeMode::Squash,
      Some("fit-longest") => ResizeMode::FitLongest,
      _ => ResizeMode::FitShortest,
    }
  }
}

/// 模型输入特征的形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureSpec {
  pub width: u32,
  pub height: u32,
  pub channels: u32,
  pub resize: ResizeMode,
}

impl From<&ModelParameters> for FeatureSpec {
  fn from(params: &ModelParameters) -> Self {
    Self {
      width: params.image_input_width,
      height: params.image_input_height,
      channels: params.image_channel_count,
      resize: ResizeMode::from_name(params.image_resize_mode.as_deref()),
    }
  }
}

impl FeatureSpec {
  /// 每个像素打包为一个浮点数：RGB 为 `(r<<16)|(g<<8)|b`，灰度为亮度的三次复制
  pub fn extract(&self, image: &RgbImage) -> Vec<f32> {
    let fitted = self.fit(image);
    let grayscale = self.channels == 1;

    fitted
      .pixels()
      .map(|pixel| {
        let [r, g, b] = pixel.0;
        let packed = if grayscale {
          let luma = (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round() as u32;
          let luma = luma.min(255);
          (luma << 16) | (luma << 8) | luma
        } else {
          ((r as u32) << 16) | ((g as u32) << 8) | b as u32
        };
        packed as f32
      })
      .collect()
  }

  fn fit(&self, image: &RgbImage) -> RgbImage {
    let (src_w, src_h) = image.dimensions();
    if self.width == 0 || self.height == 0 || (src_w, src_h) == (self.width, self.height) {
      return image.clone();
    }

    match self.resize {
      ResizeMode::Squash => imageops::resize(image, self.width, self.height, FilterType::Triangle),
      ResizeMode::FitShortest => {
        let scale = f64::max(
          self.width as f64 / src_w as f64,
          self.height as f64 / src_h as f64,
        );
        let (scaled_w, scaled_h) = scaled(src_w, src_h, scale, self.width, self.height, u32::max);
        let resized = imageops::resize(image, scaled_w, scaled_h, FilterType::Triangle);
        let x = (scaled_w - self.width) / 2;
        let y = (scaled_h - self.height) / 2;
        imageops::crop_imm(&resized, x, y, self.width, self.height).to_image()
      }
      ResizeMode::FitLongest => {
        let scale = f64::min(
          self.width as f64 / src_w as f64,
          self.height as f64 / src_h as f64,
        );
        let (scaled_w, scaled_h) = scaled(src_w, src_h, scale, self.width, self.height, u32::min);
        let resized = imageops::resize(image, scaled_w, scaled_h, FilterType::Triangle);
        let mut canvas = RgbImage::new(self.width, self.height);
        let x = (self.width - scaled_w) / 2;
        let y = (self.height - scaled_h) / 2;
        imageops::overlay(&mut canvas, &resized, x as i64, y as i64);
        canvas
      }
    }
  }
}

/// 缩放后的尺寸，用 `bound` 与目标尺寸比较以消除取整误差
fn scaled(
  src_w: u32,
  src_h: u32,
  scale: f64,
  target_w: u32,
  target_h: u32,
  bound: fn(u32, u32) -> u32,
) -> (u32, u32) {
  let w = ((src_w as f64 * scale).round() as u32).max(1);
  let h = ((src_h as f64 * scale).round() as u32).max(1);
  (bound(w, target_w), bound(h, target_h))
}
