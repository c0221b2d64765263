// 该文件是 Lugwatch （轮毂螺母监测） 项目的一部分。
// src/model.rs - 推理模型适配
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

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use crate::camera::{CameraError, FrameGrabber};
use crate::frame::Frame;

mod eim;
mod features;

pub use self::eim::{EimRunner, EimRunnerBuilder, ModelError};
pub use self::features::{FeatureSpec, ResizeMode};

/// Edge Impulse 中摄像头类模型的 sensor 编号
pub const SENSOR_CAMERA: i32 = 3;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 推理模型
///
/// 模型资源在 `init` 之后一直占用，直到 `stop`。`stop` 必须可以重复调用。
pub trait Model {
  type Error: std::error::Error + Send + Sync + 'static;

  fn init(&mut self) -> Result<ModelInfo, Self::Error>;
  fn classify(&mut self, features: Vec<f32>) -> Result<InferenceResponse, Self::Error>;
  fn stop(&mut self);

  /// 以摄像头为输入的惰性推理序列，消耗摄像头句柄，不可重启
  fn classifier<G: FrameGrabber>(&mut self, info: &ModelInfo, camera: G) -> Classifier<'_, Self, G>
  where
    Self: Sized,
  {
    Classifier {
      model: self,
      camera,
      spec: FeatureSpec::from(&info.model_parameters),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectInfo {
  /// 运行器未报告所有者时为空
  pub owner: String,
  pub name: String,
}

impl std::fmt::Display for ProjectInfo {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.owner.is_empty() {
      f.write_str(&self.name)
    } else {
      write!(f, "{} / {}", self.owner, self.name)
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelParameters {
  pub labels: Vec<String>,
  pub image_input_width: u32,
  pub image_input_height: u32,
  pub image_channel_count: u32,
  pub sensor: i32,
  pub model_type: String,
  pub image_resize_mode: Option<String>,
}

/// 模型加载后报告的信息
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
  pub project: ProjectInfo,
  pub model_parameters: ModelParameters,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timing {
  pub dsp: f64,
  pub classification: f64,
}

impl Timing {
  /// 对外报告的推理耗时（毫秒）
  pub fn total_ms(&self) -> f64 {
    self.dsp + self.classification
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
  pub label: String,
  /// 置信度
  pub value: f32,
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

/// 单帧推理结果
#[derive(Debug, Clone, Default, PartialEq)]
pub enum DetectionResult {
  Classification(BTreeMap<String, f32>),
  BoundingBoxes(Vec<BoundingBox>),
  /// 既没有分类也没有检测框
  #[default]
  Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResponse {
  pub id: u64,
  pub result: DetectionResult,
  pub timing: Timing,
}

/// 推理序列中的一项
#[derive(Debug, Clone)]
pub struct Classified {
  pub response: InferenceResponse,
  pub frame: Frame,
}

#[derive(Error, Debug)]
pub enum ClassifyError {
  #[error("摄像头错误: {0}")]
  Camera(#[from] CameraError),
  #[error("推理错误: {0}")]
  Model(#[source] BoxError),
}

pub struct Classifier<'m, M, G> {
  model: &'m mut M,
  camera: G,
  spec: FeatureSpec,
}

impl<M: Model, G: FrameGrabber> Classifier<'_, M, G> {
  fn classify_next(&mut self) -> Result<Classified, ClassifyError> {
    let frame = self.camera.grab()?;
    let features = self.spec.extract(&frame.image);
    debug!("第 {} 帧特征数量: {}", frame.index, features.len());
    let response = self
      .model
      .classify(features)
      .map_err(|e| ClassifyError::Model(Box::new(e)))?;
    Ok(Classified { response, frame })
  }
}

impl<M: Model, G: FrameGrabber> Iterator for Classifier<'_, M, G> {
  type Item = Result<Classified, ClassifyError>;

  fn next(&mut self) -> Option<Self::Item> {
    Some(self.classify_next())
  }
}
