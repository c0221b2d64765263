// 该文件是 Lugwatch （轮毂螺母监测） 项目的一部分。
// src/model/eim.rs - Edge Impulse EIM 模型
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

//! # EIM 模型运行器
//!
//! 进程启动、套接字通信与退出清理都由 [`edge_impulse_runner::EimModel`] 负责，
//! 这里只把它的参数与结果转换为本项目的类型。

use std::path::PathBuf;
use std::time::Instant;

use edge_impulse_runner::{EimError, EimModel, InferenceResult};
use thiserror::Error;
use tracing::{debug, info};

use super::{
  BoundingBox, DetectionResult, InferenceResponse, Model, ModelInfo, ModelParameters, ProjectInfo,
  SENSOR_CAMERA, Timing,
};

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型文件不存在: {0}")]
  NotFound(PathBuf),
  #[error("模型文件路径错误: {0}")]
  Path(#[from] std::io::Error),
  #[error("EIM 运行器错误: {0}")]
  Runner(#[from] EimError),
  #[error("Model file \"{0}\" is not suitable for image recognition")]
  NotImageModel(PathBuf),
  #[error("模型尚未初始化")]
  NotInitialized,
}

pub struct EimRunnerBuilder {
  model_path: PathBuf,
}

impl EimRunnerBuilder {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: model_path.into(),
    }
  }

  pub fn build(self) -> Result<EimRunner, ModelError> {
    let model_path = std::path::absolute(&self.model_path)?;
    if !model_path.is_file() {
      return Err(ModelError::NotFound(model_path));
    }
    info!("MODEL: {}", model_path.display());

    Ok(EimRunner {
      model_path,
      model: None,
    })
  }
}

/// `.eim` 模型，`init` 时启动模型进程，`stop` 或 drop 时结束
pub struct EimRunner {
  model_path: PathBuf,
  model: Option<EimModel>,
}

impl EimRunner {
  fn model_info(&self, model: &EimModel) -> Result<ModelInfo, ModelError> {
    let params = model.parameters()?;
    if params.sensor as i32 != SENSOR_CAMERA {
      return Err(ModelError::NotImageModel(self.model_path.clone()));
    }

    let name = self
      .model_path
      .file_stem()
      .map(|stem| stem.to_string_lossy().into_owned())
      .unwrap_or_default();

    Ok(ModelInfo {
      project: ProjectInfo {
        owner: String::new(),
        name,
      },
      model_parameters: ModelParameters {
        labels: params.labels.clone(),
        image_input_width: params.image_input_width as u32,
        image_input_height: params.image_input_height as u32,
        image_channel_count: params.image_channel_count as u32,
        sensor: params.sensor as i32,
        model_type: params.model_type.clone(),
        image_resize_mode: Some(params.image_resize_mode.to_string()).filter(|m| !m.is_empty()),
      },
    })
  }
}

/// 把运行器的结果转换为检测结果，分类分数优先
fn detection_result(result: InferenceResult) -> DetectionResult {
  match result {
    InferenceResult::Classification { classification, .. } => DetectionResult::Classification(
      classification
        .into_iter()
        .map(|(label, score)| (label, score as f32))
        .collect(),
    ),
    InferenceResult::ObjectDetection { bounding_boxes, .. } => DetectionResult::BoundingBoxes(
      bounding_boxes
        .into_iter()
        .map(|bb| BoundingBox {
          label: bb.label,
          value: bb.value as f32,
          x: bb.x as f32,
          y: bb.y as f32,
          width: bb.width as f32,
          height: bb.height as f32,
        })
        .collect(),
    ),
    #[allow(unreachable_patterns)]
    _ => DetectionResult::Empty,
  }
}

fn inference_response(
  response: edge_impulse_runner::InferenceResponse,
  elapsed_ms: f64,
) -> InferenceResponse {
  InferenceResponse {
    id: response.id as u64,
    result: detection_result(response.result),
    timing: Timing {
      classification: elapsed_ms,
      ..Timing::default()
    },
  }
}

impl Model for EimRunner {
  type Error = ModelError;

  fn init(&mut self) -> Result<ModelInfo, Self::Error> {
    let model = match self.model.take() {
      Some(model) => model,
      None => EimModel::new(&self.model_path)?,
    };

    // 非图像模型在这里被丢弃，进程随之结束
    let info = self.model_info(&model)?;
    debug!("模型参数: {:?}", info.model_parameters);
    self.model = Some(model);
    Ok(info)
  }

  fn classify(&mut self, features: Vec<f32>) -> Result<InferenceResponse, Self::Error> {
    let model = self.model.as_mut().ok_or(ModelError::NotInitialized)?;

    let started = Instant::now();
    let response = model.infer(features, None)?;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    Ok(inference_response(response, elapsed_ms))
  }

  fn stop(&mut self) {
    if self.model.take().is_some() {
      info!("模型进程已停止: {}", self.model_path.display());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_model_file_fails_to_build() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.eim");
    match EimRunnerBuilder::new(&path).build() {
      Err(ModelError::NotFound(found)) => assert_eq!(found, path),
      Err(e) => panic!("unexpected error: {}", e),
      Ok(_) => panic!("missing model must not build"),
    }
  }

  #[test]
  fn stop_before_init_is_harmless() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let mut runner = EimRunnerBuilder::new(file.path()).build().unwrap();
    runner.stop();
    runner.stop();
    assert!(matches!(
      runner.classify(vec![0.0]),
      Err(ModelError::NotInitialized)
    ));
  }

  #[test]
  fn bounding_boxes_are_converted() {
    let json = r#"{
      "success": true, "id": 2,
      "result": {"bounding_boxes": [
        {"label": "lug", "value": 0.91, "x": 10, "y": 12, "width": 8, "height": 8},
        {"label": "tire", "value": 0.88, "x": 0, "y": 0, "width": 90, "height": 90}
      ]},
      "timing": {"dsp": 3, "classification": 40, "anomaly": 0}
    }"#;
    let response: edge_impulse_runner::InferenceResponse = serde_json::from_str(json).unwrap();
    let response = inference_response(response, 42.0);

    assert_eq!(response.id, 2);
    assert_eq!(response.timing.total_ms(), 42.0);
    match response.result {
      DetectionResult::BoundingBoxes(boxes) => {
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].label, "lug");
        assert_eq!(boxes[0].x, 10.0);
        assert_eq!(boxes[1].width, 90.0);
      }
      other => panic!("unexpected result: {:?}", other),
    }
  }

  #[test]
  fn classification_scores_are_converted() {
    let json = r#"{
      "success": true, "id": 3,
      "result": {"classification": {"ok": 0.25, "nok": 0.75}},
      "timing": {"dsp": 1, "classification": 2, "anomaly": 0}
    }"#;
    let response: edge_impulse_runner::InferenceResponse = serde_json::from_str(json).unwrap();
    match inference_response(response, 1.0).result {
      DetectionResult::Classification(scores) => {
        assert_eq!(scores["nok"], 0.75);
        assert_eq!(scores.len(), 2);
      }
      other => panic!("unexpected result: {:?}", other),
    }
  }
}
