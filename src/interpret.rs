// 该文件是 Lugwatch （轮毂螺母监测） 项目的一部分。
// src/interpret.rs - 推理结果解读
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
use std::fmt::Write;

use tracing::{debug, info};

use crate::model::{BoundingBox, DetectionResult, InferenceResponse};

pub const DEFAULT_TARGET_LABEL: &str = "lug";
pub const DEFAULT_CONTAINER_LABEL: &str = "tire";

/// 没有检测框的帧如何处理上一帧的计数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum StaleCountPolicy {
  /// 计数只属于产生它的那一帧
  #[default]
  Reset,
  /// 沿用最近一次检测框的计数并再次判定
  Carry,
}

/// 单帧计数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameCounts {
  /// 目标部件（螺母）数量
  pub target: u32,
  /// 是否看到了容纳目标的物体（轮胎）
  pub container_present: bool,
}

impl FrameCounts {
  pub fn from_boxes(boxes: &[BoundingBox], target_label: &str, container_label: &str) -> Self {
    boxes.iter().fold(FrameCounts::default(), |mut counts, bb| {
      if bb.label == target_label {
        counts.target += 1;
      } else if bb.label == container_label {
        counts.container_present = true;
      }
      counts
    })
  }
}

/// 计数低于期望且轮胎在画面内时才告警
pub fn alert_due(expected: u32, counts: &FrameCounts) -> bool {
  counts.container_present && counts.target < expected
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
  /// 本帧没有可判定的计数
  Unevaluated,
  /// 轮胎不在画面内
  ContainerAbsent { observed: u32 },
  /// 数量足够
  Complete { observed: u32 },
  /// 数量不足，需要告警
  Shortfall { expected: u32, observed: u32 },
}

impl Verdict {
  pub fn is_shortfall(&self) -> bool {
    matches!(self, Verdict::Shortfall { .. })
  }
}

pub struct Interpreter {
  expected: u32,
  target_label: String,
  container_label: String,
  policy: StaleCountPolicy,
  last: Option<FrameCounts>,
}

impl Interpreter {
  pub fn new(expected: u32) -> Self {
    Self {
      expected,
      target_label: DEFAULT_TARGET_LABEL.to_string(),
      container_label: DEFAULT_CONTAINER_LABEL.to_string(),
      policy: StaleCountPolicy::default(),
      last: None,
    }
  }

  pub fn with_labels(mut self, target: impl Into<String>, container: impl Into<String>) -> Self {
    self.target_label = target.into();
    self.container_label = container.into();
    self
  }

  pub fn with_policy(mut self, policy: StaleCountPolicy) -> Self {
    self.policy = policy;
    self
  }

  /// 解读一帧结果；`labels` 为模型的标签顺序，仅用于打印分类分数
  pub fn inspect(&mut self, response: &InferenceResponse, labels: &[String]) -> Verdict {
    let counts = match &response.result {
      DetectionResult::Classification(scores) => {
        info!("{}", format_scores(response.timing.total_ms(), scores, labels));
        self.stale_counts()
      }
      DetectionResult::BoundingBoxes(boxes) => {
        for bb in boxes {
          info!(
            "Found {} ({:0.2}) at x={}, y={}, w={}, h={}",
            bb.label, bb.value, bb.x, bb.y, bb.width, bb.height
          );
        }
        let counts = FrameCounts::from_boxes(boxes, &self.target_label, &self.container_label);
        self.last = Some(counts);
        Some(counts)
      }
      DetectionResult::Empty => {
        debug!("推理结果中既没有分类也没有检测框");
        self.stale_counts()
      }
    };

    match counts {
      None => Verdict::Unevaluated,
      Some(counts) if alert_due(self.expected, &counts) => Verdict::Shortfall {
        expected: self.expected,
        observed: counts.target,
      },
      Some(counts) if counts.container_present => Verdict::Complete {
        observed: counts.target,
      },
      Some(counts) => Verdict::ContainerAbsent {
        observed: counts.target,
      },
    }
  }

  fn stale_counts(&self) -> Option<FrameCounts> {
    match self.policy {
      StaleCountPolicy::Reset => None,
      StaleCountPolicy::Carry => self.last,
    }
  }
}

fn format_scores(total_ms: f64, scores: &BTreeMap<String, f32>, labels: &[String]) -> String {
  let mut line = format!("Result ({:.0} ms.) ", total_ms);
  if labels.is_empty() {
    for (label, score) in scores {
      let _ = write!(line, "{}: {:.2}\t", label, score);
    }
  } else {
    for label in labels {
      if let Some(score) = scores.get(label) {
        let _ = write!(line, "{}: {:.2}\t", label, score);
      }
    }
  }
  line
}
