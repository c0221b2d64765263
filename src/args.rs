// 该文件是 Lugwatch （轮毂螺母监测） 项目的一部分。
// src/args.rs - 项目参数配置
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

use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::interpret::{DEFAULT_CONTAINER_LABEL, DEFAULT_TARGET_LABEL, StaleCountPolicy};

/// 保存 IoT Hub 设备连接字符串的环境变量
pub const CONNECTION_STRING_ENV: &str = "IOTHUB_DEVICE_CONNECTION_STRING";

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("No Azure IoT connection string found! Set IOTHUB_DEVICE_CONNECTION_STRING")]
  MissingCredentials,
  #[error("连接字符串为空")]
  EmptyCredentials,
}

/// 轮毂螺母监测参数
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// Edge Impulse 模型文件（.eim）路径
  #[arg(value_name = "MODEL_FILE")]
  pub model: PathBuf,

  /// 摄像头端口，只有一个以上摄像头时需要指定
  #[arg(value_name = "CAMERA_PORT")]
  pub camera_port: Option<u32>,

  /// 期望的螺母数量
  #[arg(short = 'c', long = "count", value_name = "LUG_NUT_COUNT")]
  pub count: u32,

  /// 要计数的标签
  #[arg(long, default_value = DEFAULT_TARGET_LABEL, value_name = "LABEL")]
  pub target_label: String,

  /// 必须出现在画面中的容纳物体标签
  #[arg(long, default_value = DEFAULT_CONTAINER_LABEL, value_name = "LABEL")]
  pub container_label: String,

  /// 没有检测框的帧如何处理上一次的计数
  #[arg(long, value_enum, default_value_t = StaleCountPolicy::Reset)]
  pub stale_counts: StaleCountPolicy,

  /// 发送告警后的冷却时间（毫秒）
  #[arg(long, default_value_t = 2000, value_name = "MILLIS")]
  pub cooldown_ms: u64,

  /// 帧间最小间隔（毫秒），默认约 10 帧/秒
  #[arg(long, default_value_t = 100, value_name = "MILLIS")]
  pub frame_interval_ms: u64,

  /// 自动探测的端口数量（从 0 开始）
  #[arg(long, default_value_t = 5, value_name = "COUNT")]
  pub probe_ports: u32,

  /// 最大处理帧数，不指定则一直运行
  #[arg(long, value_name = "FRAME_NUMBER")]
  pub max_frames: Option<u64>,

  /// IoT Hub 设备连接字符串
  #[arg(long, env = CONNECTION_STRING_ENV, hide_env_values = true, value_name = "CONNECTION_STRING")]
  pub connection_string: Option<String>,
}

impl Args {
  /// 校验云端凭据存在
  pub fn credentials(&self) -> Result<&str, ConfigError> {
    match self.connection_string.as_deref() {
      None => Err(ConfigError::MissingCredentials),
      Some(value) if value.trim().is_empty() => Err(ConfigError::EmptyCredentials),
      Some(value) => Ok(value),
    }
  }

  pub fn cooldown(&self) -> Duration {
    Duration::from_millis(self.cooldown_ms)
  }

  pub fn frame_interval(&self) -> Duration {
    Duration::from_millis(self.frame_interval_ms)
  }

  pub fn probe_range(&self) -> Range<u32> {
    0..self.probe_ports
  }
}
