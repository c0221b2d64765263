// 该文件是 Lugwatch （轮毂螺母监测） 项目的一部分。
// src/alert.rs - 告警消息与发布
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

use tracing::info;
use uuid::Uuid;

mod connection_string;
mod iothub;

pub use self::connection_string::{ConnectionString, ConnectionStringError};
pub use self::iothub::{IotHubClient, PublishError};

pub const CONTENT_TYPE: &str = "application/json";
pub const CONTENT_ENCODING: &str = "utf-8";
/// 记录实际计数的自定义属性名
pub const COUNTED_PROPERTY: &str = "counted";

/// 一条告警消息，发送一次后丢弃
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMessage {
  pub message_id: Uuid,
  pub text: String,
  pub counted: u32,
  pub content_type: &'static str,
  pub content_encoding: &'static str,
}

impl AlertMessage {
  /// 数量不足的告警
  pub fn shortfall(expected: u32, observed: u32) -> Self {
    Self {
      message_id: Uuid::new_v4(),
      text: format!(
        "Found {} missing lug nuts!",
        expected.saturating_sub(observed)
      ),
      counted: observed,
      content_type: CONTENT_TYPE,
      content_encoding: CONTENT_ENCODING,
    }
  }

  /// 系统属性与自定义属性组成的属性包
  pub fn properties(&self) -> Vec<(&'static str, String)> {
    vec![
      ("$.mid", self.message_id.to_string()),
      ("$.ct", self.content_type.to_string()),
      ("$.ce", self.content_encoding.to_string()),
      (COUNTED_PROPERTY, self.counted.to_string()),
    ]
  }
}

impl std::fmt::Display for AlertMessage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.text)
  }
}

/// 云端告警发布者
///
/// 会话在 `connect` 与 `disconnect` 之间有效，同一时间最多一条消息在途。
pub trait AlertPublisher {
  type Error: std::error::Error + Send + Sync + 'static;

  fn connect(&mut self) -> Result<(), Self::Error>;
  fn send(&mut self, message: &AlertMessage) -> Result<(), Self::Error>;
  fn is_connected(&self) -> bool;
  fn disconnect(&mut self) -> Result<(), Self::Error>;

  fn send_alert(&mut self, expected: u32, observed: u32) -> Result<AlertMessage, Self::Error> {
    let message = AlertMessage::shortfall(expected, observed);
    info!(
      "Sending message {} ({}) to Azure IoT Hub",
      message, message.message_id
    );
    self.send(&message)?;
    info!("Message successfully sent!");
    Ok(message)
  }
}
