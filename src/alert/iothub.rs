// 该文件是 Lugwatch （轮毂螺母监测） 项目的一部分。
// src/alert/iothub.rs - Azure IoT Hub MQTT 发布
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

//! # IoT Hub 设备客户端
//!
//! 通过 MQTT 3.1.1 (TLS, 8883) 连接 IoT Hub。网络事件由后台线程驱动，
//! 调用方在 `connect`/`send` 中依次等待 CONNACK 与 PUBACK，同一时间只有一条消息在途。

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use rumqttc::{
  Client, ConnectReturnCode, Connection, ConnectionError, Event, MqttOptions, Packet, QoS, Transport,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{AlertMessage, AlertPublisher, ConnectionString, ConnectionStringError};
use crate::FromConnectionString;

pub const IOTHUB_API_VERSION: &str = "2021-04-12";
const IOTHUB_MQTT_PORT: u16 = 8883;
const REQUEST_CHANNEL_CAPACITY: usize = 10;

#[derive(Error, Debug)]
pub enum PublishError {
  #[error("连接字符串错误: {0}")]
  ConnectionString(#[from] ConnectionStringError),
  #[error("IoT Hub 拒绝连接: {0:?}")]
  Refused(ConnectReturnCode),
  #[error("IoT Hub 连接错误: {0}")]
  Connection(String),
  #[error("MQTT 客户端错误: {0}")]
  Client(#[from] rumqttc::ClientError),
  #[error("等待 {0} 超时")]
  Timeout(&'static str),
  #[error("尚未连接 IoT Hub")]
  NotConnected,
}

#[derive(Debug, Clone)]
struct IotHubOptions {
  port: u16,
  keep_alive: Duration,
  /// 等待 CONNACK/PUBACK 的上限
  ack_timeout: Duration,
  /// SAS 令牌有效期
  token_ttl: Duration,
  /// 令牌到期前多久重新连接
  renew_before: Duration,
}

impl Default for IotHubOptions {
  fn default() -> Self {
    Self {
      port: IOTHUB_MQTT_PORT,
      keep_alive: Duration::from_secs(60),
      ack_timeout: Duration::from_secs(10),
      token_ttl: Duration::from_secs(3600),
      renew_before: Duration::from_secs(300),
    }
  }
}

impl IotHubOptions {
  /// 不超过有效期的一半，避免每次发送都重连
  fn renew_margin(&self) -> Duration {
    self.renew_before.min(self.token_ttl / 2)
  }
}

/// 令牌在 `expires_at`（Unix 秒）失效，`now` 时是否需要换新
fn renewal_due(expires_at: i64, now: i64, margin: Duration) -> bool {
  now + margin.as_secs() as i64 >= expires_at
}

/// 后台网络线程转发的事件
#[derive(Debug, PartialEq)]
enum PumpEvent {
  ConnAck(ConnectReturnCode),
  PubAck(u16),
  Failed(String),
}

/// 网络事件中调用方关心的部分，其余忽略
fn pump_event(event: Result<Event, ConnectionError>) -> Option<PumpEvent> {
  match event {
    Ok(Event::Incoming(Packet::ConnAck(ack))) => Some(PumpEvent::ConnAck(ack.code)),
    Ok(Event::Incoming(Packet::PubAck(ack))) => Some(PumpEvent::PubAck(ack.pkid)),
    Ok(event) => {
      debug!("MQTT 事件: {:?}", event);
      None
    }
    // 非成功的 CONNACK 以错误形式报告
    Err(ConnectionError::ConnectionRefused(code)) => Some(PumpEvent::ConnAck(code)),
    Err(e) => Some(PumpEvent::Failed(e.to_string())),
  }
}

struct Session {
  client: Client,
  events: Receiver<PumpEvent>,
  pump: Option<JoinHandle<()>>,
  healthy: bool,
  /// 本会话所用 SAS 令牌的失效时间（Unix 秒）
  expires_at: i64,
}

impl Session {
  fn start(client: Client, mut connection: Connection, expires_at: i64) -> Self {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
      for event in connection.iter() {
        let fatal = event.is_err();
        if let Some(forwarded) = pump_event(event)
          && tx.send(forwarded).is_err()
        {
          break;
        }
        if fatal {
          break;
        }
      }
      debug!("MQTT 网络线程退出");
    });

    Self {
      client,
      events: rx,
      pump: Some(handle),
      healthy: true,
      expires_at,
    }
  }

  /// 等待 `select` 选中的事件，期间收到连接错误则会话失效
  fn wait_for<T>(
    &mut self,
    what: &'static str,
    timeout: Duration,
    mut select: impl FnMut(&PumpEvent) -> Option<Result<T, PublishError>>,
  ) -> Result<T, PublishError> {
    let deadline = Instant::now() + timeout;
    loop {
      let remaining = deadline.saturating_duration_since(Instant::now());
      match self.events.recv_timeout(remaining) {
        Ok(PumpEvent::Failed(reason)) => {
          self.healthy = false;
          return Err(PublishError::Connection(reason));
        }
        Ok(event) => {
          if let Some(result) = select(&event) {
            return result;
          }
        }
        Err(RecvTimeoutError::Timeout) => return Err(PublishError::Timeout(what)),
        Err(RecvTimeoutError::Disconnected) => {
          self.healthy = false;
          return Err(PublishError::Connection("MQTT 网络线程已退出".to_string()));
        }
      }
    }
  }

  fn close(mut self) -> Result<(), PublishError> {
    let result = self.client.disconnect().map_err(PublishError::from);
    if let Some(handle) = self.pump.take()
      && handle.join().is_err()
    {
      warn!("MQTT 网络线程异常退出");
    }
    result
  }
}

/// Azure IoT Hub 设备客户端
pub struct IotHubClient {
  config: ConnectionString,
  options: IotHubOptions,
  session: Option<Session>,
}

impl FromConnectionString for IotHubClient {
  type Error = PublishError;

  fn from_connection_string(value: &str) -> Result<Self, Self::Error> {
    let config = ConnectionString::from_connection_string(value)?;
    Ok(Self::new(config))
  }
}

impl IotHubClient {
  pub fn new(config: ConnectionString) -> Self {
    Self {
      config,
      options: IotHubOptions::default(),
      session: None,
    }
  }

  /// 返回连接参数与令牌失效时间
  fn mqtt_options(&self) -> Result<(MqttOptions, i64), PublishError> {
    let expiry = Utc::now().timestamp() + self.options.token_ttl.as_secs() as i64;
    let token = self.config.sas_token(expiry)?;

    let mut options = MqttOptions::new(
      self.config.client_id(),
      self.config.endpoint(),
      self.options.port,
    );
    options.set_keep_alive(self.options.keep_alive);
    options.set_clean_session(true);
    options.set_credentials(self.config.username(IOTHUB_API_VERSION), token);
    options.set_transport(Transport::tls_with_default_config());
    Ok((options, expiry))
  }

  fn open_session(&self) -> Result<Session, PublishError> {
    let (options, expires_at) = self.mqtt_options()?;
    let (client, connection) = Client::new(options, REQUEST_CHANNEL_CAPACITY);
    let mut session = Session::start(client, connection, expires_at);

    let acked = session.wait_for("CONNACK", self.options.ack_timeout, |event| match event {
      PumpEvent::ConnAck(ConnectReturnCode::Success) => Some(Ok(())),
      PumpEvent::ConnAck(code) => Some(Err(PublishError::Refused(*code))),
      _ => None,
    });
    if let Err(e) = acked {
      if let Err(close) = session.close() {
        debug!("关闭失败的会话: {}", close);
      }
      return Err(e);
    }
    Ok(session)
  }

  /// 令牌即将失效时用新令牌重新连接
  fn renew_if_due(&mut self) -> Result<(), PublishError> {
    let Some(session) = &self.session else {
      return Ok(());
    };
    if !renewal_due(
      session.expires_at,
      Utc::now().timestamp(),
      self.options.renew_margin(),
    ) {
      return Ok(());
    }

    info!("SAS 令牌即将过期，重新连接 IoT Hub");
    if let Some(old) = self.session.take()
      && let Err(e) = old.close()
    {
      debug!("关闭旧会话失败: {}", e);
    }
    self.session = Some(self.open_session()?);
    Ok(())
  }
}

/// 主题后缀为 URL 编码的属性包
pub fn telemetry_topic(config: &ConnectionString, message: &AlertMessage) -> String {
  let properties = message
    .properties()
    .into_iter()
    .map(|(key, value)| format!("{}={}", key, urlencoding::encode(&value)))
    .collect::<Vec<_>>()
    .join("&");
  format!("{}{}", config.telemetry_topic(), properties)
}

impl AlertPublisher for IotHubClient {
  type Error = PublishError;

  fn connect(&mut self) -> Result<(), Self::Error> {
    if self.is_connected() {
      return Ok(());
    }

    info!(
      "连接 IoT Hub: {} (设备 {})",
      self.config.endpoint(),
      self.config.client_id()
    );
    self.session = Some(self.open_session()?);
    info!("IoT Hub 已连接");
    Ok(())
  }

  fn send(&mut self, message: &AlertMessage) -> Result<(), Self::Error> {
    self.renew_if_due()?;
    let topic = telemetry_topic(&self.config, message);
    let ack_timeout = self.options.ack_timeout;
    let session = self.session.as_mut().ok_or(PublishError::NotConnected)?;

    debug!("发布到主题: {}", topic);
    session.client.publish(
      topic,
      QoS::AtLeastOnce,
      false,
      message.text.clone().into_bytes(),
    )?;

    let pkid = session.wait_for("PUBACK", ack_timeout, |event| match event {
      PumpEvent::PubAck(pkid) => Some(Ok(*pkid)),
      _ => None,
    })?;
    debug!("消息 {} 已确认 (pkid {})", message.message_id, pkid);
    Ok(())
  }

  fn is_connected(&self) -> bool {
    self.session.as_ref().is_some_and(|s| s.healthy)
  }

  fn disconnect(&mut self) -> Result<(), Self::Error> {
    match self.session.take() {
      Some(session) => {
        let result = session.close();
        info!("IoT Hub 连接已关闭");
        result
      }
      None => Ok(()),
    }
  }
}

impl Drop for IotHubClient {
  fn drop(&mut self) {
    if let Err(e) = self.disconnect() {
      debug!("关闭 IoT Hub 连接失败: {}", e);
    }
  }
}
