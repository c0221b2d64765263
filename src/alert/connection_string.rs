// 该文件是 Lugwatch （轮毂螺母监测） 项目的一部分。
// src/alert/connection_string.rs - IoT Hub 设备连接字符串与 SAS 令牌
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

use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::FromConnectionString;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum ConnectionStringError {
  #[error("连接字符串缺少字段: {0}")]
  MissingField(&'static str),
  #[error("连接字符串格式错误: {0}")]
  Malformed(String),
  #[error("共享访问密钥不是有效的 base64: {0}")]
  InvalidKey(#[from] base64::DecodeError),
  #[error("无法用共享访问密钥签名")]
  Signing,
}

/// `HostName=...;DeviceId=...;SharedAccessKey=...` 形式的设备连接字符串
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
  pub host_name: String,
  pub device_id: String,
  pub module_id: Option<String>,
  pub gateway_host_name: Option<String>,
  pub shared_access_key_name: Option<String>,
  shared_access_key: Option<String>,
  shared_access_signature: Option<String>,
}

impl std::fmt::Debug for ConnectionString {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnectionString")
      .field("host_name", &self.host_name)
      .field("device_id", &self.device_id)
      .field("module_id", &self.module_id)
      .field("gateway_host_name", &self.gateway_host_name)
      .field("shared_access_key_name", &self.shared_access_key_name)
      .finish_non_exhaustive()
  }
}

impl FromConnectionString for ConnectionString {
  type Error = ConnectionStringError;

  fn from_connection_string(value: &str) -> Result<Self, Self::Error> {
    let mut host_name = None;
    let mut device_id = None;
    let mut module_id = None;
    let mut gateway_host_name = None;
    let mut shared_access_key_name = None;
    let mut shared_access_key = None;
    let mut shared_access_signature = None;

    for part in value.trim().split(';').filter(|p| !p.trim().is_empty()) {
      // 值本身（base64 密钥、SAS 令牌）可能包含 '='
      let (key, val) = part
        .split_once('=')
        .ok_or_else(|| ConnectionStringError::Malformed(part.to_string()))?;
      let val = val.trim().to_string();
      match key.trim() {
        "HostName" => host_name = Some(val),
        "DeviceId" => device_id = Some(val),
        "ModuleId" => module_id = Some(val),
        "GatewayHostName" => gateway_host_name = Some(val),
        "SharedAccessKeyName" => shared_access_key_name = Some(val),
        "SharedAccessKey" => shared_access_key = Some(val),
        "SharedAccessSignature" => shared_access_signature = Some(val),
        other => tracing::debug!("忽略连接字符串字段: {}", other),
      }
    }

    let host_name = host_name.ok_or(ConnectionStringError::MissingField("HostName"))?;
    let device_id = device_id.ok_or(ConnectionStringError::MissingField("DeviceId"))?;
    if shared_access_key.is_none() && shared_access_signature.is_none() {
      return Err(ConnectionStringError::MissingField("SharedAccessKey"));
    }

    Ok(Self {
      host_name,
      device_id,
      module_id,
      gateway_host_name,
      shared_access_key_name,
      shared_access_key,
      shared_access_signature,
    })
  }
}

impl ConnectionString {
  /// MQTT 连接的目标主机
  pub fn endpoint(&self) -> &str {
    self.gateway_host_name.as_deref().unwrap_or(&self.host_name)
  }

  /// MQTT 客户端 ID
  pub fn client_id(&self) -> String {
    match &self.module_id {
      Some(module) => format!("{}/{}", self.device_id, module),
      None => self.device_id.clone(),
    }
  }

  pub fn username(&self, api_version: &str) -> String {
    format!(
      "{}/{}/?api-version={}",
      self.host_name,
      self.client_id(),
      api_version
    )
  }

  /// 设备到云消息的主题前缀
  pub fn telemetry_topic(&self) -> String {
    match &self.module_id {
      Some(module) => format!(
        "devices/{}/modules/{}/messages/events/",
        self.device_id, module
      ),
      None => format!("devices/{}/messages/events/", self.device_id),
    }
  }

  fn resource_uri(&self) -> String {
    match &self.module_id {
      Some(module) => format!(
        "{}/devices/{}/modules/{}",
        self.host_name, self.device_id, module
      ),
      None => format!("{}/devices/{}", self.host_name, self.device_id),
    }
  }

  /// 生成在 `expiry`（Unix 秒）失效的 SAS 令牌；连接字符串自带令牌时原样返回
  pub fn sas_token(&self, expiry: i64) -> Result<String, ConnectionStringError> {
    if let Some(signature) = &self.shared_access_signature {
      return Ok(signature.clone());
    }
    let key = self
      .shared_access_key
      .as_deref()
      .ok_or(ConnectionStringError::MissingField("SharedAccessKey"))?;

    let resource = urlencoding::encode(&self.resource_uri()).into_owned();
    let key = STANDARD.decode(key)?;
    let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| ConnectionStringError::Signing)?;
    mac.update(format!("{}\n{}", resource, expiry).as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let mut token = format!(
      "SharedAccessSignature sr={}&sig={}&se={}",
      resource,
      urlencoding::encode(&signature),
      expiry
    );
    if let Some(name) = &self.shared_access_key_name {
      token.push_str("&skn=");
      token.push_str(&urlencoding::encode(name));
    }
    Ok(token)
  }
}
