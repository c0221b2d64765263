// 该文件是 Lugwatch （轮毂螺母监测） 项目的一部分。
// src/camera.rs - 摄像头来源
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

use thiserror::Error;
use tracing::{info, warn};

use crate::frame::{Frame, FrameError};

mod v4l_camera;
pub use self::v4l_camera::{V4lCamera, V4lCameraSource};

/// 默认探测的端口范围
pub const DEFAULT_PROBE_PORTS: Range<u32> = 0..5;

#[derive(Error, Debug)]
pub enum CameraError {
  #[error("Cannot find any webcams")]
  NoCamera,
  #[error(
    "Multiple cameras found (ports {ports:?}). Add the camera port ID as a second argument to select one"
  )]
  AmbiguousCamera { ports: Vec<u32> },
  #[error("Couldn't initialize camera in port {port}: {reason}")]
  CameraUnavailable { port: u32, reason: String },
  #[error("无法捕获帧: {0}")]
  Capture(String),
  #[error("帧转换错误: {0}")]
  Frame(#[from] FrameError),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
}

/// 摄像头描述信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
  pub port: u32,
  /// 后端/驱动名称
  pub backend: String,
  pub width: u32,
  pub height: u32,
}

/// 已打开的摄像头句柄，拉取一帧图像
pub trait FrameGrabber {
  fn grab(&mut self) -> Result<Frame, CameraError>;
  fn info(&self) -> &CameraInfo;
}

/// 摄像头来源
pub trait CameraSource {
  type Handle: FrameGrabber;

  /// 打开指定端口的摄像头
  fn open(&self, port: u32) -> Result<Self::Handle, CameraError>;

  /// 打开端口、读取一帧后立即释放；端口不可读时返回 `None`
  fn probe(&self, port: u32) -> Option<CameraInfo> {
    let mut camera = match self.open(port) {
      Ok(camera) => camera,
      Err(e) => {
        tracing::debug!("端口 {} 无法打开: {}", port, e);
        return None;
      }
    };
    match camera.grab() {
      Ok(_) => Some(camera.info().clone()),
      Err(e) => {
        tracing::debug!("端口 {} 无法读取帧: {}", port, e);
        None
      }
    }
  }
}

/// 依次探测端口，按端口升序返回可用的摄像头
pub fn enumerate<S: CameraSource>(source: &S, ports: Range<u32>) -> Vec<CameraInfo> {
  let mut found = Vec::new();
  for port in ports {
    info!("Looking for a camera in port {}:", port);
    if let Some(camera) = source.probe(port) {
      info!(
        "Camera {} ({} x {}) found in port {}",
        camera.backend, camera.height, camera.width, port
      );
      found.push(camera);
    }
  }
  found
}

/// 选择摄像头端口
///
/// 显式指定端口时直接使用；否则探测 `ports`，只有一个摄像头时自动选择。
pub fn select_port<S: CameraSource>(
  source: &S,
  explicit: Option<u32>,
  ports: Range<u32>,
) -> Result<u32, CameraError> {
  if let Some(port) = explicit {
    return Ok(port);
  }

  let found: Vec<u32> = enumerate(source, ports)
    .into_iter()
    .map(|camera| camera.port)
    .collect();
  match found.as_slice() {
    [] => Err(CameraError::NoCamera),
    [port] => Ok(*port),
    _ => Err(CameraError::AmbiguousCamera { ports: found }),
  }
}

/// 打开选中的摄像头并读取一帧以确认可用
pub fn open_selected<S: CameraSource>(source: &S, port: u32) -> Result<S::Handle, CameraError> {
  let mut camera = source.open(port)?;
  if let Err(e) = camera.grab() {
    warn!("摄像头 {} 无法读取帧: {}", port, e);
    return Err(CameraError::CameraUnavailable {
      port,
      reason: e.to_string(),
    });
  }

  let camera_info = camera.info();
  info!(
    "Camera {} ({} x {}) in port {} selected.",
    camera_info.backend, camera_info.height, camera_info.width, port
  );
  Ok(camera)
}
