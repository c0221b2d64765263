// 该文件是 Lugwatch （轮毂螺母监测） 项目的一部分。
// src/camera/v4l_camera.rs - V4L2 摄像头
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

use std::time::Instant;

use tracing::debug;
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

use super::{CameraError, CameraInfo, CameraSource, FrameGrabber};
use crate::frame::{Frame, mjpeg_to_rgb, yuyv_to_rgb};

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

/// 端口号对应 `/dev/video{port}`
#[derive(Debug, Clone)]
pub struct V4lCameraSource {
  width: u32,
  height: u32,
}

impl Default for V4lCameraSource {
  fn default() -> Self {
    Self {
      width: DEFAULT_WIDTH,
      height: DEFAULT_HEIGHT,
    }
  }
}

impl V4lCameraSource {
  pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
    self.width = width;
    self.height = height;
    self
  }
}

impl CameraSource for V4lCameraSource {
  type Handle = V4lCamera;

  fn open(&self, port: u32) -> Result<V4lCamera, CameraError> {
    V4lCamera::open(port, self.width, self.height)
  }
}

/// V4L2 摄像头句柄，drop 时释放设备
pub struct V4lCamera {
  /// 捕获流，必须先于设备释放
  stream: Option<Stream<'static>>,
  _device: Device,
  fourcc: FourCC,
  info: CameraInfo,
  frame_index: u64,
  start_time: Instant,
}

impl V4lCamera {
  pub fn open(port: u32, width: u32, height: u32) -> Result<Self, CameraError> {
    let unavailable = |e: std::io::Error| CameraError::CameraUnavailable {
      port,
      reason: e.to_string(),
    };

    let device = Device::new(port as usize).map_err(unavailable)?;
    let caps = device.query_caps().map_err(unavailable)?;

    let mut format = device.format().map_err(unavailable)?;
    format.width = width;
    format.height = height;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device.set_format(&format).map_err(unavailable)?;

    let yuyv = FourCC::new(b"YUYV");
    let mjpg = FourCC::new(b"MJPG");
    if format.fourcc != yuyv && format.fourcc != mjpg {
      return Err(CameraError::CameraUnavailable {
        port,
        reason: format!("不支持的像素格式: {}", format.fourcc),
      });
    }
    debug!(
      "端口 {} 格式: {}x{} {}",
      port, format.width, format.height, format.fourcc
    );

    let stream =
      Stream::with_buffers(&device, Type::VideoCapture, STREAM_BUFFERS).map_err(unavailable)?;

    Ok(Self {
      stream: Some(stream),
      _device: device,
      fourcc: format.fourcc,
      info: CameraInfo {
        port,
        backend: format!("V4L2/{}", caps.card),
        width: format.width,
        height: format.height,
      },
      frame_index: 0,
      start_time: Instant::now(),
    })
  }
}

impl Drop for V4lCamera {
  fn drop(&mut self) {
    self.stream.take();
    debug!("摄像头 {} 已释放", self.info.port);
  }
}

impl FrameGrabber for V4lCamera {
  fn grab(&mut self) -> Result<Frame, CameraError> {
    let stream = self
      .stream
      .as_mut()
      .ok_or_else(|| CameraError::Capture("捕获流已关闭".to_string()))?;

    let (buffer, meta) = stream
      .next()
      .map_err(|e| CameraError::Capture(e.to_string()))?;

    let image = if self.fourcc == FourCC::new(b"MJPG") {
      let used = (meta.bytesused as usize).min(buffer.len());
      mjpeg_to_rgb(&buffer[..used])?
    } else {
      yuyv_to_rgb(buffer, self.info.width, self.info.height)?
    };

    let frame = Frame::new(
      image,
      self.frame_index,
      self.start_time.elapsed().as_millis() as u64,
    );
    self.frame_index += 1;
    Ok(frame)
  }

  fn info(&self) -> &CameraInfo {
    &self.info
  }
}
