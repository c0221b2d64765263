// 该文件是 Lugwatch （轮毂螺母监测） 项目的一部分。
// src/bin/probe_cameras.rs - 列出可用的摄像头端口
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

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use lugwatch::camera::{self, V4lCameraSource};

/// 摄像头探测参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 探测的端口数量（从 0 开始）
  #[arg(long, default_value_t = 5, value_name = "COUNT")]
  pub probe_ports: u32,
  /// 探测使用的分辨率宽度
  #[arg(long, default_value_t = 640)]
  pub width: u32,
  /// 探测使用的分辨率高度
  #[arg(long, default_value_t = 480)]
  pub height: u32,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let source = V4lCameraSource::default().with_resolution(args.width, args.height);

  let cameras = camera::enumerate(&source, 0..args.probe_ports);
  if cameras.is_empty() {
    warn!("没有找到可用的摄像头");
  }
  for info in &cameras {
    println!(
      "{}\t{}\t{}x{}",
      info.port, info.backend, info.width, info.height
    );
  }
  info!("探测完成");
  Ok(())
}
