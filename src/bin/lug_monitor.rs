// 该文件是 Lugwatch （轮毂螺母监测） 项目的一部分。
// src/bin/lug_monitor.rs - 轮毂螺母监测主程序
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

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use lugwatch::{
  FromConnectionString,
  alert::IotHubClient,
  args::Args,
  camera::V4lCameraSource,
  model::EimRunnerBuilder,
  task::{MonitorTask, ShutdownSignal, Task},
};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let credentials = args.credentials()?;

  info!("模型文件路径: {}", args.model.display());
  info!("期望螺母数量: {}", args.count);

  let publisher =
    IotHubClient::from_connection_string(credentials).context("无法解析 IoT Hub 连接字符串")?;
  let model = EimRunnerBuilder::new(&args.model)
    .build()
    .with_context(|| format!("无法加载模型 {}", args.model.display()))?;
  let cameras = V4lCameraSource::default();

  let shutdown = ShutdownSignal::default();
  shutdown.install_ctrlc().context("无法安装中断处理")?;

  let summary = MonitorTask::new(args.count)
    .with_camera_port(args.camera_port)
    .with_probe_ports(args.probe_range())
    .with_labels(&args.target_label, &args.container_label)
    .with_stale_counts(args.stale_counts)
    .with_frame_interval(args.frame_interval())
    .with_cooldown(args.cooldown())
    .with_frame_number(args.max_frames)
    .with_shutdown(shutdown)
    .run_task(cameras, model, publisher)?;

  info!(
    "共处理 {} 帧，发送 {} 条告警{}",
    summary.frames,
    summary.alerts,
    if summary.interrupted { "（已中断）" } else { "" }
  );
  Ok(())
}
