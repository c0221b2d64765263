// 该文件是 Lugwatch （轮毂螺母监测） 项目的一部分。
// src/task.rs - 监测任务与生命周期
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
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use std::{fmt, thread};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::alert::AlertPublisher;
use crate::camera::{self, CameraError, CameraSource, DEFAULT_PROBE_PORTS};
use crate::interpret::{Interpreter, StaleCountPolicy, Verdict};
use crate::model::{BoxError, ClassifyError, Model};

const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(2);
const FORCED_EXIT_GRACE: Duration = Duration::from_secs(30);

pub trait Task<C, M, P>: Sized {
  type Output;
  type Error;
  fn run_task(self, cameras: C, model: M, publisher: P) -> Result<Self::Output, Self::Error>;
}

#[derive(Error, Debug)]
pub enum MonitorError {
  #[error("无法连接云端: {0}")]
  Connection(#[source] BoxError),
  #[error("模型加载失败: {0}")]
  ModelLoad(#[source] BoxError),
  #[error(transparent)]
  Camera(#[from] CameraError),
  #[error(transparent)]
  Inference(#[from] ClassifyError),
  #[error("告警发送失败: {0}")]
  Publish(#[source] BoxError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Starting,
  Connected,
  Running,
  Stopping,
  Stopped,
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      LifecycleState::Starting => "STARTING",
      LifecycleState::Connected => "CONNECTED",
      LifecycleState::Running => "RUNNING",
      LifecycleState::Stopping => "STOPPING",
      LifecycleState::Stopped => "STOPPED",
    };
    f.write_str(name)
  }
}

/// 生命周期状态机，保证资源只释放一次
#[derive(Debug)]
pub struct Lifecycle {
  state: LifecycleState,
}

impl Default for Lifecycle {
  fn default() -> Self {
    Self {
      state: LifecycleState::Starting,
    }
  }
}

impl Lifecycle {
  pub fn state(&self) -> LifecycleState {
    self.state
  }

  fn advance(&mut self, next: LifecycleState) {
    debug!("生命周期: {} -> {}", self.state, next);
    self.state = next;
  }

  /// 停止模型并关闭云端会话，重复调用无效
  pub fn teardown<M: Model, P: AlertPublisher>(&mut self, model: &mut M, publisher: &mut P) {
    if self.state == LifecycleState::Stopped {
      return;
    }
    self.advance(LifecycleState::Stopping);

    model.stop();
    if publisher.is_connected()
      && let Err(e) = publisher.disconnect()
    {
      warn!("关闭云端会话失败: {}", e);
    }

    self.advance(LifecycleState::Stopped);
    info!("任务已停止");
  }
}

/// 外部中断信号，可跨线程触发，睡眠中的任务会被立即唤醒
#[derive(Clone, Default)]
pub struct ShutdownSignal {
  inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
  pub fn trigger(&self) {
    let (flag, condvar) = &*self.inner;
    *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
    condvar.notify_all();
  }

  pub fn is_triggered(&self) -> bool {
    *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// 最多等待 `timeout`；返回是否已收到中断
  pub fn wait_timeout(&self, timeout: Duration) -> bool {
    let (flag, condvar) = &*self.inner;
    let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
    let (guard, _) = condvar
      .wait_timeout_while(guard, timeout, |triggered| !*triggered)
      .unwrap_or_else(PoisonError::into_inner);
    *guard
  }

  /// 安装 Ctrl-C / SIGTERM 处理；若清理迟迟未完成则强制退出
  pub fn install_ctrlc(&self) -> Result<(), ctrlc::Error> {
    let signal = self.clone();
    ctrlc::set_handler(move || {
      info!("Interrupted");
      signal.trigger();
      thread::spawn(|| {
        thread::sleep(FORCED_EXIT_GRACE);
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })
  }
}

pub trait Clock {
  fn now(&self) -> Instant;
  fn sleep(&self, duration: Duration, shutdown: &ShutdownSignal);
}

/// 真实时钟，睡眠可被中断
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> Instant {
    Instant::now()
  }

  fn sleep(&self, duration: Duration, shutdown: &ShutdownSignal) {
    shutdown.wait_timeout(duration);
  }
}

/// 帧率限制：记录下一帧允许的时间点
#[derive(Debug, Clone)]
pub struct FrameLimiter {
  interval: Duration,
  next_frame: Option<Instant>,
}

impl FrameLimiter {
  pub fn new(interval: Duration) -> Self {
    Self {
      interval,
      next_frame: None,
    }
  }

  /// 距离下一帧还需要等待的时间，不会为负
  pub fn delay(&self, now: Instant) -> Duration {
    self
      .next_frame
      .map(|next| next.saturating_duration_since(now))
      .unwrap_or(Duration::ZERO)
  }

  pub fn mark(&mut self, now: Instant) {
    self.next_frame = Some(now + self.interval);
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
  pub frames: u64,
  pub alerts: u64,
  pub interrupted: bool,
}

/// 轮毂螺母监测任务
pub struct MonitorTask<K = SystemClock> {
  camera_port: Option<u32>,
  probe_ports: Range<u32>,
  interpreter: Interpreter,
  frame_interval: Duration,
  cooldown: Duration,
  frame_number: Option<u64>,
  shutdown: ShutdownSignal,
  clock: K,
}

impl MonitorTask {
  pub fn new(expected_count: u32) -> Self {
    Self {
      camera_port: None,
      probe_ports: DEFAULT_PROBE_PORTS,
      interpreter: Interpreter::new(expected_count),
      frame_interval: DEFAULT_FRAME_INTERVAL,
      cooldown: DEFAULT_COOLDOWN,
      frame_number: None,
      shutdown: ShutdownSignal::default(),
      clock: SystemClock,
    }
  }
}

impl<K: Clock> MonitorTask<K> {
  pub fn with_camera_port(mut self, port: Option<u32>) -> Self {
    self.camera_port = port;
    self
  }

  pub fn with_probe_ports(mut self, ports: Range<u32>) -> Self {
    self.probe_ports = ports;
    self
  }

  pub fn with_labels(mut self, target: impl Into<String>, container: impl Into<String>) -> Self {
    self.interpreter = self.interpreter.with_labels(target, container);
    self
  }

  pub fn with_stale_counts(mut self, policy: StaleCountPolicy) -> Self {
    self.interpreter = self.interpreter.with_policy(policy);
    self
  }

  pub fn with_frame_interval(mut self, interval: Duration) -> Self {
    self.frame_interval = interval;
    self
  }

  pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
    self.cooldown = cooldown;
    self
  }

  pub fn with_frame_number(mut self, frame_number: Option<u64>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
    self.shutdown = shutdown;
    self
  }

  pub fn with_clock<C: Clock>(self, clock: C) -> MonitorTask<C> {
    MonitorTask {
      camera_port: self.camera_port,
      probe_ports: self.probe_ports,
      interpreter: self.interpreter,
      frame_interval: self.frame_interval,
      cooldown: self.cooldown,
      frame_number: self.frame_number,
      shutdown: self.shutdown,
      clock,
    }
  }

  fn stop_requested(&self, summary: &mut RunSummary) -> bool {
    if self.shutdown.is_triggered() {
      warn!("中断信号接收，退出任务循环");
      summary.interrupted = true;
    }
    summary.interrupted
  }

  fn run_inner<C, M, P>(
    &mut self,
    lifecycle: &mut Lifecycle,
    cameras: &C,
    model: &mut M,
    publisher: &mut P,
  ) -> Result<RunSummary, MonitorError>
  where
    C: CameraSource,
    M: Model,
    P: AlertPublisher,
  {
    publisher
      .connect()
      .map_err(|e| MonitorError::Connection(Box::new(e)))?;
    lifecycle.advance(LifecycleState::Connected);

    let model_info = model
      .init()
      .map_err(|e| MonitorError::ModelLoad(Box::new(e)))?;
    info!("Loaded runner for \"{}\"", model_info.project);
    let labels = model_info.model_parameters.labels.clone();

    let port = camera::select_port(cameras, self.camera_port, self.probe_ports.clone())?;
    let camera = camera::open_selected(cameras, port)?;
    lifecycle.advance(LifecycleState::Running);

    let mut summary = RunSummary::default();
    let mut limiter = FrameLimiter::new(self.frame_interval);

    let mut frames = model.classifier(&model_info, camera);
    loop {
      let delay = limiter.delay(self.clock.now());
      if !delay.is_zero() {
        self.clock.sleep(delay, &self.shutdown);
      }
      // 冷却或限速期间可能已收到中断，不再取下一帧
      if self.stop_requested(&mut summary) {
        break;
      }

      limiter.mark(self.clock.now());
      let Some(item) = frames.next() else {
        break;
      };
      if self.stop_requested(&mut summary) {
        break;
      }

      let classified = item?;
      summary.frames += 1;

      let verdict = self.interpreter.inspect(&classified.response, &labels);
      debug!("第 {} 帧: {:?}", classified.frame.index, verdict);

      if let Verdict::Shortfall { expected, observed } = verdict {
        publisher
          .send_alert(expected, observed)
          .map_err(|e| MonitorError::Publish(Box::new(e)))?;
        summary.alerts += 1;
        self.clock.sleep(self.cooldown, &self.shutdown);
      }

      if self.frame_number.is_some_and(|n| summary.frames >= n) {
        info!("达到指定帧数 {}, 退出任务循环", summary.frames);
        break;
      }
    }

    Ok(summary)
  }
}

impl<C, M, P, K> Task<C, M, P> for MonitorTask<K>
where
  C: CameraSource,
  M: Model,
  P: AlertPublisher,
  K: Clock,
{
  type Output = RunSummary;
  type Error = MonitorError;

  fn run_task(
    mut self,
    cameras: C,
    mut model: M,
    mut publisher: P,
  ) -> Result<RunSummary, MonitorError> {
    info!("开始任务...");
    let mut lifecycle = Lifecycle::default();

    let outcome = self.run_inner(&mut lifecycle, &cameras, &mut model, &mut publisher);
    if let Err(e) = &outcome {
      warn!("任务异常结束: {}", e);
    }

    lifecycle.teardown(&mut model, &mut publisher);
    outcome
  }
}
