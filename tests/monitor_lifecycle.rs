// 该文件是 Lugwatch （轮毂螺母监测） 项目的一部分。
// tests/monitor_lifecycle.rs - 监测任务生命周期测试
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

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use image::RgbImage;

use lugwatch::alert::{AlertMessage, AlertPublisher};
use lugwatch::camera::{CameraError, CameraInfo, CameraSource, FrameGrabber};
use lugwatch::frame::Frame;
use lugwatch::interpret::StaleCountPolicy;
use lugwatch::model::{
  BoundingBox, DetectionResult, InferenceResponse, Model, ModelInfo, ModelParameters, ProjectInfo,
  SENSOR_CAMERA, Timing,
};
use lugwatch::task::{Clock, MonitorError, MonitorTask, RunSummary, ShutdownSignal, Task};

/// 只有 `sleep` 会推进的时钟，模型推理可以额外推进
#[derive(Clone)]
struct ManualClock {
  now: Rc<Cell<Instant>>,
  sleeps: Rc<RefCell<Vec<Duration>>>,
  /// 睡眠期间模拟收到 Ctrl-C
  interrupt_on_sleep: bool,
}

impl ManualClock {
  fn new() -> Self {
    Self {
      now: Rc::new(Cell::new(Instant::now())),
      sleeps: Rc::new(RefCell::new(Vec::new())),
      interrupt_on_sleep: false,
    }
  }

  fn advance(&self, duration: Duration) {
    self.now.set(self.now.get() + duration);
  }

  fn sleeps(&self) -> Vec<Duration> {
    self.sleeps.borrow().clone()
  }
}

impl Clock for ManualClock {
  fn now(&self) -> Instant {
    self.now.get()
  }

  fn sleep(&self, duration: Duration, shutdown: &ShutdownSignal) {
    self.sleeps.borrow_mut().push(duration);
    if self.interrupt_on_sleep {
      shutdown.trigger();
    }
    self.advance(duration);
  }
}

struct StubCamera {
  info: CameraInfo,
  index: u64,
}

impl FrameGrabber for StubCamera {
  fn grab(&mut self) -> Result<Frame, CameraError> {
    self.index += 1;
    Ok(Frame::new(RgbImage::new(4, 4), self.index, self.index * 100))
  }

  fn info(&self) -> &CameraInfo {
    &self.info
  }
}

struct StubCameras {
  ports: Vec<u32>,
}

impl CameraSource for StubCameras {
  type Handle = StubCamera;

  fn open(&self, port: u32) -> Result<StubCamera, CameraError> {
    if !self.ports.contains(&port) {
      return Err(CameraError::CameraUnavailable {
        port,
        reason: "no device".to_string(),
      });
    }
    Ok(StubCamera {
      info: CameraInfo {
        port,
        backend: "stub".to_string(),
        width: 4,
        height: 4,
      },
      index: 0,
    })
  }
}

#[derive(Default)]
struct ModelCalls {
  init: usize,
  classify: usize,
  stop: usize,
}

struct ScriptedModel {
  calls: Rc<RefCell<ModelCalls>>,
  responses: VecDeque<Result<InferenceResponse, io::Error>>,
  /// 第 N 次推理时触发中断
  interrupt_at: Option<(usize, ShutdownSignal)>,
  clock: Option<(ManualClock, Duration)>,
}

impl ScriptedModel {
  fn new(responses: Vec<Result<InferenceResponse, io::Error>>) -> (Self, Rc<RefCell<ModelCalls>>) {
    let calls = Rc::new(RefCell::new(ModelCalls::default()));
    let model = Self {
      calls: calls.clone(),
      responses: responses.into(),
      interrupt_at: None,
      clock: None,
    };
    (model, calls)
  }
}

impl Model for ScriptedModel {
  type Error = io::Error;

  fn init(&mut self) -> Result<ModelInfo, io::Error> {
    self.calls.borrow_mut().init += 1;
    Ok(ModelInfo {
      project: ProjectInfo {
        owner: "Inspection".to_string(),
        name: "lug-nuts".to_string(),
      },
      model_parameters: ModelParameters {
        labels: vec!["lug".to_string(), "tire".to_string()],
        image_input_width: 4,
        image_input_height: 4,
        image_channel_count: 3,
        sensor: SENSOR_CAMERA,
        model_type: "constrained_object_detection".to_string(),
        image_resize_mode: None,
      },
    })
  }

  fn classify(&mut self, features: Vec<f32>) -> Result<InferenceResponse, io::Error> {
    assert_eq!(features.len(), 16);
    let call = {
      let mut calls = self.calls.borrow_mut();
      calls.classify += 1;
      calls.classify
    };
    if let Some((at, signal)) = &self.interrupt_at
      && *at == call
    {
      signal.trigger();
    }
    if let Some((clock, cost)) = &self.clock {
      clock.advance(*cost);
    }
    self
      .responses
      .pop_front()
      .unwrap_or_else(|| Ok(frame_with(5, 1)))
  }

  fn stop(&mut self) {
    self.calls.borrow_mut().stop += 1;
  }
}

#[derive(Default)]
struct PublisherCalls {
  connect: usize,
  disconnect: usize,
  sent: Vec<AlertMessage>,
}

struct RecordingPublisher {
  calls: Rc<RefCell<PublisherCalls>>,
  connected: bool,
  refuse: bool,
}

impl RecordingPublisher {
  fn new() -> (Self, Rc<RefCell<PublisherCalls>>) {
    let calls = Rc::new(RefCell::new(PublisherCalls::default()));
    let publisher = Self {
      calls: calls.clone(),
      connected: false,
      refuse: false,
    };
    (publisher, calls)
  }
}

impl AlertPublisher for RecordingPublisher {
  type Error = io::Error;

  fn connect(&mut self) -> Result<(), io::Error> {
    self.calls.borrow_mut().connect += 1;
    if self.refuse {
      return Err(io::Error::new(
        io::ErrorKind::PermissionDenied,
        "bad credentials",
      ));
    }
    self.connected = true;
    Ok(())
  }

  fn send(&mut self, message: &AlertMessage) -> Result<(), io::Error> {
    assert!(self.connected, "send before connect");
    self.calls.borrow_mut().sent.push(message.clone());
    Ok(())
  }

  fn is_connected(&self) -> bool {
    self.connected
  }

  fn disconnect(&mut self) -> Result<(), io::Error> {
    self.calls.borrow_mut().disconnect += 1;
    self.connected = false;
    Ok(())
  }
}

fn bbox(label: &str) -> BoundingBox {
  BoundingBox {
    label: label.to_string(),
    value: 0.8,
    x: 1.0,
    y: 1.0,
    width: 2.0,
    height: 2.0,
  }
}

fn frame_with(lugs: usize, tires: usize) -> InferenceResponse {
  let mut boxes = vec![bbox("lug"); lugs];
  boxes.extend(vec![bbox("tire"); tires]);
  InferenceResponse {
    id: 0,
    result: DetectionResult::BoundingBoxes(boxes),
    timing: Timing::default(),
  }
}

fn no_boxes() -> InferenceResponse {
  InferenceResponse {
    id: 0,
    result: DetectionResult::Empty,
    timing: Timing::default(),
  }
}

fn one_camera() -> StubCameras {
  StubCameras { ports: vec![0] }
}

fn run(
  task: MonitorTask<ManualClock>,
  cameras: StubCameras,
  model: ScriptedModel,
  publisher: RecordingPublisher,
) -> Result<RunSummary, MonitorError> {
  task.run_task(cameras, model, publisher)
}

#[test]
fn shortfall_sends_one_alert_with_observed_count() {
  let clock = ManualClock::new();
  let (model, model_calls) = ScriptedModel::new(vec![Ok(frame_with(3, 1))]);
  let (publisher, publisher_calls) = RecordingPublisher::new();

  let task = MonitorTask::new(5)
    .with_frame_number(Some(1))
    .with_clock(clock.clone());
  let summary = run(task, one_camera(), model, publisher).unwrap();

  assert_eq!(summary.frames, 1);
  assert_eq!(summary.alerts, 1);
  let publisher_calls = publisher_calls.borrow();
  assert_eq!(publisher_calls.sent.len(), 1);
  assert_eq!(publisher_calls.sent[0].counted, 3);
  assert_eq!(publisher_calls.sent[0].text, "Found 2 missing lug nuts!");
  assert_eq!(publisher_calls.sent[0].content_type, "application/json");
  assert_eq!(model_calls.borrow().init, 1);
  // 发送后冷却
  assert_eq!(clock.sleeps(), vec![Duration::from_secs(2)]);
}

#[test]
fn no_alert_without_tire_or_with_full_count() {
  let clock = ManualClock::new();
  let (model, _) = ScriptedModel::new(vec![
    Ok(frame_with(0, 0)),
    Ok(frame_with(2, 0)),
    Ok(frame_with(5, 1)),
    Ok(frame_with(6, 1)),
  ]);
  let (publisher, publisher_calls) = RecordingPublisher::new();

  let task = MonitorTask::new(5)
    .with_frame_number(Some(4))
    .with_clock(clock);
  let summary = run(task, one_camera(), model, publisher).unwrap();

  assert_eq!(summary.frames, 4);
  assert_eq!(summary.alerts, 0);
  assert!(publisher_calls.borrow().sent.is_empty());
}

#[test]
fn interrupt_mid_loop_releases_everything_once() {
  let shutdown = ShutdownSignal::default();
  let (mut model, model_calls) = ScriptedModel::new(vec![]);
  model.interrupt_at = Some((3, shutdown.clone()));
  let (publisher, publisher_calls) = RecordingPublisher::new();

  let task = MonitorTask::new(5)
    .with_shutdown(shutdown)
    .with_clock(ManualClock::new());
  let summary = run(task, one_camera(), model, publisher).unwrap();

  assert!(summary.interrupted);
  assert_eq!(summary.frames, 2);
  assert_eq!(model_calls.borrow().stop, 1);
  assert_eq!(publisher_calls.borrow().connect, 1);
  assert_eq!(publisher_calls.borrow().disconnect, 1);
}

#[test]
fn interrupt_during_cooldown_pulls_no_further_frame() {
  let mut clock = ManualClock::new();
  clock.interrupt_on_sleep = true;
  let (model, model_calls) = ScriptedModel::new(vec![Ok(frame_with(3, 1))]);
  let (publisher, publisher_calls) = RecordingPublisher::new();

  let task = MonitorTask::new(5).with_clock(clock.clone());
  let summary = run(task, one_camera(), model, publisher).unwrap();

  assert!(summary.interrupted);
  assert_eq!(summary.frames, 1);
  assert_eq!(summary.alerts, 1);
  assert_eq!(clock.sleeps(), vec![Duration::from_secs(2)]);
  assert_eq!(model_calls.borrow().classify, 1);
  assert_eq!(model_calls.borrow().stop, 1);
  assert_eq!(publisher_calls.borrow().disconnect, 1);
}

#[test]
fn inference_failure_tears_down_once() {
  let (model, model_calls) = ScriptedModel::new(vec![
    Ok(frame_with(5, 1)),
    Err(io::Error::other("runner crashed")),
  ]);
  let (publisher, publisher_calls) = RecordingPublisher::new();

  let task = MonitorTask::new(5).with_clock(ManualClock::new());
  let err = run(task, one_camera(), model, publisher).unwrap_err();

  assert!(matches!(err, MonitorError::Inference(_)));
  assert_eq!(model_calls.borrow().stop, 1);
  assert_eq!(publisher_calls.borrow().disconnect, 1);
}

#[test]
fn refused_connection_never_loads_the_model() {
  let (model, model_calls) = ScriptedModel::new(vec![]);
  let (mut publisher, publisher_calls) = RecordingPublisher::new();
  publisher.refuse = true;

  let task = MonitorTask::new(5).with_clock(ManualClock::new());
  let err = run(task, one_camera(), model, publisher).unwrap_err();

  assert!(matches!(err, MonitorError::Connection(_)));
  assert_eq!(model_calls.borrow().init, 0);
  assert_eq!(model_calls.borrow().stop, 1);
  assert_eq!(publisher_calls.borrow().disconnect, 0);
}

#[test]
fn ambiguous_cameras_abort_startup() {
  let (model, model_calls) = ScriptedModel::new(vec![]);
  let (publisher, publisher_calls) = RecordingPublisher::new();

  let task = MonitorTask::new(5).with_clock(ManualClock::new());
  let err = run(task, StubCameras { ports: vec![0, 2] }, model, publisher).unwrap_err();

  match err {
    MonitorError::Camera(CameraError::AmbiguousCamera { ports }) => assert_eq!(ports, vec![0, 2]),
    other => panic!("unexpected error: {}", other),
  }
  assert_eq!(model_calls.borrow().classify, 0);
  assert_eq!(model_calls.borrow().stop, 1);
  assert_eq!(publisher_calls.borrow().disconnect, 1);
}

#[test]
fn explicit_port_resolves_ambiguity() {
  let (model, _) = ScriptedModel::new(vec![]);
  let (publisher, _) = RecordingPublisher::new();

  let task = MonitorTask::new(5)
    .with_camera_port(Some(2))
    .with_frame_number(Some(1))
    .with_clock(ManualClock::new());
  let summary = run(task, StubCameras { ports: vec![0, 2] }, model, publisher).unwrap();
  assert_eq!(summary.frames, 1);
}

#[test]
fn no_camera_aborts_startup() {
  let (model, _) = ScriptedModel::new(vec![]);
  let (publisher, _) = RecordingPublisher::new();

  let task = MonitorTask::new(5).with_clock(ManualClock::new());
  let err = run(task, StubCameras { ports: vec![] }, model, publisher).unwrap_err();
  assert!(matches!(err, MonitorError::Camera(CameraError::NoCamera)));
}

#[test]
fn fast_inference_sleeps_the_remaining_delta() {
  let clock = ManualClock::new();
  let (mut model, _) = ScriptedModel::new(vec![]);
  model.clock = Some((clock.clone(), Duration::from_millis(30)));
  let (publisher, _) = RecordingPublisher::new();

  let task = MonitorTask::new(5)
    .with_frame_number(Some(3))
    .with_clock(clock.clone());
  run(task, one_camera(), model, publisher).unwrap();

  assert_eq!(
    clock.sleeps(),
    vec![Duration::from_millis(70), Duration::from_millis(70)]
  );
}

#[test]
fn slow_inference_is_not_delayed() {
  let clock = ManualClock::new();
  let (mut model, _) = ScriptedModel::new(vec![]);
  model.clock = Some((clock.clone(), Duration::from_millis(150)));
  let (publisher, _) = RecordingPublisher::new();

  let task = MonitorTask::new(5)
    .with_frame_number(Some(3))
    .with_clock(clock.clone());
  run(task, one_camera(), model, publisher).unwrap();

  assert!(clock.sleeps().is_empty());
}

#[test]
fn stale_counts_follow_the_policy() {
  let responses = || vec![Ok(frame_with(2, 1)), Ok(no_boxes()), Ok(no_boxes())];

  let (model, _) = ScriptedModel::new(responses());
  let (publisher, reset_calls) = RecordingPublisher::new();
  let task = MonitorTask::new(5)
    .with_frame_number(Some(3))
    .with_clock(ManualClock::new());
  run(task, one_camera(), model, publisher).unwrap();
  assert_eq!(reset_calls.borrow().sent.len(), 1);

  let (model, _) = ScriptedModel::new(responses());
  let (publisher, carry_calls) = RecordingPublisher::new();
  let task = MonitorTask::new(5)
    .with_stale_counts(StaleCountPolicy::Carry)
    .with_frame_number(Some(3))
    .with_clock(ManualClock::new());
  run(task, one_camera(), model, publisher).unwrap();
  assert_eq!(carry_calls.borrow().sent.len(), 3);
  assert!(carry_calls.borrow().sent.iter().all(|m| m.counted == 2));
}
