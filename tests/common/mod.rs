// 该文件是 Kanjian （看见） 项目的一部分。
// tests/common/mod.rs - 集成测试用的模拟后端与帧源
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

#![allow(dead_code)]

use std::fs::File;
use std::os::fd::BorrowedFd;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use kanjian::backend::{BackendError, Chip, Connection, Driver, TensorSet};
use kanjian::frame::{FrameSource, FrameSourceError, OwnedFrame};

pub const ALL_CHIPS: [Chip; 3] = [Chip::EdgeTpu, Chip::Artpec8Dlpu, Chip::TfliteCpu];

/// 跨连接共享的计数
#[derive(Default)]
pub struct MockState {
  pub connects: AtomicUsize,
  pub live_connections: AtomicUsize,
  pub live_models: AtomicUsize,
  pub runs: AtomicUsize,
  pub attempted: Mutex<Vec<Chip>>,
  pub last_input: Mutex<Vec<u8>>,
}

impl MockState {
  pub fn live_connections(&self) -> usize {
    self.live_connections.load(Ordering::SeqCst)
  }

  pub fn live_models(&self) -> usize {
    self.live_models.load(Ordering::SeqCst)
  }

  pub fn runs(&self) -> usize {
    self.runs.load(Ordering::SeqCst)
  }

  pub fn attempted(&self) -> Vec<Chip> {
    self.attempted.lock().unwrap().clone()
  }

  pub fn last_input(&self) -> Vec<u8> {
    self.last_input.lock().unwrap().clone()
  }
}

/// 让一次推理停在后端里，直到测试放行
pub struct Gate {
  armed: AtomicBool,
  pub entered: Barrier,
  pub release: Barrier,
}

impl Gate {
  pub fn new() -> Arc<Self> {
    Arc::new(Gate {
      armed: AtomicBool::new(true),
      entered: Barrier::new(2),
      release: Barrier::new(2),
    })
  }
}

#[derive(Clone)]
pub struct MockDriver {
  pub candidates: Vec<Chip>,
  pub failing_chips: Vec<Chip>,
  pub fail_load: bool,
  pub input_count: usize,
  pub output_count: usize,
  pub fail_request: bool,
  pub fail_run: Arc<AtomicBool>,
  pub output: Arc<Mutex<Vec<u8>>>,
  pub gate: Option<Arc<Gate>>,
  pub state: Arc<MockState>,
}

impl Default for MockDriver {
  fn default() -> Self {
    MockDriver {
      candidates: ALL_CHIPS.to_vec(),
      failing_chips: Vec::new(),
      fail_load: false,
      input_count: 1,
      output_count: 1,
      fail_request: false,
      fail_run: Arc::new(AtomicBool::new(false)),
      output: Arc::new(Mutex::new(Vec::new())),
      gate: None,
      state: Arc::new(MockState::default()),
    }
  }
}

impl MockDriver {
  pub fn with_output(self, bytes: &[u8]) -> Self {
    *self.output.lock().unwrap() = bytes.to_vec();
    self
  }

  pub fn with_failing_chips(mut self, chips: &[Chip]) -> Self {
    self.failing_chips = chips.to_vec();
    self
  }

  pub fn set_fail_run(&self, fail: bool) {
    self.fail_run.store(fail, Ordering::SeqCst);
  }
}

impl Driver for MockDriver {
  type Connection = MockConnection;

  fn candidates(&self) -> &[Chip] {
    &self.candidates
  }

  fn connect(&self) -> Result<Self::Connection, BackendError> {
    self.state.connects.fetch_add(1, Ordering::SeqCst);
    self.state.live_connections.fetch_add(1, Ordering::SeqCst);
    Ok(MockConnection {
      driver: self.clone(),
    })
  }
}

pub struct MockConnection {
  driver: MockDriver,
}

impl Drop for MockConnection {
  fn drop(&mut self) {
    self
      .driver
      .state
      .live_connections
      .fetch_sub(1, Ordering::SeqCst);
  }
}

pub struct MockModel {
  state: Arc<MockState>,
}

impl Drop for MockModel {
  fn drop(&mut self) {
    self.state.live_models.fetch_sub(1, Ordering::SeqCst);
  }
}

pub struct MockTensors {
  files: Vec<Option<File>>,
}

impl TensorSet for MockTensors {
  fn len(&self) -> usize {
    self.files.len()
  }
}

impl MockTensors {
  fn first(&self) -> Result<File, BackendError> {
    let file = self
      .files
      .first()
      .and_then(Option::as_ref)
      .ok_or_else(|| BackendError::driver(-1, "tensor not bound"))?;
    Ok(file.try_clone()?)
  }
}

pub struct MockRequest {
  input: File,
  output: File,
}

impl Connection for MockConnection {
  type Model = MockModel;
  type Tensors = MockTensors;
  type Request = MockRequest;

  fn select_chip(&mut self, chip: Chip) -> Result<(), BackendError> {
    self.driver.state.attempted.lock().unwrap().push(chip);
    if self.driver.failing_chips.contains(&chip) {
      Err(BackendError::ChipUnsupported(chip))
    } else {
      Ok(())
    }
  }

  fn load_model(&mut self, _model: &File, _name: &str) -> Result<Self::Model, BackendError> {
    if self.driver.fail_load {
      return Err(BackendError::driver(3, "bad model"));
    }
    self.driver.state.live_models.fetch_add(1, Ordering::SeqCst);
    Ok(MockModel {
      state: self.driver.state.clone(),
    })
  }

  fn create_inputs(&mut self, _model: &Self::Model) -> Result<Self::Tensors, BackendError> {
    Ok(MockTensors {
      files: (0..self.driver.input_count).map(|_| None).collect(),
    })
  }

  fn create_outputs(&mut self, _model: &Self::Model) -> Result<Self::Tensors, BackendError> {
    Ok(MockTensors {
      files: (0..self.driver.output_count).map(|_| None).collect(),
    })
  }

  fn bind_fd(
    &mut self,
    tensors: &mut Self::Tensors,
    index: usize,
    fd: BorrowedFd<'_>,
  ) -> Result<(), BackendError> {
    let slot = tensors
      .files
      .get_mut(index)
      .ok_or_else(|| BackendError::driver(-1, "no such tensor"))?;
    *slot = Some(File::from(fd.try_clone_to_owned()?));
    Ok(())
  }

  fn create_request(
    &mut self,
    _model: &Self::Model,
    inputs: &Self::Tensors,
    outputs: &Self::Tensors,
  ) -> Result<Self::Request, BackendError> {
    if self.driver.fail_request {
      return Err(BackendError::driver(5, "request refused"));
    }
    Ok(MockRequest {
      input: inputs.first()?,
      output: outputs.first()?,
    })
  }

  fn run(&mut self, request: &mut Self::Request) -> Result<(), BackendError> {
    if let Some(gate) = &self.driver.gate {
      if gate.armed.swap(false, Ordering::SeqCst) {
        gate.entered.wait();
        gate.release.wait();
      }
    }
    if self.driver.fail_run.load(Ordering::SeqCst) {
      return Err(BackendError::driver(7, "accelerator fault"));
    }
    self.driver.state.runs.fetch_add(1, Ordering::SeqCst);

    let input_len = request.input.metadata()?.len() as usize;
    let mut input = vec![0u8; input_len];
    request.input.read_exact_at(&mut input, 0)?;
    *self.driver.state.last_input.lock().unwrap() = input;

    let output_len = request.output.metadata()?.len() as usize;
    let mut output = self.driver.output.lock().unwrap().clone();
    output.resize(output_len, 0);
    request.output.write_all_at(&output, 0)?;
    Ok(())
  }
}

/// 内存帧源，每次取帧返回同一帧的克隆
#[derive(Default)]
pub struct MemorySource {
  pub frame: Mutex<Option<OwnedFrame>>,
  pub fail_start: bool,
  pub acquired: Arc<AtomicUsize>,
  pub released: Arc<AtomicUsize>,
  pub started: Arc<AtomicBool>,
  pub stopped: Arc<AtomicBool>,
}

impl MemorySource {
  pub fn with_frame(frame: OwnedFrame) -> Self {
    MemorySource {
      frame: Mutex::new(Some(frame)),
      ..Default::default()
    }
  }

  pub fn empty() -> Self {
    MemorySource::default()
  }

  pub fn counters(&self) -> SourceCounters {
    SourceCounters {
      acquired: self.acquired.clone(),
      released: self.released.clone(),
      started: self.started.clone(),
      stopped: self.stopped.clone(),
    }
  }
}

#[derive(Clone)]
pub struct SourceCounters {
  pub acquired: Arc<AtomicUsize>,
  pub released: Arc<AtomicUsize>,
  pub started: Arc<AtomicBool>,
  pub stopped: Arc<AtomicBool>,
}

impl SourceCounters {
  pub fn acquired(&self) -> usize {
    self.acquired.load(Ordering::SeqCst)
  }

  pub fn released(&self) -> usize {
    self.released.load(Ordering::SeqCst)
  }
}

impl FrameSource for MemorySource {
  type Frame = OwnedFrame;

  fn start(&mut self) -> Result<(), FrameSourceError> {
    if self.fail_start {
      return Err(FrameSourceError::StartFailed("camera busy".into()));
    }
    self.started.store(true, Ordering::SeqCst);
    Ok(())
  }

  fn stop(&mut self) {
    self.stopped.store(true, Ordering::SeqCst);
  }

  fn acquire_latest(&self) -> Option<Self::Frame> {
    let frame = self.frame.lock().unwrap().clone()?;
    self.acquired.fetch_add(1, Ordering::SeqCst);
    Some(frame)
  }

  fn release(&self, frame: Self::Frame) {
    self.released.fetch_add(1, Ordering::SeqCst);
    drop(frame);
  }
}

/// 模型与标签文件
pub struct Resources {
  pub dir: tempfile::TempDir,
  pub model: PathBuf,
  pub labels: PathBuf,
}

impl Resources {
  pub fn new(labels: &str) -> Self {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("model.tflite");
    let labels_path = dir.path().join("labels.txt");
    std::fs::write(&model, b"mock model").unwrap();
    std::fs::write(&labels_path, labels).unwrap();
    Resources {
      dir,
      model,
      labels: labels_path,
    }
  }
}
