// 该文件是 Kanjian （看见） 项目的一部分。
// tests/session.rs - 后端会话测试
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

mod common;

use kanjian::backend::Chip;
use kanjian::buffer::TensorBuffer;
use kanjian::session::{BindStage, Session, SessionError, SessionState};

use common::{ALL_CHIPS, MockConnection, MockDriver};

fn model_file() -> tempfile::NamedTempFile {
  tempfile::NamedTempFile::new().unwrap()
}

fn buffers() -> (TensorBuffer, TensorBuffer) {
  (
    TensorBuffer::allocate("kanjian.test.in.", 12).unwrap(),
    TensorBuffer::allocate("kanjian.test.out.", 3).unwrap(),
  )
}

#[test]
fn falls_back_in_preference_order() {
  let driver = MockDriver::default().with_failing_chips(&[Chip::EdgeTpu]);
  let model = model_file();

  let session = Session::open(&driver, &ALL_CHIPS, model.as_file(), "model").unwrap();
  assert_eq!(session.chip(), Some(Chip::Artpec8Dlpu));
  assert_eq!(session.state(), SessionState::ModelLoaded);
  assert_eq!(driver.state.attempted(), [Chip::EdgeTpu, Chip::Artpec8Dlpu]);
  assert_eq!(driver.state.live_connections(), 1);

  drop(session);
  assert_eq!(driver.state.live_connections(), 0);
  assert_eq!(driver.state.live_models(), 0);
}

#[test]
fn exhausted_candidates_leave_nothing_behind() {
  let driver = MockDriver::default().with_failing_chips(&ALL_CHIPS);
  let model = model_file();

  let result = Session::open(&driver, &ALL_CHIPS, model.as_file(), "model");
  assert!(matches!(result, Err(SessionError::NoCompatibleBackend)));
  assert_eq!(driver.state.attempted(), ALL_CHIPS);
  assert_eq!(
    driver
      .state
      .connects
      .load(std::sync::atomic::Ordering::SeqCst),
    3
  );
  assert_eq!(driver.state.live_connections(), 0);
}

#[test]
fn model_load_failure_releases_connection() {
  let driver = MockDriver {
    fail_load: true,
    ..Default::default()
  };
  let model = model_file();

  let result = Session::open(&driver, &ALL_CHIPS, model.as_file(), "model");
  assert!(matches!(result, Err(SessionError::ModelLoadFailed(_))));
  // 加载失败不再尝试其他候选
  assert_eq!(driver.state.attempted(), [Chip::EdgeTpu]);
  assert_eq!(driver.state.live_connections(), 0);
}

#[test]
fn binds_and_runs() {
  let driver = MockDriver::default().with_output(&[1, 2, 3]);
  let model = model_file();
  let mut session = Session::open(&driver, &ALL_CHIPS, model.as_file(), "model").unwrap();

  let (input, output) = buffers();
  session.bind_tensors(input, output).unwrap();
  assert!(session.is_ready());
  assert_eq!((session.input_count(), session.output_count()), (1, 1));

  session.input_buffer_mut().unwrap().as_mut_slice().fill(9);
  session.run().unwrap();
  assert_eq!(session.output_buffer().unwrap().as_slice(), [1, 2, 3]);
  assert_eq!(driver.state.last_input(), vec![9u8; 12]);
}

#[test]
fn extra_input_tensor_is_rejected() {
  let driver = MockDriver {
    input_count: 2,
    ..Default::default()
  };
  let model = model_file();
  let mut session = Session::open(&driver, &ALL_CHIPS, model.as_file(), "model").unwrap();

  let (input, output) = buffers();
  let err = session.bind_tensors(input, output).unwrap_err();
  assert!(matches!(
    err,
    SessionError::BindFailed {
      stage: BindStage::Inputs,
      ..
    }
  ));
  assert!(!session.is_ready());

  session.close();
  assert_eq!(driver.state.live_connections(), 0);
}

#[test]
fn request_failure_is_reported() {
  let driver = MockDriver {
    fail_request: true,
    ..Default::default()
  };
  let model = model_file();
  let mut session = Session::open(&driver, &ALL_CHIPS, model.as_file(), "model").unwrap();

  let (input, output) = buffers();
  let err = session.bind_tensors(input, output).unwrap_err();
  assert!(matches!(
    err,
    SessionError::BindFailed {
      stage: BindStage::Request,
      ..
    }
  ));
  assert_eq!(session.state(), SessionState::TensorsBound);
  assert_eq!(session.input_count(), 1);
  assert!(matches!(
    session.run(),
    Err(SessionError::InvalidState(SessionState::TensorsBound))
  ));

  session.close();
  assert_eq!(driver.state.live_connections(), 0);
}

#[test]
fn steps_through_each_state() {
  let driver = MockDriver::default().with_output(&[4, 5, 6]);
  let model = model_file();
  let mut session: Session<MockConnection> = Session::new();
  assert_eq!(session.state(), SessionState::Unconnected);
  assert_eq!(session.chip(), None);
  assert!(matches!(
    session.load_model(model.as_file(), "model"),
    Err(SessionError::InvalidState(SessionState::Unconnected))
  ));

  assert_eq!(session.select_chip(&driver, &ALL_CHIPS).unwrap(), Chip::EdgeTpu);
  assert_eq!(session.state(), SessionState::ChipSelected);
  assert_eq!(driver.state.live_models(), 0);

  session.load_model(model.as_file(), "model").unwrap();
  assert_eq!(session.state(), SessionState::ModelLoaded);
  assert!(matches!(
    session.select_chip(&driver, &ALL_CHIPS),
    Err(SessionError::InvalidState(SessionState::ModelLoaded))
  ));
  assert_eq!(driver.state.live_connections(), 1);

  let (input, output) = buffers();
  session.bind_tensors(input, output).unwrap();
  assert_eq!(session.state(), SessionState::Ready);
  session.run().unwrap();
  assert_eq!(session.output_buffer().unwrap().as_slice(), [4, 5, 6]);
}

#[test]
fn run_requires_bound_tensors() {
  let driver = MockDriver::default();
  let model = model_file();
  let mut session = Session::open(&driver, &ALL_CHIPS, model.as_file(), "model").unwrap();
  assert!(matches!(
    session.run(),
    Err(SessionError::InvalidState(SessionState::ModelLoaded))
  ));
}

#[test]
fn close_is_idempotent() {
  let driver = MockDriver::default();
  let model = model_file();
  let mut session = Session::open(&driver, &ALL_CHIPS, model.as_file(), "model").unwrap();
  let (input, output) = buffers();
  session.bind_tensors(input, output).unwrap();

  session.close();
  session.close();
  assert_eq!(session.state(), SessionState::Closed);
  assert!(session.input_buffer_mut().is_none());
  assert_eq!(driver.state.live_connections(), 0);
  assert_eq!(driver.state.live_models(), 0);

  let (input, output) = buffers();
  assert!(matches!(
    session.bind_tensors(input, output),
    Err(SessionError::InvalidState(SessionState::Closed))
  ));
  drop(session);
  assert_eq!(driver.state.live_connections(), 0);
}
