// 该文件是 Kanjian （看见） 项目的一部分。
// src/task.rs - 推理任务
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

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::{thread, time::Duration};

use tracing::{debug, info, warn};

use crate::backend::Connection;
use crate::engine::{Engine, InferenceResult};
use crate::frame::FrameSource;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

pub trait Task<C: Connection, S: FrameSource>: Sized {
  type Output;
  type Error;
  fn run_task(self, engine: &Engine<C, S>) -> Result<Self::Output, Self::Error>;
}

/// 执行一次推理并返回结果
pub struct OneShotTask;

impl<C: Connection, S: FrameSource> Task<C, S> for OneShotTask {
  type Output = InferenceResult;
  type Error = anyhow::Error;

  fn run_task(self, engine: &Engine<C, S>) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let result = engine.run_cycle()?;
    info!(
      "推理完成，耗时: {} ms，{} 个结果",
      result.duration,
      result.list.len()
    );
    Ok(result)
  }
}

/// 周期任务的统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicSummary {
  pub cycles: usize,
  pub detections: usize,
  pub skipped: usize,
  pub failures: usize,
}

/// 按固定间隔推理，直到收到停止信号或达到指定次数
#[derive(Debug)]
pub struct PeriodicTask {
  interval: Duration,
  max_cycles: Option<usize>,
  stop: Option<Receiver<()>>,
}

impl Default for PeriodicTask {
  fn default() -> Self {
    PeriodicTask {
      interval: DEFAULT_INTERVAL,
      max_cycles: None,
      stop: None,
    }
  }
}

impl PeriodicTask {
  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  pub fn with_max_cycles(mut self, max_cycles: Option<usize>) -> Self {
    self.max_cycles = max_cycles;
    self
  }

  /// 使用外部停止信号；未设置时安装 Ctrl-C 处理器
  pub fn with_stop_signal(mut self, stop: Receiver<()>) -> Self {
    self.stop = Some(stop);
    self
  }

  fn install_ctrlc() -> Result<Receiver<()>, ctrlc::Error> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;
    Ok(rx)
  }
}

impl<C: Connection, S: FrameSource> Task<C, S> for PeriodicTask {
  type Output = PeriodicSummary;
  type Error = anyhow::Error;

  fn run_task(self, engine: &Engine<C, S>) -> Result<Self::Output, Self::Error> {
    info!("开始任务，间隔 {:.2?}...", self.interval);
    let stop = match self.stop {
      Some(stop) => stop,
      None => Self::install_ctrlc()?,
    };

    let mut summary = PeriodicSummary::default();
    loop {
      summary.cycles += 1;
      match engine.run_cycle() {
        Ok(result) if result.list.is_empty() => debug!("({}) 没有检测结果", summary.cycles),
        Ok(result) => {
          info!("{} detections", result.list.len());
          for detection in &result.list {
            info!("{} {}", detection.label, detection.score);
          }
          summary.detections += result.list.len();
        }
        Err(e) if e.is_recoverable() => {
          debug!("({}) 跳过本次推理: {}", summary.cycles, e);
          summary.skipped += 1;
        }
        Err(e) => {
          warn!("({}) 推理失败: {}", summary.cycles, e);
          summary.failures += 1;
        }
      }

      if self.max_cycles.is_some_and(|n| summary.cycles >= n) {
        info!("达到指定次数 {}, 退出任务循环", summary.cycles);
        break;
      }
      match stop.recv_timeout(self.interval) {
        Err(RecvTimeoutError::Timeout) => continue,
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
          warn!("中断信号接收，退出任务循环");
          break;
        }
      }
    }

    info!("任务完成，退出");
    Ok(summary)
  }
}
