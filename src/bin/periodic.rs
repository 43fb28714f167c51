// 该文件是 Kanjian （看见） 项目的一部分。
// src/bin/periodic.rs - 周期推理
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

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use kanjian::backend::Driver;
use kanjian::task::{PeriodicTask, Task};

use common::CommonArgs;

/// 按固定间隔执行图像分类
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub common: CommonArgs,
  /// 推理间隔（秒）
  #[arg(long, default_value = "5", value_name = "SECONDS")]
  pub interval: u64,
  /// 最大推理次数，不指定时一直运行到 Ctrl-C
  #[arg(long, value_name = "COUNT")]
  pub cycles: Option<usize>,
}

fn run<D: Driver>(args: &Args, driver: D) -> Result<()> {
  let (engine, status) = common::open_engine(&args.common, &driver)?;

  let summary = PeriodicTask::default()
    .with_interval(Duration::from_secs(args.interval))
    .with_max_cycles(args.cycles)
    .run_task(&engine)?;
  info!(
    "共 {} 次推理，{} 个结果，{} 次跳过，{} 次失败",
    summary.cycles, summary.detections, summary.skipped, summary.failures
  );

  engine.close();
  info!("状态: {}", status.to_json());
  Ok(())
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  match args.common.model.scheme() {
    #[cfg(feature = "rknpu")]
    "rknpu" => {
      use kanjian::FromUrl;
      let driver = kanjian::backend::RknpuDriver::from_url(&args.common.model)?;
      run(&args, driver)
    }
    #[cfg(feature = "larod")]
    "larod" => {
      use kanjian::FromUrl;
      let driver = kanjian::backend::LarodDriver::from_url(&args.common.model)?;
      run(&args, driver)
    }
    other => anyhow::bail!("不支持的模型 URI 方案: {}", other),
  }
}
