// 该文件是 Kanjian （看见） 项目的一部分。
// src/bin/oneshot.rs - 单次推理并输出 JSON 结果
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

use anyhow::Result;
use clap::Parser;

use kanjian::backend::Driver;
use kanjian::task::{OneShotTask, Task};

use common::CommonArgs;

/// 执行一次图像分类并打印结果
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub common: CommonArgs,
  /// 输出带缩进的 JSON
  #[arg(long)]
  pub pretty: bool,
}

fn run<D: Driver>(args: &Args, driver: D) -> Result<()> {
  let (engine, _status) = common::open_engine(&args.common, &driver)?;
  let result = OneShotTask.run_task(&engine)?;
  let json = if args.pretty {
    serde_json::to_string_pretty(&result)?
  } else {
    serde_json::to_string(&result)?
  };
  println!("{}", json);
  engine.close();
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
