// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/main.rs - 命令行主程序
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

mod args;

use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use tracing::info;

use shanan_sam::{
  FromUrl, SamSession,
  batch::BatchRequest,
  config::SessionConfig,
  input::InputWrapper,
  model::AdapterWrapper,
  output::OutputWrapper,
  prompt::Prompt,
  remote::process::ProcessSessionBuilder,
  task::{BatchTask, PromptTask, Task},
};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();

  info!("模型: {}", args.model);
  info!("远程: {}", args.remote);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let frame = InputWrapper::from_url(&args.input)?.into_frame();
  let output = OutputWrapper::from_url(&args.output)?;

  let adapter = Arc::new(AdapterWrapper::from_url(&args.model)?);
  let config = SessionConfig::from_url(&args.remote)?;
  let return_all = !args.largest && config.return_all;
  let remote = ProcessSessionBuilder::from_url(&args.remote)?.build(adapter.clone())?;
  let mut session = SamSession::new(remote, adapter, config);

  let labels = match &args.labels {
    Some(url) => Some(InputWrapper::from_url(url)?.into_labels()),
    None => None,
  };

  let prompt_count = args.points.len() + args.boxes.len() + usize::from(labels.is_some());
  if prompt_count == 0 {
    bail!("至少需要一个提示: --point、--box 或 --labels");
  }

  let result = if args.batch || labels.is_some() {
    let mut request = BatchRequest::new()
      .with_points(args.points)
      .with_boxes(args.boxes)
      .with_return_all(return_all);
    if let Some(labels) = labels {
      request = request.with_labels(labels);
    }
    BatchTask::new(request)
      .with_ctrlc()?
      .run_task(&mut session, frame, &output)
  } else if let [bbox] = args.boxes.as_slice() {
    if !args.points.is_empty() {
      bail!("框提示不能与点提示同时使用，请使用 --batch");
    }
    PromptTask::new(Prompt::Box(*bbox), return_all).run_task(&mut session, frame, &output)
  } else if args.boxes.is_empty() {
    let prompt = Prompt::points(args.points).with_negative(args.negatives);
    PromptTask::new(prompt, return_all).run_task(&mut session, frame, &output)
  } else {
    bail!("多个框提示请使用 --batch");
  };

  session.close();
  result
}
