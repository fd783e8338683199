// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/task.rs - 任务执行
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

use std::time::Instant;

use tracing::{info, warn};

use crate::{
  SamSession,
  batch::{BatchEvent, BatchRequest, CancelToken},
  frame::ImageFrame,
  output::Render,
  prompt::Prompt,
  remote::RemoteSession,
};

pub trait Task<R: RemoteSession, O: Render>: Sized {
  type Error;
  fn run_task(
    self,
    session: &mut SamSession<R>,
    frame: ImageFrame,
    output: &O,
  ) -> Result<(), Self::Error>;
}

/// 回答单个提示
pub struct PromptTask {
  prompt: Prompt,
  return_all: bool,
}

impl PromptTask {
  pub fn new(prompt: Prompt, return_all: bool) -> Self {
    Self { prompt, return_all }
  }
}

impl<R, O, RE> Task<R, O> for PromptTask
where
  R: RemoteSession,
  RE: std::error::Error + Sync + Send + 'static,
  O: Render<Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    session: &mut SamSession<R>,
    frame: ImageFrame,
    output: &O,
  ) -> Result<(), Self::Error> {
    info!("开始任务: {} 提示", self.prompt.kind());
    let now = Instant::now();
    session.set_image(frame)?;
    info!("图像设置完成，耗时: {:.2?}", now.elapsed());

    let now = Instant::now();
    let result = session.process_prompt(&self.prompt, self.return_all)?;
    info!("推理完成，{} 个对象，耗时: {:.2?}", result.len(), now.elapsed());

    let image = session
      .image()
      .ok_or_else(|| anyhow::anyhow!("会话中没有图像"))?;
    output.render_result(image, &result)?;
    info!("渲染完成");
    Ok(())
  }
}

/// 一次回答一组提示，Ctrl-C 取消尚未开始的提示
pub struct BatchTask {
  request: BatchRequest,
  cancel: CancelToken,
}

impl BatchTask {
  pub fn new(request: BatchRequest) -> Self {
    Self {
      request,
      cancel: CancelToken::new(),
    }
  }

  pub fn cancel_token(&self) -> CancelToken {
    self.cancel.clone()
  }

  /// 注册 Ctrl-C 处理，每个进程只能注册一次
  pub fn with_ctrlc(self) -> Result<Self, ctrlc::Error> {
    let cancel = self.cancel.clone();
    ctrlc::set_handler(move || {
      warn!("收到中断信号，取消尚未开始的提示...");
      cancel.cancel();
    })?;
    Ok(self)
  }
}

impl<R, O, RE> Task<R, O> for BatchTask
where
  R: RemoteSession,
  RE: std::error::Error + Sync + Send + 'static,
  O: Render<Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    session: &mut SamSession<R>,
    frame: ImageFrame,
    output: &O,
  ) -> Result<(), Self::Error> {
    info!("开始批量任务...");
    let now = Instant::now();
    session.set_image(frame)?;
    info!("图像设置完成，耗时: {:.2?}", now.elapsed());

    let now = Instant::now();
    let mut listener = |event: &BatchEvent<'_>| match event {
      BatchEvent::Total(total) => info!("共 {} 个提示", total),
      BatchEvent::Found {
        index,
        masks,
        completed,
        total,
      } => info!(
        "({}/{}) 提示 {} 得到 {} 个对象",
        completed,
        total,
        index,
        masks.len()
      ),
    };
    let outcome = session.process_batch_of_prompts(&self.request, &mut listener, &self.cancel)?;
    if outcome.cancelled {
      warn!(
        "批量任务被取消，完成 {}/{} 个提示",
        outcome.results.len(),
        outcome.total
      );
    }
    info!("批量推理完成，耗时: {:.2?}", now.elapsed());

    let result = outcome.into_masks();
    let image = session
      .image()
      .ok_or_else(|| anyhow::anyhow!("会话中没有图像"))?;
    output.render_result(image, &result)?;
    info!("渲染完成，共 {} 个对象", result.len());
    Ok(())
  }
}
