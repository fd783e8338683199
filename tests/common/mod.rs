// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// tests/common/mod.rs - 集成测试公共部分
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

use std::sync::{
  Arc,
  atomic::{AtomicUsize, Ordering},
};

use ndarray::Array2;
use shanan_sam::{
  FromUrl, SamSession,
  command::{Command, NdArray},
  config::SessionConfig,
  frame::ImageFrame,
  geometry::Point,
  mask::{PromptOutput, Rle},
  model::{ModelAdapter, Sam2},
  prompt::LocalPrompt,
  remote::{
    CancelToken, Outputs, RemoteError, RemoteSession, UpdateEvent,
    local::{LocalSession, Predictor},
  },
};
use url::Url;

pub const DISC_RADIUS: i32 = 4;

/// 以提示中心为圆心画圆的预测器，记录编码次数
#[derive(Default)]
pub struct DiscPredictor {
  encodes: Arc<AtomicUsize>,
  /// 前若干次编码失败
  failing: usize,
}

impl DiscPredictor {
  pub fn failing_first(failing: usize) -> Self {
    Self {
      failing,
      ..Self::default()
    }
  }

  pub fn encodes(&self) -> usize {
    self.encodes.load(Ordering::SeqCst)
  }
}

impl Predictor for DiscPredictor {
  type Embedding = (usize, usize);

  fn encode(&self, image: &NdArray) -> Result<Self::Embedding, String> {
    if self.encodes.fetch_add(1, Ordering::SeqCst) < self.failing {
      return Err("编码器暂不可用".into());
    }
    let shape = image.shape();
    Ok((shape[0], shape[1]))
  }

  fn predict(
    &self,
    &(h, w): &Self::Embedding,
    prompt: &LocalPrompt,
  ) -> Result<Vec<Array2<bool>>, String> {
    let (center, radius) = match prompt {
      LocalPrompt::Points { positive, .. } => (*positive.first().ok_or("没有正点")?, DISC_RADIUS),
      LocalPrompt::Box([x0, y0, x1, y1]) => (
        Point::new((x0 + x1) / 2, (y0 + y1) / 2),
        ((x1 - x0).abs().max((y1 - y0).abs()) / 2).max(1),
      ),
      LocalPrompt::Mask(_) => return Err("掩码提示应在本地拆分".into()),
    };
    Ok(vec![Array2::from_shape_fn((h, w), |(y, x)| {
      let (dx, dy) = (x as i32 - center.x, y as i32 - center.y);
      dx * dx + dy * dy <= radius * radius
    })])
  }
}

pub fn adapter() -> Arc<dyn ModelAdapter> {
  Arc::new(Sam2::from_url(&Url::parse("sam2://tiny").unwrap()).unwrap())
}

pub fn blank(width: usize, height: usize) -> ImageFrame {
  ImageFrame::from_raw(width, height, 3, vec![0; width * height * 3]).unwrap()
}

pub fn local_session(config: SessionConfig) -> SamSession<LocalSession<DiscPredictor>> {
  predictor_session(DiscPredictor::default(), config)
}

pub fn predictor_session(
  predictor: DiscPredictor,
  config: SessionConfig,
) -> SamSession<LocalSession<DiscPredictor>> {
  let remote = LocalSession::new(predictor).with_seed(7);
  SamSession::new(remote, adapter(), config)
}

/// 按脚本回放批量事件的远程会话，非批量命令直接成功
pub struct ScriptedRemote {
  pub commands: Vec<Command>,
  pub total: usize,
  /// 会产生结果的提示序号
  pub finished: Vec<usize>,
  pub stride: u32,
  pub batch_result: fn() -> Result<Outputs, RemoteError>,
  pub count_first: bool,
}

impl ScriptedRemote {
  pub fn new(total: usize, finished: Vec<usize>, stride: u32) -> Self {
    Self {
      commands: Vec::new(),
      total,
      finished,
      stride,
      batch_result: || Err(RemoteError::Canceled),
      count_first: true,
    }
  }

  /// 第 `index` 个提示的结果：第 0 行 `x = index * 10` 处的单个像素
  pub fn marker(index: usize, stride: u32) -> PromptOutput {
    let x = index as u64 * 10;
    let mut output = PromptOutput::default();
    output.push(
      &[Point::new(x as i32, 0)],
      &Rle::from_flat(stride, &[x, 1]).unwrap(),
    );
    output
  }

  pub fn encodes(&self) -> usize {
    self
      .commands
      .iter()
      .filter(|c| matches!(c, Command::Encode { .. }))
      .count()
  }
}

impl RemoteSession for ScriptedRemote {
  fn run_task(
    &mut self,
    command: &Command,
    listener: &mut dyn FnMut(&UpdateEvent),
    _cancel: &CancelToken,
  ) -> Result<Outputs, RemoteError> {
    self.commands.push(command.clone());
    if !matches!(command, Command::Batch(_)) {
      return Ok(Outputs::new());
    }
    if self.count_first {
      listener(&UpdateEvent::total_count(self.total));
    }
    for &index in &self.finished {
      listener(&UpdateEvent::found_contour(
        index,
        &Self::marker(index, self.stride),
      ));
    }
    (self.batch_result)()
  }

  fn is_alive(&self) -> bool {
    true
  }

  fn close(&mut self) {}
}
