// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/remote/local.rs - 进程内远程会话
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

use std::{
  collections::HashMap,
  sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
    mpsc,
  },
  thread,
};

use ndarray::Array2;
use rand::{SeedableRng, rngs::StdRng};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
  command::{BatchCommand, Command, NdArray},
  geometry::Rect,
  mask::{
    PromptOutput,
    trace::{components, label_components, objects_from_mask, sample_interior},
  },
  prompt::LocalPrompt,
  remote::{CancelToken, Outputs, RemoteError, RemoteSession, UpdateEvent},
};

/// 每个标签连通域取的种子点数
const SEEDS_PER_COMPONENT: usize = 3;

/// 进程内的分割网络
///
/// 输入均为编码区域局部坐标，返回与编码图像同尺寸的布尔掩码。
pub trait Predictor: Send + Sync {
  type Embedding: Clone + Send + Sync;

  fn encode(&self, image: &NdArray) -> Result<Self::Embedding, String>;

  fn predict(
    &self,
    embedding: &Self::Embedding,
    prompt: &LocalPrompt,
  ) -> Result<Vec<Array2<bool>>, String>;
}

/// 在本进程内执行命令的远程会话
pub struct LocalSession<P: Predictor> {
  predictor: P,
  current: Option<P::Embedding>,
  snapshots: HashMap<String, P::Embedding>,
  rng: StdRng,
  closed: bool,
}

fn merge(masks: &[Array2<bool>]) -> Option<Array2<bool>> {
  let (first, rest) = masks.split_first()?;
  let mut merged = first.clone();
  for mask in rest {
    if mask.dim() == merged.dim() {
      merged.zip_mut_with(mask, |a, b| *a |= *b);
    }
  }
  Some(merged)
}

fn objects_from_masks(masks: &[Array2<bool>], return_all: bool) -> PromptOutput {
  match merge(masks) {
    Some(merged) => objects_from_mask(merged.view(), return_all),
    None => PromptOutput::default(),
  }
}

fn into_outputs(output: &PromptOutput) -> Outputs {
  match serde_json::to_value(output) {
    Ok(Value::Object(map)) => map,
    _ => Outputs::new(),
  }
}

impl<P: Predictor> LocalSession<P> {
  pub fn new(predictor: P) -> Self {
    Self {
      predictor,
      current: None,
      snapshots: HashMap::new(),
      rng: StdRng::from_os_rng(),
      closed: false,
    }
  }

  /// 固定标签种子点的随机序列
  pub fn with_seed(mut self, seed: u64) -> Self {
    self.rng = StdRng::seed_from_u64(seed);
    self
  }

  pub fn predictor(&self) -> &P {
    &self.predictor
  }

  pub fn snapshot_count(&self) -> usize {
    self.snapshots.len()
  }

  fn embedding(&self) -> Result<&P::Embedding, RemoteError> {
    self
      .current
      .as_ref()
      .ok_or_else(|| RemoteError::Failed("尚未编码图像".into()))
  }

  fn predict_one(
    &self,
    embedding: &P::Embedding,
    prompt: &LocalPrompt,
  ) -> Result<Vec<Array2<bool>>, String> {
    match prompt {
      // 掩码提示按连通域转为框提示
      LocalPrompt::Mask(mask) => {
        let mut masks = Vec::new();
        for component in components(mask.mapv(|v| v > 0).view()) {
          let Some(r) = Rect::bounding(&component.pixels) else {
            continue;
          };
          let bbox = LocalPrompt::Box([r.x, r.y, r.right() - 1, r.bottom() - 1]);
          masks.extend(self.predictor.predict(embedding, &bbox)?);
        }
        Ok(masks)
      }
      other => self.predictor.predict(embedding, other),
    }
  }

  fn answer(&self, prompt: &LocalPrompt, return_all: bool) -> Result<Outputs, RemoteError> {
    let masks = self
      .predict_one(self.embedding()?, prompt)
      .map_err(RemoteError::Failed)?;
    Ok(into_outputs(&objects_from_masks(&masks, return_all)))
  }

  /// 顺序：标签连通域、点、框
  fn batch_prompts(&mut self, batch: &BatchCommand) -> Vec<LocalPrompt> {
    let mut prompts = Vec::new();
    if let Some(labels) = &batch.labels {
      for component in label_components(labels.view()) {
        let seeds = sample_interior(&component, SEEDS_PER_COMPONENT, &mut self.rng);
        prompts.push(LocalPrompt::Points {
          positive: seeds,
          negative: Vec::new(),
        });
      }
    }
    prompts.extend(batch.points.iter().map(|p| LocalPrompt::Points {
      positive: vec![*p],
      negative: Vec::new(),
    }));
    prompts.extend(batch.boxes.iter().map(|b| LocalPrompt::Box(*b)));
    prompts
  }

  fn run_batch(
    &mut self,
    batch: &BatchCommand,
    listener: &mut dyn FnMut(&UpdateEvent),
    cancel: &CancelToken,
  ) -> Result<Outputs, RemoteError> {
    self.embedding()?;
    let prompts = self.batch_prompts(batch);
    let total = prompts.len();
    listener(&UpdateEvent::total_count(total));

    let embedding = self.embedding()?;
    let next = AtomicUsize::new(0);
    let started = AtomicUsize::new(0);
    let failure = Mutex::new(None::<String>);
    let (tx, rx) = mpsc::channel::<(usize, PromptOutput)>();

    thread::scope(|scope| {
      for _ in 0..batch.workers.max(1) {
        let tx = tx.clone();
        let (prompts, next, started, failure) = (&prompts, &next, &started, &failure);
        let this = &*self;
        scope.spawn(move || {
          loop {
            // 已开始的提示不受取消影响
            if cancel.is_cancelled() {
              break;
            }
            let index = next.fetch_add(1, Ordering::SeqCst);
            if index >= prompts.len() {
              break;
            }
            started.fetch_add(1, Ordering::SeqCst);
            match this.predict_one(embedding, &prompts[index]) {
              Ok(masks) => {
                let found = objects_from_masks(&masks, batch.return_all);
                if tx.send((index, found)).is_err() {
                  break;
                }
              }
              Err(message) => {
                if let Ok(mut slot) = failure.lock() {
                  slot.get_or_insert(message);
                }
              }
            }
          }
        });
      }
      drop(tx);
      for (index, found) in rx {
        listener(&UpdateEvent::found_contour(index, &found));
      }
    });

    if let Some(message) = failure.into_inner().ok().flatten() {
      return Err(RemoteError::Failed(message));
    }
    let started = started.into_inner();
    if started < total {
      warn!("批量任务已取消: 完成 {} / {}", started, total);
      return Err(RemoteError::Canceled);
    }
    let mut outputs = Outputs::new();
    outputs.insert("count".into(), Value::String(total.to_string()));
    Ok(outputs)
  }
}

impl<P: Predictor> RemoteSession for LocalSession<P> {
  fn run_task(
    &mut self,
    command: &Command,
    listener: &mut dyn FnMut(&UpdateEvent),
    cancel: &CancelToken,
  ) -> Result<Outputs, RemoteError> {
    if self.closed {
      return Err(RemoteError::Closed);
    }
    debug!("本地执行任务: {}", command.name());
    match command {
      Command::Encode { image } => {
        let embedding = self.predictor.encode(image).map_err(RemoteError::Failed)?;
        self.current = Some(embedding);
        Ok(Outputs::new())
      }
      Command::Points {
        positive,
        negative,
        return_all,
      } => {
        let prompt = LocalPrompt::Points {
          positive: positive.clone(),
          negative: negative.clone(),
        };
        self.answer(&prompt, *return_all)
      }
      Command::Box { bbox, return_all } => self.answer(&LocalPrompt::Box(*bbox), *return_all),
      Command::Mask { mask, return_all } => {
        self.answer(&LocalPrompt::Mask(mask.clone()), *return_all)
      }
      Command::Batch(batch) => self.run_batch(batch, listener, cancel),
      Command::Persist { id } => {
        let embedding = self.embedding()?.clone();
        self.snapshots.insert(id.clone(), embedding);
        Ok(Outputs::new())
      }
      Command::Select { id } => {
        let embedding = self
          .snapshots
          .get(id)
          .cloned()
          .ok_or_else(|| RemoteError::Failed(format!("未知的编码: {}", id)))?;
        self.current = Some(embedding);
        Ok(Outputs::new())
      }
      Command::Delete { id } => {
        self.snapshots.remove(id);
        Ok(Outputs::new())
      }
    }
  }

  fn is_alive(&self) -> bool {
    !self.closed
  }

  fn close(&mut self) {
    self.closed = true;
    self.current = None;
    self.snapshots.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::geometry::Point;

  /// 以提示外接框为掩码的预测器，编码结果为图像尺寸
  struct BoxPredictor;

  impl Predictor for BoxPredictor {
    type Embedding = (usize, usize);

    fn encode(&self, image: &NdArray) -> Result<Self::Embedding, String> {
      let shape = image.shape();
      Ok((shape[0], shape[1]))
    }

    fn predict(
      &self,
      &(h, w): &Self::Embedding,
      prompt: &LocalPrompt,
    ) -> Result<Vec<Array2<bool>>, String> {
      let [x0, y0, x1, y1] = match prompt {
        LocalPrompt::Box(b) => *b,
        LocalPrompt::Points { positive, .. } => {
          let p = positive.first().ok_or("no point")?;
          [p.x - 1, p.y - 1, p.x + 1, p.y + 1]
        }
        LocalPrompt::Mask(_) => return Err("mask".into()),
      };
      Ok(vec![Array2::from_shape_fn((h, w), |(y, x)| {
        (x0..=x1).contains(&(x as i32)) && (y0..=y1).contains(&(y as i32))
      })])
    }
  }

  fn encoded() -> LocalSession<BoxPredictor> {
    let mut session = LocalSession::new(BoxPredictor).with_seed(1);
    let image = NdArray::U8(ndarray::ArrayD::zeros(ndarray::IxDyn(&[32, 32, 3])));
    session
      .run_task(&Command::Encode { image }, &mut |_| {}, &CancelToken::new())
      .unwrap();
    session
  }

  #[test]
  fn prompt_before_encode_fails() {
    let mut session = LocalSession::new(BoxPredictor);
    let cmd = Command::Box {
      bbox: [0, 0, 1, 1],
      return_all: true,
    };
    assert!(matches!(
      session.run_task(&cmd, &mut |_| {}, &CancelToken::new()),
      Err(RemoteError::Failed(_))
    ));
  }

  #[test]
  fn box_prompt_yields_one_object() {
    let mut session = encoded();
    let cmd = Command::Box {
      bbox: [2, 3, 5, 4],
      return_all: true,
    };
    let outputs = session.run_task(&cmd, &mut |_| {}, &CancelToken::new()).unwrap();
    let found = crate::remote::prompt_output(&outputs).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found.rle[0], vec![3 * 32 + 2, 4, 4 * 32 + 2, 4]);
  }

  #[test]
  fn mask_prompt_splits_into_components() {
    let mut session = encoded();
    let mut mask = Array2::<u8>::zeros((32, 32));
    mask[[2, 2]] = 1;
    mask[[20, 20]] = 1;
    let cmd = Command::Mask {
      mask,
      return_all: true,
    };
    let outputs = session.run_task(&cmd, &mut |_| {}, &CancelToken::new()).unwrap();
    assert_eq!(crate::remote::prompt_output(&outputs).unwrap().len(), 2);
  }

  #[test]
  fn batch_reports_count_first_and_every_index() {
    let mut session = encoded();
    let mut labels = Array2::<u16>::zeros((32, 32));
    labels.slice_mut(ndarray::s![10..16, 10..16]).fill(4);
    let batch = BatchCommand {
      points: vec![Point::new(3, 3), Point::new(25, 25)],
      boxes: vec![[1, 20, 4, 28]],
      labels: Some(labels),
      return_all: true,
      workers: 3,
    };
    let mut events = Vec::new();
    session
      .run_task(
        &Command::Batch(batch),
        &mut |e| events.push(e.clone()),
        &CancelToken::new(),
      )
      .unwrap();
    assert_eq!(events[0].count(), Some(4));
    let mut indices: Vec<usize> = events[1..].iter().filter_map(|e| e.index()).collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2, 3]);
  }

  #[test]
  fn cancelled_batch_starts_nothing() {
    let mut session = encoded();
    let cancel = CancelToken::new();
    cancel.cancel();
    let batch = BatchCommand {
      points: vec![Point::new(3, 3); 5],
      boxes: vec![],
      labels: None,
      return_all: true,
      workers: 3,
    };
    let mut found = 0;
    let result = session.run_task(
      &Command::Batch(batch),
      &mut |e| {
        if e.index().is_some() {
          found += 1;
        }
      },
      &cancel,
    );
    assert!(matches!(result, Err(RemoteError::Canceled)));
    assert_eq!(found, 0);
  }

  #[test]
  fn snapshots_restore_embedding() {
    let mut session = encoded();
    let none = CancelToken::new();
    session
      .run_task(&Command::Persist { id: "a".into() }, &mut |_| {}, &none)
      .unwrap();
    let image = NdArray::U8(ndarray::ArrayD::zeros(ndarray::IxDyn(&[8, 8, 3])));
    session
      .run_task(&Command::Encode { image }, &mut |_| {}, &none)
      .unwrap();
    session
      .run_task(&Command::Select { id: "a".into() }, &mut |_| {}, &none)
      .unwrap();
    assert_eq!(session.current, Some((32, 32)));
    session
      .run_task(&Command::Delete { id: "a".into() }, &mut |_| {}, &none)
      .unwrap();
    assert_eq!(session.snapshot_count(), 0);
    assert!(
      session
        .run_task(&Command::Select { id: "a".into() }, &mut |_| {}, &none)
        .is_err()
    );
  }
}
