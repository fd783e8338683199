// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/remote.rs - 远程推理会话
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

//! 远程推理会话：执行一个命令，返回具名输出，执行过程中可推送更新事件。

use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};

use serde_json::{Map, Value};
use thiserror::Error;

use crate::{command::Command, mask::PromptOutput};

pub mod local;
pub mod process;
pub mod script;
pub mod shm;

/// 批量提示总数事件，负载为十进制字符串
pub const TOTAL_COUNT_TAG: &str = "nc";
/// 单个提示完成事件，负载为提示序号与轮廓、RLE
pub const FOUND_CONTOUR_TAG: &str = "fc";

pub type Outputs = Map<String, Value>;

#[derive(Error, Debug)]
pub enum RemoteError {
  #[error("远程任务已取消")]
  Canceled,
  #[error("远程任务失败: {0}")]
  Failed(String),
  #[error("远程进程崩溃: {0}")]
  Crashed(String),
  #[error("远程任务被中断")]
  Interrupted,
  #[error("IO 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("远程会话已关闭")]
  Closed,
}

/// 任务完成前推送的中间事件
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent {
  pub message: String,
  pub outputs: Outputs,
}

impl UpdateEvent {
  pub fn total_count(count: usize) -> Self {
    let mut outputs = Map::new();
    outputs.insert("count".into(), Value::String(count.to_string()));
    Self {
      message: TOTAL_COUNT_TAG.into(),
      outputs,
    }
  }

  pub fn found_contour(index: usize, output: &PromptOutput) -> Self {
    let mut outputs = match serde_json::to_value(output) {
      Ok(Value::Object(map)) => map,
      _ => Map::new(),
    };
    outputs.insert("index".into(), Value::from(index));
    Self {
      message: FOUND_CONTOUR_TAG.into(),
      outputs,
    }
  }

  /// `nc` 事件中的总数
  pub fn count(&self) -> Option<usize> {
    match self.outputs.get("count")? {
      Value::String(s) => s.trim().parse().ok(),
      Value::Number(n) => n.as_u64().map(|n| n as usize),
      _ => None,
    }
  }

  /// `fc` 事件中的提示序号
  pub fn index(&self) -> Option<usize> {
    self.outputs.get("index")?.as_u64().map(|n| n as usize)
  }

  pub fn prompt_output(&self) -> Result<PromptOutput, RemoteError> {
    prompt_output(&self.outputs)
  }
}

/// 从具名输出中取出轮廓与 RLE
pub fn prompt_output(outputs: &Outputs) -> Result<PromptOutput, RemoteError> {
  let mut picked = Map::new();
  for key in ["contours_x", "contours_y", "rle"] {
    picked.insert(
      key.to_string(),
      outputs.get(key).cloned().unwrap_or(Value::Array(Vec::new())),
    );
  }
  serde_json::from_value(Value::Object(picked))
    .map_err(|e| RemoteError::Failed(format!("无法解析轮廓输出: {}", e)))
}

/// 取消令牌，可跨线程共享
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// 远程推理会话
///
/// 调用阻塞直至任务结束。事件按到达顺序同步传给 `listener`。
/// 只有批量任务会检查 `cancel`。
pub trait RemoteSession {
  fn run_task(
    &mut self,
    command: &Command,
    listener: &mut dyn FnMut(&UpdateEvent),
    cancel: &CancelToken,
  ) -> Result<Outputs, RemoteError>;

  fn is_alive(&self) -> bool;

  fn close(&mut self);
}

impl<R: RemoteSession + ?Sized> RemoteSession for Box<R> {
  fn run_task(
    &mut self,
    command: &Command,
    listener: &mut dyn FnMut(&UpdateEvent),
    cancel: &CancelToken,
  ) -> Result<Outputs, RemoteError> {
    (**self).run_task(command, listener, cancel)
  }

  fn is_alive(&self) -> bool {
    (**self).is_alive()
  }

  fn close(&mut self) {
    (**self).close()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::geometry::Point;
  use crate::mask::Rle;

  #[test]
  fn count_is_decimal_string() {
    let event = UpdateEvent::total_count(12);
    assert_eq!(event.message, TOTAL_COUNT_TAG);
    assert_eq!(event.outputs["count"], Value::String("12".into()));
    assert_eq!(event.count(), Some(12));
  }

  #[test]
  fn found_contour_carries_index_and_output() {
    let mut output = PromptOutput::default();
    output.push(&[Point::new(1, 2)], &Rle::from_flat(4, &[5, 1]).unwrap());
    let event = UpdateEvent::found_contour(3, &output);
    assert_eq!(event.index(), Some(3));
    assert_eq!(event.prompt_output().unwrap(), output);
  }

  #[test]
  fn missing_outputs_decode_as_empty() {
    assert!(prompt_output(&Map::new()).unwrap().is_empty());
  }

  #[test]
  fn cancel_is_shared_between_clones() {
    let token = CancelToken::new();
    let other = token.clone();
    other.cancel();
    assert!(token.is_cancelled());
  }
}
