// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/batch.rs - 批量提示编排
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

//! 一次远程往返回答一组提示，并在每个提示完成时回调。
//!
//! 远程端先发送总数事件，再为每个完成的提示发送一个结果事件。取消后未开始的
//! 提示没有结果，汇总时按序号从大到小移除。

use ndarray::Array2;
use tracing::{debug, info, warn};

use crate::{
  command::Command,
  error::SamError,
  geometry::Point,
  mask::MaskContour,
  prompt::BoxPrompt,
  region::EncodedRegion,
  remote::{FOUND_CONTOUR_TAG, RemoteError, RemoteSession, TOTAL_COUNT_TAG, UpdateEvent},
};

pub use crate::remote::CancelToken;

/// 一组提示，坐标均为整幅图像坐标
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchRequest {
  pub points: Vec<Point>,
  pub boxes: Vec<BoxPrompt>,
  /// 与整幅图像同尺寸的实例标签图，0 为背景
  pub labels: Option<Array2<u16>>,
  /// 未指定时使用会话配置
  pub return_all: Option<bool>,
}

impl BatchRequest {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_points(mut self, points: impl IntoIterator<Item = Point>) -> Self {
    self.points.extend(points);
    self
  }

  pub fn with_boxes(mut self, boxes: impl IntoIterator<Item = BoxPrompt>) -> Self {
    self.boxes.extend(boxes);
    self
  }

  pub fn with_labels(mut self, labels: Array2<u16>) -> Self {
    self.labels = Some(labels);
    self
  }

  pub fn with_return_all(mut self, return_all: bool) -> Self {
    self.return_all = Some(return_all);
    self
  }

  pub fn is_empty(&self) -> bool {
    self.points.is_empty()
      && self.boxes.is_empty()
      && self
        .labels
        .as_ref()
        .is_none_or(|l| l.iter().all(|&v| v == 0))
  }

  /// 区域决策使用的点：全部点、框的两个角点与标签的外接框角点
  pub fn anchor_points(&self) -> Vec<Point> {
    let mut anchors = self.points.clone();
    for b in &self.boxes {
      anchors.extend(b.corners());
    }
    if let Some(labels) = &self.labels {
      let (mut x0, mut y0, mut x1, mut y1) = (i32::MAX, i32::MAX, i32::MIN, i32::MIN);
      for ((y, x), &v) in labels.indexed_iter() {
        if v != 0 {
          x0 = x0.min(x as i32);
          y0 = y0.min(y as i32);
          x1 = x1.max(x as i32);
          y1 = y1.max(y as i32);
        }
      }
      if x0 <= x1 {
        anchors.push(Point::new(x0, y0));
        anchors.push(Point::new(x1, y1));
      }
    }
    anchors
  }
}

/// 编排过程中传给调用方的事件
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BatchEvent<'a> {
  /// 提示总数，总在任何结果之前
  Total(usize),
  Found {
    index: usize,
    masks: &'a [MaskContour],
    completed: usize,
    total: usize,
  },
}

pub trait BatchListener {
  fn on_event(&mut self, event: &BatchEvent<'_>);
}

impl<F: FnMut(&BatchEvent<'_>)> BatchListener for F {
  fn on_event(&mut self, event: &BatchEvent<'_>) {
    self(event)
  }
}

/// 不关心进度的调用方使用
pub struct Silent;

impl BatchListener for Silent {
  fn on_event(&mut self, _event: &BatchEvent<'_>) {}
}

/// 单个提示的结果
#[derive(Debug, Clone, PartialEq)]
pub struct PromptResult {
  pub index: usize,
  pub masks: Vec<MaskContour>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
  pub total: usize,
  /// 按提示序号排列，不含被取消的提示
  pub results: Vec<PromptResult>,
  pub cancelled: bool,
}

impl BatchOutcome {
  pub fn masks(&self) -> impl Iterator<Item = &MaskContour> {
    self.results.iter().flat_map(|r| r.masks.iter())
  }

  pub fn into_masks(self) -> Vec<MaskContour> {
    self.results.into_iter().flat_map(|r| r.masks).collect()
  }
}

/// 局部结果到整幅图像结果的转换参数
#[derive(Debug, Clone, Copy)]
pub struct ResultMapping {
  pub region: EncodedRegion,
  pub image_width: u32,
  pub roi_adjust: bool,
  pub return_all: bool,
}

impl ResultMapping {
  pub fn apply(&self, output: &crate::mask::PromptOutput) -> Result<Vec<MaskContour>, SamError> {
    let mut masks = output.to_masks(&self.region, self.image_width)?;
    if self.roi_adjust {
      masks = masks.iter().map(MaskContour::with_roi_adjustment).collect();
    }
    if !self.return_all {
      masks = MaskContour::largest(masks).into_iter().collect();
    }
    Ok(masks)
  }
}

/// 执行批量命令并汇总结果
pub fn run_batch<R: RemoteSession + ?Sized>(
  remote: &mut R,
  command: &Command,
  mapping: &ResultMapping,
  listener: &mut dyn BatchListener,
  cancel: &CancelToken,
) -> Result<BatchOutcome, SamError> {
  let mut slots: Option<Vec<Option<Vec<MaskContour>>>> = None;
  let mut completed = 0usize;
  let mut failure: Option<SamError> = None;

  let mut on_update = |event: &UpdateEvent| {
    if failure.is_some() {
      return;
    }
    match event.message.as_str() {
      TOTAL_COUNT_TAG => {
        let Some(total) = event.count() else {
          failure = Some(protocol_error("总数事件缺少数量"));
          return;
        };
        if slots.is_some() {
          warn!("重复的总数事件被忽略");
          return;
        }
        info!("批量提示总数: {}", total);
        slots = Some(vec![None; total]);
        listener.on_event(&BatchEvent::Total(total));
      }
      FOUND_CONTOUR_TAG => {
        let Some(slots) = slots.as_mut() else {
          failure = Some(protocol_error("结果事件先于总数事件到达"));
          return;
        };
        let total = slots.len();
        let index = match event.index() {
          Some(i) if i < total => i,
          other => {
            failure = Some(protocol_error(&format!("结果序号 {:?} 超出范围 {}", other, total)));
            return;
          }
        };
        let masks = match event
          .prompt_output()
          .map_err(SamError::from)
          .and_then(|output| mapping.apply(&output))
        {
          Ok(masks) => masks,
          Err(e) => {
            failure = Some(e);
            return;
          }
        };
        if slots[index].is_none() {
          completed += 1;
        }
        debug!("提示 {} 完成: {} 个对象 ({}/{})", index, masks.len(), completed, total);
        let stored = slots[index].insert(masks);
        listener.on_event(&BatchEvent::Found {
          index,
          masks: stored.as_slice(),
          completed,
          total,
        });
      }
      other => debug!("忽略更新事件: {}", other),
    }
  };

  let result = remote.run_task(command, &mut on_update, cancel);
  if let Some(e) = failure {
    return Err(e);
  }
  let cancelled = match result {
    Ok(_) => false,
    Err(RemoteError::Canceled) => true,
    Err(e) => return Err(e.into()),
  };

  let slots = slots.unwrap_or_default();
  let total = slots.len();
  let mut unfinished: Vec<usize> = slots
    .iter()
    .enumerate()
    .filter(|(_, s)| s.is_none())
    .map(|(i, _)| i)
    .collect();
  if !unfinished.is_empty() && !cancelled && !cancel.is_cancelled() {
    return Err(protocol_error(&format!(
      "批量任务结束但有 {} 个提示没有结果",
      unfinished.len()
    )));
  }

  let mut results: Vec<PromptResult> = slots
    .into_iter()
    .enumerate()
    .map(|(index, masks)| PromptResult {
      index,
      masks: masks.unwrap_or_default(),
    })
    .collect();
  // 从大到小移除，避免序号错位
  unfinished.sort_unstable_by(|a, b| b.cmp(a));
  for index in &unfinished {
    results.remove(*index);
  }
  if !unfinished.is_empty() {
    warn!("批量任务已取消，{} 个提示未执行", unfinished.len());
  }

  Ok(BatchOutcome {
    total,
    results,
    cancelled: cancelled || !unfinished.is_empty(),
  })
}

fn protocol_error(msg: &str) -> SamError {
  SamError::RemoteTaskFailure(RemoteError::Failed(msg.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::geometry::Rect;

  #[test]
  fn anchors_include_box_corners_and_label_extent() {
    let mut labels = Array2::<u16>::zeros((20, 20));
    labels[[5, 6]] = 2;
    labels[[9, 3]] = 1;
    let req = BatchRequest::new()
      .with_points([Point::new(1, 1)])
      .with_boxes([BoxPrompt::new(10, 12, 4, 2)])
      .with_labels(labels);
    assert_eq!(
      req.anchor_points(),
      vec![
        Point::new(1, 1),
        Point::new(4, 2),
        Point::new(10, 12),
        Point::new(3, 5),
        Point::new(6, 9),
      ]
    );
  }

  #[test]
  fn empty_labels_make_an_empty_request() {
    let req = BatchRequest::new().with_labels(Array2::zeros((4, 4)));
    assert!(req.is_empty());
  }

  #[test]
  fn mapping_keeps_largest_when_asked() {
    let mut output = crate::mask::PromptOutput::default();
    let small = crate::mask::Rle::from_flat(8, &[0, 1]).unwrap();
    let big = crate::mask::Rle::from_flat(8, &[10, 4]).unwrap();
    output.push(&[Point::new(0, 0)], &small);
    output.push(&[Point::new(2, 1)], &big);
    let mapping = ResultMapping {
      region: EncodedRegion::new(Rect::new(0, 0, 8, 8), 1),
      image_width: 8,
      roi_adjust: false,
      return_all: false,
    };
    let masks = mapping.apply(&output).unwrap();
    assert_eq!(masks.len(), 1);
    assert_eq!(masks[0].area(), 4);
  }
}
