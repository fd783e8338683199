// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/mask.rs - 掩码与轮廓结果
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

pub mod trace;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
  geometry::{Point, Rect},
  region::EncodedRegion,
};

#[derive(Error, Debug, PartialEq)]
pub enum MaskError {
  #[error("轮廓坐标长度不一致: x {0}, y {1}")]
  ContourLengthMismatch(usize, usize),
  #[error("对象数量不一致: 轮廓 {contours}, RLE {rles}")]
  ObjectCountMismatch { contours: usize, rles: usize },
  #[error("RLE 数组长度必须为偶数，实际为 {0}")]
  OddRleLength(usize),
}

/// 一段连续像素，`start` 为按行展开的线性下标
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Run {
  pub start: u64,
  pub len: u64,
}

/// 行优先的游程编码掩码
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rle {
  stride: u32,
  runs: Vec<Run>,
}

impl Rle {
  /// 构造时排序并合并相邻游程
  pub fn new(stride: u32, runs: Vec<Run>) -> Self {
    let mut rle = Self { stride, runs };
    rle.normalize();
    rle
  }

  /// 由 `[start, len, start, len, ...]` 形式的扁平数组构造
  pub fn from_flat(stride: u32, flat: &[u64]) -> Result<Self, MaskError> {
    if flat.len() % 2 != 0 {
      return Err(MaskError::OddRleLength(flat.len()));
    }
    let runs = flat
      .chunks_exact(2)
      .map(|c| Run {
        start: c[0],
        len: c[1],
      })
      .collect();
    Ok(Self::new(stride, runs))
  }

  pub fn to_flat(&self) -> Vec<u64> {
    self.runs.iter().flat_map(|r| [r.start, r.len]).collect()
  }

  pub fn stride(&self) -> u32 {
    self.stride
  }

  pub fn runs(&self) -> &[Run] {
    &self.runs
  }

  pub fn area(&self) -> u64 {
    self.runs.iter().map(|r| r.len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.runs.is_empty()
  }

  pub fn contains(&self, index: u64) -> bool {
    let pos = self.runs.partition_point(|r| r.start <= index);
    pos > 0 && index < self.runs[pos - 1].start + self.runs[pos - 1].len
  }

  pub fn contains_xy(&self, x: i32, y: i32) -> bool {
    if x < 0 || y < 0 || x as u32 >= self.stride {
      return false;
    }
    self.contains(y as u64 * self.stride as u64 + x as u64)
  }

  /// 按行拆分的游程 `(x, y, len)`
  pub fn row_segments(&self) -> Vec<(u32, u32, u32)> {
    let stride = self.stride as u64;
    let mut segments = Vec::with_capacity(self.runs.len());
    if stride == 0 {
      return segments;
    }
    for run in &self.runs {
      let mut start = run.start;
      let mut left = run.len;
      while left > 0 {
        let x = start % stride;
        let len = left.min(stride - x);
        segments.push((x as u32, (start / stride) as u32, len as u32));
        start += len;
        left -= len;
      }
    }
    segments
  }

  fn normalize(&mut self) {
    self.runs.retain(|r| r.len > 0);
    self.runs.sort_unstable();
    let mut merged: Vec<Run> = Vec::with_capacity(self.runs.len());
    for run in self.runs.drain(..) {
      match merged.last_mut() {
        Some(last) if run.start <= last.start + last.len => {
          let end = (last.start + last.len).max(run.start + run.len);
          last.len = end - last.start;
        }
        _ => merged.push(run),
      }
    }
    self.runs = merged;
  }
}

/// 单个对象的分割结果：轮廓多边形与全分辨率游程掩码
///
/// 两种表示描述同一像素集合，坐标均为整幅图像坐标。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskContour {
  contour: Vec<Point>,
  rle: Rle,
}

impl MaskContour {
  pub fn new(contour: Vec<Point>, rle: Rle) -> Self {
    Self { contour, rle }
  }

  pub fn contour(&self) -> &[Point] {
    &self.contour
  }

  pub fn rle(&self) -> &Rle {
    &self.rle
  }

  pub fn area(&self) -> u64 {
    self.rle.area()
  }

  pub fn bounding_box(&self) -> Option<Rect> {
    Rect::bounding(&self.contour)
  }

  /// 从编码区域的局部坐标映射回整幅图像坐标
  ///
  /// 局部的一个像素对应 `scale x scale` 的块，游程按行复制 `scale` 次，
  /// 超出区域右侧和下侧的部分被裁掉。
  pub fn remap(&self, region: &EncodedRegion, image_width: u32) -> MaskContour {
    let scale = region.scale() as i32;
    let origin = region.origin();
    let contour = self
      .contour
      .iter()
      .map(|p| Point::new(p.x * scale + origin.x, p.y * scale + origin.y))
      .collect();

    let rect = region.rect();
    let mut runs = Vec::new();
    for (x, y, len) in self.rle.row_segments() {
      let full_x = x as i64 * scale as i64 + origin.x as i64;
      let full_end = (full_x + len as i64 * scale as i64).min(rect.right() as i64);
      if full_end <= full_x {
        continue;
      }
      for k in 0..scale as i64 {
        let row = y as i64 * scale as i64 + k + origin.y as i64;
        if row >= rect.bottom() as i64 {
          break;
        }
        runs.push(Run {
          start: (row * image_width as i64 + full_x) as u64,
          len: (full_end - full_x) as u64,
        });
      }
    }

    MaskContour {
      contour,
      rle: Rle::new(image_width, runs),
    }
  }

  /// ROI 兼容调整：把位于右侧或下侧边界的顶点移到像素外角
  pub fn with_roi_adjustment(&self) -> MaskContour {
    let contour = self
      .contour
      .iter()
      .map(|p| {
        let dx = i32::from(!self.rle.contains_xy(p.x + 1, p.y));
        let dy = i32::from(!self.rle.contains_xy(p.x, p.y + 1));
        Point::new(p.x + dx, p.y + dy)
      })
      .collect();
    MaskContour {
      contour,
      rle: self.rle.clone(),
    }
  }

  /// 面积最大的结果
  pub fn largest(results: Vec<MaskContour>) -> Option<MaskContour> {
    results.into_iter().max_by_key(|m| m.area())
  }
}

/// 远程一次提示返回的局部坐标结果，即轮廓与 RLE 的传输格式
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptOutput {
  pub contours_x: Vec<Vec<i32>>,
  pub contours_y: Vec<Vec<i32>>,
  pub rle: Vec<Vec<u64>>,
}

impl PromptOutput {
  pub fn len(&self) -> usize {
    self.rle.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rle.is_empty()
  }

  pub fn push(&mut self, contour: &[Point], rle: &Rle) {
    self.contours_x.push(contour.iter().map(|p| p.x).collect());
    self.contours_y.push(contour.iter().map(|p| p.y).collect());
    self.rle.push(rle.to_flat());
  }

  /// 解析局部结果并映射回整幅图像坐标
  pub fn to_masks(
    &self,
    region: &EncodedRegion,
    image_width: u32,
  ) -> Result<Vec<MaskContour>, MaskError> {
    if self.contours_x.len() != self.contours_y.len() || self.contours_x.len() != self.rle.len() {
      return Err(MaskError::ObjectCountMismatch {
        contours: self.contours_x.len().min(self.contours_y.len()),
        rles: self.rle.len(),
      });
    }

    let local_width = region.local_width();
    self
      .contours_x
      .iter()
      .zip(&self.contours_y)
      .zip(&self.rle)
      .map(|((xs, ys), flat)| {
        if xs.len() != ys.len() {
          return Err(MaskError::ContourLengthMismatch(xs.len(), ys.len()));
        }
        let contour = xs.iter().zip(ys).map(|(&x, &y)| Point::new(x, y)).collect();
        let rle = Rle::from_flat(local_width, flat)?;
        Ok(MaskContour::new(contour, rle).remap(region, image_width))
      })
      .collect()
  }
}

/// 把结果绘制成实例标签图，第 i 个结果的标签为 i + 1
pub fn render_labels(results: &[MaskContour], width: usize, height: usize) -> Array2<u16> {
  let mut labels = Array2::<u16>::zeros((height, width));
  for (i, m) in results.iter().enumerate() {
    let label = u16::try_from(i + 1).unwrap_or(u16::MAX);
    for (x, y, len) in m.rle().row_segments() {
      let (x, y) = (x as usize, y as usize);
      if y >= height {
        continue;
      }
      for px in x..(x + len as usize).min(width) {
        labels[[y, px]] = label;
      }
    }
  }
  labels
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rle_merges_and_answers_membership() {
    let rle = Rle::from_flat(10, &[12, 3, 5, 2, 15, 1]).unwrap();
    assert_eq!(rle.runs(), &[Run { start: 5, len: 2 }, Run { start: 12, len: 4 }]);
    assert!(rle.contains(15));
    assert!(!rle.contains(16));
    assert!(rle.contains_xy(2, 1));
    assert!(!rle.contains_xy(-1, 0));
    assert_eq!(rle.area(), 6);
  }

  #[test]
  fn row_segments_split_wrapping_runs() {
    let rle = Rle::new(4, vec![Run { start: 2, len: 5 }]);
    assert_eq!(rle.row_segments(), vec![(2, 0, 2), (0, 1, 3)]);
  }

  #[test]
  fn remap_without_scale_translates() {
    let region = EncodedRegion::new(Rect::new(100, 50, 10, 10), 1);
    let local = MaskContour::new(
      vec![Point::new(1, 1), Point::new(2, 1)],
      Rle::new(10, vec![Run { start: 11, len: 2 }]),
    );
    let full = local.remap(&region, 1000);
    assert_eq!(full.contour(), &[Point::new(101, 51), Point::new(102, 51)]);
    assert_eq!(full.rle().runs(), &[Run { start: 51 * 1000 + 101, len: 2 }]);
  }

  #[test]
  fn remap_with_scale_expands_rows() {
    // 区域 5x5，缩放 2，局部宽度 3
    let region = EncodedRegion::new(Rect::new(10, 20, 5, 5), 2);
    assert_eq!(region.local_width(), 3);
    let local = MaskContour::new(
      vec![Point::new(2, 2)],
      Rle::new(3, vec![Run { start: 3 + 1, len: 2 }, Run { start: 6 + 2, len: 1 }]),
    );
    let full = local.remap(&region, 100);
    assert_eq!(full.contour(), &[Point::new(14, 24)]);
    // 第 1 行: x=1..3 -> 全图 x=12..15 (裁到区域右边界 15)，行 22 与 23
    // 第 2 行: x=2 -> 全图 x=14..15，只剩行 24（行 25 超出区域）
    assert_eq!(
      full.rle().runs(),
      &[
        Run { start: 22 * 100 + 12, len: 3 },
        Run { start: 23 * 100 + 12, len: 3 },
        Run { start: 24 * 100 + 14, len: 1 },
      ]
    );
  }

  #[test]
  fn roi_adjustment_moves_far_edges_outward() {
    let mut runs = Vec::new();
    for y in 2..5u64 {
      runs.push(Run { start: y * 10 + 2, len: 3 });
    }
    let m = MaskContour::new(
      vec![Point::new(2, 2), Point::new(4, 2), Point::new(4, 4), Point::new(2, 4)],
      Rle::new(10, runs),
    );
    assert_eq!(
      m.with_roi_adjustment().contour(),
      &[Point::new(2, 2), Point::new(5, 2), Point::new(5, 5), Point::new(2, 5)]
    );
  }

  #[test]
  fn prompt_output_rejects_inconsistent_arrays() {
    let region = EncodedRegion::new(Rect::new(0, 0, 4, 4), 1);
    let bad = PromptOutput {
      contours_x: vec![vec![0, 1]],
      contours_y: vec![vec![0]],
      rle: vec![vec![0, 1]],
    };
    assert_eq!(
      bad.to_masks(&region, 4),
      Err(MaskError::ContourLengthMismatch(2, 1))
    );
  }

  #[test]
  fn labels_render_in_order() {
    let a = MaskContour::new(vec![], Rle::new(4, vec![Run { start: 0, len: 2 }]));
    let b = MaskContour::new(vec![], Rle::new(4, vec![Run { start: 5, len: 1 }]));
    let labels = render_labels(&[a, b], 4, 2);
    assert_eq!(labels[[0, 0]], 1);
    assert_eq!(labels[[0, 1]], 1);
    assert_eq!(labels[[1, 1]], 2);
    assert_eq!(labels[[1, 2]], 0);
  }
}
