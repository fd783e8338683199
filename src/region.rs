// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/region.rs - 编码区域状态机
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

//! 决定在回答一个提示之前需要（重新）编码图像的哪一部分。
//!
//! 分割质量取决于目标尺寸与编码图像尺寸之比，小目标在大编码图像中会丢失分辨率；
//! 而编码本身耗时数秒。这里的阈值都来自 [`RegionPolicy`]，可按需调整。

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
  config::RegionPolicy,
  error::SamError,
  geometry::{Point, Rect, ceil_div},
};

/// 远程模型当前已经编码的区域
///
/// 局部坐标为 `ceil((全图坐标 - origin) / scale)`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedRegion {
  rect: Rect,
  scale: u32,
}

impl EncodedRegion {
  pub fn new(rect: Rect, scale: u32) -> Self {
    Self {
      rect,
      scale: scale.max(1),
    }
  }

  pub fn rect(&self) -> Rect {
    self.rect
  }

  pub fn origin(&self) -> Point {
    Point::new(self.rect.x, self.rect.y)
  }

  pub fn scale(&self) -> u32 {
    self.scale
  }

  pub fn local_width(&self) -> u32 {
    ceil_div(self.rect.width as i64, self.scale as i64) as u32
  }

  pub fn local_height(&self) -> u32 {
    ceil_div(self.rect.height as i64, self.scale as i64) as u32
  }

  pub fn to_local(&self, p: Point) -> Point {
    let s = self.scale as i64;
    Point::new(
      ceil_div((p.x - self.rect.x) as i64, s) as i32,
      ceil_div((p.y - self.rect.y) as i64, s) as i32,
    )
  }

  pub fn to_full(&self, p: Point) -> Point {
    let s = self.scale as i32;
    Point::new(p.x * s + self.rect.x, p.y * s + self.rect.y)
  }

  /// 区域是否完全位于图像内部
  pub fn within(&self, image: &Rect) -> bool {
    image.contains_rect(&self.rect)
  }
}

/// 编码状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegionState {
  /// 尚未设置图像
  #[default]
  Unset,
  /// 整幅图像以原始分辨率编码
  FullyEncoded(EncodedRegion),
  /// 只编码了图像的一部分（或经过降采样）
  PartiallyEncoded(EncodedRegion),
  /// 图像过大且尚未选择区域
  TooLargeUnencoded,
}

impl RegionState {
  pub fn region(&self) -> Option<&EncodedRegion> {
    match self {
      RegionState::FullyEncoded(r) | RegionState::PartiallyEncoded(r) => Some(r),
      _ => None,
    }
  }

  /// 编码完成后的新状态
  pub fn encoded(region: EncodedRegion, image: &Rect) -> Self {
    if region.rect == *image && region.scale == 1 {
      RegionState::FullyEncoded(region)
    } else {
      RegionState::PartiallyEncoded(region)
    }
  }

  /// 掩码提示必须与当前编码区域的局部尺寸一致
  pub fn check_mask(&self, width: usize, height: usize) -> Result<EncodedRegion, SamError> {
    let region = self
      .region()
      .ok_or_else(|| SamError::invalid("当前没有已编码的区域，无法使用掩码提示"))?;
    if width != region.local_width() as usize || height != region.local_height() as usize {
      return Err(SamError::invalid(format!(
        "掩码尺寸 {}x{} 与当前编码区域 {}x{} 不一致",
        width,
        height,
        region.local_width(),
        region.local_height()
      )));
    }
    Ok(*region)
  }
}

/// 区域决策结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
  Keep,
  Encode(EncodedRegion),
}

impl RegionPolicy {
  /// 图像能否整体编码
  pub fn fits_whole(&self, image: &Rect) -> bool {
    image.area() <= self.max_area && image.width.max(image.height) <= self.max_side
  }

  /// 使裁剪区域短边不超过工作尺寸的最小整数降采样倍数
  pub fn working_scale(&self, rect: &Rect) -> u32 {
    let short = rect.width.min(rect.height).max(1) as i64;
    ceil_div(short, self.max_working_side.max(1) as i64).max(1) as u32
  }

  pub fn region_for(&self, rect: Rect) -> EncodedRegion {
    EncodedRegion::new(rect, self.working_scale(&rect))
  }

  /// 框的短边相对编码区域对应边过小
  pub fn needs_more_resolution(&self, bbox: &Rect, region: &EncodedRegion) -> bool {
    let r = region.rect();
    let (short, side) = if bbox.width <= bbox.height {
      (bbox.width, r.width)
    } else {
      (bbox.height, r.height)
    };
    (short.max(1) as f64) * self.resolution_ratio < side as f64
  }

  /// 框的四个角点都落在编码区域内
  pub fn is_area_encoded(&self, bbox: &Rect, region: &EncodedRegion) -> bool {
    let r = region.rect();
    [
      Point::new(bbox.x, bbox.y),
      Point::new(bbox.right(), bbox.y),
      Point::new(bbox.x, bbox.bottom()),
      Point::new(bbox.right(), bbox.bottom()),
    ]
    .into_iter()
    .all(|p| r.contains_point(p))
  }

  /// 以框为中心的候选编码区域
  ///
  /// 近似正方形的框得到边长约为框长边 3 倍的正方形区域；
  /// 细长框保持长宽比，长边约为框长边的 10 倍。
  pub fn box_region(&self, bbox: &Rect, image: &Rect) -> EncodedRegion {
    let long = bbox.width.max(bbox.height).max(1) as f64;
    let short = bbox.width.min(bbox.height).max(1) as f64;

    let (width, height) = if long / short < self.square_aspect {
      let side = (long * self.square_box_region_ratio).ceil() as i32;
      (side, side)
    } else {
      let long_side = long * self.box_region_ratio;
      let short_side = (long_side * short / long).ceil() as i32;
      let long_side = long_side.ceil() as i32;
      if bbox.width >= bbox.height {
        (long_side, short_side)
      } else {
        (short_side, long_side)
      }
    };

    let width = width.max(self.min_side).min(image.width);
    let height = height.max(self.min_side).min(image.height);
    let c = bbox.center();
    let rect = Rect::new(c.x - width / 2, c.y - height / 2, width, height).fit_within(image);
    self.region_for(rect)
  }

  /// 向外扩展 `extend_fraction`，每侧不少于 `margin`，并裁剪到图像内
  pub fn extend(&self, rect: &Rect, image: &Rect) -> Rect {
    let dx = ((rect.width as f64 * self.extend_fraction).ceil() as i32).max(self.margin);
    let dy = ((rect.height as f64 * self.extend_fraction).ceil() as i32).max(self.margin);
    rect.expand(dx, dy).intersect(image)
  }

  /// 点提示所需的最小区域
  pub fn needed_rect(&self, points: &[Point], roi: Option<&Rect>, image: &Rect) -> Option<Rect> {
    let base = match roi {
      Some(roi) => roi.intersect(image),
      None => {
        let bbox = Rect::bounding(points)?;
        let px = ((bbox.width as f64 * self.point_pad_fraction).ceil() as i32).max(self.margin);
        let py = ((bbox.height as f64 * self.point_pad_fraction).ceil() as i32).max(self.margin);
        bbox.expand(px, py)
      }
    };
    Some(base.grow_to(self.min_side, self.min_side).fit_within(image))
  }

  fn oversized(&self, current: &Rect, needed: &Rect) -> bool {
    current.width as f64 > needed.width as f64 * self.oversize_ratio
      || current.height as f64 > needed.height as f64 * self.oversize_ratio
  }

  /// 框提示的区域决策
  pub fn decide_for_box(
    &self,
    state: &RegionState,
    image: &Rect,
    bbox: &Rect,
  ) -> Result<Decision, SamError> {
    if !image.contains_point(Point::new(bbox.x, bbox.y))
      || !image.contains_point(Point::new(bbox.right(), bbox.bottom()))
    {
      return Err(SamError::invalid(format!(
        "框 {:?} 位于可编码区域之外",
        bbox
      )));
    }

    let current = match state {
      RegionState::Unset => return Err(SamError::invalid("尚未设置图像")),
      RegionState::TooLargeUnencoded => {
        return Ok(Decision::Encode(self.box_region(bbox, image)));
      }
      RegionState::FullyEncoded(r) | RegionState::PartiallyEncoded(r) => r,
    };

    let needs_more = self.needs_more_resolution(bbox, current);
    let encoded = self.is_area_encoded(bbox, current);
    debug!(
      "框 {:?}: 分辨率不足={}, 已编码={}, 当前区域={:?}",
      bbox, needs_more, encoded, current
    );
    if !needs_more && encoded {
      return Ok(Decision::Keep);
    }

    let candidate = self.box_region(bbox, image);
    if candidate == *current {
      Ok(Decision::Keep)
    } else {
      Ok(Decision::Encode(candidate))
    }
  }

  /// 点提示的区域决策
  ///
  /// 当前区域部分编码时，先求出所需区域与当前区域的扩展区域：
  /// 扩展区域容纳所需区域且当前区域相对所需区域不过大时，点全在当前区域内则保留，
  /// 否则改编码扩展区域；其余情况（容纳不下，或当前区域过大）都改编码所需区域。
  pub fn decide_for_points(
    &self,
    state: &RegionState,
    image: &Rect,
    points: &[Point],
    roi: Option<&Rect>,
  ) -> Result<Decision, SamError> {
    if points.is_empty() {
      return Err(SamError::invalid("至少需要一个点"));
    }
    let bounds = match roi {
      Some(roi) => {
        let r = roi.intersect(image);
        if r.is_empty() {
          return Err(SamError::invalid(format!("感兴趣区域 {:?} 与图像不相交", roi)));
        }
        r
      }
      None => *image,
    };
    if let Some(p) = points.iter().find(|p| !bounds.contains_point(**p)) {
      return Err(SamError::invalid(format!(
        "点 ({}, {}) 位于可编码区域之外",
        p.x, p.y
      )));
    }

    let needed = self
      .needed_rect(points, roi, image)
      .ok_or_else(|| SamError::invalid("至少需要一个点"))?;

    let current = match state {
      RegionState::Unset => return Err(SamError::invalid("尚未设置图像")),
      RegionState::FullyEncoded(_) => return Ok(Decision::Keep),
      RegionState::TooLargeUnencoded => return Ok(Decision::Encode(self.region_for(needed))),
      RegionState::PartiallyEncoded(r) => r,
    };

    let rect = current.rect();
    let extended = self.extend(&rect, image);
    let needed_extended = self.extend(&needed, image);
    let fits = extended.contains_rect(&needed);
    let oversized = self.oversized(&rect, &needed_extended);
    let inside = points.iter().all(|p| rect.contains_point(*p));
    debug!(
      "点提示: 所需区域={:?}, 扩展区域={:?}, 容纳={}, 过大={}, 点在区域内={}",
      needed, extended, fits, oversized, inside
    );

    if fits && !oversized && inside {
      Ok(Decision::Keep)
    } else if fits && !oversized {
      Ok(Decision::Encode(self.region_for(extended)))
    } else {
      Ok(Decision::Encode(self.region_for(needed)))
    }
  }

  /// 批量提示的区域决策：以全部点与框角点作为点提示
  pub fn decide_for_batch(
    &self,
    state: &RegionState,
    image: &Rect,
    points: &[Point],
  ) -> Result<Decision, SamError> {
    if let Some(region) = state.region() {
      if points.iter().all(|p| region.rect().contains_point(*p)) {
        return Ok(Decision::Keep);
      }
    }
    self.decide_for_points(state, image, points, None)
  }
}
