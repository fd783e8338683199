// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/geometry.rs - 点与矩形
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

use serde::{Deserialize, Serialize};

/// 像素坐标点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
  pub x: i32,
  pub y: i32,
}

impl Point {
  pub const fn new(x: i32, y: i32) -> Self {
    Self { x, y }
  }
}

impl From<[i32; 2]> for Point {
  fn from([x, y]: [i32; 2]) -> Self {
    Self { x, y }
  }
}

/// 轴对齐矩形，`x`/`y` 为左上角，右下边界不包含在内
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
  pub x: i32,
  pub y: i32,
  pub width: i32,
  pub height: i32,
}

impl Rect {
  pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
  }

  /// 由两个角点构造，角点顺序无关
  pub fn from_corners(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
    Self {
      x: x0.min(x1),
      y: y0.min(y1),
      width: (x1 - x0).abs(),
      height: (y1 - y0).abs(),
    }
  }

  /// 覆盖全部点的最小矩形（按像素计，宽高至少为 1）
  pub fn bounding<'a>(points: impl IntoIterator<Item = &'a Point>) -> Option<Self> {
    let mut iter = points.into_iter();
    let first = iter.next()?;
    let (mut x0, mut y0, mut x1, mut y1) = (first.x, first.y, first.x, first.y);
    for p in iter {
      x0 = x0.min(p.x);
      y0 = y0.min(p.y);
      x1 = x1.max(p.x);
      y1 = y1.max(p.y);
    }
    Some(Self::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1))
  }

  pub fn right(&self) -> i32 {
    self.x + self.width
  }

  pub fn bottom(&self) -> i32 {
    self.y + self.height
  }

  pub fn area(&self) -> i64 {
    self.width as i64 * self.height as i64
  }

  pub fn is_empty(&self) -> bool {
    self.width <= 0 || self.height <= 0
  }

  pub fn center(&self) -> Point {
    Point::new(self.x + self.width / 2, self.y + self.height / 2)
  }

  pub fn contains_point(&self, p: Point) -> bool {
    p.x >= self.x && p.x < self.right() && p.y >= self.y && p.y < self.bottom()
  }

  pub fn contains_rect(&self, other: &Rect) -> bool {
    other.x >= self.x
      && other.y >= self.y
      && other.right() <= self.right()
      && other.bottom() <= self.bottom()
  }

  /// 四周各向外扩展
  pub fn expand(&self, dx: i32, dy: i32) -> Self {
    Self::new(
      self.x - dx,
      self.y - dy,
      self.width + 2 * dx,
      self.height + 2 * dy,
    )
  }

  /// 与另一个矩形求交，不相交时返回空矩形
  pub fn intersect(&self, other: &Rect) -> Self {
    let x0 = self.x.max(other.x);
    let y0 = self.y.max(other.y);
    let x1 = self.right().min(other.right());
    let y1 = self.bottom().min(other.bottom());
    Self::new(x0, y0, (x1 - x0).max(0), (y1 - y0).max(0))
  }

  /// 以中心为基准把宽高放大到至少 `min_width` x `min_height`
  pub fn grow_to(&self, min_width: i32, min_height: i32) -> Self {
    let width = self.width.max(min_width);
    let height = self.height.max(min_height);
    let c = self.center();
    Self::new(c.x - width / 2, c.y - height / 2, width, height)
  }

  /// 平移到 `bounds` 内部，尺寸超出时收缩到 `bounds`
  pub fn fit_within(&self, bounds: &Rect) -> Self {
    let width = self.width.min(bounds.width);
    let height = self.height.min(bounds.height);
    let x = self.x.clamp(bounds.x, bounds.right() - width);
    let y = self.y.clamp(bounds.y, bounds.bottom() - height);
    Self::new(x, y, width, height)
  }
}

/// 向上取整的整数除法，分子可以为负
pub fn ceil_div(a: i64, b: i64) -> i64 {
  let q = a / b;
  if a % b != 0 && ((a > 0) == (b > 0)) {
    q + 1
  } else {
    q
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ceil_div_rounds_towards_positive_infinity() {
    assert_eq!(ceil_div(7, 2), 4);
    assert_eq!(ceil_div(8, 2), 4);
    assert_eq!(ceil_div(-7, 2), -3);
    assert_eq!(ceil_div(0, 3), 0);
  }

  #[test]
  fn bounding_covers_every_point() {
    let pts = [Point::new(3, 9), Point::new(10, 2), Point::new(5, 5)];
    let r = Rect::bounding(&pts).unwrap();
    assert_eq!(r, Rect::new(3, 2, 8, 8));
    assert!(pts.iter().all(|p| r.contains_point(*p)));
    assert!(Rect::bounding(&[]).is_none());
  }

  #[test]
  fn fit_within_shifts_before_shrinking() {
    let bounds = Rect::new(0, 0, 100, 100);
    assert_eq!(
      Rect::new(-10, 90, 30, 30).fit_within(&bounds),
      Rect::new(0, 70, 30, 30)
    );
    assert_eq!(
      Rect::new(-10, -10, 300, 50).fit_within(&bounds),
      Rect::new(0, 0, 100, 50)
    );
  }

  #[test]
  fn grow_to_keeps_center() {
    let r = Rect::new(40, 40, 20, 20).grow_to(100, 60);
    assert_eq!(r, Rect::new(0, 20, 100, 60));
    assert_eq!(r.center(), Point::new(50, 50));
  }

  #[test]
  fn from_corners_normalizes() {
    assert_eq!(
      Rect::from_corners(1010, 1010, 1000, 1000),
      Rect::new(1000, 1000, 10, 10)
    );
  }
}
