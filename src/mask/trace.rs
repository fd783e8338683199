// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/mask/trace.rs - 连通域标记、边界跟踪与游程编码
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

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::{
  contours::{BorderType, find_contours},
  definitions::Image,
  region_labelling::{Connectivity, connected_components},
};
use ndarray::{Array2, ArrayView2};
use rand::Rng;

use crate::{
  geometry::Point,
  mask::{PromptOutput, Rle, Run},
};

/// 单个 8 连通域
#[derive(Debug, Clone)]
pub struct Component {
  /// 按光栅顺序排列的像素
  pub pixels: Vec<Point>,
}

impl Component {
  pub fn area(&self) -> usize {
    self.pixels.len()
  }
}

/// 标签按首次出现的光栅顺序从 1 开始编号，0 为背景
fn group(labels: &Image<Luma<u32>>) -> Vec<Component> {
  let mut result: Vec<Component> = Vec::new();
  for (x, y, label) in labels.enumerate_pixels() {
    let Some(index) = (label[0] as usize).checked_sub(1) else {
      continue;
    };
    if index == result.len() {
      result.push(Component { pixels: Vec::new() });
    }
    if let Some(component) = result.get_mut(index) {
      component.pixels.push(Point::new(x as i32, y as i32));
    }
  }
  result
}

fn gray_from(mask: ArrayView2<'_, bool>, pad: u32) -> GrayImage {
  let (h, w) = mask.dim();
  let mut image = GrayImage::new(w as u32 + 2 * pad, h as u32 + 2 * pad);
  for ((y, x), &v) in mask.indexed_iter() {
    if v {
      image.put_pixel(x as u32 + pad, y as u32 + pad, Luma([255]));
    }
  }
  image
}

/// 8 连通域标记，结果按首个像素的光栅顺序排列
pub fn components(mask: ArrayView2<'_, bool>) -> Vec<Component> {
  let labels = connected_components(&gray_from(mask, 0), Connectivity::Eight, Luma([0u8]));
  group(&labels)
}

/// 标签图中每个非零标签各自的连通域，按首个像素的光栅顺序排列
pub fn label_components(labels: ArrayView2<'_, u16>) -> Vec<Component> {
  let (h, w) = labels.dim();
  let image: ImageBuffer<Luma<u16>, Vec<u16>> =
    ImageBuffer::from_fn(w as u32, h as u32, |x, y| Luma([labels[[y as usize, x as usize]]]));
  group(&connected_components(&image, Connectivity::Eight, Luma([0u16])))
}

/// 包含 `start` 的连通域的外边界
///
/// 四周补一圈背景后跟踪，使贴着图像边缘的连通域也有外边界。
pub fn trace_boundary(mask: ArrayView2<'_, bool>, start: Point) -> Vec<Point> {
  let padded = gray_from(mask, 1);
  let target = imageproc::point::Point::new(start.x + 1, start.y + 1);
  find_contours::<i32>(&padded)
    .into_iter()
    .find(|c| c.border_type == BorderType::Outer && c.points.contains(&target))
    .map(|c| {
      c.points
        .iter()
        .map(|p| Point::new(p.x - 1, p.y - 1))
        .collect()
    })
    .unwrap_or_else(|| vec![start])
}

/// 行优先游程编码
pub fn encode_rle(mask: ArrayView2<'_, bool>) -> Rle {
  let (h, w) = mask.dim();
  let mut runs = Vec::new();
  for y in 0..h {
    let mut x = 0;
    while x < w {
      if mask[[y, x]] {
        let begin = x;
        while x < w && mask[[y, x]] {
          x += 1;
        }
        runs.push(Run {
          start: (y * w + begin) as u64,
          len: (x - begin) as u64,
        });
      } else {
        x += 1;
      }
    }
  }
  Rle::new(w as u32, runs)
}

/// 从连通域中随机取至多 `count` 个内部像素（四邻域都在连通域内），
/// 没有内部像素时退而使用任意像素
pub fn sample_interior<R: Rng + ?Sized>(
  component: &Component,
  count: usize,
  rng: &mut R,
) -> Vec<Point> {
  let members: std::collections::HashSet<Point> = component.pixels.iter().copied().collect();
  let interior: Vec<Point> = component
    .pixels
    .iter()
    .copied()
    .filter(|p| {
      [(1, 0), (-1, 0), (0, 1), (0, -1)]
        .iter()
        .all(|(dx, dy)| members.contains(&Point::new(p.x + dx, p.y + dy)))
    })
    .collect();
  let pool = if interior.is_empty() {
    &component.pixels
  } else {
    &interior
  };

  let amount = count.min(pool.len());
  rand::seq::index::sample(rng, pool.len(), amount)
    .into_iter()
    .map(|i| pool[i])
    .collect()
}

/// 把一个二值掩码拆成对象并生成轮廓与 RLE
///
/// `return_all` 为假时只保留面积最大的连通域。
pub fn objects_from_mask(mask: ArrayView2<'_, bool>, return_all: bool) -> PromptOutput {
  let mut found = components(mask);
  if !return_all {
    if let Some(largest) = found.iter().max_by_key(|c| c.area()).cloned() {
      found = vec![largest];
    }
  }

  let (h, w) = mask.dim();
  let mut output = PromptOutput::default();
  for component in found {
    let mut single = Array2::<bool>::from_elem((h, w), false);
    for p in &component.pixels {
      single[[p.y as usize, p.x as usize]] = true;
    }
    let contour = trace_boundary(single.view(), component.pixels[0]);
    output.push(&contour, &encode_rle(single.view()));
  }
  output
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::{SeedableRng, rngs::StdRng};

  fn mask_from(rows: &[&str]) -> Array2<bool> {
    let h = rows.len();
    let w = rows[0].len();
    Array2::from_shape_fn((h, w), |(y, x)| rows[y].as_bytes()[x] == b'#')
  }

  #[test]
  fn traces_square_corners() {
    let mask = mask_from(&["....", ".##.", ".##.", "...."]);
    let mut contour = trace_boundary(mask.view(), Point::new(1, 1));
    assert_eq!(contour[0], Point::new(1, 1));
    contour.sort_unstable_by_key(|p| (p.y, p.x));
    assert_eq!(
      contour,
      vec![Point::new(1, 1), Point::new(2, 1), Point::new(1, 2), Point::new(2, 2)]
    );
  }

  #[test]
  fn traces_components_touching_the_edge() {
    let mask = mask_from(&["##..", "##..", "...#"]);
    let contour = trace_boundary(mask.view(), Point::new(0, 0));
    assert_eq!(contour.len(), 4);
    assert!(contour.contains(&Point::new(0, 1)));
    assert!(!contour.contains(&Point::new(3, 2)));
    assert_eq!(trace_boundary(mask.view(), Point::new(3, 2)), vec![Point::new(3, 2)]);
  }

  #[test]
  fn traces_isolated_pixel() {
    let mask = mask_from(&["...", ".#.", "..."]);
    assert_eq!(trace_boundary(mask.view(), Point::new(1, 1)), vec![Point::new(1, 1)]);
  }

  #[test]
  fn traces_every_boundary_pixel_of_a_cross() {
    let mask = mask_from(&[".#.", "###", ".#."]);
    let contour = trace_boundary(mask.view(), Point::new(1, 0));
    for p in [Point::new(1, 0), Point::new(2, 1), Point::new(1, 2), Point::new(0, 1)] {
      assert!(contour.contains(&p), "missing {:?} in {:?}", p, contour);
    }
  }

  #[test]
  fn labels_split_by_value_and_connectivity() {
    let labels = ndarray::arr2(&[[1u16, 1, 0, 2], [0, 0, 0, 2], [1, 0, 0, 0]]);
    let found = label_components(labels.view());
    assert_eq!(found.len(), 3);
    assert_eq!(found.iter().map(|c| c.area()).collect::<Vec<_>>(), vec![2, 2, 1]);
    assert_eq!(found[2].pixels, vec![Point::new(0, 2)]);
  }

  #[test]
  fn diagonal_pixels_are_one_component() {
    let mask = mask_from(&["#..", ".#.", "..#", "#.."]);
    let found = components(mask.view());
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].pixels, vec![Point::new(0, 0), Point::new(1, 1), Point::new(2, 2)]);
  }

  #[test]
  fn rle_is_row_major() {
    let mask = mask_from(&["##..", "..##"]);
    let rle = encode_rle(mask.view());
    assert_eq!(rle.to_flat(), vec![0, 2, 6, 2]);
  }

  #[test]
  fn sampled_points_belong_to_component() {
    let mask = mask_from(&["#####", "#####", "#####", "#####"]);
    let component = components(mask.view()).remove(0);
    let mut rng = StdRng::seed_from_u64(7);
    let points = sample_interior(&component, 3, &mut rng);
    assert_eq!(points.len(), 3);
    assert!(points.iter().all(|p| (1..4).contains(&p.x) && (1..3).contains(&p.y)));
  }

  #[test]
  fn keeps_only_largest_when_asked() {
    let mask = mask_from(&["#...", "..##", "..##"]);
    assert_eq!(objects_from_mask(mask.view(), true).len(), 2);
    let one = objects_from_mask(mask.view(), false);
    assert_eq!(one.len(), 1);
    assert_eq!(one.rle[0], vec![6, 2, 10, 2]);
  }
}
