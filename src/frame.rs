// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/frame.rs - HWC 图像帧定义
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

use image::{DynamicImage, RgbImage};
use ndarray::{Array3, ArrayView3, s};
use thiserror::Error;

use crate::geometry::Rect;

const RGB_CHANNELS: usize = 3;
const GRAY_CHANNELS: usize = 1;

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("图像尺寸无效: {0}x{1}x{2}")]
  InvalidShape(usize, usize, usize),
}

/// 按 (高, 宽, 通道) 存放的 8 位图像
///
/// 会话只持有它的共享引用，从不修改其中的像素。
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
  data: Array3<u8>,
}

impl ImageFrame {
  pub fn from_array(data: Array3<u8>) -> Result<Self, FrameError> {
    let (h, w, c) = data.dim();
    if h == 0 || w == 0 || c == 0 {
      return Err(FrameError::InvalidShape(h, w, c));
    }
    Ok(Self { data })
  }

  pub fn from_raw(
    width: usize,
    height: usize,
    channels: usize,
    raw: Vec<u8>,
  ) -> Result<Self, FrameError> {
    let expected = width * height * channels;
    if raw.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: raw.len(),
      });
    }
    let data = Array3::from_shape_vec((height, width, channels), raw)
      .map_err(|_| FrameError::InvalidShape(height, width, channels))?;
    Self::from_array(data)
  }

  pub fn width(&self) -> usize {
    self.data.dim().1
  }

  pub fn height(&self) -> usize {
    self.data.dim().0
  }

  pub fn channels(&self) -> usize {
    self.data.dim().2
  }

  pub fn bounds(&self) -> Rect {
    Rect::new(0, 0, self.width() as i32, self.height() as i32)
  }

  pub fn view(&self) -> ArrayView3<'_, u8> {
    self.data.view()
  }

  /// 归一化为 1 或 3 个通道：
  /// 2 通道取第一个通道，4 通道及以上取前三个通道
  pub fn normalized(&self) -> ImageFrame {
    let channels = match self.channels() {
      GRAY_CHANNELS | RGB_CHANNELS => return self.clone(),
      2 => GRAY_CHANNELS,
      _ => RGB_CHANNELS,
    };
    let data = self.data.slice(s![.., .., ..channels]).to_owned();
    ImageFrame { data }
  }

  /// 裁剪到 `rect`，`rect` 必须位于图像内部
  pub fn crop(&self, rect: &Rect) -> ImageFrame {
    let r = rect.intersect(&self.bounds());
    let data = self
      .data
      .slice(s![
        r.y as usize..r.bottom() as usize,
        r.x as usize..r.right() as usize,
        ..
      ])
      .to_owned();
    ImageFrame { data }
  }

  /// 按整数步长直接降采样，结果尺寸为 ceil(w / scale) x ceil(h / scale)
  pub fn subsample(&self, scale: u32) -> ImageFrame {
    if scale <= 1 {
      return self.clone();
    }
    let step = scale as isize;
    let data = self.data.slice(s![..;step, ..;step, ..]).to_owned();
    ImageFrame { data }
  }

  /// 转为 3 通道帧，灰度图复制到三个通道
  pub fn to_rgb(&self) -> ImageFrame {
    let normalized = self.normalized();
    if normalized.channels() == RGB_CHANNELS {
      return normalized;
    }
    let (h, w, _) = normalized.data.dim();
    let data = Array3::from_shape_fn((h, w, RGB_CHANNELS), |(y, x, _)| normalized.data[[y, x, 0]]);
    ImageFrame { data }
  }

  /// 转为 RGB 图像，灰度图复制到三个通道
  pub fn to_rgb_image(&self) -> RgbImage {
    let (h, w, c) = self.data.dim();
    RgbImage::from_fn(w as u32, h as u32, |x, y| {
      let (x, y) = (x as usize, y as usize);
      if c >= RGB_CHANNELS {
        image::Rgb([self.data[[y, x, 0]], self.data[[y, x, 1]], self.data[[y, x, 2]]])
      } else {
        image::Rgb([self.data[[y, x, 0]]; RGB_CHANNELS])
      }
    })
  }
}

impl From<DynamicImage> for ImageFrame {
  fn from(image: DynamicImage) -> Self {
    let (channels, width, height, raw) = match image.color().channel_count() {
      1 | 2 => {
        let img = image.to_luma8();
        (GRAY_CHANNELS, img.width(), img.height(), img.into_raw())
      }
      _ => {
        let img = image.to_rgb8();
        (RGB_CHANNELS, img.width(), img.height(), img.into_raw())
      }
    };

    let data = Array3::from_shape_vec((height as usize, width as usize, channels), raw)
      .unwrap_or_else(|_| Array3::zeros((height as usize, width as usize, channels)));
    ImageFrame { data }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ramp(width: usize, height: usize, channels: usize) -> ImageFrame {
    let raw = (0..width * height * channels).map(|v| (v % 251) as u8).collect();
    ImageFrame::from_raw(width, height, channels, raw).unwrap()
  }

  #[test]
  fn normalizes_channel_count() {
    assert_eq!(ramp(4, 4, 4).normalized().channels(), 3);
    assert_eq!(ramp(4, 4, 2).normalized().channels(), 1);
    assert_eq!(ramp(4, 4, 1).normalized().channels(), 1);
  }

  #[test]
  fn subsample_rounds_dimensions_up() {
    let frame = ramp(10, 7, 1).subsample(3);
    assert_eq!((frame.width(), frame.height()), (4, 3));
    assert_eq!(frame.view()[[1, 1, 0]], ramp(10, 7, 1).view()[[3, 3, 0]]);
  }

  #[test]
  fn crop_keeps_pixels_in_place() {
    let frame = ramp(8, 8, 3);
    let crop = frame.crop(&Rect::new(2, 3, 4, 2));
    assert_eq!((crop.width(), crop.height()), (4, 2));
    assert_eq!(crop.view()[[0, 0, 1]], frame.view()[[3, 2, 1]]);
  }

  #[test]
  fn gray_expands_to_rgb() {
    let rgb = ramp(3, 2, 1).to_rgb();
    assert_eq!(rgb.channels(), 3);
    assert_eq!(rgb.view()[[1, 2, 2]], ramp(3, 2, 1).view()[[1, 2, 0]]);
  }

  #[test]
  fn rejects_wrong_length() {
    assert!(matches!(
      ImageFrame::from_raw(3, 3, 3, vec![0; 10]),
      Err(FrameError::LengthMismatch { .. })
    ));
  }
}
