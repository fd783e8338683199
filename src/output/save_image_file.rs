// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/output/save_image_file.rs - 保存标注图像文件
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

use std::path::Path;

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, frame::ImageFrame, mask::MaskContour, output::Render,
};

const PALETTE_SIZE: usize = 24;
const FILL_ALPHA: f32 = 0.4;

/// `image:///path/to/out.png?fill=0`
pub struct SaveImageFileOutput {
  path: String,
  fill: bool,
  colors: Vec<Rgb<u8>>,
}

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(image::ImageError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    let fill = !uri
      .query_pairs()
      .any(|(k, v)| k == "fill" && (v == "0" || v == "false"));

    Ok(SaveImageFileOutput {
      path: uri.path().to_string(),
      fill,
      colors: (0..PALETTE_SIZE)
        .map(|i| hsv_to_rgb(i as f32 * 360.0 / PALETTE_SIZE as f32, 0.8, 0.9))
        .collect(),
    })
  }
}

/// HSV 转 RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}

impl SaveImageFileOutput {
  fn draw(&self, image: &mut RgbImage, result: &[MaskContour]) {
    let (width, height) = image.dimensions();
    for (i, mask) in result.iter().enumerate() {
      let color = self.colors[i % self.colors.len()];

      if self.fill {
        for (x, y, len) in mask.rle().row_segments() {
          if y >= height {
            continue;
          }
          for px in x..(x + len).min(width) {
            let p = image.get_pixel_mut(px, y);
            for c in 0..3 {
              p[c] = (p[c] as f32 * (1.0 - FILL_ALPHA) + color[c] as f32 * FILL_ALPHA) as u8;
            }
          }
        }
      }

      let contour = mask.contour();
      if contour.len() == 1 {
        let p = contour[0];
        if p.x >= 0 && p.y >= 0 && (p.x as u32) < width && (p.y as u32) < height {
          image.put_pixel(p.x as u32, p.y as u32, color);
        }
        continue;
      }
      for (a, b) in contour.iter().zip(contour.iter().cycle().skip(1)) {
        draw_line_segment_mut(image, (a.x as f32, a.y as f32), (b.x as f32, b.y as f32), color);
      }
    }
  }

  fn save_image(&self, image: RgbImage) -> Result<(), SaveImageFileError> {
    if let Some(parent) = Path::new(&self.path).parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent).map_err(SaveImageFileError::IoError)?;
    }

    image
      .save(&self.path)
      .map_err(SaveImageFileError::ImageError)?;

    info!("保存图像到文件: {}", self.path);

    Ok(())
  }
}

impl Render for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(&self, frame: &ImageFrame, result: &[MaskContour]) -> Result<(), Self::Error> {
    let mut image = frame.to_rgb_image();
    self.draw(&mut image, result);
    self.save_image(image)
  }
}
