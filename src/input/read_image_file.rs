// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::path::PathBuf;

use image::{DynamicImage, ImageReader};
use ndarray::Array2;
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::ImageFrame};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemaMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// `image:///path/to/file.png`
pub struct ImageFileInput {
  path: PathBuf,
  image: DynamicImage,
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let path = PathBuf::from(url.path());
    let image = ImageReader::open(&path)?.decode()?;
    debug!(
      "读取图像 {}: {}x{}, {:?}",
      path.display(),
      image.width(),
      image.height(),
      image.color()
    );
    Ok(ImageFileInput { path, image })
  }
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl ImageFileInput {
  pub fn path(&self) -> &std::path::Path {
    &self.path
  }

  pub fn into_frame(self) -> ImageFrame {
    ImageFrame::from(self.image)
  }

  /// 按 16 位灰度读取，像素值即实例标签
  pub fn into_labels(self) -> Array2<u16> {
    let luma = self.image.into_luma16();
    let (width, height) = luma.dimensions();
    Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
      luma.get_pixel(x as u32, y as u32)[0]
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{GrayImage, Luma};

  #[test]
  fn reads_frame_and_labels() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("labels.png");
    let mut img = GrayImage::new(4, 3);
    img.put_pixel(2, 1, Luma([7]));
    img.save(&path).unwrap();

    let url = Url::parse(&format!("image://{}", path.display())).unwrap();
    let frame = ImageFileInput::from_url(&url).unwrap().into_frame();
    assert_eq!((frame.width(), frame.height(), frame.channels()), (4, 3, 1));

    let labels = ImageFileInput::from_url(&url).unwrap().into_labels();
    assert_eq!(labels.dim(), (3, 4));
    assert_ne!(labels[[1, 2]], 0);
    assert_eq!(labels[[0, 0]], 0);
  }

  #[test]
  fn scheme_is_checked() {
    let url = Url::parse("file:///tmp/x.png").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&url),
      Err(ImageFileInputError::SchemaMismatch)
    ));
  }
}
