// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/model.rs - 模型族适配
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

use std::collections::HashMap;

use thiserror::Error;
use tracing::error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, command::NdArray, frame::ImageFrame};

mod efficient_sam;
mod efficientvit_sam;
mod sam2;

pub use self::efficient_sam::EfficientSam;
pub use self::efficientvit_sam::EfficientVitSam;
pub use self::sam2::Sam2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
  Sam2,
  EfficientSam,
  EfficientVitSam,
}

impl std::fmt::Display for ModelFamily {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      ModelFamily::Sam2 => "SAM2",
      ModelFamily::EfficientSam => "EfficientSAM",
      ModelFamily::EfficientVitSam => "EfficientViT-SAM",
    };
    f.write_str(name)
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("未知的模型变体: {0}")]
  UnknownVariant(String),
}

/// 模型族适配器
///
/// 各模型族共用同一套编码与提示协议，只在图像布局和脚本中的预测调用上不同。
/// 编排逻辑只依赖这个 trait。
pub trait ModelAdapter: Send + Sync {
  fn family(&self) -> ModelFamily;

  fn variant(&self) -> &str;

  /// 把（已裁剪、降采样的）图像转换为模型需要的布局
  fn normalize_image(&self, frame: &ImageFrame) -> NdArray;

  /// 加载模型并把预测器放入 `state["predictor"]` 的脚本片段
  fn load_script(&self) -> String;

  /// 对输入 `image` 编码的脚本片段
  fn encode_script(&self) -> &'static str;

  /// 定义 `predict(points, labels, box)` 的脚本片段，返回布尔掩码列表
  fn predict_script(&self) -> &'static str;

  /// 编码快照需要保存的预测器属性
  fn embedding_attributes(&self) -> &'static [&'static str];
}

pub(crate) fn query_map(url: &Url) -> HashMap<String, String> {
  url
    .query_pairs()
    .map(|(k, v)| (k.into_owned(), v.into_owned()))
    .collect()
}

pub(crate) fn check_scheme<T: FromUrlWithScheme>(url: &Url) -> Result<(), ModelError> {
  if url.scheme() != T::SCHEME {
    error!(
      "URI scheme mismatch: expected '{}', found '{}'",
      T::SCHEME,
      url.scheme()
    );
    return Err(ModelError::SchemeMismatch);
  }
  Ok(())
}

/// 按 URL 方案选择的适配器
#[derive(Debug, Clone)]
pub enum AdapterWrapper {
  Sam2(Sam2),
  EfficientSam(EfficientSam),
  EfficientVitSam(EfficientVitSam),
}

impl FromUrl for AdapterWrapper {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      Sam2::SCHEME => Ok(AdapterWrapper::Sam2(Sam2::from_url(url)?)),
      EfficientSam::SCHEME => Ok(AdapterWrapper::EfficientSam(EfficientSam::from_url(url)?)),
      EfficientVitSam::SCHEME => Ok(AdapterWrapper::EfficientVitSam(EfficientVitSam::from_url(
        url,
      )?)),
      _ => Err(ModelError::SchemeMismatch),
    }
  }
}

impl AdapterWrapper {
  fn inner(&self) -> &dyn ModelAdapter {
    match self {
      AdapterWrapper::Sam2(m) => m,
      AdapterWrapper::EfficientSam(m) => m,
      AdapterWrapper::EfficientVitSam(m) => m,
    }
  }
}

impl ModelAdapter for AdapterWrapper {
  fn family(&self) -> ModelFamily {
    self.inner().family()
  }

  fn variant(&self) -> &str {
    self.inner().variant()
  }

  fn normalize_image(&self, frame: &ImageFrame) -> NdArray {
    self.inner().normalize_image(frame)
  }

  fn load_script(&self) -> String {
    self.inner().load_script()
  }

  fn encode_script(&self) -> &'static str {
    self.inner().encode_script()
  }

  fn predict_script(&self) -> &'static str {
    self.inner().predict_script()
  }

  fn embedding_attributes(&self) -> &'static [&'static str] {
    self.inner().embedding_attributes()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scheme_selects_family() {
    let cases = [
      ("sam2://tiny", ModelFamily::Sam2),
      ("efficientsam://vitt", ModelFamily::EfficientSam),
      ("efficientvitsam://l2", ModelFamily::EfficientVitSam),
    ];
    for (url, family) in cases {
      let adapter = AdapterWrapper::from_url(&Url::parse(url).unwrap()).unwrap();
      assert_eq!(adapter.family(), family);
    }
    assert!(matches!(
      AdapterWrapper::from_url(&Url::parse("onnx:///x").unwrap()),
      Err(ModelError::SchemeMismatch)
    ));
  }

  #[test]
  fn unknown_variant_is_rejected() {
    assert!(matches!(
      AdapterWrapper::from_url(&Url::parse("sam2://huge").unwrap()),
      Err(ModelError::UnknownVariant(_))
    ));
  }
}
