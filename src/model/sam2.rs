// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/model/sam2.rs - SAM2 模型族
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

use tracing::debug;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  command::NdArray,
  frame::ImageFrame,
  model::{ModelAdapter, ModelError, ModelFamily, check_scheme, query_map},
};

const SAM2_VARIANTS: [(&str, &str); 4] = [
  ("tiny", "configs/sam2.1/sam2.1_hiera_t.yaml"),
  ("small", "configs/sam2.1/sam2.1_hiera_s.yaml"),
  ("base-plus", "configs/sam2.1/sam2.1_hiera_b+.yaml"),
  ("large", "configs/sam2.1/sam2.1_hiera_l.yaml"),
];

const SAM2_ENCODE: &str = r#"
predictor.set_image(image)
"#;

const SAM2_PREDICT: &str = r#"
def predict(predictor, points, labels, box):
    masks, scores, _ = predictor.predict(
        point_coords=points,
        point_labels=labels,
        box=box,
        multimask_output=False,
    )
    return [m > 0 for m in masks]
"#;

#[derive(Debug, Clone, PartialEq)]
pub struct Sam2 {
  variant: String,
  config: String,
  checkpoint: String,
  device: String,
}

impl FromUrl for Sam2 {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    check_scheme::<Self>(url)?;
    let variant = url.host_str().unwrap_or("tiny").to_string();
    let (_, default_config) = SAM2_VARIANTS
      .iter()
      .find(|(name, _)| *name == variant)
      .ok_or_else(|| ModelError::UnknownVariant(variant.clone()))?;

    let query = query_map(url);
    let config = query
      .get("config")
      .cloned()
      .unwrap_or_else(|| default_config.to_string());
    let checkpoint = query
      .get("checkpoint")
      .cloned()
      .unwrap_or_else(|| format!("checkpoints/sam2.1_hiera_{}.pt", variant.replace('-', "_")));
    let device = query.get("device").cloned().unwrap_or_else(|| "cuda".into());
    debug!("SAM2 变体: {}, 权重: {}, 设备: {}", variant, checkpoint, device);

    Ok(Sam2 {
      variant,
      config,
      checkpoint,
      device,
    })
  }
}

impl FromUrlWithScheme for Sam2 {
  const SCHEME: &'static str = "sam2";
}

impl ModelAdapter for Sam2 {
  fn family(&self) -> ModelFamily {
    ModelFamily::Sam2
  }

  fn variant(&self) -> &str {
    &self.variant
  }

  fn normalize_image(&self, frame: &ImageFrame) -> NdArray {
    NdArray::image(&frame.to_rgb())
  }

  fn load_script(&self) -> String {
    format!(
      r#"
from sam2.build_sam import build_sam2
from sam2.sam2_image_predictor import SAM2ImagePredictor
state["predictor"] = SAM2ImagePredictor(build_sam2({:?}, {:?}, device={:?}))
"#,
      self.config, self.checkpoint, self.device
    )
  }

  fn encode_script(&self) -> &'static str {
    SAM2_ENCODE
  }

  fn predict_script(&self) -> &'static str {
    SAM2_PREDICT
  }

  fn embedding_attributes(&self) -> &'static [&'static str] {
    &["_features", "_orig_hw", "_is_image_set", "_is_batch"]
  }
}
