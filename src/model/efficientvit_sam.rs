// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/model/efficientvit_sam.rs - EfficientViT-SAM 模型族
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

const EFFICIENTVIT_SAM_VARIANTS: [&str; 5] = ["l0", "l1", "l2", "xl0", "xl1"];

const EFFICIENTVIT_SAM_ENCODE: &str = r#"
predictor.set_image(image)
"#;

const EFFICIENTVIT_SAM_PREDICT: &str = r#"
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
pub struct EfficientVitSam {
  variant: String,
  checkpoint: String,
}

impl FromUrl for EfficientVitSam {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    check_scheme::<Self>(url)?;
    let variant = url.host_str().unwrap_or("l0").to_string();
    if !EFFICIENTVIT_SAM_VARIANTS.contains(&variant.as_str()) {
      return Err(ModelError::UnknownVariant(variant));
    }
    let checkpoint = query_map(url)
      .get("checkpoint")
      .cloned()
      .unwrap_or_else(|| format!("assets/checkpoints/efficientvit_sam/efficientvit_sam_{}.pt", variant));
    debug!("EfficientViT-SAM 变体: {}, 权重: {}", variant, checkpoint);
    Ok(EfficientVitSam {
      variant,
      checkpoint,
    })
  }
}

impl FromUrlWithScheme for EfficientVitSam {
  const SCHEME: &'static str = "efficientvitsam";
}

impl ModelAdapter for EfficientVitSam {
  fn family(&self) -> ModelFamily {
    ModelFamily::EfficientVitSam
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
from efficientvit.sam_model_zoo import create_efficientvit_sam_model
from efficientvit.models.efficientvit.sam import EfficientViTSamPredictor
model = create_efficientvit_sam_model(name="efficientvit-sam-{}", weight_url={:?})
state["predictor"] = EfficientViTSamPredictor(model.cuda().eval())
"#,
      self.variant, self.checkpoint
    )
  }

  fn encode_script(&self) -> &'static str {
    EFFICIENTVIT_SAM_ENCODE
  }

  fn predict_script(&self) -> &'static str {
    EFFICIENTVIT_SAM_PREDICT
  }

  fn embedding_attributes(&self) -> &'static [&'static str] {
    &["features", "original_size", "input_size", "is_image_set"]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_checkpoint_follows_variant() {
    let m = EfficientVitSam::from_url(&Url::parse("efficientvitsam://xl1").unwrap()).unwrap();
    assert!(m.load_script().contains("efficientvit_sam_xl1.pt"));
    assert!(m.load_script().contains("efficientvit-sam-xl1"));
  }
}
