// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/model/efficient_sam.rs - EfficientSAM 模型族
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

use ndarray::Array3;
use tracing::debug;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  command::NdArray,
  frame::ImageFrame,
  model::{ModelAdapter, ModelError, ModelFamily, check_scheme, query_map},
};

const EFFICIENT_SAM_VARIANTS: [&str; 2] = ["vitt", "vits"];

// EfficientSAM 没有预测器对象，用一个命名空间保存模型和编码结果
const EFFICIENT_SAM_ENCODE: &str = r#"
tensor = torch.from_numpy(image)[None].to(predictor.device)
with torch.no_grad():
    predictor.embedding = predictor.model.get_image_embeddings(tensor)
predictor.input_hw = image.shape[1:]
"#;

// 框提示以两个角点表示，标签为 2 和 3
const EFFICIENT_SAM_PREDICT: &str = r#"
def predict(predictor, points, labels, box):
    coords, marks = [], []
    if points is not None:
        coords.extend(points.tolist())
        marks.extend(labels.tolist())
    if box is not None:
        coords.extend([[box[0], box[1]], [box[2], box[3]]])
        marks.extend([2, 3])
    pts = torch.tensor(coords, dtype=torch.float32)[None, None].to(predictor.device)
    lbl = torch.tensor(marks, dtype=torch.int64)[None, None].to(predictor.device)
    h, w = predictor.input_hw
    with torch.no_grad():
        logits, iou = predictor.model.predict_masks(
            predictor.embedding, pts, lbl,
            multimask_output=True, input_h=h, input_w=w,
            output_h=h, output_w=w,
        )
    best = int(torch.argmax(iou[0, 0]))
    return [(logits[0, 0, best] >= 0).cpu().numpy()]
"#;

#[derive(Debug, Clone, PartialEq)]
pub struct EfficientSam {
  variant: String,
  checkpoint: Option<String>,
  device: String,
}

impl FromUrl for EfficientSam {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    check_scheme::<Self>(url)?;
    let variant = url.host_str().unwrap_or("vitt").to_string();
    if !EFFICIENT_SAM_VARIANTS.contains(&variant.as_str()) {
      return Err(ModelError::UnknownVariant(variant));
    }
    let query = query_map(url);
    let device = query.get("device").cloned().unwrap_or_else(|| "cuda".into());
    debug!("EfficientSAM 变体: {}, 设备: {}", variant, device);

    Ok(EfficientSam {
      variant,
      checkpoint: query.get("checkpoint").cloned(),
      device,
    })
  }
}

impl FromUrlWithScheme for EfficientSam {
  const SCHEME: &'static str = "efficientsam";
}

impl ModelAdapter for EfficientSam {
  fn family(&self) -> ModelFamily {
    ModelFamily::EfficientSam
  }

  fn variant(&self) -> &str {
    &self.variant
  }

  /// CHW 布局、取值 `[0, 1]` 的 float32
  fn normalize_image(&self, frame: &ImageFrame) -> NdArray {
    let rgb = frame.to_rgb();
    let hwc = rgb.view();
    let (h, w, c) = hwc.dim();
    let chw = Array3::from_shape_fn((c, h, w), |(ch, y, x)| hwc[[y, x, ch]] as f32 / 255.0);
    NdArray::F32(chw.into_dyn())
  }

  fn load_script(&self) -> String {
    let load = match &self.checkpoint {
      Some(path) => format!(
        "model.load_state_dict(torch.load({:?}, map_location=\"cpu\")[\"model\"])\n",
        path
      ),
      None => String::new(),
    };
    format!(
      r#"
import types
import torch
from efficient_sam.build_efficient_sam import build_efficient_sam_{variant}
model = build_efficient_sam_{variant}()
{load}model = model.to({device:?}).eval()
state["predictor"] = types.SimpleNamespace(model=model, device={device:?}, embedding=None, input_hw=None)
"#,
      variant = self.variant,
      load = load,
      device = self.device,
    )
  }

  fn encode_script(&self) -> &'static str {
    EFFICIENT_SAM_ENCODE
  }

  fn predict_script(&self) -> &'static str {
    EFFICIENT_SAM_PREDICT
  }

  fn embedding_attributes(&self) -> &'static [&'static str] {
    &["embedding", "input_hw"]
  }
}
