// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/command.rs - 远程请求命令
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

//! 每次调用构造、调用结束即丢弃的请求值。
//!
//! [`Command`] 只描述“要做什么”，由 [`RequestSerializer`] 转换为远程端需要的形式
//! （脚本文本加具名输入数组），区域与提示逻辑不依赖远程表示。

use std::collections::BTreeMap;

use ndarray::{Array2, ArrayD, IxDyn};

use crate::{frame::ImageFrame, geometry::Point, prompt::LocalPrompt};

/// 具名输入数组
#[derive(Debug, Clone, PartialEq)]
pub enum NdArray {
  U8(ArrayD<u8>),
  U16(ArrayD<u16>),
  I32(ArrayD<i32>),
  F32(ArrayD<f32>),
}

impl NdArray {
  /// numpy 风格的元素类型名
  pub fn dtype(&self) -> &'static str {
    match self {
      NdArray::U8(_) => "uint8",
      NdArray::U16(_) => "uint16",
      NdArray::I32(_) => "int32",
      NdArray::F32(_) => "float32",
    }
  }

  pub fn shape(&self) -> &[usize] {
    match self {
      NdArray::U8(a) => a.shape(),
      NdArray::U16(a) => a.shape(),
      NdArray::I32(a) => a.shape(),
      NdArray::F32(a) => a.shape(),
    }
  }

  pub fn len(&self) -> usize {
    self.shape().iter().product()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn byte_len(&self) -> usize {
    let item = match self {
      NdArray::U8(_) => 1,
      NdArray::U16(_) => 2,
      NdArray::I32(_) | NdArray::F32(_) => 4,
    };
    self.len() * item
  }

  /// 按 C 顺序输出小端字节
  pub fn to_le_bytes(&self) -> Vec<u8> {
    match self {
      NdArray::U8(a) => a.iter().copied().collect(),
      NdArray::U16(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
      NdArray::I32(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
      NdArray::F32(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
    }
  }

  /// `n x 2` 的点坐标数组
  pub fn points(points: &[Point]) -> Self {
    let flat: Vec<i32> = points.iter().flat_map(|p| [p.x, p.y]).collect();
    NdArray::I32(
      ArrayD::from_shape_vec(IxDyn(&[points.len(), 2]), flat)
        .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[0, 2]))),
    )
  }

  /// `n x 4` 的框数组
  pub fn boxes(boxes: &[[i32; 4]]) -> Self {
    let flat: Vec<i32> = boxes.iter().flatten().copied().collect();
    NdArray::I32(
      ArrayD::from_shape_vec(IxDyn(&[boxes.len(), 4]), flat)
        .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[0, 4]))),
    )
  }

  /// HWC 图像
  pub fn image(frame: &ImageFrame) -> Self {
    NdArray::U8(frame.view().to_owned().into_dyn())
  }
}

/// 批量提示
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCommand {
  /// 每个点单独作为一个提示
  pub points: Vec<Point>,
  pub boxes: Vec<[i32; 4]>,
  /// 实例标签图，每个连通域取至多 3 个内部点作为提示
  pub labels: Option<Array2<u16>>,
  pub return_all: bool,
  pub workers: usize,
}

/// 远程请求
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
  /// 编码一幅（已裁剪、降采样并归一化的）图像
  Encode { image: NdArray },
  Points {
    positive: Vec<Point>,
    negative: Vec<Point>,
    return_all: bool,
  },
  Box {
    bbox: [i32; 4],
    return_all: bool,
  },
  Mask {
    mask: Array2<u8>,
    return_all: bool,
  },
  Batch(BatchCommand),
  /// 以 `id` 保存当前编码
  Persist { id: String },
  /// 激活以 `id` 保存的编码
  Select { id: String },
  Delete { id: String },
}

impl Command {
  pub fn prompt(prompt: LocalPrompt, return_all: bool) -> Self {
    match prompt {
      LocalPrompt::Points { positive, negative } => Command::Points {
        positive,
        negative,
        return_all,
      },
      LocalPrompt::Box(bbox) => Command::Box { bbox, return_all },
      LocalPrompt::Mask(mask) => Command::Mask { mask, return_all },
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      Command::Encode { .. } => "encode",
      Command::Points { negative, .. } if negative.is_empty() => "points",
      Command::Points { .. } => "points+negatives",
      Command::Box { .. } => "box",
      Command::Mask { .. } => "mask",
      Command::Batch(_) => "batch",
      Command::Persist { .. } => "persist",
      Command::Select { .. } => "select",
      Command::Delete { .. } => "delete",
    }
  }

  /// 需要传给远程端的具名数组
  pub fn inputs(&self) -> BTreeMap<String, NdArray> {
    let mut inputs = BTreeMap::new();
    match self {
      Command::Encode { image } => {
        inputs.insert("image".to_string(), image.clone());
      }
      Command::Points {
        positive, negative, ..
      } => {
        inputs.insert("points".to_string(), NdArray::points(positive));
        if !negative.is_empty() {
          inputs.insert("neg_points".to_string(), NdArray::points(negative));
        }
      }
      Command::Box { bbox, .. } => {
        inputs.insert("box".to_string(), NdArray::boxes(&[*bbox]));
      }
      Command::Mask { mask, .. } => {
        inputs.insert("mask".to_string(), NdArray::U8(mask.clone().into_dyn()));
      }
      Command::Batch(batch) => {
        inputs.insert("point_prompts".to_string(), NdArray::points(&batch.points));
        inputs.insert("box_prompts".to_string(), NdArray::boxes(&batch.boxes));
        if let Some(labels) = &batch.labels {
          inputs.insert("labels".to_string(), NdArray::U16(labels.clone().into_dyn()));
        }
      }
      Command::Persist { .. } | Command::Select { .. } | Command::Delete { .. } => {}
    }
    inputs
  }
}

/// 远程端可执行的请求：脚本文本与具名输入
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedTask {
  pub script: String,
  pub inputs: BTreeMap<String, NdArray>,
}

/// 把命令转换为远程表示
pub trait RequestSerializer {
  fn serialize(&self, command: &Command) -> SerializedTask;
}
