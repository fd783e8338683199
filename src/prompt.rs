// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/prompt.rs - 提示定义与坐标转换
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

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{
  geometry::{Point, Rect},
  region::EncodedRegion,
};

/// 框提示 `[x0, y0, x1, y1]`，整幅图像坐标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxPrompt {
  pub x0: i32,
  pub y0: i32,
  pub x1: i32,
  pub y1: i32,
}

impl BoxPrompt {
  pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
    Self { x0, y0, x1, y1 }
  }

  pub fn rect(&self) -> Rect {
    Rect::from_corners(self.x0, self.y0, self.x1, self.y1)
  }

  pub fn corners(&self) -> [Point; 2] {
    let r = self.rect();
    [Point::new(r.x, r.y), Point::new(r.right(), r.bottom())]
  }

  pub fn to_local(&self, region: &EncodedRegion) -> [i32; 4] {
    let [a, b] = self.corners();
    let (a, b) = (region.to_local(a), region.to_local(b));
    [a.x, a.y, b.x, b.y]
  }
}

impl From<[i32; 4]> for BoxPrompt {
  fn from([x0, y0, x1, y1]: [i32; 4]) -> Self {
    Self::new(x0, y0, x1, y1)
  }
}

/// 调用方给出的提示，坐标均为整幅图像坐标
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
  Points {
    positive: Vec<Point>,
    negative: Vec<Point>,
    roi: Option<Rect>,
  },
  Box(BoxPrompt),
  /// 与当前编码区域局部尺寸一致的掩码
  Mask(Array2<u8>),
}

impl Prompt {
  pub fn points(positive: Vec<Point>) -> Self {
    Prompt::Points {
      positive,
      negative: Vec::new(),
      roi: None,
    }
  }

  pub fn with_negative(self, extra: Vec<Point>) -> Self {
    match self {
      Prompt::Points {
        positive,
        mut negative,
        roi,
      } => {
        negative.extend(extra);
        Prompt::Points {
          positive,
          negative,
          roi,
        }
      }
      other => other,
    }
  }

  pub fn with_roi(self, rect: Rect) -> Self {
    match self {
      Prompt::Points {
        positive, negative, ..
      } => Prompt::Points {
        positive,
        negative,
        roi: Some(rect),
      },
      other => other,
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Prompt::Points { negative, .. } if negative.is_empty() => "points",
      Prompt::Points { .. } => "points+negatives",
      Prompt::Box(_) => "box",
      Prompt::Mask(_) => "mask",
    }
  }

  /// 转为编码区域局部坐标
  pub fn to_local(&self, region: &EncodedRegion) -> LocalPrompt {
    match self {
      Prompt::Points {
        positive, negative, ..
      } => LocalPrompt::Points {
        positive: positive.iter().map(|p| region.to_local(*p)).collect(),
        negative: negative.iter().map(|p| region.to_local(*p)).collect(),
      },
      Prompt::Box(b) => LocalPrompt::Box(b.to_local(region)),
      Prompt::Mask(m) => LocalPrompt::Mask(m.clone()),
    }
  }
}

/// 编码区域局部坐标下的提示，即远程模型实际接收的形式
#[derive(Debug, Clone, PartialEq)]
pub enum LocalPrompt {
  Points {
    positive: Vec<Point>,
    negative: Vec<Point>,
  },
  Box([i32; 4]),
  Mask(Array2<u8>),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn box_translates_both_corners() {
    let region = EncodedRegion::new(Rect::new(100, 200, 400, 400), 2);
    let b = BoxPrompt::new(150, 260, 110, 210);
    assert_eq!(b.to_local(&region), [5, 5, 25, 30]);
  }

  #[test]
  fn negatives_only_attach_to_point_prompts() {
    let p = Prompt::points(vec![Point::new(1, 1)]).with_negative(vec![Point::new(2, 2)]);
    assert_eq!(p.kind(), "points+negatives");
    let b = Prompt::Box(BoxPrompt::new(0, 0, 1, 1)).with_negative(vec![Point::new(2, 2)]);
    assert_eq!(b.kind(), "box");
  }

  #[test]
  fn points_translate_into_region() {
    let region = EncodedRegion::new(Rect::new(10, 10, 100, 100), 1);
    let local = Prompt::points(vec![Point::new(15, 30)]).to_local(&region);
    assert_eq!(
      local,
      LocalPrompt::Points {
        positive: vec![Point::new(5, 20)],
        negative: vec![],
      }
    );
  }
}
