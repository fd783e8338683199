// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/output/json_record.rs - JSON 结果记录
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

use std::{fs::File, io::BufWriter, path::PathBuf};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::ImageFrame, mask::MaskContour, output::Render};

#[derive(Error, Debug)]
pub enum JsonRecordError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  SerializeError(#[from] serde_json::Error),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// `json:///path/to/result.json?pretty`
pub struct JsonRecordOutput {
  path: PathBuf,
  pretty: bool,
}

#[derive(Serialize)]
struct Record<'a> {
  timestamp: String,
  width: usize,
  height: usize,
  count: usize,
  results: &'a [MaskContour],
}

impl FromUrlWithScheme for JsonRecordOutput {
  const SCHEME: &'static str = "json";
}

impl FromUrl for JsonRecordOutput {
  type Error = JsonRecordError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(JsonRecordError::SchemeMismatch);
    }
    let pretty = uri.query_pairs().any(|(k, _)| k == "pretty");
    Ok(JsonRecordOutput {
      path: PathBuf::from(uri.path()),
      pretty,
    })
  }
}

impl Render for JsonRecordOutput {
  type Error = JsonRecordError;

  fn render_result(&self, frame: &ImageFrame, result: &[MaskContour]) -> Result<(), Self::Error> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    let record = Record {
      timestamp: Utc::now().to_rfc3339(),
      width: frame.width(),
      height: frame.height(),
      count: result.len(),
      results: result,
    };
    let writer = BufWriter::new(File::create(&self.path)?);
    if self.pretty {
      serde_json::to_writer_pretty(writer, &record)?;
    } else {
      serde_json::to_writer(writer, &record)?;
    }
    info!("记录 {} 个结果到 {}", result.len(), self.path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{geometry::Point, mask::Rle};

  #[test]
  fn writes_results_with_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("result.json");
    let url = Url::parse(&format!("json://{}?pretty", path.display())).unwrap();
    let output = JsonRecordOutput::from_url(&url).unwrap();

    let frame = ImageFrame::from_raw(4, 4, 3, vec![0; 48]).unwrap();
    let mask = MaskContour::new(vec![Point::new(1, 1)], Rle::from_flat(4, &[5, 1]).unwrap());
    output.render_result(&frame, &[mask.clone()]).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["count"], 1);
    assert_eq!(value["width"], 4);
    assert!(value["timestamp"].as_str().is_some());
    let back: Vec<MaskContour> = serde_json::from_value(value["results"].clone()).unwrap();
    assert_eq!(back, vec![mask]);
  }
}
