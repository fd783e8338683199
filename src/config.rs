// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/config.rs - 会话配置
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
use tracing::debug;
use url::Url;

use crate::FromUrl;

// 以下默认值均为经验取值
const DEFAULT_MAX_SIDE: i32 = 1024;
const DEFAULT_MAX_AREA: i64 = 1024 * 1024;
const DEFAULT_MIN_SIDE: i32 = 256;
const DEFAULT_MARGIN: i32 = 64;
const DEFAULT_RESOLUTION_RATIO: f64 = 50.0;
const DEFAULT_OVERSIZE_RATIO: f64 = 1.4;
const DEFAULT_EXTEND_FRACTION: f64 = 0.2;
const DEFAULT_POINT_PAD_FRACTION: f64 = 0.1;
const DEFAULT_BOX_REGION_RATIO: f64 = 10.0;
const DEFAULT_SQUARE_BOX_REGION_RATIO: f64 = 3.0;
const DEFAULT_SQUARE_ASPECT: f64 = 2.0;
const DEFAULT_MAX_WORKING_SIDE: i32 = 1024;
const DEFAULT_BATCH_WORKERS: usize = 3;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("配置项 {key} 的值无效: {value}")]
  InvalidValue { key: String, value: String },
}

/// 重新编码区域的决策参数
#[derive(Debug, Clone, PartialEq)]
pub struct RegionPolicy {
  /// 可整体编码的最大边长
  pub max_side: i32,
  /// 可整体编码的最大面积
  pub max_area: i64,
  /// 编码区域的最小边长
  pub min_side: i32,
  /// 重新编码时的固定像素边距
  pub margin: i32,
  /// 框的短边乘以该比例仍小于编码区域对应边时，认为分辨率不足
  pub resolution_ratio: f64,
  /// 当前区域超过所需区域该倍数时，认为区域过大（约 70% 占用率）
  pub oversize_ratio: f64,
  /// 当前区域向外扩展的比例
  pub extend_fraction: f64,
  /// 点提示外接框的填充比例
  pub point_pad_fraction: f64,
  /// 细长框的区域边长与框长边之比
  pub box_region_ratio: f64,
  /// 近似正方形框的区域边长与框长边之比
  pub square_box_region_ratio: f64,
  /// 长短边之比低于该值的框视为近似正方形
  pub square_aspect: f64,
  /// 降采样前裁剪区域短边的上限
  pub max_working_side: i32,
}

impl Default for RegionPolicy {
  fn default() -> Self {
    Self {
      max_side: DEFAULT_MAX_SIDE,
      max_area: DEFAULT_MAX_AREA,
      min_side: DEFAULT_MIN_SIDE,
      margin: DEFAULT_MARGIN,
      resolution_ratio: DEFAULT_RESOLUTION_RATIO,
      oversize_ratio: DEFAULT_OVERSIZE_RATIO,
      extend_fraction: DEFAULT_EXTEND_FRACTION,
      point_pad_fraction: DEFAULT_POINT_PAD_FRACTION,
      box_region_ratio: DEFAULT_BOX_REGION_RATIO,
      square_box_region_ratio: DEFAULT_SQUARE_BOX_REGION_RATIO,
      square_aspect: DEFAULT_SQUARE_ASPECT,
      max_working_side: DEFAULT_MAX_WORKING_SIDE,
    }
  }
}

/// 会话配置
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
  pub policy: RegionPolicy,
  /// 批量预测时远程工作线程数
  pub batch_workers: usize,
  /// 未显式指定时是否返回全部对象
  pub return_all: bool,
  /// 是否对轮廓做 ROI 兼容的半像素调整
  pub roi_adjust: bool,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      policy: RegionPolicy::default(),
      batch_workers: DEFAULT_BATCH_WORKERS,
      return_all: true,
      roi_adjust: false,
    }
  }
}

impl SessionConfig {
  pub fn with_policy(mut self, policy: RegionPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn with_batch_workers(mut self, workers: usize) -> Self {
    self.batch_workers = workers.max(1);
    self
  }

  pub fn with_return_all(mut self, return_all: bool) -> Self {
    self.return_all = return_all;
    self
  }

  pub fn with_roi_adjust(mut self, roi_adjust: bool) -> Self {
    self.roi_adjust = roi_adjust;
    self
  }

  /// 用查询参数覆盖默认配置，未识别的键被忽略
  pub fn from_query(pairs: &HashMap<String, String>) -> Result<Self, ConfigError> {
    let mut config = SessionConfig::default();
    let p = &mut config.policy;
    for (key, value) in pairs {
      match key.as_str() {
        "max_side" => p.max_side = parse(key, value)?,
        "max_area" => p.max_area = parse(key, value)?,
        "min_side" => p.min_side = parse(key, value)?,
        "margin" => p.margin = parse(key, value)?,
        "resolution_ratio" => p.resolution_ratio = parse(key, value)?,
        "oversize_ratio" => p.oversize_ratio = parse(key, value)?,
        "extend_fraction" => p.extend_fraction = parse(key, value)?,
        "point_pad_fraction" => p.point_pad_fraction = parse(key, value)?,
        "box_region_ratio" => p.box_region_ratio = parse(key, value)?,
        "square_box_region_ratio" => p.square_box_region_ratio = parse(key, value)?,
        "square_aspect" => p.square_aspect = parse(key, value)?,
        "max_working_side" => p.max_working_side = parse(key, value)?,
        "workers" => config.batch_workers = parse::<usize>(key, value)?.max(1),
        "return_all" => config.return_all = parse(key, value)?,
        "roi_adjust" => config.roi_adjust = parse(key, value)?,
        _ => debug!("忽略未知配置项: {}", key),
      }
    }
    Ok(config)
  }
}

impl FromUrl for SessionConfig {
  type Error = ConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let pairs: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (k.into_owned(), v.into_owned()))
      .collect();
    Self::from_query(&pairs)
  }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
  value.parse().map_err(|_| ConfigError::InvalidValue {
    key: key.to_string(),
    value: value.to_string(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn url_query_overrides_defaults() {
    let url = Url::parse("python:///usr/bin/python3?max_side=2048&workers=5&roi_adjust=true&foo=1")
      .unwrap();
    let config = SessionConfig::from_url(&url).unwrap();
    assert_eq!(config.policy.max_side, 2048);
    assert_eq!(config.batch_workers, 5);
    assert!(config.roi_adjust);
    assert_eq!(config.policy.min_side, DEFAULT_MIN_SIDE);
  }

  #[test]
  fn bad_value_is_reported() {
    let url = Url::parse("python:///x?resolution_ratio=abc").unwrap();
    assert!(matches!(
      SessionConfig::from_url(&url),
      Err(ConfigError::InvalidValue { .. })
    ));
  }

  #[test]
  fn workers_never_drop_to_zero() {
    assert_eq!(SessionConfig::default().with_batch_workers(0).batch_workers, 1);
  }
}
