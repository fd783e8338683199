// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/session.rs - 分割会话
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

use std::sync::Arc;

use ndarray::{Array2, s};
use tracing::{debug, info, warn};

use crate::{
  batch::{self, BatchListener, BatchOutcome, BatchRequest, ResultMapping},
  cache::EncodingCache,
  command::{BatchCommand, Command},
  config::SessionConfig,
  error::SamError,
  frame::ImageFrame,
  geometry::{Point, Rect},
  mask::MaskContour,
  model::ModelAdapter,
  prompt::{BoxPrompt, Prompt},
  region::{Decision, EncodedRegion, RegionState},
  remote::{self, CancelToken, RemoteSession},
};

/// 分割会话
///
/// 持有当前图像、当前编码区域与已保存编码的记录。每次调用构造一个命令，
/// 调用结束即丢弃；调用失败时区域状态保持不变，会话仍可继续使用。
pub struct SamSession<R: RemoteSession> {
  remote: R,
  adapter: Arc<dyn ModelAdapter>,
  config: SessionConfig,
  image: Option<Arc<ImageFrame>>,
  state: RegionState,
  cache: EncodingCache,
}

impl<R: RemoteSession> SamSession<R> {
  pub fn new(remote: R, adapter: Arc<dyn ModelAdapter>, config: SessionConfig) -> Self {
    info!(
      "创建分割会话: {} {}",
      adapter.family(),
      adapter.variant()
    );
    Self {
      remote,
      adapter,
      config,
      image: None,
      state: RegionState::Unset,
      cache: EncodingCache::new(),
    }
  }

  pub fn config(&self) -> &SessionConfig {
    &self.config
  }

  pub fn adapter(&self) -> &dyn ModelAdapter {
    self.adapter.as_ref()
  }

  pub fn remote(&self) -> &R {
    &self.remote
  }

  pub fn image(&self) -> Option<&ImageFrame> {
    self.image.as_deref()
  }

  pub fn state(&self) -> &RegionState {
    &self.state
  }

  pub fn current_region(&self) -> Option<EncodedRegion> {
    self.state.region().copied()
  }

  pub fn cache(&self) -> &EncodingCache {
    &self.cache
  }

  pub fn is_alive(&self) -> bool {
    self.remote.is_alive()
  }

  pub fn close(&mut self) {
    info!("关闭分割会话");
    self.remote.close();
    self.cache = EncodingCache::new();
  }

  /// 设置工作图像；图像足够小时立即整体编码
  pub fn set_image(&mut self, image: ImageFrame) -> Result<(), SamError> {
    let image = Arc::new(image.normalized());
    let bounds = image.bounds();
    info!("设置图像: {}x{}x{}", image.width(), image.height(), image.channels());
    self.image = Some(image);
    self.state = RegionState::Unset;

    if !self.config.policy.fits_whole(&bounds) {
      info!("图像超过可编码尺寸，等待首个提示选择区域");
      self.state = RegionState::TooLargeUnencoded;
      return Ok(());
    }
    let result = self.encode(EncodedRegion::new(bounds, 1));
    if result.is_err() {
      // 下一个提示会重新尝试整体编码
      self.state = RegionState::TooLargeUnencoded;
    }
    result
  }

  /// 整体编码失败过的小图像，在提示前再次整体编码
  fn encode_whole_if_pending(&mut self) -> Result<(), SamError> {
    let Some(bounds) = self.image.as_ref().map(|i| i.bounds()) else {
      return Ok(());
    };
    if self.state == RegionState::TooLargeUnencoded && self.config.policy.fits_whole(&bounds) {
      info!("重新尝试整体编码");
      self.encode(EncodedRegion::new(bounds, 1))?;
    }
    Ok(())
  }

  fn image_or_err(&self) -> Result<Arc<ImageFrame>, SamError> {
    self
      .image
      .clone()
      .ok_or_else(|| SamError::invalid("尚未设置图像"))
  }

  /// 裁剪、降采样并编码区域，成功后替换当前区域
  fn encode(&mut self, region: EncodedRegion) -> Result<(), SamError> {
    let image = self.image_or_err()?;
    let bounds = image.bounds();
    if !region.within(&bounds) {
      return Err(SamError::invalid(format!(
        "编码区域 {:?} 超出图像范围",
        region.rect()
      )));
    }
    let crop = image.crop(&region.rect()).subsample(region.scale());
    let array = self.adapter.normalize_image(&crop);
    info!(
      "编码区域: {:?}, 缩放 {}, 输入 {:?}",
      region.rect(),
      region.scale(),
      array.shape()
    );
    self
      .remote
      .run_task(&Command::Encode { image: array }, &mut |_| {}, &CancelToken::new())?;
    self.state = RegionState::encoded(region, &bounds);
    info!("编码完成");
    Ok(())
  }

  fn apply(&mut self, decision: Decision) -> Result<EncodedRegion, SamError> {
    match decision {
      Decision::Keep => self
        .current_region()
        .ok_or_else(|| SamError::invalid("当前没有已编码的区域")),
      Decision::Encode(region) => {
        self.encode(region)?;
        Ok(region)
      }
    }
  }

  fn mapping(&self, region: EncodedRegion, return_all: bool) -> Result<ResultMapping, SamError> {
    Ok(ResultMapping {
      region,
      image_width: self.image_or_err()?.width() as u32,
      roi_adjust: self.config.roi_adjust,
      return_all,
    })
  }

  fn predict(
    &mut self,
    prompt: &Prompt,
    region: EncodedRegion,
    return_all: bool,
  ) -> Result<Vec<MaskContour>, SamError> {
    let command = Command::prompt(prompt.to_local(&region), return_all);
    debug!("提示 {} 于区域 {:?}", command.name(), region.rect());
    let outputs = self
      .remote
      .run_task(&command, &mut |_| {}, &CancelToken::new())?;
    let output = remote::prompt_output(&outputs)?;
    let masks = self.mapping(region, return_all)?.apply(&output)?;
    debug!("得到 {} 个对象", masks.len());
    Ok(masks)
  }

  /// 点提示，可附带负点与感兴趣区域
  pub fn process_points(
    &mut self,
    positive: &[Point],
    negative: &[Point],
    roi: Option<Rect>,
    return_all: bool,
  ) -> Result<Vec<MaskContour>, SamError> {
    if positive.is_empty() {
      return Err(SamError::invalid("至少需要一个正点"));
    }
    let image = self.image_or_err()?;
    self.encode_whole_if_pending()?;
    let all: Vec<Point> = positive.iter().chain(negative).copied().collect();
    let decision =
      self
        .config
        .policy
        .decide_for_points(&self.state, &image.bounds(), &all, roi.as_ref())?;
    let region = self.apply(decision)?;

    let mut prompt = Prompt::points(positive.to_vec()).with_negative(negative.to_vec());
    if let Some(roi) = roi {
      prompt = prompt.with_roi(roi);
    }
    self.predict(&prompt, region, return_all)
  }

  pub fn process_box(
    &mut self,
    bbox: BoxPrompt,
    return_all: bool,
  ) -> Result<Vec<MaskContour>, SamError> {
    let image = self.image_or_err()?;
    self.encode_whole_if_pending()?;
    let decision = self
      .config
      .policy
      .decide_for_box(&self.state, &image.bounds(), &bbox.rect())?;
    let region = self.apply(decision)?;
    self.predict(&Prompt::Box(bbox), region, return_all)
  }

  /// 掩码提示，尺寸必须与当前编码区域的局部尺寸一致
  pub fn process_mask(
    &mut self,
    mask: &Array2<u8>,
    return_all: bool,
  ) -> Result<Vec<MaskContour>, SamError> {
    let (height, width) = mask.dim();
    let region = self.state.check_mask(width, height)?;
    self.predict(&Prompt::Mask(mask.clone()), region, return_all)
  }

  pub fn process_prompt(
    &mut self,
    prompt: &Prompt,
    return_all: bool,
  ) -> Result<Vec<MaskContour>, SamError> {
    match prompt {
      Prompt::Points {
        positive,
        negative,
        roi,
      } => self.process_points(positive, negative, *roi, return_all),
      Prompt::Box(b) => self.process_box(*b, return_all),
      Prompt::Mask(m) => self.process_mask(m, return_all),
    }
  }

  /// 一次往返回答一组提示
  ///
  /// 每个提示完成时回调 `listener`；`cancel` 只取消尚未开始的提示。
  pub fn process_batch_of_prompts(
    &mut self,
    request: &BatchRequest,
    listener: &mut dyn BatchListener,
    cancel: &CancelToken,
  ) -> Result<BatchOutcome, SamError> {
    if request.is_empty() {
      return Err(SamError::invalid("批量请求不包含任何提示"));
    }
    let image = self.image_or_err()?;
    let bounds = image.bounds();
    if let Some(labels) = &request.labels {
      let (h, w) = labels.dim();
      if w != image.width() || h != image.height() {
        return Err(SamError::invalid(format!(
          "标签图尺寸 {}x{} 与图像 {}x{} 不一致",
          w,
          h,
          image.width(),
          image.height()
        )));
      }
    }
    self.encode_whole_if_pending()?;
    let anchors = request.anchor_points();
    let decision = self
      .config
      .policy
      .decide_for_batch(&self.state, &bounds, &anchors)?;
    let region = self.apply(decision)?;

    let return_all = request.return_all.unwrap_or(self.config.return_all);
    let command = Command::Batch(BatchCommand {
      points: request.points.iter().map(|p| region.to_local(*p)).collect(),
      boxes: request.boxes.iter().map(|b| b.to_local(&region)).collect(),
      labels: request.labels.as_ref().map(|l| local_labels(l, &region)),
      return_all,
      workers: self.config.batch_workers,
    });
    let mapping = self.mapping(region, return_all)?;
    batch::run_batch(&mut self.remote, &command, &mapping, listener, cancel)
  }

  /// 保存当前编码，返回其标识
  pub fn persist_encoding(&mut self) -> Result<String, SamError> {
    let region = self
      .current_region()
      .ok_or_else(|| SamError::invalid("当前没有可保存的编码"))?;
    let id = uuid::Uuid::new_v4().to_string();
    self
      .remote
      .run_task(&Command::Persist { id: id.clone() }, &mut |_| {}, &CancelToken::new())?;
    self.cache.insert(id.clone(), region);
    info!("保存编码 {}: {:?}", id, region.rect());
    Ok(id)
  }

  /// 激活已保存的编码；不改变本端记录的当前区域
  pub fn select_encoding(&mut self, id: &str) -> Result<(), SamError> {
    if !self.cache.contains(id) {
      return Err(SamError::invalid(format!("未知的编码: {}", id)));
    }
    self
      .remote
      .run_task(&Command::Select { id: id.to_string() }, &mut |_| {}, &CancelToken::new())?;
    info!("激活编码 {}", id);
    Ok(())
  }

  /// 删除已保存的编码，未知的标识被忽略
  pub fn delete_encoding(&mut self, id: &str) -> Result<(), SamError> {
    if !self.cache.contains(id) {
      warn!("删除未知的编码 {}，忽略", id);
      return Ok(());
    }
    self
      .remote
      .run_task(&Command::Delete { id: id.to_string() }, &mut |_| {}, &CancelToken::new())?;
    self.cache.remove(id);
    Ok(())
  }
}

/// 把整幅图像的标签图裁剪、降采样到编码区域局部尺寸
fn local_labels(labels: &Array2<u16>, region: &EncodedRegion) -> Array2<u16> {
  let r = region.rect();
  let step = region.scale().max(1) as isize;
  labels
    .slice(s![
      r.y as usize..r.bottom() as usize;step,
      r.x as usize..r.right() as usize;step
    ])
    .to_owned()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn labels_follow_region_and_scale() {
    let labels = Array2::from_shape_fn((10, 10), |(y, x)| (y * 10 + x) as u16);
    let region = EncodedRegion::new(Rect::new(2, 4, 5, 6), 2);
    let local = local_labels(&labels, &region);
    assert_eq!(local.dim(), (3, 3));
    assert_eq!(local[[0, 0]], 42);
    assert_eq!(local[[1, 2]], 66);
  }
}
