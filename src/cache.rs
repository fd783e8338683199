// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/cache.rs - 编码缓存记录
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

use crate::region::EncodedRegion;

/// 本端对远程已保存编码的记录
///
/// 编码本身留在远程端，这里只保存标识和保存时的区域。
#[derive(Debug, Clone, Default)]
pub struct EncodingCache {
  entries: HashMap<String, EncodedRegion>,
}

impl EncodingCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, id: String, region: EncodedRegion) {
    self.entries.insert(id, region);
  }

  pub fn contains(&self, id: &str) -> bool {
    self.entries.contains_key(id)
  }

  pub fn remove(&mut self, id: &str) -> Option<EncodedRegion> {
    self.entries.remove(id)
  }

  /// 保存该编码时的区域
  pub fn region_of(&self, id: &str) -> Option<&EncodedRegion> {
    self.entries.get(id)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn ids(&self) -> impl Iterator<Item = &str> {
    self.entries.keys().map(String::as_str)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::geometry::Rect;

  #[test]
  fn remembers_region_per_id() {
    let mut cache = EncodingCache::new();
    let region = EncodedRegion::new(Rect::new(0, 0, 512, 512), 1);
    cache.insert("a".into(), region);
    assert!(cache.contains("a"));
    assert_eq!(cache.region_of("a"), Some(&region));
    assert_eq!(cache.remove("a"), Some(region));
    assert!(cache.remove("a").is_none());
    assert!(cache.is_empty());
  }
}
