// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/remote/shm.rs - 共享内存数组
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

use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use serde_json::json;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::command::NdArray;

const SHM_DIR: &str = "/dev/shm";
const SHM_PREFIX: &str = "shanan-sam-";

/// 具名共享内存段，保存一个数组的 C 顺序小端字节
///
/// 由控制端创建并写入，交给远程端读取。远程端在任务结束时可以先行删除，
/// 本端在 `Drop` 时再删除一次，两边谁最后用完都能释放。
pub struct SharedArray {
  map: MmapMut,
  file: NamedTempFile,
  dtype: &'static str,
  shape: Vec<usize>,
  byte_len: usize,
}

fn shm_dir() -> PathBuf {
  let dir = Path::new(SHM_DIR);
  if dir.is_dir() {
    dir.to_path_buf()
  } else {
    std::env::temp_dir()
  }
}

impl SharedArray {
  pub fn create(array: &NdArray) -> std::io::Result<Self> {
    let byte_len = array.byte_len();
    let file = tempfile::Builder::new()
      .prefix(SHM_PREFIX)
      .tempfile_in(shm_dir())?;
    // 空映射在部分平台上不可用
    file.as_file().set_len(byte_len.max(1) as u64)?;

    let mut map = unsafe { MmapOptions::new().map_mut(file.as_file())? };
    map[..byte_len].copy_from_slice(&array.to_le_bytes());
    map.flush()?;
    debug!(
      "创建共享内存 {}: {} {:?}, {} 字节",
      file.path().display(),
      array.dtype(),
      array.shape(),
      byte_len
    );

    Ok(Self {
      map,
      file,
      dtype: array.dtype(),
      shape: array.shape().to_vec(),
      byte_len,
    })
  }

  pub fn path(&self) -> &Path {
    self.file.path()
  }

  pub fn name(&self) -> String {
    self
      .path()
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_default()
  }

  pub fn dtype(&self) -> &'static str {
    self.dtype
  }

  pub fn shape(&self) -> &[usize] {
    &self.shape
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.map[..self.byte_len]
  }

  /// 远程端打开该段所需的描述
  pub fn descriptor(&self) -> serde_json::Value {
    json!({
      "path": self.path().to_string_lossy(),
      "dtype": self.dtype,
      "shape": self.shape,
    })
  }
}

impl std::fmt::Debug for SharedArray {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SharedArray")
      .field("path", &self.path())
      .field("dtype", &self.dtype)
      .field("shape", &self.shape)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::{ArrayD, IxDyn};

  #[test]
  fn bytes_are_visible_through_the_file() {
    let array = NdArray::U16(ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1u16, 2, 3, 513]).unwrap());
    let shared = SharedArray::create(&array).unwrap();
    assert_eq!(shared.as_bytes(), &[1, 0, 2, 0, 3, 0, 1, 2]);
    assert_eq!(shared.as_bytes().len(), array.byte_len());
    assert_eq!(std::fs::read(shared.path()).unwrap(), shared.as_bytes());
    assert!(shared.name().starts_with(SHM_PREFIX));
    assert_eq!(shared.descriptor()["shape"], json!([2, 2]));
  }

  #[test]
  fn segment_is_unlinked_on_drop() {
    let array = NdArray::U8(ArrayD::zeros(IxDyn(&[0, 3])));
    let shared = SharedArray::create(&array).unwrap();
    let path = shared.path().to_path_buf();
    assert!(path.exists());
    assert!(shared.as_bytes().is_empty());
    drop(shared);
    assert!(!path.exists());
  }
}
