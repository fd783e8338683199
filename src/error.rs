// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/error.rs - 会话错误定义
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

use thiserror::Error;

use crate::{mask::MaskError, remote::RemoteError};

/// 会话对调用方暴露的错误
///
/// 任何一种错误都只表示“本次提示无法得到回答”，会话本身仍然可用。
#[derive(Error, Debug)]
pub enum SamError {
  /// 提示格式错误，总是在发起远程调用之前检出
  #[error("参数无效: {0}")]
  InvalidArgument(String),
  /// 远程脚本抛出异常或进程崩溃
  #[error("远程任务失败: {0}")]
  RemoteTaskFailure(RemoteError),
  #[error("等待远程任务时被中断")]
  Interrupted,
  /// 在发起远程调用之前，本地共享内存或文件准备失败
  #[error("I/O 错误: {0}")]
  IoFailure(#[from] std::io::Error),
}

impl SamError {
  pub fn invalid(msg: impl Into<String>) -> Self {
    SamError::InvalidArgument(msg.into())
  }
}

impl From<RemoteError> for SamError {
  fn from(err: RemoteError) -> Self {
    match err {
      RemoteError::Interrupted => SamError::Interrupted,
      RemoteError::Io(e) => SamError::IoFailure(e),
      other => SamError::RemoteTaskFailure(other),
    }
  }
}

/// 远程返回的结果格式不符合约定
impl From<MaskError> for SamError {
  fn from(err: MaskError) -> Self {
    SamError::RemoteTaskFailure(RemoteError::Failed(format!("结果格式错误: {}", err)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn remote_errors_map_onto_session_taxonomy() {
    assert!(matches!(
      SamError::from(RemoteError::Interrupted),
      SamError::Interrupted
    ));
    assert!(matches!(
      SamError::from(RemoteError::Failed("boom".into())),
      SamError::RemoteTaskFailure(RemoteError::Failed(_))
    ));
    assert!(matches!(
      SamError::from(RemoteError::Io(std::io::Error::other("shm"))),
      SamError::IoFailure(_)
    ));
  }
}
