// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/remote/process.rs - Python 子进程远程会话
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

use std::{
  collections::BTreeMap,
  io::{BufRead, BufReader, Write},
  path::PathBuf,
  process::{Child, ChildStdin, ExitStatus, Stdio},
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc::{self, Receiver, RecvTimeoutError},
  },
  thread,
  time::{Duration, Instant},
};

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  command::{Command, RequestSerializer, SerializedTask},
  model::ModelAdapter,
  remote::{
    CancelToken, Outputs, RemoteError, RemoteSession, UpdateEvent,
    script::{RUNNER, ScriptSerializer},
    shm::SharedArray,
  },
};

const DEFAULT_PYTHON: &str = "python3";
const DEFAULT_POLL_MS: u64 = 50;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// 运行器写回的一行消息
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Reply {
  Update {
    message: String,
    #[serde(default)]
    outputs: Outputs,
  },
  Done {
    #[serde(default)]
    outputs: Outputs,
  },
  Error {
    message: String,
  },
  Canceled,
}

/// `python:///usr/bin/python3?cwd=/opt/sam&poll_ms=50`
#[derive(Debug, Clone)]
pub struct ProcessSessionBuilder {
  python: PathBuf,
  working_dir: Option<PathBuf>,
  poll: Duration,
}

impl FromUrl for ProcessSessionBuilder {
  type Error = RemoteError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(RemoteError::Failed(format!(
        "远程会话必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let python = match url.path() {
      "" | "/" => PathBuf::from(DEFAULT_PYTHON),
      path => PathBuf::from(path),
    };
    let mut builder = ProcessSessionBuilder {
      python,
      working_dir: None,
      poll: Duration::from_millis(DEFAULT_POLL_MS),
    };
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "cwd" => builder.working_dir = Some(PathBuf::from(value.as_ref())),
        "poll_ms" => {
          let ms = value
            .parse::<u64>()
            .map_err(|_| RemoteError::Failed(format!("poll_ms 无效: {}", value)))?;
          builder.poll = Duration::from_millis(ms.max(1));
        }
        _ => {}
      }
    }
    Ok(builder)
  }
}

impl FromUrlWithScheme for ProcessSessionBuilder {
  const SCHEME: &'static str = "python";
}

impl ProcessSessionBuilder {
  pub fn python(mut self, python: impl Into<PathBuf>) -> Self {
    self.python = python.into();
    self
  }

  /// 启动子进程并加载模型
  pub fn build(self, adapter: Arc<dyn ModelAdapter>) -> Result<ProcessSession, RemoteError> {
    info!(
      "启动 Python 进程: {}, 模型: {} {}",
      self.python.display(),
      adapter.family(),
      adapter.variant()
    );
    let mut session = self.spawn(RUNNER, adapter)?;
    let load = SerializedTask {
      script: session.serializer.load_script(),
      inputs: BTreeMap::new(),
    };
    session.execute(&load, &mut |_| {}, &CancelToken::new())?;
    info!("模型加载完成");
    Ok(session)
  }

  fn spawn(&self, runner: &str, adapter: Arc<dyn ModelAdapter>) -> Result<ProcessSession, RemoteError> {
    let mut command = std::process::Command::new(&self.python);
    command
      .arg("-u")
      .arg("-c")
      .arg(runner)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped());
    if let Some(dir) = &self.working_dir {
      command.current_dir(dir);
    }
    let mut child = command.spawn()?;

    let stdin = child
      .stdin
      .take()
      .ok_or_else(|| RemoteError::Crashed("无法获取子进程标准输入".into()))?;
    let stdout = child
      .stdout
      .take()
      .ok_or_else(|| RemoteError::Crashed("无法获取子进程标准输出".into()))?;
    let stderr = child.stderr.take();

    let alive = Arc::new(AtomicBool::new(true));
    let (tx, replies) = mpsc::channel();
    let reader_alive = alive.clone();
    thread::spawn(move || {
      for line in BufReader::new(stdout).lines() {
        let Ok(line) = line else { break };
        match serde_json::from_str::<Reply>(&line) {
          Ok(reply) => {
            if tx.send(reply).is_err() {
              break;
            }
          }
          Err(_) => debug!("python stdout: {}", line),
        }
      }
      reader_alive.store(false, Ordering::SeqCst);
    });
    if let Some(stderr) = stderr {
      thread::spawn(move || {
        for line in BufReader::new(stderr).lines().map_while(Result::ok) {
          debug!("python stderr: {}", line);
        }
      });
    }

    Ok(ProcessSession {
      child,
      stdin: Some(stdin),
      replies,
      alive,
      serializer: ScriptSerializer::new(adapter),
      poll: self.poll,
    })
  }
}

/// 通过标准输入输出上的 JSON 行与 Python 子进程通信的远程会话
pub struct ProcessSession {
  child: Child,
  stdin: Option<ChildStdin>,
  replies: Receiver<Reply>,
  alive: Arc<AtomicBool>,
  serializer: ScriptSerializer,
  poll: Duration,
}

#[cfg(unix)]
fn killed_by_interrupt(status: &ExitStatus) -> bool {
  use std::os::unix::process::ExitStatusExt;
  const SIGINT: i32 = 2;
  status.signal() == Some(SIGINT)
}

#[cfg(not(unix))]
fn killed_by_interrupt(_: &ExitStatus) -> bool {
  false
}

impl ProcessSession {
  fn send(&mut self, value: &serde_json::Value) -> Result<(), RemoteError> {
    let stdin = self.stdin.as_mut().ok_or(RemoteError::Closed)?;
    let line = format!("{}\n", value);
    stdin
      .write_all(line.as_bytes())
      .and_then(|_| stdin.flush())
      .map_err(|e| RemoteError::Crashed(format!("写入子进程失败: {}", e)))
  }

  /// 输出流关闭后等待子进程退出；被 SIGINT 结束时视为中断
  fn exit_error(&mut self) -> RemoteError {
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    let mut status = None;
    while Instant::now() < deadline {
      match self.child.try_wait() {
        Ok(Some(exit)) => {
          status = Some(exit);
          break;
        }
        Ok(None) => thread::sleep(self.poll),
        Err(_) => break,
      }
    }
    if status.as_ref().is_some_and(killed_by_interrupt) {
      warn!("Python 进程被中断信号结束");
      return RemoteError::Interrupted;
    }
    error!("Python 进程已退出: {:?}", status);
    RemoteError::Crashed(format!("Python 进程已退出: {:?}", status))
  }

  fn execute(
    &mut self,
    task: &SerializedTask,
    listener: &mut dyn FnMut(&UpdateEvent),
    cancel: &CancelToken,
  ) -> Result<Outputs, RemoteError> {
    // 共享内存在本次调用结束时释放
    let mut shared = BTreeMap::new();
    for (name, array) in &task.inputs {
      shared.insert(name.clone(), SharedArray::create(array)?);
    }
    let descriptors: serde_json::Map<String, serde_json::Value> = shared
      .iter()
      .map(|(name, array)| (name.clone(), array.descriptor()))
      .collect();
    self.send(&json!({
      "type": "task",
      "script": task.script,
      "inputs": descriptors,
    }))?;

    let mut cancel_sent = false;
    loop {
      if cancel.is_cancelled() && !cancel_sent {
        warn!("请求取消远程任务");
        self.send(&json!({ "type": "cancel" }))?;
        cancel_sent = true;
      }
      match self.replies.recv_timeout(self.poll) {
        Ok(Reply::Update { message, outputs }) => listener(&UpdateEvent { message, outputs }),
        Ok(Reply::Done { outputs }) => return Ok(outputs),
        Ok(Reply::Error { message }) => {
          error!("远程任务失败: {}", message);
          return Err(RemoteError::Failed(message));
        }
        Ok(Reply::Canceled) => return Err(RemoteError::Canceled),
        Err(RecvTimeoutError::Timeout) => continue,
        Err(RecvTimeoutError::Disconnected) => return Err(self.exit_error()),
      }
    }
  }
}

impl RemoteSession for ProcessSession {
  fn run_task(
    &mut self,
    command: &Command,
    listener: &mut dyn FnMut(&UpdateEvent),
    cancel: &CancelToken,
  ) -> Result<Outputs, RemoteError> {
    if self.stdin.is_none() {
      return Err(RemoteError::Closed);
    }
    debug!("执行远程任务: {}", command.name());
    let task = self.serializer.serialize(command);
    self.execute(&task, listener, cancel)
  }

  fn is_alive(&self) -> bool {
    self.stdin.is_some() && self.alive.load(Ordering::SeqCst)
  }

  fn close(&mut self) {
    let Some(stdin) = self.stdin.take() else {
      return;
    };
    info!("关闭 Python 进程");
    drop(stdin);
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while Instant::now() < deadline {
      match self.child.try_wait() {
        Ok(Some(_)) => return,
        Ok(None) => thread::sleep(Duration::from_millis(DEFAULT_POLL_MS)),
        Err(_) => break,
      }
    }
    warn!("Python 进程未按时退出，强制结束");
    let _ = self.child.kill();
    let _ = self.child.wait();
  }
}

impl Drop for ProcessSession {
  fn drop(&mut self) {
    self.close();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn url_configures_interpreter() {
    let url = Url::parse("python:///opt/env/bin/python?cwd=/opt/sam&poll_ms=10").unwrap();
    let builder = ProcessSessionBuilder::from_url(&url).unwrap();
    assert_eq!(builder.python, PathBuf::from("/opt/env/bin/python"));
    assert_eq!(builder.working_dir, Some(PathBuf::from("/opt/sam")));
    assert_eq!(builder.poll, Duration::from_millis(10));

    let url = Url::parse("python:///").unwrap();
    let builder = ProcessSessionBuilder::from_url(&url).unwrap();
    assert_eq!(builder.python, PathBuf::from(DEFAULT_PYTHON));
  }

  #[test]
  fn replies_are_tagged_by_type() {
    let reply: Reply =
      serde_json::from_str(r#"{"type":"update","message":"nc","outputs":{"count":"3"}}"#).unwrap();
    assert!(matches!(reply, Reply::Update { ref message, .. } if message == "nc"));
    let reply: Reply = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
    assert!(matches!(reply, Reply::Done { ref outputs } if outputs.is_empty()));
    let reply: Reply = serde_json::from_str(r#"{"type":"canceled"}"#).unwrap();
    assert!(matches!(reply, Reply::Canceled));
  }

  /// 运行器只用到 numpy 的两个类型，测试环境不一定装有 numpy
  const NUMPY_STUB: &str = r#"
import sys, types
_np = types.ModuleType("numpy")
_np.ndarray = type("ndarray", (), {})
_np.generic = type("generic", (), {})
sys.modules.setdefault("numpy", _np)
"#;

  fn stub_session() -> Option<ProcessSession> {
    let available = std::process::Command::new(DEFAULT_PYTHON)
      .arg("--version")
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .status()
      .is_ok_and(|s| s.success());
    if !available {
      eprintln!("未找到 {}，跳过", DEFAULT_PYTHON);
      return None;
    }
    let url = Url::parse("python:///?poll_ms=5").unwrap();
    let adapter: Arc<dyn ModelAdapter> =
      Arc::new(crate::model::Sam2::from_url(&Url::parse("sam2://tiny").unwrap()).unwrap());
    let runner = format!("{}{}", NUMPY_STUB, RUNNER);
    Some(
      ProcessSessionBuilder::from_url(&url)
        .unwrap()
        .spawn(&runner, adapter)
        .unwrap(),
    )
  }

  fn task(script: &str) -> SerializedTask {
    SerializedTask {
      script: script.to_string(),
      inputs: BTreeMap::new(),
    }
  }

  const STEPPING: &str = r#"
import time
steps = 0
for _ in range(6):
    if cancelled():
        outputs["cancelled"] = True
        break
    steps += 1
    time.sleep(0.05)
outputs["steps"] = steps
"#;

  #[test]
  fn cancel_before_start_reaches_the_task() {
    let Some(mut session) = stub_session() else {
      return;
    };
    let token = CancelToken::new();
    token.cancel();
    let result = session.execute(&task(STEPPING), &mut |_| {}, &token);
    assert!(matches!(result, Err(RemoteError::Canceled)), "{:?}", result);

    // 上一个任务的取消不影响下一个任务
    let outputs = session
      .execute(&task(STEPPING), &mut |_| {}, &CancelToken::new())
      .unwrap();
    assert_eq!(outputs.get("steps"), Some(&serde_json::json!(6)));
    session.close();
  }

  #[cfg(unix)]
  #[test]
  fn sigint_exit_is_interrupted() {
    let Some(mut session) = stub_session() else {
      return;
    };
    let script = "import os, signal\nsignal.signal(signal.SIGINT, signal.SIG_DFL)\nos.kill(os.getpid(), signal.SIGINT)\n";
    let result = session.execute(&task(script), &mut |_| {}, &CancelToken::new());
    assert!(matches!(result, Err(RemoteError::Interrupted)), "{:?}", result);
  }

  #[test]
  fn abrupt_exit_is_a_crash() {
    let Some(mut session) = stub_session() else {
      return;
    };
    let result = session.execute(&task("import os\nos._exit(3)\n"), &mut |_| {}, &CancelToken::new());
    assert!(matches!(result, Err(RemoteError::Crashed(_))), "{:?}", result);
  }

  #[test]
  fn scheme_is_checked() {
    let url = Url::parse("ssh://host/python").unwrap();
    assert!(ProcessSessionBuilder::from_url(&url).is_err());
  }
}
