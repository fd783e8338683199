// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/remote/script.rs - Python 任务脚本生成
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

//! 把 [`Command`] 拼装为远程 Python 进程执行的脚本。
//!
//! 脚本在运行器提供的全局变量中执行：`inputs`（具名 numpy 数组）、`state`
//! （跨任务保留的字典）、`outputs`（具名输出）、`emit(message, outputs)` 与
//! `cancelled()`。

use std::sync::Arc;

use crate::{
  command::{Command, RequestSerializer, SerializedTask},
  model::ModelAdapter,
  remote::{FOUND_CONTOUR_TAG, TOTAL_COUNT_TAG},
};

/// 进程端运行器：逐行读取 JSON 请求，执行脚本，逐行写回事件
pub const RUNNER: &str = r#"
import json, os, sys, threading, traceback
import numpy as np

_out_lock = threading.Lock()
_cancel = threading.Event()
_requests = []
_ready = threading.Condition()
state = {}

def _send(obj):
    with _out_lock:
        sys.stdout.write(json.dumps(obj) + "\n")
        sys.stdout.flush()

def _jsonable(value):
    if isinstance(value, np.ndarray):
        return value.tolist()
    if isinstance(value, np.generic):
        return value.item()
    if isinstance(value, (list, tuple)):
        return [_jsonable(v) for v in value]
    if isinstance(value, dict):
        return {k: _jsonable(v) for k, v in value.items()}
    return value

def _load(desc):
    array = np.fromfile(desc["path"], dtype=desc["dtype"], count=int(np.prod(desc["shape"])))
    try:
        os.unlink(desc["path"])
    except OSError:
        pass
    return array.reshape(desc["shape"])

def _reader():
    for line in sys.stdin:
        request = json.loads(line)
        if request.get("type") == "cancel":
            _cancel.set()
            continue
        with _ready:
            _cancel.clear()
            _requests.append(request)
            _ready.notify()
    with _ready:
        _requests.append(None)
        _ready.notify()

threading.Thread(target=_reader, daemon=True).start()

while True:
    with _ready:
        while not _requests:
            _ready.wait()
        request = _requests.pop(0)
    if request is None:
        break
    outputs = {}
    scope = {
        "inputs": {k: _load(v) for k, v in request.get("inputs", {}).items()},
        "state": state,
        "outputs": outputs,
        "emit": lambda message, payload: _send({"type": "update", "message": message, "outputs": _jsonable(payload)}),
        "cancelled": _cancel.is_set,
        "np": np,
    }
    try:
        exec(request["script"], scope)
        if _cancel.is_set() and outputs.get("cancelled"):
            _send({"type": "canceled"})
        else:
            _send({"type": "done", "outputs": _jsonable(outputs)})
    except Exception as exc:
        sys.stderr.write(traceback.format_exc())
        _send({"type": "error", "message": repr(exc)})
"#;

/// 掩码转轮廓与 RLE，所有模型族共用
const CONTOUR_FRAGMENT: &str = r#"
import cv2

def encode_rle(mask):
    flat = np.concatenate([[0], mask.reshape(-1).astype(np.int8), [0]])
    edges = np.flatnonzero(np.diff(flat))
    starts, ends = edges[0::2], edges[1::2]
    return np.stack([starts, ends - starts], axis=1).reshape(-1).tolist()

def objects_from_masks(masks, return_all):
    merged = np.zeros(masks[0].shape, dtype=np.uint8) if masks else None
    for m in masks:
        merged |= np.asarray(m, dtype=np.uint8)
    result = {"contours_x": [], "contours_y": [], "rle": []}
    if merged is None:
        return result
    count, labels, stats, _ = cv2.connectedComponentsWithStats(merged, connectivity=8)
    ids = list(range(1, count))
    if not return_all and ids:
        ids = [max(ids, key=lambda i: stats[i, cv2.CC_STAT_AREA])]
    for i in ids:
        single = (labels == i).astype(np.uint8)
        contours, _ = cv2.findContours(single, cv2.RETR_EXTERNAL, cv2.CHAIN_APPROX_NONE)
        contour = max(contours, key=len).reshape(-1, 2)
        result["contours_x"].append(contour[:, 0].tolist())
        result["contours_y"].append(contour[:, 1].tolist())
        result["rle"].append(encode_rle(single.astype(bool)))
    return result
"#;

fn py_bool(value: bool) -> &'static str {
  if value { "True" } else { "False" }
}

/// 生成 Python 任务脚本的序列化器
#[derive(Clone)]
pub struct ScriptSerializer {
  adapter: Arc<dyn ModelAdapter>,
}

impl ScriptSerializer {
  pub fn new(adapter: Arc<dyn ModelAdapter>) -> Self {
    Self { adapter }
  }

  /// 加载模型的脚本，会话建立后首先执行
  pub fn load_script(&self) -> String {
    self.adapter.load_script()
  }

  fn predictor_prelude(&self) -> String {
    format!(
      "predictor = state[\"predictor\"]\n{}\n{}\n",
      CONTOUR_FRAGMENT,
      self.adapter.predict_script()
    )
  }

  fn attribute_list(&self) -> String {
    let names: Vec<String> = self
      .adapter
      .embedding_attributes()
      .iter()
      .map(|a| format!("{:?}", a))
      .collect();
    format!("[{}]", names.join(", "))
  }

  fn command_script(&self, command: &Command) -> String {
    match command {
      Command::Encode { .. } => format!(
        "predictor = state[\"predictor\"]\nimage = inputs[\"image\"]\n{}\n",
        self.adapter.encode_script()
      ),
      Command::Points { return_all, .. } => format!(
        r#"{prelude}
coords = inputs["points"].astype(np.float32)
labels = np.ones(len(coords), dtype=np.int32)
if "neg_points" in inputs:
    coords = np.concatenate([coords, inputs["neg_points"].astype(np.float32)])
    labels = np.concatenate([labels, np.zeros(len(inputs["neg_points"]), dtype=np.int32)])
outputs.update(objects_from_masks(predict(predictor, coords, labels, None), {all}))
"#,
        prelude = self.predictor_prelude(),
        all = py_bool(*return_all),
      ),
      Command::Box { return_all, .. } => format!(
        r#"{prelude}
box = inputs["box"][0].astype(np.float32)
outputs.update(objects_from_masks(predict(predictor, None, None, box), {all}))
"#,
        prelude = self.predictor_prelude(),
        all = py_bool(*return_all),
      ),
      // 掩码提示按连通域转为框提示
      Command::Mask { return_all, .. } => format!(
        r#"{prelude}
source = (inputs["mask"] > 0).astype(np.uint8)
count, _, stats, _ = cv2.connectedComponentsWithStats(source, connectivity=8)
masks = []
for i in range(1, count):
    x, y, w, h = stats[i, :4]
    masks.extend(predict(predictor, None, None, np.array([x, y, x + w - 1, y + h - 1], dtype=np.float32)))
outputs.update(objects_from_masks(masks, {all}))
"#,
        prelude = self.predictor_prelude(),
        all = py_bool(*return_all),
      ),
      Command::Batch(batch) => format!(
        r#"{prelude}
import random
from concurrent.futures import ThreadPoolExecutor, wait, FIRST_COMPLETED
prompts = []
if "labels" in inputs:
    labels = inputs["labels"]
    for value in np.unique(labels):
        if value == 0:
            continue
        count, parts = cv2.connectedComponents((labels == value).astype(np.uint8), connectivity=8)
        for i in range(1, count):
            part = (parts == i).astype(np.uint8)
            inner = cv2.erode(part, np.ones((3, 3), np.uint8))
            ys, xs = np.nonzero(inner if inner.any() else part)
            picks = random.sample(range(len(xs)), min(3, len(xs)))
            seeds = np.array([[xs[k], ys[k]] for k in picks], dtype=np.float32)
            prompts.append((seeds, np.ones(len(seeds), dtype=np.int32), None))
for p in inputs["point_prompts"]:
    prompts.append((p[None].astype(np.float32), np.ones(1, dtype=np.int32), None))
for b in inputs["box_prompts"]:
    prompts.append((None, None, b.astype(np.float32)))
emit("{nc}", {{"count": str(len(prompts))}})

def run_one(index):
    coords, marks, box = prompts[index]
    found = objects_from_masks(predict(predictor, coords, marks, box), {all})
    found["index"] = index
    emit("{fc}", found)

with ThreadPoolExecutor(max_workers={workers}) as pool:
    pending = {{pool.submit(run_one, i) for i in range(len(prompts))}}
    while pending:
        done, pending = wait(pending, timeout=0.05, return_when=FIRST_COMPLETED)
        for future in done:
            if not future.cancelled():
                future.result()
        if cancelled():
            for future in pending:
                future.cancel()
            outputs["cancelled"] = True
outputs["count"] = str(len(prompts))
"#,
        prelude = self.predictor_prelude(),
        nc = TOTAL_COUNT_TAG,
        fc = FOUND_CONTOUR_TAG,
        all = py_bool(batch.return_all),
        workers = batch.workers.max(1),
      ),
      Command::Persist { id } => format!(
        r#"predictor = state["predictor"]
state.setdefault("snapshots", {{}})[{id:?}] = {{a: getattr(predictor, a) for a in {attrs} if hasattr(predictor, a)}}
"#,
        id = id,
        attrs = self.attribute_list(),
      ),
      Command::Select { id } => format!(
        r#"predictor = state["predictor"]
for a, v in state.get("snapshots", {{}})[{id:?}].items():
    setattr(predictor, a, v)
"#,
        id = id,
      ),
      Command::Delete { id } => format!(
        "state.get(\"snapshots\", {{}}).pop({:?}, None)\n",
        id
      ),
    }
  }
}

impl RequestSerializer for ScriptSerializer {
  fn serialize(&self, command: &Command) -> SerializedTask {
    SerializedTask {
      script: self.command_script(command),
      inputs: command.inputs(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{FromUrl, command::BatchCommand, geometry::Point, model::AdapterWrapper};

  fn serializer(url: &str) -> ScriptSerializer {
    let adapter = AdapterWrapper::from_url(&url::Url::parse(url).unwrap()).unwrap();
    ScriptSerializer::new(Arc::new(adapter))
  }

  #[test]
  fn batch_script_uses_bounded_pool_and_reserved_tags() {
    let task = serializer("sam2://tiny").serialize(&Command::Batch(BatchCommand {
      points: vec![Point::new(3, 4)],
      boxes: vec![],
      labels: None,
      return_all: false,
      workers: 3,
    }));
    assert!(task.script.contains("max_workers=3"));
    assert!(task.script.contains("emit(\"nc\""));
    assert!(task.script.contains("emit(\"fc\""));
    assert!(task.script.contains("objects_from_masks"));
    assert!(task.inputs.contains_key("point_prompts"));
  }

  #[test]
  fn family_fragment_is_spliced_in() {
    let cmd = Command::Box {
      bbox: [1, 2, 3, 4],
      return_all: true,
    };
    let sam2 = serializer("sam2://tiny").serialize(&cmd);
    let esam = serializer("efficientsam://vitt").serialize(&cmd);
    assert!(sam2.script.contains("multimask_output=False"));
    assert!(esam.script.contains("marks.extend([2, 3])"));
    assert!(sam2.script.contains(", True))"));
  }

  #[test]
  fn snapshot_scripts_name_the_id() {
    let s = serializer("efficientvitsam://l0");
    let persist = s.serialize(&Command::Persist { id: "abc".into() });
    assert!(persist.script.contains("[\"abc\"]"));
    assert!(persist.script.contains("\"original_size\""));
    assert!(persist.inputs.is_empty());
    let delete = s.serialize(&Command::Delete { id: "abc".into() });
    assert!(delete.script.contains("pop(\"abc\", None)"));
  }
}
