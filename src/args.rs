// 该文件是 Shanan SAM （山南西风·分割） 项目的一部分。
// src/args.rs - 命令行参数
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

use clap::Parser;
use url::Url;

use shanan_sam::{geometry::Point, prompt::BoxPrompt};

/// Shanan SAM 交互式分割
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型，例如 sam2://tiny?device=cuda、efficientsam://vits、efficientvitsam://l1
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// 远程推理进程与会话配置，例如 python:///usr/bin/python3?cwd=/opt/sam&workers=3
  #[arg(long, value_name = "REMOTE", default_value = "python:///")]
  pub remote: Url,

  /// 输入图像，例如 image:///data/cells.png
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 输出，image:///out.png 绘制轮廓，json:///out.json 记录结果
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,

  /// 正点 x,y，可重复
  #[arg(long = "point", value_name = "X,Y", value_parser = parse_point)]
  pub points: Vec<Point>,

  /// 负点 x,y，可重复
  #[arg(long = "negative", value_name = "X,Y", value_parser = parse_point)]
  pub negatives: Vec<Point>,

  /// 框 x0,y0,x1,y1，可重复
  #[arg(long = "box", value_name = "X0,Y0,X1,Y1", value_parser = parse_box)]
  pub boxes: Vec<BoxPrompt>,

  /// 实例标签图，与输入图像同尺寸，0 为背景
  #[arg(long, value_name = "LABELS")]
  pub labels: Option<Url>,

  /// 把所有提示作为一批处理
  #[arg(long)]
  pub batch: bool,

  /// 每个提示只保留面积最大的对象
  #[arg(long)]
  pub largest: bool,
}

fn parse_numbers<const N: usize>(s: &str) -> Result<[i32; N], String> {
  let values: Vec<i32> = s
    .split(',')
    .map(|v| v.trim().parse::<i32>().map_err(|e| format!("{}: {}", v, e)))
    .collect::<Result<_, _>>()?;
  values
    .try_into()
    .map_err(|v: Vec<i32>| format!("需要 {} 个数，实际 {} 个", N, v.len()))
}

fn parse_point(s: &str) -> Result<Point, String> {
  parse_numbers::<2>(s).map(Point::from)
}

fn parse_box(s: &str) -> Result<BoxPrompt, String> {
  let [x0, y0, x1, y1] = parse_numbers::<4>(s)?;
  Ok(BoxPrompt::new(x0, y0, x1, y1))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_prompts() {
    assert_eq!(parse_point("3, 4"), Ok(Point::new(3, 4)));
    assert!(parse_point("3").is_err());
    assert_eq!(parse_box("1,2,30,40"), Ok(BoxPrompt::new(1, 2, 30, 40)));
    assert!(parse_box("1,2,x,4").is_err());
  }

  #[test]
  fn repeated_points_collect() {
    let args = Args::try_parse_from([
      "shanan-sam",
      "--model",
      "sam2://tiny",
      "--input",
      "image:///in.png",
      "--output",
      "json:///out.json",
      "--point",
      "1,2",
      "--point",
      "5,6",
      "--box",
      "0,0,9,9",
    ])
    .unwrap();
    assert_eq!(args.points, vec![Point::new(1, 2), Point::new(5, 6)]);
    assert_eq!(args.boxes.len(), 1);
    assert!(!args.batch);
    assert_eq!(args.remote.scheme(), "python");
  }
}
