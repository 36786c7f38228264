// 该文件是 RiceGuard （米粒质检） 项目的一部分。
// src/bin/analyze_image.rs - 单张图片质检
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

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::info;

use riceguard::{Analyzer, args::PipelineArgs};

/// RiceGuard 单张图片质检
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入图片路径
  #[arg(long, value_name = "IMAGE")]
  pub input: PathBuf,

  /// 标注图输出路径，默认为带时间戳的 JPEG 文件
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<PathBuf>,

  #[command(flatten)]
  pub pipeline: PipelineArgs,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入图片: {}", args.input.display());
  let bytes = std::fs::read(&args.input)
    .with_context(|| format!("无法读取图片: {}", args.input.display()))?;

  let analyzer = Analyzer::new(args.pipeline.into_config()?)?;
  let result = analyzer.analyze(&bytes)?;

  let output = args.output.unwrap_or_else(|| {
    PathBuf::from(format!(
      "riceguard_{}.jpg",
      chrono::Local::now().format("%Y%m%d_%H%M%S")
    ))
  });
  std::fs::write(&output, &result.processed_image)
    .with_context(|| format!("无法写入标注图: {}", output.display()))?;
  info!("标注图已保存: {}", output.display());

  let summary = json!({
    "total_grains": result.total_grains,
    "whole_grains": result.whole_grains,
    "broken_grains": result.broken_grains,
    "broken_percentage": result.broken_percentage,
    "avg_model_confidence": result.avg_model_confidence,
    "detector": result.detector,
    "processed_image": output,
  });
  println!("{}", serde_json::to_string_pretty(&summary)?);

  Ok(())
}
