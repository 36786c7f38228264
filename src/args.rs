// 该文件是 RiceGuard （米粒质检） 项目的一部分。
// src/args.rs - 命令行与环境变量参数
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

use std::{path::PathBuf, time::Duration};

use clap::Args;
use url::Url;

use crate::{
  FromUrl,
  classify::ThresholdPolicy,
  config::{
    AnalyzerConfig, ConfigError, DEFAULT_LOCAL_MODEL_PATH, DEFAULT_MODEL_ID, DEFAULT_TIMEOUT_SECS,
    LocalConfig, RemoteConfig, RemoteProtocol,
  },
  normalize::{DEFAULT_JPEG_QUALITY, DEFAULT_MAX_LONG_SIDE},
};

/// 分析流程参数，供各个可执行程序共用
#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
  /// 远程推理服务的 API 密钥
  #[arg(long, env = "ROBOFLOW_API_KEY", hide_env_values = true)]
  pub api_key: Option<String>,

  /// 模型或工作流标识（支持路径与令牌写法）
  #[arg(long, env = "ROBOFLOW_MODEL_ID", default_value = DEFAULT_MODEL_ID)]
  pub model_id: String,

  /// 工作流所在的工作空间
  #[arg(long, env = "ROBOFLOW_WORKSPACE")]
  pub workspace: Option<String>,

  /// 远程服务地址，留空使用协议默认地址
  #[arg(long, env = "ROBOFLOW_API_URL", value_name = "URL")]
  pub api_url: Option<Url>,

  /// 远程请求协议: workflow 或 detect
  #[arg(long, env = "ROBOFLOW_PROTOCOL", default_value = "workflow")]
  pub protocol: RemoteProtocol,

  /// 本地 ONNX 模型，文件路径或 onnx:///path?size=640 形式的地址
  /// 设为 none 时只使用远程服务
  #[arg(long, env = "RICEGUARD_LOCAL_MODEL", default_value = DEFAULT_LOCAL_MODEL_PATH)]
  pub local_model: String,

  /// 归一化后图像的最大长边
  #[arg(long, env = "RICEGUARD_MAX_LONG_SIDE", default_value_t = DEFAULT_MAX_LONG_SIDE)]
  pub max_long_side: u32,

  /// 远程请求超时（秒）
  #[arg(long, env = "RICEGUARD_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
  pub timeout_secs: u64,

  /// 置信度过滤策略: adaptive 或 accept-all
  #[arg(long, env = "RICEGUARD_THRESHOLD", default_value = "adaptive")]
  pub threshold: ThresholdPolicy,

  /// 自适应阈值系数，仅对 adaptive 策略有效
  #[arg(long, value_name = "FACTOR")]
  pub threshold_factor: Option<f32>,

  /// 标注图的 JPEG 质量 (1 - 100)
  #[arg(
    long,
    default_value_t = DEFAULT_JPEG_QUALITY,
    value_parser = clap::value_parser!(u8).range(1..=100)
  )]
  pub jpeg_quality: u8,
}

fn non_empty(value: Option<String>) -> Option<String> {
  value
    .map(|v| v.trim().to_string())
    .filter(|v| !v.is_empty())
}

/// 解析本地模型参数，`onnx://` 地址走 `FromUrl`，其他按文件路径处理
pub fn parse_local_model(value: &str) -> Result<Option<LocalConfig>, ConfigError> {
  let value = value.trim();
  if value.is_empty() || value.eq_ignore_ascii_case("none") {
    return Ok(None);
  }

  if value.contains("://") {
    let url = Url::parse(value)?;
    return LocalConfig::from_url(&url).map(Some);
  }

  Ok(Some(LocalConfig {
    model_path: PathBuf::from(value),
    ..LocalConfig::default()
  }))
}

impl PipelineArgs {
  pub fn into_config(self) -> Result<AnalyzerConfig, ConfigError> {
    let threshold = match (self.threshold, self.threshold_factor) {
      (ThresholdPolicy::Adaptive { .. }, Some(factor)) => ThresholdPolicy::Adaptive { factor },
      (policy, _) => policy,
    };

    let config = AnalyzerConfig {
      max_long_side: self.max_long_side,
      threshold,
      jpeg_quality: self.jpeg_quality,
      remote: RemoteConfig {
        api_key: non_empty(self.api_key),
        model_id: self.model_id.trim().to_string(),
        workspace: non_empty(self.workspace),
        base_url: self.api_url,
        protocol: self.protocol,
        timeout: Duration::from_secs(self.timeout_secs),
      },
      local: parse_local_model(&self.local_model)?,
    };
    config.validate()?;
    Ok(config)
  }
}
