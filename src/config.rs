// 该文件是 RiceGuard （米粒质检） 项目的一部分。
// src/config.rs - 分析流程配置
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

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  classify::ThresholdPolicy,
  normalize::{DEFAULT_JPEG_QUALITY, DEFAULT_MAX_LONG_SIDE},
};

pub const DEFAULT_MODEL_ID: &str = "detect-and-classify";
pub const DEFAULT_TIMEOUT_SECS: u64 = 90;
/// 未填写工作空间时的占位值，视为未配置
pub const WORKSPACE_PLACEHOLDER: &str = "your-workspace";
pub const DEFAULT_LOCAL_MODEL_PATH: &str = "models/riceguard.onnx";
pub const DEFAULT_CLASS_NAMES: [&str; 2] = ["broken_grain", "whole_grain"];
pub const DEFAULT_MODEL_INPUT_SIZE: u32 = 640;
pub const DEFAULT_SCORE_FLOOR: f32 = 0.25;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("URL 解析失败: {0}")]
  InvalidUrl(#[from] url::ParseError),
  #[error("配置值无效: {0}")]
  InvalidValue(String),
}

/// 远程推理服务的请求协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemoteProtocol {
  /// `POST {base}/{workspace}/workflows/{id}`，JSON 请求体携带密钥与 base64 图像
  #[default]
  Workflow,
  /// `POST {base}/{model}?api_key=...`，请求体为 base64 图像
  Detect,
}

impl RemoteProtocol {
  pub fn default_base_url(&self) -> &'static str {
    match self {
      RemoteProtocol::Workflow => "https://serverless.roboflow.com",
      RemoteProtocol::Detect => "https://detect.roboflow.com",
    }
  }
}

impl FromStr for RemoteProtocol {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "workflow" | "workflows" => Ok(RemoteProtocol::Workflow),
      "detect" => Ok(RemoteProtocol::Detect),
      other => Err(format!("未知的远程协议 '{}'，可选值: workflow, detect", other)),
    }
  }
}

impl fmt::Display for RemoteProtocol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RemoteProtocol::Workflow => f.write_str("workflow"),
      RemoteProtocol::Detect => f.write_str("detect"),
    }
  }
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
  pub api_key: Option<String>,
  /// 模型或工作流标识，可以是复合令牌
  pub model_id: String,
  pub workspace: Option<String>,
  /// 为空时使用协议默认地址
  pub base_url: Option<Url>,
  pub protocol: RemoteProtocol,
  pub timeout: Duration,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      api_key: None,
      model_id: DEFAULT_MODEL_ID.to_string(),
      workspace: None,
      base_url: None,
      protocol: RemoteProtocol::default(),
      timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
    }
  }
}

impl RemoteConfig {
  pub fn api_key_configured(&self) -> bool {
    self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
  }

  pub fn workspace_configured(&self) -> bool {
    self
      .workspace
      .as_deref()
      .map(str::trim)
      .is_some_and(|w| !w.is_empty() && w != WORKSPACE_PLACEHOLDER)
  }
}

#[derive(Debug, Clone)]
pub struct LocalConfig {
  pub model_path: PathBuf,
  pub input_width: u32,
  pub input_height: u32,
  /// 模型类别索引到类别名的映射
  pub class_names: Vec<String>,
  pub score_floor: f32,
  pub iou_threshold: f32,
}

impl Default for LocalConfig {
  fn default() -> Self {
    Self {
      model_path: PathBuf::from(DEFAULT_LOCAL_MODEL_PATH),
      input_width: DEFAULT_MODEL_INPUT_SIZE,
      input_height: DEFAULT_MODEL_INPUT_SIZE,
      class_names: DEFAULT_CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
      score_floor: DEFAULT_SCORE_FLOOR,
      iou_threshold: DEFAULT_IOU_THRESHOLD,
    }
  }
}

impl FromUrlWithScheme for LocalConfig {
  const SCHEME: &'static str = "onnx";
}

impl FromUrl for LocalConfig {
  type Error = ConfigError;

  /// 形如 `onnx:///models/rice.onnx?size=640` 的地址
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ConfigError::SchemeMismatch(format!(
        "期望模型方案 '{}', 实际方案 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let mut config = LocalConfig {
      model_path: PathBuf::from(url.path()),
      ..LocalConfig::default()
    };

    for (key, value) in url.query_pairs() {
      let parse_err = || ConfigError::InvalidValue(format!("{}={}", key, value));
      match key.as_ref() {
        "size" => {
          let size: u32 = value.parse().map_err(|_| parse_err())?;
          config.input_width = size;
          config.input_height = size;
        }
        "width" => config.input_width = value.parse().map_err(|_| parse_err())?,
        "height" => config.input_height = value.parse().map_err(|_| parse_err())?,
        "classes" => {
          config.class_names = value.split(',').map(|s| s.trim().to_string()).collect()
        }
        _ => return Err(parse_err()),
      }
    }

    Ok(config)
  }
}

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
  pub max_long_side: u32,
  pub threshold: ThresholdPolicy,
  pub jpeg_quality: u8,
  pub remote: RemoteConfig,
  /// 为空时只使用远程检测
  pub local: Option<LocalConfig>,
}

impl Default for AnalyzerConfig {
  fn default() -> Self {
    Self {
      max_long_side: DEFAULT_MAX_LONG_SIDE,
      threshold: ThresholdPolicy::default(),
      jpeg_quality: DEFAULT_JPEG_QUALITY,
      remote: RemoteConfig::default(),
      local: None,
    }
  }
}

impl AnalyzerConfig {
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.max_long_side == 0 {
      return Err(ConfigError::InvalidValue("max_long_side 必须大于 0".to_string()));
    }
    if self.remote.timeout.is_zero() {
      return Err(ConfigError::InvalidValue("timeout 必须大于 0".to_string()));
    }
    if let ThresholdPolicy::Adaptive { factor } = self.threshold
      && !(factor.is_finite() && factor >= 0.0)
    {
      return Err(ConfigError::InvalidValue(format!("阈值系数无效: {}", factor)));
    }
    if let Some(local) = &self.local {
      if local.class_names.is_empty() {
        return Err(ConfigError::InvalidValue("本地模型类别列表为空".to_string()));
      }
      if local.input_width == 0 || local.input_height == 0 {
        return Err(ConfigError::InvalidValue("本地模型输入尺寸必须大于 0".to_string()));
      }
    }
    Ok(())
  }
}
