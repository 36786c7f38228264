// 该文件是 RiceGuard （米粒质检） 项目的一部分。
// src/detect/remote.rs - 远程 HTTP 推理服务
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

use std::time::Instant;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  classify::GrainCategory,
  config::{RemoteConfig, RemoteProtocol},
  detect::{DetectError, Detector, DetectorStatus, RawPrediction, normalize_workflow_id},
  normalize::NormalizedImage,
};

/// 上游错误信息最多保留的字符数
pub const UPSTREAM_DETAIL_LIMIT: usize = 300;

pub struct RemoteDetector {
  config: RemoteConfig,
  workflow_id: String,
  agent: ureq::Agent,
}

impl RemoteDetector {
  pub fn new(config: RemoteConfig) -> Self {
    let workflow_id = normalize_workflow_id(&config.model_id);
    let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
    Self {
      config,
      workflow_id,
      agent,
    }
  }

  pub fn workflow_id(&self) -> &str {
    &self.workflow_id
  }

  pub fn protocol(&self) -> RemoteProtocol {
    self.config.protocol
  }

  fn api_key(&self) -> Result<&str, DetectError> {
    match self.config.api_key.as_deref().map(str::trim) {
      Some(key) if !key.is_empty() => Ok(key),
      _ => Err(DetectError::Configuration("缺少推理服务 API 密钥".to_string())),
    }
  }

  fn model_path(&self) -> Result<String, DetectError> {
    match self.config.protocol {
      RemoteProtocol::Workflow => {
        if self.workflow_id.is_empty() || self.workflow_id == crate::config::WORKSPACE_PLACEHOLDER {
          return Err(DetectError::Configuration("缺少工作流 ID".to_string()));
        }
        if !self.config.workspace_configured() {
          return Err(DetectError::Configuration("缺少工作空间名称".to_string()));
        }
        let workspace = self.config.workspace.as_deref().unwrap_or_default().trim();
        Ok(format!(
          "{}/workflows/{}",
          urlencoding::encode(workspace),
          urlencoding::encode(&self.workflow_id)
        ))
      }
      RemoteProtocol::Detect => {
        let model_id = self.config.model_id.trim().trim_matches('/');
        if model_id.is_empty() {
          return Err(DetectError::Configuration("缺少模型 ID".to_string()));
        }
        Ok(
          model_id
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/"),
        )
      }
    }
  }

  /// 校验配置并拼出请求地址，不包含密钥
  pub fn endpoint(&self) -> Result<Url, DetectError> {
    let path = self.model_path()?;
    let base = match &self.config.base_url {
      Some(url) => url.as_str().to_string(),
      None => self.config.protocol.default_base_url().to_string(),
    };
    let endpoint = format!("{}/{}", base.trim_end_matches('/'), path);
    Url::parse(&endpoint)
      .map_err(|e| DetectError::Configuration(format!("推理服务地址无效 {}: {}", endpoint, e)))
  }

  fn send(
    &self,
    endpoint: &Url,
    api_key: &str,
    image: &[u8],
  ) -> Result<ureq::Response, ureq::Error> {
    let encoded = STANDARD.encode(image);
    match self.config.protocol {
      RemoteProtocol::Workflow => self.agent.post(endpoint.as_str()).send_json(json!({
        "api_key": api_key,
        "inputs": {
          "image": encoded,
        },
      })),
      RemoteProtocol::Detect => self
        .agent
        .post(endpoint.as_str())
        .query("api_key", api_key)
        .set("Content-Type", "application/x-www-form-urlencoded")
        .send_string(&encoded),
    }
  }
}

fn truncate_detail(text: &str) -> String {
  text.chars().take(UPSTREAM_DETAIL_LIMIT).collect()
}

fn upstream_error(err: ureq::Error) -> DetectError {
  match err {
    ureq::Error::Status(status, response) => {
      let body = response.into_string().unwrap_or_default();
      DetectError::Upstream {
        status: Some(status),
        detail: truncate_detail(&body),
      }
    }
    ureq::Error::Transport(transport) => DetectError::Upstream {
      status: None,
      detail: truncate_detail(&transport.to_string()),
    },
  }
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamResponse {
  #[serde(default)]
  predictions: Option<PredictionBlock>,
  #[serde(default)]
  outputs: Option<Vec<Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkflowOutput {
  #[serde(default)]
  predictions: Option<PredictionBlock>,
}

/// 工作流输出里的 `predictions` 既可能是数组，也可能是再包一层的对象
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PredictionBlock {
  List(Vec<Value>),
  Nested {
    #[serde(default)]
    predictions: Vec<Value>,
  },
}

impl PredictionBlock {
  fn into_entries(self) -> Vec<Value> {
    match self {
      PredictionBlock::List(entries) => entries,
      PredictionBlock::Nested { predictions } => predictions,
    }
  }
}

#[derive(Debug, Deserialize)]
struct WirePrediction {
  #[serde(default)]
  class: Option<String>,
  #[serde(default)]
  confidence: Option<f32>,
  x: f32,
  y: f32,
  width: f32,
  height: f32,
}

impl UpstreamResponse {
  fn into_entries(self) -> Vec<Value> {
    if let Some(block) = self.predictions {
      return block.into_entries();
    }

    self
      .outputs
      .and_then(|outputs| outputs.into_iter().next())
      .and_then(|first| serde_json::from_value::<WorkflowOutput>(first).ok())
      .and_then(|output| output.predictions)
      .map(PredictionBlock::into_entries)
      .unwrap_or_default()
  }
}

/// 解析上游响应体
///
/// 缺少置信度按 0 处理；类别缺失、无法识别或坐标缺失的条目直接跳过。
pub fn parse_response_body(body: &str) -> Result<Vec<RawPrediction>, serde_json::Error> {
  let response: UpstreamResponse = serde_json::from_str(body)?;
  let entries = response.into_entries();
  let total = entries.len();

  let predictions: Vec<RawPrediction> = entries
    .into_iter()
    .filter_map(|entry| {
      let wire: WirePrediction = match serde_json::from_value(entry) {
        Ok(wire) => wire,
        Err(e) => {
          debug!("跳过无法解析的预测: {}", e);
          return None;
        }
      };
      let class_label = wire.class?;
      GrainCategory::from_label(&class_label)?;
      Some(RawPrediction {
        class_label,
        confidence: wire.confidence.unwrap_or(0.0),
        center_x: wire.x,
        center_y: wire.y,
        width: wire.width,
        height: wire.height,
      })
    })
    .collect();

  if predictions.len() < total {
    debug!("上游返回 {} 个预测，跳过 {} 个", total, total - predictions.len());
  }
  Ok(predictions)
}

impl Detector for RemoteDetector {
  fn name(&self) -> &'static str {
    "remote"
  }

  fn infer(&self, image: &NormalizedImage) -> Result<Vec<RawPrediction>, DetectError> {
    let api_key = self.api_key()?;
    let endpoint = self.endpoint()?;

    info!(
      "调用远程推理服务 ({}): {}，图像 {} 字节",
      self.config.protocol,
      endpoint,
      image.bytes().len()
    );
    let now = Instant::now();
    let response = self.send(&endpoint, api_key, image.bytes()).map_err(|e| {
      let err = upstream_error(e);
      error!("远程推理失败: {}", err);
      err
    })?;
    let status = response.status();

    let body = response.into_string().map_err(|e| DetectError::Upstream {
      status: Some(status),
      detail: truncate_detail(&format!("读取响应失败: {}", e)),
    })?;
    let predictions = parse_response_body(&body).map_err(|e| {
      warn!("上游响应不是有效的 JSON: {}", e);
      DetectError::Upstream {
        status: Some(status),
        detail: truncate_detail(&format!("响应不是有效的 JSON: {}", e)),
      }
    })?;

    info!("远程推理完成，耗时: {:.2?}", now.elapsed());
    Ok(predictions)
  }

  fn status(&self) -> DetectorStatus {
    let check = self.api_key().and_then(|_| self.endpoint());
    match check {
      Ok(endpoint) => DetectorStatus {
        name: self.name(),
        ready: true,
        detail: endpoint.to_string(),
      },
      Err(e) => DetectorStatus {
        name: self.name(),
        ready: false,
        detail: e.to_string(),
      },
    }
  }
}
