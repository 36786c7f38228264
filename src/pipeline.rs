// 该文件是 RiceGuard （米粒质检） 项目的一部分。
// src/pipeline.rs - 米粒质检分析流程
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
use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  annotate::{AnnotateError, Annotator},
  classify::{CanonicalDetection, ThresholdPolicy, classify},
  config::{AnalyzerConfig, ConfigError},
  detect::{
    DetectError, DetectorChain, DetectorStatus, RawPrediction, RemoteDetector,
    normalize_workflow_id,
  },
  metrics::{QualityMetrics, aggregate},
  normalize::{NormalizeError, normalize},
};

#[derive(Error, Debug)]
pub enum AnalyzeError {
  #[error(transparent)]
  Normalize(#[from] NormalizeError),
  #[error(transparent)]
  Detect(#[from] DetectError),
  #[error(transparent)]
  Annotate(#[from] AnnotateError),
}

/// 错误类别，供外层映射为 HTTP 状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  InvalidImage,
  Configuration,
  Upstream,
  Internal,
}

impl AnalyzeError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      AnalyzeError::Normalize(NormalizeError::InvalidImage(_)) => ErrorKind::InvalidImage,
      AnalyzeError::Normalize(NormalizeError::Encode(_)) => ErrorKind::Internal,
      AnalyzeError::Detect(DetectError::ModelUnavailable(_) | DetectError::Configuration(_)) => {
        ErrorKind::Configuration
      }
      AnalyzeError::Detect(DetectError::Upstream { .. }) => ErrorKind::Upstream,
      AnalyzeError::Detect(DetectError::Inference(_)) => ErrorKind::Internal,
      AnalyzeError::Annotate(_) => ErrorKind::Internal,
    }
  }
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
  serializer.serialize_str(&STANDARD.encode(bytes))
}

/// 单次分析的结果
///
/// 序列化时 `processed_image` 编码为 base64 字符串。
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
  pub total_grains: usize,
  pub whole_grains: usize,
  pub broken_grains: usize,
  pub broken_percentage: f64,
  pub avg_model_confidence: f64,
  #[serde(serialize_with = "serialize_base64")]
  pub processed_image: Vec<u8>,
  #[serde(skip)]
  pub detections: Vec<CanonicalDetection>,
  /// 实际产生预测的检测器
  #[serde(skip)]
  pub detector: &'static str,
}

impl AnalysisResult {
  fn new(
    metrics: QualityMetrics,
    detections: Vec<CanonicalDetection>,
    processed_image: Vec<u8>,
    detector: &'static str,
  ) -> Self {
    Self {
      total_grains: metrics.total(),
      whole_grains: metrics.counts.whole,
      broken_grains: metrics.counts.broken,
      broken_percentage: metrics.broken_percentage,
      avg_model_confidence: metrics.avg_confidence,
      processed_image,
      detections,
      detector,
    }
  }
}

/// 过滤、分类并统计一批原始预测
pub fn score(
  predictions: &[RawPrediction],
  image_width: u32,
  image_height: u32,
  policy: ThresholdPolicy,
) -> (Vec<CanonicalDetection>, QualityMetrics) {
  let detections = classify(predictions, image_width, image_height, policy);
  let metrics = aggregate(&detections);
  (detections, metrics)
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
  pub ready: bool,
  pub remote_configured: bool,
  pub workspace_configured: bool,
  pub workflow_id: String,
  pub local_model_present: bool,
  pub threshold_policy: String,
  pub max_long_side: u32,
  pub detectors: Vec<DetectorStatus>,
}

pub struct Analyzer {
  config: AnalyzerConfig,
  chain: DetectorChain,
  annotator: Annotator,
}

#[cfg(feature = "local_onnx")]
fn push_local(chain: &mut DetectorChain, config: &AnalyzerConfig) {
  if let Some(local) = &config.local {
    chain.push(Box::new(crate::detect::LocalDetector::new(local.clone())));
  }
}

#[cfg(not(feature = "local_onnx"))]
fn push_local(_chain: &mut DetectorChain, config: &AnalyzerConfig) {
  if let Some(local) = &config.local {
    warn!(
      "未启用 local_onnx 特性，忽略本地模型: {}",
      local.model_path.display()
    );
  }
}

impl Analyzer {
  /// 按配置组装检测链：本地模型优先，远程服务兜底
  pub fn new(config: AnalyzerConfig) -> Result<Self, ConfigError> {
    let mut chain = DetectorChain::new();
    push_local(&mut chain, &config);
    chain.push(Box::new(RemoteDetector::new(config.remote.clone())));
    Self::with_chain(config, chain)
  }

  pub fn with_chain(config: AnalyzerConfig, chain: DetectorChain) -> Result<Self, ConfigError> {
    config.validate()?;
    if chain.is_empty() {
      warn!("检测链为空，所有分析请求都会失败");
    }
    let annotator = Annotator::default().with_jpeg_quality(config.jpeg_quality);
    info!(
      "分析器就绪: {} 个检测器, 阈值策略 {}, 最大长边 {}",
      chain.len(),
      config.threshold,
      config.max_long_side
    );
    Ok(Self {
      config,
      chain,
      annotator,
    })
  }

  pub fn config(&self) -> &AnalyzerConfig {
    &self.config
  }

  pub fn analyze(&self, bytes: &[u8]) -> Result<AnalysisResult, AnalyzeError> {
    let started = Instant::now();
    let image = normalize(bytes, self.config.max_long_side)?;
    debug!(
      "图像归一化完成: {}x{}，缩放: {}，耗时: {:.2?}",
      image.width(),
      image.height(),
      image.was_resized(),
      started.elapsed()
    );

    let now = Instant::now();
    let (detector, predictions) = self.chain.infer(&image)?;
    info!(
      "检测器 {} 推理完成，耗时: {:.2?}",
      detector,
      now.elapsed()
    );

    let (detections, metrics) = score(
      &predictions,
      image.width(),
      image.height(),
      self.config.threshold,
    );

    let now = Instant::now();
    let processed_image = self.annotator.render(image.pixels(), &detections)?;
    debug!("标注完成，耗时: {:.2?}", now.elapsed());

    info!(
      "分析完成: 共 {} 粒，整粒 {}，碎粒 {} ({:.2}%)，总耗时: {:.2?}",
      metrics.total(),
      metrics.counts.whole,
      metrics.counts.broken,
      metrics.broken_percentage,
      started.elapsed()
    );

    Ok(AnalysisResult::new(
      metrics,
      detections,
      processed_image,
      detector,
    ))
  }

  /// 报告当前配置状态，不执行推理
  pub fn status(&self) -> ServiceStatus {
    let detectors = self.chain.statuses();
    ServiceStatus {
      ready: detectors.iter().any(|d| d.ready),
      remote_configured: self.config.remote.api_key_configured(),
      workspace_configured: self.config.remote.workspace_configured(),
      workflow_id: normalize_workflow_id(&self.config.remote.model_id),
      local_model_present: self
        .config
        .local
        .as_ref()
        .is_some_and(|local| local.model_path.is_file()),
      threshold_policy: self.config.threshold.to_string(),
      max_long_side: self.config.max_long_side,
      detectors,
    }
  }
}
