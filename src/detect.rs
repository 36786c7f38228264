// 该文件是 RiceGuard （米粒质检） 项目的一部分。
// src/detect.rs - 检测源抽象与回退链
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

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::normalize::NormalizedImage;

/// 检测器输出的原始预测，坐标为归一化图像中的像素坐标
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawPrediction {
  pub class_label: String,
  pub confidence: f32,
  pub center_x: f32,
  pub center_y: f32,
  pub width: f32,
  pub height: f32,
}

#[derive(Error, Debug)]
pub enum DetectError {
  #[error("本地模型不可用: {}", .0.display())]
  ModelUnavailable(PathBuf),
  #[error("配置错误: {0}")]
  Configuration(String),
  #[error("上游推理服务失败 ({}): {detail}", fmt_status(.status))]
  Upstream { status: Option<u16>, detail: String },
  #[error("本地推理失败: {0}")]
  Inference(String),
}

fn fmt_status(status: &Option<u16>) -> String {
  match status {
    Some(code) => code.to_string(),
    None => "无响应".to_string(),
  }
}

#[cfg(feature = "local_onnx")]
impl From<ort::Error> for DetectError {
  fn from(err: ort::Error) -> Self {
    DetectError::Inference(err.to_string())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorStatus {
  pub name: &'static str,
  pub ready: bool,
  pub detail: String,
}

pub trait Detector: Send + Sync {
  fn name(&self) -> &'static str;

  fn infer(&self, image: &NormalizedImage) -> Result<Vec<RawPrediction>, DetectError>;

  /// 不执行推理，仅报告所需配置是否齐全
  fn status(&self) -> DetectorStatus;
}

/// 按顺序尝试的检测器列表
///
/// `ModelUnavailable` 会跳到下一个检测器，其他错误立即返回。
#[derive(Default)]
pub struct DetectorChain {
  detectors: Vec<Box<dyn Detector>>,
}

impl DetectorChain {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with<D: Detector + 'static>(mut self, detector: D) -> Self {
    self.push(Box::new(detector));
    self
  }

  pub fn push(&mut self, detector: Box<dyn Detector>) {
    debug!("注册检测器: {}", detector.name());
    self.detectors.push(detector);
  }

  pub fn len(&self) -> usize {
    self.detectors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.detectors.is_empty()
  }

  pub fn statuses(&self) -> Vec<DetectorStatus> {
    self.detectors.iter().map(|d| d.status()).collect()
  }

  /// 返回实际使用的检测器名称与其预测结果
  pub fn infer(
    &self,
    image: &NormalizedImage,
  ) -> Result<(&'static str, Vec<RawPrediction>), DetectError> {
    for detector in &self.detectors {
      match detector.infer(image) {
        Ok(predictions) => {
          info!(
            "检测器 {} 返回 {} 个预测",
            detector.name(),
            predictions.len()
          );
          return Ok((detector.name(), predictions));
        }
        Err(DetectError::ModelUnavailable(path)) => {
          warn!(
            "检测器 {} 不可用 ({})，尝试下一个",
            detector.name(),
            path.display()
          );
        }
        Err(e) => return Err(e),
      }
    }

    Err(DetectError::Configuration(
      "没有可用的检测器".to_string(),
    ))
  }
}

#[cfg(feature = "local_onnx")]
mod local;
mod remote;
mod workflow_id;

#[cfg(feature = "local_onnx")]
pub use self::local::{LocalDetector, decode_yolo_output};
pub use self::remote::{RemoteDetector, UPSTREAM_DETAIL_LIMIT, parse_response_body};
pub use self::workflow_id::normalize_workflow_id;
