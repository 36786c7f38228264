// 该文件是 RiceGuard （米粒质检） 项目的一部分。
// src/classify.rs - 类别归一、自适应阈值过滤与边界框转换
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

use std::{fmt, str::FromStr};

use serde::Serialize;
use tracing::debug;

use crate::detect::RawPrediction;

pub const DEFAULT_THRESHOLD_FACTOR: f32 = 0.75;

/// 米粒类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrainCategory {
  Whole,
  Broken,
}

impl GrainCategory {
  /// 将模型输出的各种类别名归一为两类，无法识别时返回 None
  pub fn from_label(label: &str) -> Option<Self> {
    let key: String = label
      .trim()
      .chars()
      .map(|c| match c {
        '-' | ' ' => '_',
        c => c.to_ascii_lowercase(),
      })
      .collect();

    match key.as_str() {
      "broken" | "broken_grain" | "broken_rice" => Some(GrainCategory::Broken),
      "whole" | "whole_grain" | "whole_rice" | "full" | "full_grain" => Some(GrainCategory::Whole),
      _ => None,
    }
  }

  pub fn as_label(&self) -> &'static str {
    match self {
      GrainCategory::Whole => "whole_grain",
      GrainCategory::Broken => "broken_grain",
    }
  }
}

impl fmt::Display for GrainCategory {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_label())
  }
}

/// 置信度过滤策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdPolicy {
  /// 每个类别的阈值为 `factor × 该类别平均置信度`
  Adaptive { factor: f32 },
  /// 只要类别可识别就全部接受
  AcceptAll,
}

impl Default for ThresholdPolicy {
  fn default() -> Self {
    ThresholdPolicy::Adaptive {
      factor: DEFAULT_THRESHOLD_FACTOR,
    }
  }
}

impl FromStr for ThresholdPolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "adaptive" => Ok(ThresholdPolicy::default()),
      "accept-all" | "accept_all" | "none" => Ok(ThresholdPolicy::AcceptAll),
      other => Err(format!(
        "未知的阈值策略 '{}'，可选值: adaptive, accept-all",
        other
      )),
    }
  }
}

impl fmt::Display for ThresholdPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ThresholdPolicy::Adaptive { factor } => write!(f, "adaptive({})", factor),
      ThresholdPolicy::AcceptAll => f.write_str("accept-all"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CanonicalDetection {
  pub category: GrainCategory,
  pub confidence: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CategoryThresholds {
  pub whole: f32,
  pub broken: f32,
}

impl CategoryThresholds {
  pub fn for_category(&self, category: GrainCategory) -> f32 {
    match category {
      GrainCategory::Whole => self.whole,
      GrainCategory::Broken => self.broken,
    }
  }
}

fn sanitize_confidence(confidence: f32) -> f32 {
  if confidence.is_nan() {
    0.0
  } else {
    confidence.clamp(0.0, 1.0)
  }
}

fn mean(values: impl Iterator<Item = f32>) -> f32 {
  let (sum, count) = values.fold((0.0f32, 0usize), |(s, n), v| (s + v, n + 1));
  if count == 0 { 0.0 } else { sum / count as f32 }
}

/// 按类别统计平均置信度，阈值为 `factor × 平均值`，空类别阈值为 0
pub fn adaptive_thresholds(labelled: &[(GrainCategory, f32)], factor: f32) -> CategoryThresholds {
  let of = |category: GrainCategory| {
    factor
      * mean(
        labelled
          .iter()
          .filter(|(c, _)| *c == category)
          .map(|(_, conf)| *conf),
      )
  };

  CategoryThresholds {
    whole: of(GrainCategory::Whole),
    broken: of(GrainCategory::Broken),
  }
}

/// 中心点 + 宽高 转为左上/右下角坐标，并裁剪到图像范围内
pub fn corner_box(
  center_x: f32,
  center_y: f32,
  width: f32,
  height: f32,
  image_width: u32,
  image_height: u32,
) -> [f32; 4] {
  let (w, h) = (image_width as f32, image_height as f32);

  let x_min = (center_x - width / 2.0).max(0.0).min(w);
  let y_min = (center_y - height / 2.0).max(0.0).min(h);
  let x_max = (center_x + width / 2.0).min(w).max(x_min);
  let y_max = (center_y + height / 2.0).min(h).max(y_min);

  [x_min, y_min, x_max, y_max]
}

/// 过滤并分类原始预测
///
/// 无法识别类别的预测直接丢弃，不参与阈值计算。输出顺序与输入一致。
pub fn classify(
  predictions: &[RawPrediction],
  image_width: u32,
  image_height: u32,
  policy: ThresholdPolicy,
) -> Vec<CanonicalDetection> {
  let labelled: Vec<(GrainCategory, f32, &RawPrediction)> = predictions
    .iter()
    .filter_map(|p| {
      GrainCategory::from_label(&p.class_label)
        .map(|category| (category, sanitize_confidence(p.confidence), p))
    })
    .collect();

  let dropped = predictions.len() - labelled.len();
  if dropped > 0 {
    debug!("丢弃 {} 个无法识别类别的预测", dropped);
  }

  let thresholds = match policy {
    ThresholdPolicy::Adaptive { factor } => {
      let pairs: Vec<(GrainCategory, f32)> =
        labelled.iter().map(|(c, conf, _)| (*c, *conf)).collect();
      adaptive_thresholds(&pairs, factor)
    }
    ThresholdPolicy::AcceptAll => CategoryThresholds::default(),
  };
  debug!(
    "类别阈值: 完整粒 {:.4}, 碎粒 {:.4}",
    thresholds.whole, thresholds.broken
  );

  let detections: Vec<CanonicalDetection> = labelled
    .into_iter()
    .filter(|(category, confidence, _)| *confidence >= thresholds.for_category(*category))
    .map(|(category, confidence, p)| CanonicalDetection {
      category,
      confidence,
      bbox: corner_box(
        p.center_x,
        p.center_y,
        p.width,
        p.height,
        image_width,
        image_height,
      ),
    })
    .collect();

  debug!(
    "阈值过滤: {} 个预测中保留 {} 个",
    predictions.len(),
    detections.len()
  );
  detections
}
