// 该文件是 RiceGuard （米粒质检） 项目的一部分。
// src/metrics.rs - 质检指标统计
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

use serde::Serialize;

use crate::classify::{CanonicalDetection, GrainCategory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CategoryCounts {
  pub whole: usize,
  pub broken: usize,
}

impl CategoryCounts {
  pub fn increment(&mut self, category: GrainCategory) {
    match category {
      GrainCategory::Whole => self.whole += 1,
      GrainCategory::Broken => self.broken += 1,
    }
  }

  pub fn get(&self, category: GrainCategory) -> usize {
    match category {
      GrainCategory::Whole => self.whole,
      GrainCategory::Broken => self.broken,
    }
  }

  pub fn total(&self) -> usize {
    self.whole + self.broken
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct QualityMetrics {
  pub counts: CategoryCounts,
  /// 碎粒占比，百分数，保留两位小数
  pub broken_percentage: f64,
  /// 平均置信度，保留三位小数
  pub avg_confidence: f64,
}

impl QualityMetrics {
  pub fn total(&self) -> usize {
    self.counts.total()
  }
}

/// 四舍六入五成双
pub fn round_to(value: f64, decimals: i32) -> f64 {
  let factor = 10f64.powi(decimals);
  (value * factor).round_ties_even() / factor
}

pub fn aggregate(detections: &[CanonicalDetection]) -> QualityMetrics {
  let mut counts = CategoryCounts::default();
  let mut confidence_sum = 0.0f64;
  for detection in detections {
    counts.increment(detection.category);
    confidence_sum += detection.confidence as f64;
  }

  let total = counts.total();
  let (broken_percentage, avg_confidence) = if total == 0 {
    (0.0, 0.0)
  } else {
    (
      100.0 * counts.broken as f64 / total as f64,
      confidence_sum / total as f64,
    )
  };

  QualityMetrics {
    counts,
    broken_percentage: round_to(broken_percentage, 2),
    avg_confidence: round_to(avg_confidence, 3),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn det(category: GrainCategory, confidence: f32) -> CanonicalDetection {
    CanonicalDetection {
      category,
      confidence,
      bbox: [0.0, 0.0, 1.0, 1.0],
    }
  }

  #[test]
  fn test_empty_detections() {
    let metrics = aggregate(&[]);
    assert_eq!(metrics.total(), 0);
    assert_eq!(metrics.broken_percentage, 0.0);
    assert_eq!(metrics.avg_confidence, 0.0);
  }

  #[test]
  fn test_counts_and_percentage() {
    let detections = vec![
      det(GrainCategory::Whole, 0.9),
      det(GrainCategory::Broken, 0.6),
      det(GrainCategory::Whole, 0.8),
    ];
    let metrics = aggregate(&detections);
    assert_eq!(metrics.counts.whole, 2);
    assert_eq!(metrics.counts.broken, 1);
    assert_eq!(metrics.counts.whole + metrics.counts.broken, metrics.total());
    assert_eq!(metrics.broken_percentage, 33.33);
    assert_eq!(metrics.avg_confidence, 0.767);
  }

  #[test]
  fn test_all_broken() {
    let detections = vec![det(GrainCategory::Broken, 1.0); 4];
    let metrics = aggregate(&detections);
    assert_eq!(metrics.broken_percentage, 100.0);
    assert_eq!(metrics.avg_confidence, 1.0);
    assert_eq!(metrics.counts.get(GrainCategory::Broken), 4);
    assert_eq!(metrics.counts.get(GrainCategory::Whole), 0);
  }

  #[test]
  fn test_bounds_hold_for_mixed_batches() {
    for n in 1..40usize {
      let detections: Vec<CanonicalDetection> = (0..n)
        .map(|i| {
          let category = if i % 3 == 0 {
            GrainCategory::Broken
          } else {
            GrainCategory::Whole
          };
          det(category, (i as f32 / n as f32).min(1.0))
        })
        .collect();
      let metrics = aggregate(&detections);
      assert_eq!(metrics.total(), n);
      assert!((0.0..=100.0).contains(&metrics.broken_percentage));
      assert!((0.0..=1.0).contains(&metrics.avg_confidence));
      let exact = 100.0 * metrics.counts.broken as f64 / n as f64;
      assert!((metrics.broken_percentage - exact).abs() <= 0.005 + 1e-9);
    }
  }

  #[test]
  fn test_round_to() {
    assert_eq!(round_to(0.76666, 3), 0.767);
    assert_eq!(round_to(12.344, 2), 12.34);
    assert_eq!(round_to(0.0, 2), 0.0);
    assert_eq!(round_to(3.125, 2), 3.12);
    assert_eq!(round_to(0.0625, 3), 0.062);
  }

  #[test]
  fn test_ties_round_to_even() {
    let mut detections = vec![det(GrainCategory::Whole, 0.0625); 31];
    detections.push(det(GrainCategory::Broken, 0.0625));
    let metrics = aggregate(&detections);
    assert_eq!(metrics.broken_percentage, 3.12);
    assert_eq!(metrics.avg_confidence, 0.062);
  }
}
