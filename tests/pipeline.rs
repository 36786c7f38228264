// 该文件是 RiceGuard （米粒质检） 项目的一部分。
// tests/pipeline.rs - 分析流程集成测试
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

use std::{
  io::Cursor,
  sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
  },
};

use image::{ImageFormat, RgbImage};

use riceguard::{
  AnalyzeError, Analyzer, DetectError, Detector, DetectorChain, GrainCategory, RawPrediction,
  ThresholdPolicy,
  config::AnalyzerConfig,
  detect::DetectorStatus,
  normalize::NormalizedImage,
  pipeline::ErrorKind,
};

#[derive(Clone, Default)]
struct CallLog {
  calls: Arc<AtomicUsize>,
  seen: Arc<Mutex<Vec<(u32, u32)>>>,
}

/// 返回固定预测或固定错误的检测器
struct Fixed {
  outcome: fn() -> Result<Vec<RawPrediction>, DetectError>,
  log: CallLog,
}

impl Detector for Fixed {
  fn name(&self) -> &'static str {
    "fixed"
  }

  fn infer(&self, image: &NormalizedImage) -> Result<Vec<RawPrediction>, DetectError> {
    self.log.calls.fetch_add(1, Ordering::SeqCst);
    self
      .log
      .seen
      .lock()
      .unwrap()
      .push((image.width(), image.height()));
    (self.outcome)()
  }

  fn status(&self) -> DetectorStatus {
    DetectorStatus {
      name: self.name(),
      ready: true,
      detail: String::new(),
    }
  }
}

fn prediction(label: &str, confidence: f32, cx: f32, cy: f32) -> RawPrediction {
  RawPrediction {
    class_label: label.to_string(),
    confidence,
    center_x: cx,
    center_y: cy,
    width: 20.0,
    height: 20.0,
  }
}

fn mixed_batch() -> Result<Vec<RawPrediction>, DetectError> {
  Ok(vec![
    prediction("broken", 0.9, 20.0, 20.0),
    prediction("broken", 0.5, 50.0, 50.0),
    prediction("whole", 0.8, 80.0, 80.0),
  ])
}

fn png(width: u32, height: u32) -> Vec<u8> {
  let mut cursor = Cursor::new(Vec::new());
  RgbImage::from_pixel(width, height, image::Rgb([120, 110, 90]))
    .write_to(&mut cursor, ImageFormat::Png)
    .unwrap();
  cursor.into_inner()
}

fn analyzer_with(
  outcome: fn() -> Result<Vec<RawPrediction>, DetectError>,
  config: AnalyzerConfig,
) -> (Analyzer, CallLog) {
  let log = CallLog::default();
  let chain = DetectorChain::new().with(Fixed {
    outcome,
    log: log.clone(),
  });
  (Analyzer::with_chain(config, chain).unwrap(), log)
}

#[test]
fn adaptive_threshold_end_to_end() {
  let (analyzer, log) = analyzer_with(mixed_batch, AnalyzerConfig::default());
  let result = analyzer.analyze(&png(100, 100)).unwrap();

  assert_eq!(log.calls.load(Ordering::SeqCst), 1);
  assert_eq!(result.total_grains, 2);
  assert_eq!(result.broken_grains, 1);
  assert_eq!(result.whole_grains, 1);
  assert_eq!(result.broken_percentage, 50.0);
  assert_eq!(result.avg_model_confidence, 0.85);
  assert_eq!(result.detector, "fixed");

  let categories: Vec<GrainCategory> = result.detections.iter().map(|d| d.category).collect();
  assert_eq!(categories, vec![GrainCategory::Broken, GrainCategory::Whole]);
  assert_eq!(result.detections[0].bbox, [10.0, 10.0, 30.0, 30.0]);

  let annotated = image::load_from_memory(&result.processed_image).unwrap();
  assert_eq!((annotated.width(), annotated.height()), (100, 100));
}

#[test]
fn accept_all_keeps_low_confidence_grains() {
  let config = AnalyzerConfig {
    threshold: ThresholdPolicy::AcceptAll,
    ..AnalyzerConfig::default()
  };
  let (analyzer, _) = analyzer_with(mixed_batch, config);
  let result = analyzer.analyze(&png(100, 100)).unwrap();
  assert_eq!(result.total_grains, 3);
  assert_eq!(result.broken_percentage, 66.67);
}

#[test]
fn repeated_analysis_is_identical() {
  let (analyzer, _) = analyzer_with(mixed_batch, AnalyzerConfig::default());
  let bytes = png(100, 100);
  let first = analyzer.analyze(&bytes).unwrap();
  let second = analyzer.analyze(&bytes).unwrap();

  assert_eq!(first.detections, second.detections);
  assert_eq!(first.broken_percentage, second.broken_percentage);
  assert_eq!(first.avg_model_confidence, second.avg_model_confidence);
  assert_eq!(first.processed_image, second.processed_image);
}

#[test]
fn oversized_images_are_analyzed_in_normalized_space() {
  let (analyzer, log) = analyzer_with(mixed_batch, AnalyzerConfig::default());
  let result = analyzer.analyze(&png(2000, 1000)).unwrap();

  assert_eq!(*log.seen.lock().unwrap(), vec![(1280, 640)]);
  let annotated = image::load_from_memory(&result.processed_image).unwrap();
  assert_eq!((annotated.width(), annotated.height()), (1280, 640));
}

#[test]
fn invalid_image_fails_before_detection() {
  let (analyzer, log) = analyzer_with(mixed_batch, AnalyzerConfig::default());

  for bytes in [&b""[..], &b"definitely not an image"[..]] {
    let err = analyzer.analyze(bytes).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidImage);
  }
  assert_eq!(log.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn upstream_failure_propagates() {
  let (analyzer, _) = analyzer_with(
    || {
      Err(DetectError::Upstream {
        status: Some(502),
        detail: "bad gateway".to_string(),
      })
    },
    AnalyzerConfig::default(),
  );
  let err = analyzer.analyze(&png(32, 32)).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Upstream);
  assert!(matches!(
    err,
    AnalyzeError::Detect(DetectError::Upstream { status: Some(502), .. })
  ));
}

#[test]
fn unrecognized_labels_are_ignored() {
  let (analyzer, _) = analyzer_with(
    || {
      Ok(vec![
        prediction("stone", 0.99, 10.0, 10.0),
        prediction("Whole-Grain", 0.7, 30.0, 30.0),
        prediction("chalky", 0.95, 50.0, 50.0),
      ])
    },
    AnalyzerConfig::default(),
  );
  let result = analyzer.analyze(&png(64, 64)).unwrap();
  assert_eq!(result.total_grains, 1);
  assert_eq!(result.whole_grains, 1);
  assert_eq!(result.broken_percentage, 0.0);
  assert_eq!(result.avg_model_confidence, 0.7);
}

#[test]
fn empty_prediction_set_yields_zero_metrics() {
  let (analyzer, _) = analyzer_with(|| Ok(vec![]), AnalyzerConfig::default());
  let result = analyzer.analyze(&png(64, 64)).unwrap();
  assert_eq!(result.total_grains, 0);
  assert_eq!(result.broken_percentage, 0.0);
  assert_eq!(result.avg_model_confidence, 0.0);
  assert!(!result.processed_image.is_empty());
}

#[test]
fn no_ready_detector_is_configuration_error() {
  let analyzer = Analyzer::new(AnalyzerConfig::default()).unwrap();
  let err = analyzer.analyze(&png(16, 16)).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Configuration);
  assert!(!analyzer.status().ready);
}

#[cfg(feature = "local_onnx")]
mod local_fallback {
  use std::time::Duration;

  use httpmock::{Method::POST, MockServer};
  use serde_json::json;
  use tempfile::tempdir;
  use url::Url;

  use riceguard::config::{LocalConfig, RemoteConfig};

  use super::*;

  #[test]
  fn missing_local_model_falls_back_to_remote() {
    let dir = tempdir().unwrap();
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
      when.method(POST).path("/acme/workflows/rice-quality");
      then.status(200).json_body(json!({
        "predictions": [
          {"class": "broken_grain", "confidence": 0.8, "x": 10, "y": 10, "width": 8, "height": 8},
          {"class": "whole_grain", "confidence": 0.9, "x": 30, "y": 30, "width": 8, "height": 8}
        ]
      }));
    });

    let config = AnalyzerConfig {
      remote: RemoteConfig {
        api_key: Some("secret".to_string()),
        model_id: "rice-quality".to_string(),
        workspace: Some("acme".to_string()),
        base_url: Some(Url::parse(&server.base_url()).unwrap()),
        timeout: Duration::from_secs(5),
        ..RemoteConfig::default()
      },
      local: Some(LocalConfig {
        model_path: dir.path().join("riceguard.onnx"),
        ..LocalConfig::default()
      }),
      ..AnalyzerConfig::default()
    };
    let analyzer = Analyzer::new(config).unwrap();

    let status = analyzer.status();
    assert!(status.ready);
    assert!(!status.local_model_present);
    assert_eq!(status.detectors.len(), 2);

    let result = analyzer.analyze(&png(48, 48)).unwrap();
    mock.assert();
    assert_eq!(result.detector, "remote");
    assert_eq!(result.total_grains, 2);
    assert_eq!(result.broken_percentage, 50.0);
  }
}
