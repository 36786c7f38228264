// 该文件是 RiceGuard （米粒质检） 项目的一部分。
// src/detect/local.rs - 本地 ONNX 模型推理
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

use std::{collections::HashMap, sync::Mutex, time::Instant};

use image::{RgbImage, imageops::FilterType};
use ndarray::{Array4, ArrayD, Axis, CowArray, Ix2};
use once_cell::sync::OnceCell;
use ort::session::{
  Session,
  builder::{GraphOptimizationLevel, SessionBuilder},
};
use tracing::{debug, info};

use crate::{
  config::LocalConfig,
  detect::{DetectError, Detector, DetectorStatus, RawPrediction},
  normalize::NormalizedImage,
};

/// 本地 YOLO 检测器
///
/// 模型在第一次推理时加载，之后复用同一个会话。
pub struct LocalDetector {
  config: LocalConfig,
  session: OnceCell<Mutex<Session>>,
}

impl LocalDetector {
  pub fn new(config: LocalConfig) -> Self {
    Self {
      config,
      session: OnceCell::new(),
    }
  }

  pub fn is_loaded(&self) -> bool {
    self.session.get().is_some()
  }

  fn session(&self) -> Result<&Mutex<Session>, DetectError> {
    let path = &self.config.model_path;
    if !path.is_file() {
      return Err(DetectError::ModelUnavailable(path.clone()));
    }

    self.session.get_or_try_init(|| {
      info!("加载本地模型文件: {}", path.display());
      let now = Instant::now();
      let session = SessionBuilder::new()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .commit_from_file(path)?;
      info!("模型加载完成，耗时: {:.2?}", now.elapsed());
      Ok::<_, DetectError>(Mutex::new(session))
    })
  }
}

/// 拉伸到模型输入尺寸，转为 `[1, 3, H, W]`、取值 `[0, 1]` 的张量
fn to_input_tensor(pixels: &RgbImage, width: u32, height: u32) -> Array4<f32> {
  let resized = image::imageops::resize(pixels, width, height, FilterType::Triangle);
  let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
  for (x, y, pixel) in resized.enumerate_pixels() {
    for c in 0..3 {
      tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
    }
  }
  tensor
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
  index: usize,
  class_id: usize,
  score: f32,
  center: [f32; 4], // [cx, cy, w, h]
}

impl Candidate {
  fn corners(&self) -> [f32; 4] {
    let [cx, cy, w, h] = self.center;
    [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
  }
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
  let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
  let inter = inter_w * inter_h;
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - inter;
  if union <= 0.0 { 0.0 } else { inter / union }
}

/// 按类别做非极大值抑制，保留原始锚点顺序
fn nms(candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
  let mut by_class: HashMap<usize, Vec<Candidate>> = HashMap::new();
  for candidate in candidates {
    by_class.entry(candidate.class_id).or_default().push(candidate);
  }

  let mut kept = Vec::new();
  for (_, mut group) in by_class {
    group.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut suppressed = vec![false; group.len()];
    for i in 0..group.len() {
      if suppressed[i] {
        continue;
      }
      kept.push(group[i]);
      let corners_i = group[i].corners();
      for j in (i + 1)..group.len() {
        if !suppressed[j] && iou(&corners_i, &group[j].corners()) > iou_threshold {
          suppressed[j] = true;
        }
      }
    }
  }

  kept.sort_by_key(|c| c.index);
  kept
}

/// 解码 YOLOv8 风格的输出张量
///
/// 支持 `[1, 4+nc, N]` 与转置后的 `[1, N, 4+nc]`。`scale_x`/`scale_y`
/// 为原图与模型输入尺寸之比，输出坐标位于原图坐标系。
pub fn decode_yolo_output(
  output: &ArrayD<f32>,
  config: &LocalConfig,
  scale_x: f32,
  scale_y: f32,
) -> Result<Vec<RawPrediction>, DetectError> {
  let num_classes = config.class_names.len();
  if num_classes == 0 {
    return Err(DetectError::Configuration("本地模型类别列表为空".to_string()));
  }
  let channels = 4 + num_classes;

  let shape = output.shape().to_vec();
  if shape.len() != 3 || shape[0] != 1 {
    return Err(DetectError::Inference(format!(
      "期望输出形状为 [1, {}, N]，实际为 {:?}",
      channels, shape
    )));
  }

  let view = output
    .index_axis(Axis(0), 0)
    .into_dimensionality::<Ix2>()
    .map_err(|e| DetectError::Inference(e.to_string()))?;
  let anchors = if shape[1] == channels {
    view
  } else if shape[2] == channels {
    debug!("输出为 [1, N, C] 布局，转置处理");
    view.reversed_axes()
  } else {
    return Err(DetectError::Inference(format!(
      "输出通道数与类别数不匹配: 形状 {:?}, 类别数 {}",
      shape, num_classes
    )));
  };

  let num_anchors = anchors.shape()[1];
  let mut candidates = Vec::new();
  for i in 0..num_anchors {
    let (class_id, score) = (0..num_classes)
      .map(|c| (c, anchors[[4 + c, i]]))
      .fold((0usize, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

    if score < config.score_floor {
      continue;
    }

    candidates.push(Candidate {
      index: i,
      class_id,
      score,
      center: [
        anchors[[0, i]],
        anchors[[1, i]],
        anchors[[2, i]],
        anchors[[3, i]],
      ],
    });
  }

  let before = candidates.len();
  let kept = nms(candidates, config.iou_threshold);
  debug!(
    "本地模型: {} 个锚点，{} 个超过下限，NMS 后保留 {} 个",
    num_anchors,
    before,
    kept.len()
  );

  Ok(
    kept
      .into_iter()
      .map(|c| {
        let [cx, cy, w, h] = c.center;
        RawPrediction {
          class_label: config.class_names[c.class_id].clone(),
          confidence: c.score,
          center_x: cx * scale_x,
          center_y: cy * scale_y,
          width: w * scale_x,
          height: h * scale_y,
        }
      })
      .collect(),
  )
}

impl Detector for LocalDetector {
  fn name(&self) -> &'static str {
    "local"
  }

  fn infer(&self, image: &NormalizedImage) -> Result<Vec<RawPrediction>, DetectError> {
    let session = self.session()?;
    let (input_w, input_h) = (self.config.input_width, self.config.input_height);

    debug!(
      "本地推理: {}x{} -> {}x{}",
      image.width(),
      image.height(),
      input_w,
      input_h
    );
    let input = CowArray::from(to_input_tensor(image.pixels(), input_w, input_h).into_dyn());
    let inputs = ort::inputs![input.view()]?;

    let now = Instant::now();
    let session = session
      .lock()
      .map_err(|_| DetectError::Inference("模型会话锁已损坏".to_string()))?;
    let outputs = session.run(inputs)?;
    let (_, output) = outputs
      .iter()
      .next()
      .ok_or_else(|| DetectError::Inference("模型没有输出".to_string()))?;
    let output: ArrayD<f32> = output.try_extract_tensor::<f32>()?.into_owned();
    info!("本地推理完成，耗时: {:.2?}", now.elapsed());

    decode_yolo_output(
      &output,
      &self.config,
      image.width() as f32 / input_w as f32,
      image.height() as f32 / input_h as f32,
    )
  }

  fn status(&self) -> DetectorStatus {
    let path = &self.config.model_path;
    let (ready, detail) = if self.is_loaded() {
      (true, format!("模型已加载: {}", path.display()))
    } else if path.is_file() {
      (true, format!("模型文件存在，尚未加载: {}", path.display()))
    } else {
      (false, format!("模型文件不存在: {}", path.display()))
    };
    DetectorStatus {
      name: self.name(),
      ready,
      detail,
    }
  }
}
