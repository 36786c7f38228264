// 该文件是 RiceGuard （米粒质检） 项目的一部分。
// src/annotate.rs - 检测结果可视化
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

use image::{Rgb, RgbImage};
use imageproc::{drawing::draw_filled_rect_mut, rect::Rect};
use thiserror::Error;
use tracing::debug;

use crate::{
  classify::{CanonicalDetection, GrainCategory},
  normalize::{DEFAULT_JPEG_QUALITY, NormalizeError, encode_jpeg},
};

pub const WHOLE_COLOR: [u8; 3] = [0, 255, 0]; // 绿色
pub const BROKEN_COLOR: [u8; 3] = [255, 0, 0]; // 红色
const BOX_THICKNESS: i32 = 2;

#[derive(Error, Debug)]
pub enum AnnotateError {
  #[error("标注图像编码失败: {0}")]
  Encode(#[from] NormalizeError),
}

pub struct Annotator {
  whole_color: [u8; 3],
  broken_color: [u8; 3],
  thickness: i32,
  jpeg_quality: u8,
}

impl Default for Annotator {
  fn default() -> Self {
    Self {
      whole_color: WHOLE_COLOR,
      broken_color: BROKEN_COLOR,
      thickness: BOX_THICKNESS,
      jpeg_quality: DEFAULT_JPEG_QUALITY,
    }
  }
}

impl Annotator {
  pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
    self.jpeg_quality = quality;
    self
  }

  pub fn color_for(&self, category: GrainCategory) -> [u8; 3] {
    match category {
      GrainCategory::Whole => self.whole_color,
      GrainCategory::Broken => self.broken_color,
    }
  }

  // bbox 为像素坐标 [x1, y1, x2, y2]，取整后向内加粗
  fn draw_bbox(&self, image: &mut RgbImage, bbox: &[f32; 4], color: [u8; 3]) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = (bbox[0] as i32).clamp(0, w - 1);
    let y_min = (bbox[1] as i32).clamp(0, h - 1);
    let x_max = (bbox[2] as i32).clamp(0, w - 1);
    let y_max = (bbox[3] as i32).clamp(0, h - 1);
    if x_min > x_max || y_min > y_max {
      return;
    }

    let (box_w, box_h) = (x_max - x_min + 1, y_max - y_min + 1);
    let edge_w = self.thickness.min(box_w);
    let edge_h = self.thickness.min(box_h);
    let color = Rgb(color);

    // 上、下、左、右四条边
    let edges = [
      Rect::at(x_min, y_min).of_size(box_w as u32, edge_h as u32),
      Rect::at(x_min, y_max - edge_h + 1).of_size(box_w as u32, edge_h as u32),
      Rect::at(x_min, y_min).of_size(edge_w as u32, box_h as u32),
      Rect::at(x_max - edge_w + 1, y_min).of_size(edge_w as u32, box_h as u32),
    ];
    for edge in edges {
      draw_filled_rect_mut(image, edge, color);
    }
  }

  /// 在副本上绘制所有检测框，输入图像保持不变
  pub fn annotate(&self, image: &RgbImage, detections: &[CanonicalDetection]) -> RgbImage {
    let mut canvas = image.clone();
    for detection in detections {
      self.draw_bbox(&mut canvas, &detection.bbox, self.color_for(detection.category));
    }
    debug!("绘制 {} 个检测框", detections.len());
    canvas
  }

  pub fn encode(&self, image: &RgbImage) -> Result<Vec<u8>, AnnotateError> {
    Ok(encode_jpeg(image, self.jpeg_quality)?)
  }

  pub fn render(
    &self,
    image: &RgbImage,
    detections: &[CanonicalDetection],
  ) -> Result<Vec<u8>, AnnotateError> {
    self.encode(&self.annotate(image, detections))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn detection(category: GrainCategory, bbox: [f32; 4]) -> CanonicalDetection {
    CanonicalDetection {
      category,
      confidence: 0.9,
      bbox,
    }
  }

  #[test]
  fn test_annotate_draws_category_colors() {
    let image = RgbImage::new(100, 100);
    let annotated = Annotator::default().annotate(
      &image,
      &[
        detection(GrainCategory::Whole, [10.7, 10.2, 40.9, 40.0]),
        detection(GrainCategory::Broken, [60.0, 60.0, 90.0, 90.0]),
      ],
    );

    // 坐标截断取整
    assert_eq!(annotated.get_pixel(10, 10).0, WHOLE_COLOR);
    assert_eq!(annotated.get_pixel(11, 25).0, WHOLE_COLOR);
    assert_eq!(annotated.get_pixel(40, 40).0, WHOLE_COLOR);
    assert_eq!(annotated.get_pixel(12, 25).0, [0, 0, 0]);
    assert_eq!(annotated.get_pixel(25, 25).0, [0, 0, 0]);

    assert_eq!(annotated.get_pixel(60, 75).0, BROKEN_COLOR);
    assert_eq!(annotated.get_pixel(89, 89).0, BROKEN_COLOR);
    assert_eq!(annotated.get_pixel(75, 75).0, [0, 0, 0]);
  }

  #[test]
  fn test_annotate_leaves_input_untouched() {
    let image = RgbImage::from_pixel(32, 32, Rgb([7, 7, 7]));
    let annotated = Annotator::default().annotate(
      &image,
      &[detection(GrainCategory::Broken, [0.0, 0.0, 32.0, 32.0])],
    );
    assert!(image.pixels().all(|p| p.0 == [7, 7, 7]));
    // 右下角被钳制到最后一个像素
    assert_eq!(annotated.get_pixel(31, 31).0, BROKEN_COLOR);
  }

  #[test]
  fn test_degenerate_boxes_do_not_panic() {
    let image = RgbImage::new(10, 10);
    let annotator = Annotator::default();
    let annotated = annotator.annotate(
      &image,
      &[
        detection(GrainCategory::Whole, [5.0, 5.0, 5.0, 5.0]),
        detection(GrainCategory::Whole, [10.0, 10.0, 10.0, 10.0]),
      ],
    );
    assert_eq!(annotated.get_pixel(5, 5).0, WHOLE_COLOR);
    assert_eq!(annotated.get_pixel(9, 9).0, WHOLE_COLOR);

    let empty = RgbImage::new(0, 0);
    let annotated = annotator.annotate(&empty, &[detection(GrainCategory::Whole, [0.0; 4])]);
    assert_eq!(annotated.width(), 0);
  }

  #[test]
  fn test_render_produces_jpeg() {
    let image = RgbImage::new(20, 12);
    let bytes = Annotator::default()
      .with_jpeg_quality(80)
      .render(&image, &[detection(GrainCategory::Whole, [1.0, 1.0, 10.0, 10.0])])
      .unwrap();
    assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    let decoded = image::load_from_memory(&bytes).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (20, 12));
  }
}
