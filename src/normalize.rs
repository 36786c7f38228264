// 该文件是 RiceGuard （米粒质检） 项目的一部分。
// src/normalize.rs - 图像解码与尺寸归一化
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

use std::{borrow::Cow, io::Cursor};

use image::{
  DynamicImage, ImageDecoder, ImageError, ImageReader, RgbImage, codecs::jpeg::JpegEncoder,
  imageops::FilterType, metadata::Orientation,
};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_MAX_LONG_SIDE: u32 = 1280;
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

#[derive(Error, Debug)]
pub enum NormalizeError {
  #[error("无效图像: {0}")]
  InvalidImage(image::ImageError),
  #[error("图像编码失败: {0}")]
  Encode(image::ImageError),
}

/// 归一化后的图像
///
/// `bytes` 是发送给检测器的编码数据，`pixels` 是同一坐标空间下的 RGB 像素，
/// 标注图也绘制在 `pixels` 上。
#[derive(Debug, Clone)]
pub struct NormalizedImage {
  bytes: Vec<u8>,
  pixels: RgbImage,
  resized: bool,
}

impl NormalizedImage {
  pub fn bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn pixels(&self) -> &RgbImage {
    &self.pixels
  }

  pub fn width(&self) -> u32 {
    self.pixels.width()
  }

  pub fn height(&self) -> u32 {
    self.pixels.height()
  }

  pub fn was_resized(&self) -> bool {
    self.resized
  }
}

/// 解码并按 EXIF 方向摆正，返回像素与是否发生了旋转/翻转
fn decode_oriented(bytes: &[u8]) -> Result<(RgbImage, bool), ImageError> {
  let mut decoder = ImageReader::new(Cursor::new(bytes))
    .with_guessed_format()
    .map_err(ImageError::IoError)?
    .into_decoder()?;
  let orientation = decoder.orientation()?;
  let mut image = DynamicImage::from_decoder(decoder)?;

  let reoriented = orientation != Orientation::NoTransforms;
  if reoriented {
    debug!("按 EXIF 方向摆正图像: {:?}", orientation);
    image.apply_orientation(orientation);
  }
  Ok((image.to_rgb8(), reoriented))
}

/// 解码任意常见格式的图像字节为 RGB 像素，已按 EXIF 方向摆正
pub fn decode(bytes: &[u8]) -> Result<RgbImage, NormalizeError> {
  decode_oriented(bytes)
    .map(|(image, _)| image)
    .map_err(NormalizeError::InvalidImage)
}

/// 计算缩放后的尺寸，长边不超过 `max_long_side` 时返回 None
///
/// 长边精确等于 `max_long_side`，短边按比例截断取整（至少 1 像素）。
pub fn scaled_dimensions(width: u32, height: u32, max_long_side: u32) -> Option<(u32, u32)> {
  let max_long_side = max_long_side.max(1);
  let long_side = width.max(height);
  if long_side <= max_long_side {
    return None;
  }

  let scale = max_long_side as f64 / long_side as f64;
  let shrink = |side: u32| {
    if side == long_side {
      max_long_side
    } else {
      ((side as f64 * scale) as u32).max(1)
    }
  };
  Some((shrink(width), shrink(height)))
}

/// 像素版本：长边超限时等比缩小，否则原样返回
pub fn resize_pixels_if_oversized(image: RgbImage, max_long_side: u32) -> RgbImage {
  match scaled_dimensions(image.width(), image.height(), max_long_side) {
    Some((width, height)) => {
      debug!(
        "缩放图像: {}x{} -> {}x{}",
        image.width(),
        image.height(),
        width,
        height
      );
      image::imageops::resize(&image, width, height, FilterType::Triangle)
    }
    None => image,
  }
}

/// 字节版本：长边超限或带有 EXIF 方向时重新编码为 JPEG，否则原样借用输入字节
pub fn resize_if_oversized(
  bytes: &[u8],
  max_long_side: u32,
) -> Result<Cow<'_, [u8]>, NormalizeError> {
  let (image, reoriented) = decode_oriented(bytes).map_err(NormalizeError::InvalidImage)?;
  if scaled_dimensions(image.width(), image.height(), max_long_side).is_none() {
    if reoriented {
      return Ok(Cow::Owned(encode_jpeg(&image, DEFAULT_JPEG_QUALITY)?));
    }
    return Ok(Cow::Borrowed(bytes));
  }

  let resized = resize_pixels_if_oversized(image, max_long_side);
  Ok(Cow::Owned(encode_jpeg(&resized, DEFAULT_JPEG_QUALITY)?))
}

/// 解码一次，同时得到发送给检测器的字节与用于标注的像素
///
/// 带 EXIF 方向的输入会重新编码，保证发出的字节与像素方向一致。
pub fn normalize(bytes: &[u8], max_long_side: u32) -> Result<NormalizedImage, NormalizeError> {
  let (image, reoriented) = decode_oriented(bytes).map_err(NormalizeError::InvalidImage)?;
  debug!("输入图像尺寸: {}x{}", image.width(), image.height());

  if scaled_dimensions(image.width(), image.height(), max_long_side).is_none() {
    let bytes = if reoriented {
      encode_jpeg(&image, DEFAULT_JPEG_QUALITY)?
    } else {
      bytes.to_vec()
    };
    return Ok(NormalizedImage {
      bytes,
      pixels: image,
      resized: false,
    });
  }

  let pixels = resize_pixels_if_oversized(image, max_long_side);
  let bytes = encode_jpeg(&pixels, DEFAULT_JPEG_QUALITY)?;
  Ok(NormalizedImage {
    bytes,
    pixels,
    resized: true,
  })
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, NormalizeError> {
  let mut buf = Vec::new();
  {
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    encoder
      .encode_image(image)
      .map_err(NormalizeError::Encode)?;
  }
  Ok(buf)
}
