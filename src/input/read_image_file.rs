// 该文件是 Retinex （视网膜筛查） 项目的一部分。
// src/input/read_image_file.rs - 图像文件读取与预处理
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

use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageReader, RgbImage, imageops::FilterType};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{FundusFrame, INPUT_HEIGHT, INPUT_SHAPE, INPUT_WIDTH, RgbNhwcTensor, ShapeMismatchError},
  path_from_url,
};

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("I/O error reading {path}: {source}")]
  IoError {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Image decoding error in {path}: {source}")]
  ImageLoadError {
    path: PathBuf,
    #[source]
    source: image::ImageError,
  },
  #[error("Image has no pixels ({width}x{height})")]
  EmptyImage { width: u32, height: u32 },
  #[error("Preprocessed tensor has the wrong shape: {0}")]
  Shape(#[from] ShapeMismatchError),
}

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error(transparent)]
  Decode(#[from] DecodeError),
}

/// 读取并预处理一张眼底照片
///
/// 固定步骤：按内容识别格式并解码，转换为 RGB，双线性缩放到 224x224，
/// 除以 255 得到 [0, 1] 的 `f32`。
pub fn preprocess(path: impl AsRef<Path>) -> Result<RgbNhwcTensor, DecodeError> {
  let path = path.as_ref();
  let io_error = |source| DecodeError::IoError {
    path: path.to_path_buf(),
    source,
  };

  let image = ImageReader::open(path)
    .map_err(io_error)?
    .with_guessed_format()
    .map_err(io_error)?
    .decode()
    .map_err(|source| DecodeError::ImageLoadError {
      path: path.to_path_buf(),
      source,
    })?;

  debug!(
    "解码图像 {}: {}x{} {:?}",
    path.display(),
    image.width(),
    image.height(),
    image.color()
  );

  preprocess_image(&image)
}

/// 对已解码图像执行颜色转换、缩放与归一化
pub fn preprocess_image(image: &DynamicImage) -> Result<RgbNhwcTensor, DecodeError> {
  let (width, height) = (image.width(), image.height());
  if width == 0 || height == 0 {
    return Err(DecodeError::EmptyImage { width, height });
  }

  // 灰度、带 alpha、16 位与浮点图像统一转换为 8 位 RGB
  let rgb = image.to_rgb8();
  let rgb = if rgb.dimensions() == (INPUT_WIDTH as u32, INPUT_HEIGHT as u32) {
    rgb
  } else {
    image::imageops::resize(
      &rgb,
      INPUT_WIDTH as u32,
      INPUT_HEIGHT as u32,
      FilterType::Triangle,
    )
  };

  to_tensor(rgb)
}

/// 8 位 RGB 缩放结果归一化为模型输入
fn to_tensor(rgb: RgbImage) -> Result<RgbNhwcTensor, DecodeError> {
  let data: Vec<f32> = rgb
    .into_raw()
    .into_iter()
    .map(|value| value as f32 / 255.0)
    .collect();

  RgbNhwcTensor::from_shape_vec(INPUT_SHAPE, data).map_err(|e| {
    error!("预处理输出形状异常: {}", e);
    DecodeError::from(e)
  })
}

const READ_IMAGE_FILE_SCHEME: &str = "image";

pub struct ImageFileInput {
  frame: Option<FundusFrame>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = READ_IMAGE_FILE_SCHEME;
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    Ok(Self::open(path_from_url(url))?)
  }
}

impl ImageFileInput {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, DecodeError> {
    let path = path.as_ref();
    let tensor = preprocess(path)?;
    Ok(ImageFileInput {
      frame: Some(FundusFrame::new(path, tensor)),
    })
  }

  pub fn into_nhwc(self) -> ImageFileInputNhwc {
    ImageFileInputNhwc { inner: self }
  }
}

pub struct ImageFileInputNhwc {
  inner: ImageFileInput,
}

impl Iterator for ImageFileInputNhwc {
  type Item = FundusFrame;

  fn next(&mut self) -> Option<Self::Item> {
    self.inner.frame.take()
  }
}
