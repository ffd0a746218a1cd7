// 该文件是 Retinex （视网膜筛查） 项目的一部分。
// src/frame.rs - NHWC 张量与眼底帧定义
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

use thiserror::Error;

pub const RGB_CHANNELS: usize = 3;

/// 模型输入宽度
pub const INPUT_WIDTH: usize = 224;
/// 模型输入高度
pub const INPUT_HEIGHT: usize = 224;

/// 预处理输出的固定形状 (H, W, C)
pub const INPUT_SHAPE: [usize; 3] = [INPUT_HEIGHT, INPUT_WIDTH, RGB_CHANNELS];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("张量形状不匹配: 期望 {expected:?}, 实际 {actual:?}")]
pub struct ShapeMismatchError {
  pub expected: Vec<usize>,
  pub actual: Vec<usize>,
}

/// RGB 通道顺序、HWC 布局的浮点张量，取值范围 [0, 1]
///
/// 批维度不在这里保存：单张图像的 (H, W, C) 与 (1, H, W, C) 内存布局一致，
/// 交给推理后端时再通过 [`RgbNhwcTensor::batched_shape`] 补上。
#[derive(Debug, Clone, PartialEq)]
pub struct RgbNhwcTensor {
  height: usize,
  width: usize,
  channels: usize,
  data: Box<[f32]>,
}

impl RgbNhwcTensor {
  pub fn from_shape_vec(shape: [usize; 3], data: Vec<f32>) -> Result<Self, ShapeMismatchError> {
    let [height, width, channels] = shape;
    let expected = height * width * channels;
    if data.len() != expected {
      return Err(ShapeMismatchError {
        expected: shape.to_vec(),
        actual: vec![data.len()],
      });
    }

    Ok(Self {
      height,
      width,
      channels,
      data: data.into_boxed_slice(),
    })
  }

  pub fn zeros(shape: [usize; 3]) -> Self {
    let [height, width, channels] = shape;
    Self {
      height,
      width,
      channels,
      data: vec![0.0f32; height * width * channels].into_boxed_slice(),
    }
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn channels(&self) -> usize {
    self.channels
  }

  pub fn shape(&self) -> [usize; 3] {
    [self.height, self.width, self.channels]
  }

  /// 加上单例批维度后的形状 (1, H, W, C)
  pub fn batched_shape(&self) -> [usize; 4] {
    [1, self.height, self.width, self.channels]
  }

  pub fn as_nhwc(&self) -> &[f32] {
    &self.data
  }

  pub fn get(&self, h: usize, w: usize, c: usize) -> Option<f32> {
    if h >= self.height || w >= self.width || c >= self.channels {
      return None;
    }
    let index = (h * self.width + w) * self.channels + c;
    self.data.get(index).copied()
  }

  /// 形状必须与 `expected` 完全一致，不做任何隐式 reshape
  pub fn ensure_shape(&self, expected: [usize; 3]) -> Result<(), ShapeMismatchError> {
    if self.shape() != expected {
      return Err(ShapeMismatchError {
        expected: expected.to_vec(),
        actual: self.shape().to_vec(),
      });
    }
    Ok(())
  }
}

impl AsMut<[f32]> for RgbNhwcTensor {
  fn as_mut(&mut self) -> &mut [f32] {
    &mut self.data
  }
}

/// 一张已完成预处理的眼底照片：来源路径加上模型输入张量
#[derive(Debug, Clone)]
pub struct FundusFrame {
  source: PathBuf,
  tensor: RgbNhwcTensor,
}

impl FundusFrame {
  pub fn new(source: impl Into<PathBuf>, tensor: RgbNhwcTensor) -> Self {
    Self {
      source: source.into(),
      tensor,
    }
  }

  pub fn source(&self) -> &Path {
    &self.source
  }

  pub fn tensor(&self) -> &RgbNhwcTensor {
    &self.tensor
  }
}

impl AsRef<RgbNhwcTensor> for FundusFrame {
  fn as_ref(&self) -> &RgbNhwcTensor {
    &self.tensor
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn from_shape_vec_rejects_wrong_length() {
    let err = RgbNhwcTensor::from_shape_vec([2, 2, 3], vec![0.0; 11]).unwrap_err();
    assert_eq!(err.expected, vec![2, 2, 3]);
    assert_eq!(err.actual, vec![11]);
  }

  #[test]
  fn indexing_is_hwc() {
    let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
    let tensor = RgbNhwcTensor::from_shape_vec([2, 2, 3], data).unwrap();

    assert_eq!(tensor.get(0, 0, 0), Some(0.0));
    assert_eq!(tensor.get(0, 1, 2), Some(5.0));
    assert_eq!(tensor.get(1, 0, 1), Some(7.0));
    assert_eq!(tensor.get(2, 0, 0), None);
  }

  #[test]
  fn batched_shape_prepends_singleton() {
    let tensor = RgbNhwcTensor::zeros(INPUT_SHAPE);
    assert_eq!(tensor.batched_shape(), [1, 224, 224, 3]);
    assert_eq!(tensor.as_nhwc().len(), 224 * 224 * 3);
  }

  #[test]
  fn ensure_shape_reports_both_shapes() {
    let tensor = RgbNhwcTensor::zeros([32, 32, 3]);
    let err = tensor.ensure_shape(INPUT_SHAPE).unwrap_err();
    assert_eq!(err.expected, vec![224, 224, 3]);
    assert_eq!(err.actual, vec![32, 32, 3]);
    assert!(RgbNhwcTensor::zeros(INPUT_SHAPE).ensure_shape(INPUT_SHAPE).is_ok());
  }
}
