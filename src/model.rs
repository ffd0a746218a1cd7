// 该文件是 Retinex （视网膜筛查） 项目的一部分。
// src/model.rs - 模型
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

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::ShapeMismatchError;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 模型加载失败，进程级错误，缓存后对之后的每次分类请求重复返回
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelLoadError {
  #[error("模型文件不存在: {0}")]
  NotFound(PathBuf),
  #[error("模型无效: {path}, 错误: {reason}")]
  Invalid { path: PathBuf, reason: String },
  #[error("标签清单无效: {path}, 错误: {reason}")]
  Manifest { path: PathBuf, reason: String },
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
}

impl ModelLoadError {
  pub fn invalid(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
    ModelLoadError::Invalid {
      path: path.into(),
      reason: reason.to_string(),
    }
  }
}

/// 单次推理失败，请求级错误，不影响后续请求
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("推理失败: {0}")]
pub struct InferenceError(pub String);

impl InferenceError {
  pub fn new(msg: impl ToString) -> Self {
    InferenceError(msg.to_string())
  }
}

#[derive(Error, Debug)]
pub enum ClassifierError {
  #[error(transparent)]
  ShapeMismatch(#[from] ShapeMismatchError),
  #[error(transparent)]
  Inference(#[from] InferenceError),
  #[error(transparent)]
  ModelLoad(#[from] ModelLoadError),
}

/// 类别对应的筛查结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Finding {
  /// 检出糖尿病视网膜病变
  Positive,
  /// 未检出
  Negative,
}

impl Finding {
  pub fn as_str(&self) -> &'static str {
    match self {
      Finding::Positive => "positive",
      Finding::Negative => "negative",
    }
  }
}

/// 一次完整的分类结果：模型原始概率向量加上 arg-max 得到的标签
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
  pub index: usize,
  pub label: String,
  pub finding: Finding,
  pub probabilities: Vec<f32>,
}

impl ClassificationResult {
  pub fn label(&self) -> &str {
    &self.label
  }

  pub fn probabilities(&self) -> &[f32] {
    &self.probabilities
  }

  pub fn is_positive(&self) -> bool {
    self.finding == Finding::Positive
  }

  pub fn into_pair(self) -> (String, Vec<f32>) {
    (self.label, self.probabilities)
  }
}

/// 最大值下标；并列时取最小下标，NaN 永远不会胜出
pub fn argmax(values: &[f32]) -> Option<usize> {
  let mut best: Option<(usize, f32)> = None;
  for (index, &value) in values.iter().enumerate() {
    match best {
      None => best = Some((index, value)),
      Some((_, best_value)) if value > best_value || best_value.is_nan() => {
        if !value.is_nan() {
          best = Some((index, value));
        }
      }
      _ => {}
    }
  }
  best.map(|(index, _)| index)
}

mod labels;
pub use self::labels::{LabelEntry, LabelMap, ModelInfo, ModelManifest};

mod retinopathy;
pub use self::retinopathy::{ForwardPass, RetinopathyClassifier};

mod slot;
pub use self::slot::{ModelSlot, SlotStatus};

#[cfg(feature = "model_onnx")]
mod onnx;
#[cfg(feature = "model_onnx")]
pub use self::onnx::{
  DEFAULT_MODEL_DIR, MANIFEST_FILE, OnnxForward, RetinopathyBuilder, load_classifier,
};

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn argmax_picks_largest() {
    assert_eq!(argmax(&[0.1, 0.9]), Some(1));
    assert_eq!(argmax(&[0.7, 0.3]), Some(0));
    assert_eq!(argmax(&[0.2, 0.3, 0.5]), Some(2));
  }

  #[test]
  fn argmax_ties_resolve_to_lowest_index() {
    assert_eq!(argmax(&[0.5, 0.5]), Some(0));
    assert_eq!(argmax(&[0.1, 0.45, 0.45]), Some(1));
  }

  #[test]
  fn argmax_ignores_nan_and_empty() {
    assert_eq!(argmax(&[]), None);
    assert_eq!(argmax(&[f32::NAN, 0.2]), Some(1));
    assert_eq!(argmax(&[0.2, f32::NAN, 0.1]), Some(0));
  }
}
