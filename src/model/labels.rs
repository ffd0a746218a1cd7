// 该文件是 Retinex （视网膜筛查） 项目的一部分。
// src/model/labels.rs - 模型标签清单
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

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
  frame::INPUT_SHAPE,
  model::{ClassificationResult, Finding, InferenceError, ModelLoadError, argmax},
};

const BUILTIN_MANIFEST: &str = include_str!("../../labels/retinopathy.toml");
const BUILTIN_MANIFEST_NAME: &str = "labels/retinopathy.toml";

fn default_model_file() -> String {
  "model.onnx".to_string()
}

fn default_output() -> String {
  "dense_1".to_string()
}

fn default_input_shape() -> [usize; 3] {
  INPUT_SHAPE
}

/// 模型制品的元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
  pub name: String,
  #[serde(default)]
  pub version: Option<String>,
  /// 模型目录内的 ONNX 文件名
  #[serde(default = "default_model_file")]
  pub file: String,
  /// 输入张量名，缺省时取模型的第一个输入
  #[serde(default)]
  pub input: Option<String>,
  /// 输出张量名
  #[serde(default = "default_output")]
  pub output: String,
  /// 单张图像的输入形状 (H, W, C)
  #[serde(default = "default_input_shape")]
  pub input_shape: [usize; 3],
}

impl ModelInfo {
  pub fn display_name(&self) -> String {
    match &self.version {
      Some(version) => format!("{} v{}", self.name, version),
      None => self.name.clone(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEntry {
  pub index: usize,
  pub name: String,
  pub finding: Finding,
}

/// 下标到标签的固定映射，下标必须恰好覆盖 0..n
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
  entries: Vec<LabelEntry>,
}

impl LabelMap {
  pub fn new(mut entries: Vec<LabelEntry>) -> Result<Self, String> {
    if entries.is_empty() {
      return Err("标签列表为空".to_string());
    }

    entries.sort_by_key(|entry| entry.index);
    for (expected, entry) in entries.iter().enumerate() {
      if entry.index != expected {
        return Err(format!(
          "标签下标必须从 0 连续编号, 期望 {}, 实际 {}",
          expected, entry.index
        ));
      }
      if entry.name.trim().is_empty() {
        return Err(format!("标签 {} 的名称为空", entry.index));
      }
    }

    for (i, entry) in entries.iter().enumerate() {
      if entries[..i].iter().any(|other| other.name == entry.name) {
        return Err(format!("标签名称重复: {}", entry.name));
      }
    }

    Ok(Self { entries })
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn get(&self, index: usize) -> Option<&LabelEntry> {
    self.entries.get(index)
  }

  pub fn by_name(&self, name: &str) -> Option<&LabelEntry> {
    let name = name.trim();
    self.entries.iter().find(|entry| entry.name == name)
  }

  pub fn iter(&self) -> impl Iterator<Item = &LabelEntry> {
    self.entries.iter()
  }

  /// 将模型输出解释为分类结果
  ///
  /// 概率向量原样保留，不重新归一化；长度与标签数量不一致、
  /// 出现非有限值或超出 [0, 1] 都视为推理失败，不返回部分结果。
  pub fn resolve(&self, probabilities: Vec<f32>) -> Result<ClassificationResult, InferenceError> {
    self.check_probabilities(&probabilities)?;

    let index = argmax(&probabilities).ok_or_else(|| InferenceError::new("模型输出为空"))?;
    let entry = self
      .get(index)
      .ok_or_else(|| InferenceError::new(format!("类别下标 {} 没有对应标签", index)))?;

    debug!("arg-max 下标 {} -> {}", index, entry.name);

    Ok(ClassificationResult {
      index,
      label: entry.name.clone(),
      finding: entry.finding,
      probabilities,
    })
  }

  /// 由已知标签名和概率向量重建结果，用于报告下载等回传场景
  pub fn result_for_label(
    &self,
    name: &str,
    probabilities: Vec<f32>,
  ) -> Result<ClassificationResult, InferenceError> {
    self.check_probabilities(&probabilities)?;
    let entry = self
      .by_name(name)
      .ok_or_else(|| InferenceError::new(format!("未知的诊断标签: {}", name)))?;

    Ok(ClassificationResult {
      index: entry.index,
      label: entry.name.clone(),
      finding: entry.finding,
      probabilities,
    })
  }

  fn check_probabilities(&self, probabilities: &[f32]) -> Result<(), InferenceError> {
    if probabilities.len() != self.len() {
      return Err(InferenceError::new(format!(
        "模型输出长度 {} 与标签数量 {} 不一致",
        probabilities.len(),
        self.len()
      )));
    }

    if let Some(bad) = probabilities
      .iter()
      .find(|p| !p.is_finite() || !(0.0..=1.0).contains(*p))
    {
      return Err(InferenceError::new(format!(
        "模型输出概率超出 [0, 1]: {}",
        bad
      )));
    }

    Ok(())
  }
}

#[derive(Deserialize)]
struct RawManifest {
  model: ModelInfo,
  labels: Vec<LabelEntry>,
}

/// 模型制品附带的清单：张量名、输入形状以及标签映射
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelManifest {
  model: ModelInfo,
  labels: LabelMap,
}

impl ModelManifest {
  /// 随程序一起发布的 64x3-CNN 清单
  pub fn builtin() -> Result<Self, ModelLoadError> {
    Self::from_toml_str(BUILTIN_MANIFEST, Path::new(BUILTIN_MANIFEST_NAME))
  }

  pub fn from_file(path: &Path) -> Result<Self, ModelLoadError> {
    let content = std::fs::read_to_string(path).map_err(|e| ModelLoadError::Manifest {
      path: path.to_path_buf(),
      reason: e.to_string(),
    })?;
    Self::from_toml_str(&content, path)
  }

  pub fn from_toml_str(content: &str, origin: &Path) -> Result<Self, ModelLoadError> {
    let manifest_error = |reason: String| ModelLoadError::Manifest {
      path: origin.to_path_buf(),
      reason,
    };

    let raw: RawManifest = toml::from_str(content).map_err(|e| manifest_error(e.to_string()))?;
    let labels = LabelMap::new(raw.labels).map_err(manifest_error)?;

    // 预处理输出形状固定，清单声明其它形状时直接拒绝
    if raw.model.input_shape != INPUT_SHAPE {
      return Err(manifest_error(format!(
        "输入形状 {:?} 与预处理输出 {:?} 不一致",
        raw.model.input_shape, INPUT_SHAPE
      )));
    }

    Ok(Self {
      model: raw.model,
      labels,
    })
  }

  pub fn model(&self) -> &ModelInfo {
    &self.model
  }

  pub fn labels(&self) -> &LabelMap {
    &self.labels
  }

  pub fn input_shape(&self) -> [usize; 3] {
    self.model.input_shape
  }
}
