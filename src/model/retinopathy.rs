// 该文件是 Retinex （视网膜筛查） 项目的一部分。
// src/model/retinopathy.rs - 糖尿病视网膜病变分类器
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

use std::time::Instant;

use tracing::{debug, info};

use crate::{
  frame::RgbNhwcTensor,
  model::{
    ClassificationResult, ClassifierError, InferenceError, LabelMap, Model, ModelManifest,
  },
};

/// 推理后端：对一个 (1, H, W, C) 批执行前向计算，返回该样本的输出向量
///
/// 实现必须可以在多个线程间共享；后端自身不支持并发调用时需在内部加锁。
pub trait ForwardPass: Send + Sync {
  fn forward(&self, input: &[f32], shape: [usize; 4]) -> Result<Vec<f32>, InferenceError>;
}

/// 加载完成后的分类器，只读，可在线程间共享
pub struct RetinopathyClassifier {
  backend: Box<dyn ForwardPass>,
  manifest: ModelManifest,
}

impl RetinopathyClassifier {
  pub fn new(backend: impl ForwardPass + 'static, manifest: ModelManifest) -> Self {
    Self {
      backend: Box::new(backend),
      manifest,
    }
  }

  pub fn manifest(&self) -> &ModelManifest {
    &self.manifest
  }

  pub fn labels(&self) -> &LabelMap {
    self.manifest.labels()
  }

  pub fn classify(&self, tensor: &RgbNhwcTensor) -> Result<ClassificationResult, ClassifierError> {
    tensor.ensure_shape(self.manifest.input_shape())?;

    debug!("执行模型推理, 输入形状 {:?}", tensor.batched_shape());
    let now = Instant::now();
    let output = self
      .backend
      .forward(tensor.as_nhwc(), tensor.batched_shape())?;
    let elapsed = now.elapsed();
    debug!("模型输出: {:?}", output);

    let result = self.manifest.labels().resolve(output)?;
    info!(
      "推理完成: {} {:?}, 耗时: {:.2?}",
      result.label, result.probabilities, elapsed
    );

    Ok(result)
  }
}

impl Model for RetinopathyClassifier {
  type Input = RgbNhwcTensor;
  type Output = ClassificationResult;
  type Error = ClassifierError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.classify(input)
  }
}
