// 该文件是 Retinex （视网膜筛查） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 推理后端
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
use std::sync::Mutex;

use ort::session::Session;
use ort::value::{Tensor, ValueType};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{ForwardPass, InferenceError, ModelLoadError, ModelManifest, RetinopathyClassifier},
  path_from_url,
};

/// 模型制品的默认目录
pub const DEFAULT_MODEL_DIR: &str = "64x3-CNN.model";
/// 模型目录中的标签清单文件名
pub const MANIFEST_FILE: &str = "labels.toml";

/// ONNX Runtime 会话
///
/// `Session::run` 需要可变借用，所以会话放在互斥锁里，前向计算串行执行。
pub struct OnnxForward {
  session: Mutex<Session>,
  input_name: String,
  output_name: String,
}

impl OnnxForward {
  pub fn load(model_path: &Path, manifest: &ModelManifest) -> Result<Self, ModelLoadError> {
    if !model_path.exists() {
      return Err(ModelLoadError::NotFound(model_path.to_path_buf()));
    }

    info!("加载模型文件: {}", model_path.display());
    let session = Session::builder()
      .map_err(|e| ModelLoadError::invalid(model_path, format!("无法创建会话: {e}")))?
      .commit_from_file(model_path)
      .map_err(|e| ModelLoadError::invalid(model_path, format!("无法加载 ONNX 模型: {e}")))?;

    let info = manifest.model();

    let input = match &info.input {
      Some(name) => session.inputs().iter().find(|i| i.name() == name.as_str()),
      None => session.inputs().first(),
    }
    .ok_or_else(|| {
      ModelLoadError::invalid(
        model_path,
        format!("找不到输入张量 {:?}", info.input.as_deref().unwrap_or("<first>")),
      )
    })?;
    let input_name = input.name().to_string();

    // 声明了静态维度时必须与 (N, H, W, C) 一致，动态维度 (-1) 放行
    if let Some(dims) = tensor_dims(input.dtype()) {
      let expected = info.input_shape.map(|d| d as i64);
      let matches = dims.len() == 4
        && (dims[0] <= 0 || dims[0] == 1)
        && dims[1..]
          .iter()
          .zip(expected.iter())
          .all(|(&d, &e)| d <= 0 || d == e);
      if !matches {
        error!("模型输入形状 {:?} 与期望 {:?} 不一致", dims, expected);
        return Err(ModelLoadError::invalid(
          model_path,
          format!("输入形状 {:?} 与期望 [N, {:?}] 不一致", dims, info.input_shape),
        ));
      }
    }

    let output = session
      .outputs()
      .iter()
      .find(|o| o.name() == info.output.as_str())
      .ok_or_else(|| {
        ModelLoadError::invalid(model_path, format!("找不到输出张量 {:?}", info.output))
      })?;
    let output_name = output.name().to_string();

    // 输出宽度与标签数量不一致说明换了模型却没有更新清单
    if let Some(width) = tensor_dims(output.dtype()).and_then(|dims| dims.last().copied())
      && width > 0
      && width as usize != manifest.labels().len()
    {
      return Err(ModelLoadError::invalid(
        model_path,
        format!(
          "输出类别数 {} 与标签数量 {} 不一致",
          width,
          manifest.labels().len()
        ),
      ));
    }

    debug!("模型输入: {}", input_name);
    debug!("模型输出: {}", output_name);

    Ok(Self {
      session: Mutex::new(session),
      input_name,
      output_name,
    })
  }
}

impl ForwardPass for OnnxForward {
  fn forward(&self, input: &[f32], shape: [usize; 4]) -> Result<Vec<f32>, InferenceError> {
    let dims = shape.map(|d| d as i64);
    let tensor = Tensor::from_array((dims, input.to_vec().into_boxed_slice()))
      .map_err(|e| InferenceError::new(format!("无法构造输入张量 {:?}: {e}", shape)))?;

    let mut session = self
      .session
      .lock()
      .map_err(|_| InferenceError::new("无法获取会话锁"))?;

    let outputs = session
      .run(ort::inputs![self.input_name.as_str() => tensor])
      .map_err(|e| {
        InferenceError::new(format!(
          "ONNX Runtime 推理失败 '{}' -> '{}': {e}",
          self.input_name, self.output_name
        ))
      })?;

    let (output_shape, output_data) = outputs[self.output_name.as_str()]
      .try_extract_tensor::<f32>()
      .map_err(|e| InferenceError::new(format!("无法读取输出张量 '{}': {e}", self.output_name)))?;

    let dims: &[i64] = output_shape;
    if dims.first().is_some_and(|&batch| batch != 1) {
      return Err(InferenceError::new(format!(
        "输出批大小异常: {:?}",
        dims
      )));
    }

    Ok(output_data.to_vec())
  }
}

fn tensor_dims(value_type: &ValueType) -> Option<Vec<i64>> {
  match value_type {
    ValueType::Tensor { shape, .. } => Some(shape.iter().copied().collect()),
    _ => None,
  }
}

/// 从模型目录加载分类器
///
/// 目录中需要有 ONNX 文件（默认 `model.onnx`），可选 `labels.toml`；
/// 没有清单时使用内置的 64x3-CNN 清单。
pub fn load_classifier(model_dir: &Path) -> Result<RetinopathyClassifier, ModelLoadError> {
  if !model_dir.is_dir() {
    return Err(ModelLoadError::NotFound(model_dir.to_path_buf()));
  }

  let manifest_path = model_dir.join(MANIFEST_FILE);
  let manifest = if manifest_path.exists() {
    info!("读取标签清单: {}", manifest_path.display());
    ModelManifest::from_file(&manifest_path)?
  } else {
    warn!(
      "模型目录 {} 中没有 {}，使用内置标签清单",
      model_dir.display(),
      MANIFEST_FILE
    );
    ModelManifest::builtin()?
  };

  let model_path = model_dir.join(&manifest.model().file);
  let backend = OnnxForward::load(&model_path, &manifest)?;
  info!(
    "模型 {} 就绪, 类别: {:?}",
    manifest.model().display_name(),
    manifest.labels().iter().map(|l| l.name.as_str()).collect::<Vec<_>>()
  );

  Ok(RetinopathyClassifier::new(backend, manifest))
}

pub struct RetinopathyBuilder {
  model_dir: PathBuf,
}

impl FromUrlWithScheme for RetinopathyBuilder {
  const SCHEME: &'static str = "onnx";
}

impl FromUrl for RetinopathyBuilder {
  type Error = ModelLoadError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelLoadError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    Ok(RetinopathyBuilder {
      model_dir: path_from_url(url),
    })
  }
}

impl RetinopathyBuilder {
  pub fn new(model_dir: impl Into<PathBuf>) -> Self {
    Self {
      model_dir: model_dir.into(),
    }
  }

  pub fn model_dir(&self) -> &Path {
    &self.model_dir
  }

  pub fn build(&self) -> Result<RetinopathyClassifier, ModelLoadError> {
    load_classifier(&self.model_dir)
  }
}
