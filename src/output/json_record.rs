// 该文件是 Retinex （视网膜筛查） 项目的一部分。
// src/output/json_record.rs - JSON 结果记录
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

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::FundusFrame,
  model::{ClassificationResult, Finding},
  output::Render,
  path_from_url,
};

#[derive(Error, Debug)]
pub enum JsonRecordError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

#[derive(Debug, Serialize)]
pub struct ScreeningRecord<'a> {
  pub source: &'a Path,
  pub label: &'a str,
  pub index: usize,
  pub finding: Finding,
  pub probabilities: &'a [f32],
  pub analysed_at: DateTime<Local>,
}

impl<'a> ScreeningRecord<'a> {
  pub fn new(source: &'a Path, result: &'a ClassificationResult, at: DateTime<Local>) -> Self {
    Self {
      source,
      label: &result.label,
      index: result.index,
      finding: result.finding,
      probabilities: &result.probabilities,
      analysed_at: at,
    }
  }
}

/// `json:///path/to/record.json` 输出
pub struct JsonRecordOutput {
  path: PathBuf,
}

impl FromUrlWithScheme for JsonRecordOutput {
  const SCHEME: &'static str = "json";
}

impl FromUrl for JsonRecordOutput {
  type Error = JsonRecordError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(JsonRecordError::SchemeMismatch(format!(
        "期望输出方式 '{}', 实际输出方式 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    Ok(JsonRecordOutput {
      path: path_from_url(url),
    })
  }
}

impl Render<FundusFrame, ClassificationResult> for JsonRecordOutput {
  type Error = JsonRecordError;

  fn render_result(
    &self,
    frame: &FundusFrame,
    result: &ClassificationResult,
  ) -> Result<(), Self::Error> {
    let record = ScreeningRecord::new(frame.source(), result, Local::now());

    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&self.path, serde_json::to_string_pretty(&record)?)?;

    info!("结果记录已写入: {}", self.path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::{INPUT_SHAPE, RgbNhwcTensor};
  use crate::model::ModelManifest;

  #[test]
  fn record_has_expected_fields() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("nested/record.json");
    let url = Url::parse(&format!("json://{}", target.display())).unwrap();
    let output = JsonRecordOutput::from_url(&url).unwrap();

    let manifest = ModelManifest::builtin().unwrap();
    let result = manifest.labels().resolve(vec![0.5, 0.5]).unwrap();
    let frame = FundusFrame::new("fundus/eye.jpg", RgbNhwcTensor::zeros(INPUT_SHAPE));
    output.render_result(&frame, &result).unwrap();

    let value: serde_json::Value =
      serde_json::from_str(&std::fs::read_to_string(&target).unwrap()).unwrap();
    assert_eq!(value["source"], "fundus/eye.jpg");
    assert_eq!(value["label"], "Diabetic Retinopathy Detected");
    assert_eq!(value["index"], 0);
    assert_eq!(value["finding"], "positive");
    assert_eq!(value["probabilities"], serde_json::json!([0.5, 0.5]));
    assert!(value["analysed_at"].is_string());
  }

  #[test]
  fn wrong_scheme_is_rejected() {
    let url = Url::parse("pdf:///tmp/record.json").unwrap();
    assert!(matches!(
      JsonRecordOutput::from_url(&url),
      Err(JsonRecordError::SchemeMismatch(_))
    ));
  }
}
