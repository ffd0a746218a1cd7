// 该文件是 Retinex （视网膜筛查） 项目的一部分。
// src/output.rs - 输出定义
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

use thiserror::Error;
use url::Url;

use crate::frame::FundusFrame;
use crate::model::{ClassificationResult, ModelManifest};
use crate::{FromUrl, FromUrlWithScheme};

pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

pub mod report;

pub mod html_page;
pub use self::html_page::{HtmlPageError, HtmlPageOutput};

mod json_record;
pub use self::json_record::{JsonRecordError, JsonRecordOutput, ScreeningRecord};

#[cfg(feature = "pdf_report")]
mod pdf_report;
#[cfg(feature = "pdf_report")]
pub use self::pdf_report::{PdfReportOutput, PdfReportWriter, ReportError};

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "pdf_report")]
  #[error("PDF 报告输出错误: {0}")]
  ReportError(#[from] ReportError),
  #[error("网页输出错误: {0}")]
  HtmlPageError(#[from] HtmlPageError),
  #[error("JSON 记录输出错误: {0}")]
  JsonRecordError(#[from] JsonRecordError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

pub enum OutputWrapper {
  #[cfg(feature = "pdf_report")]
  PdfReportOutput(PdfReportOutput),
  HtmlPageOutput(HtmlPageOutput),
  JsonRecordOutput(JsonRecordOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      #[cfg(feature = "pdf_report")]
      PdfReportOutput::SCHEME => {
        let output = PdfReportOutput::from_url(url)?;
        Ok(OutputWrapper::PdfReportOutput(output))
      }
      HtmlPageOutput::SCHEME => {
        let output = HtmlPageOutput::from_url(url)?;
        Ok(OutputWrapper::HtmlPageOutput(output))
      }
      JsonRecordOutput::SCHEME => {
        let output = JsonRecordOutput::from_url(url)?;
        Ok(OutputWrapper::JsonRecordOutput(output))
      }
      _ => Err(OutputError::SchemeMismatch),
    }
  }
}

impl OutputWrapper {
  /// 报告类输出需要实际模型的标签和模型信息
  pub fn with_manifest(self, manifest: ModelManifest) -> Self {
    match self {
      #[cfg(feature = "pdf_report")]
      OutputWrapper::PdfReportOutput(output) => {
        OutputWrapper::PdfReportOutput(output.with_manifest(manifest))
      }
      OutputWrapper::HtmlPageOutput(output) => {
        OutputWrapper::HtmlPageOutput(output.with_manifest(manifest))
      }
      other => other,
    }
  }
}

impl Render<FundusFrame, ClassificationResult> for OutputWrapper {
  type Error = OutputError;

  fn render_result(
    &self,
    frame: &FundusFrame,
    result: &ClassificationResult,
  ) -> Result<(), Self::Error> {
    match self {
      #[cfg(feature = "pdf_report")]
      OutputWrapper::PdfReportOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      OutputWrapper::HtmlPageOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      OutputWrapper::JsonRecordOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn wrapper_dispatches_on_scheme() {
    let html = OutputWrapper::from_url(&Url::parse("html:///tmp/r.html").unwrap()).unwrap();
    assert!(matches!(html, OutputWrapper::HtmlPageOutput(_)));

    let json = OutputWrapper::from_url(&Url::parse("json:///tmp/r.json").unwrap()).unwrap();
    assert!(matches!(json, OutputWrapper::JsonRecordOutput(_)));

    #[cfg(feature = "pdf_report")]
    {
      let pdf = OutputWrapper::from_url(&Url::parse("pdf:///tmp/r.pdf").unwrap()).unwrap();
      assert!(matches!(pdf, OutputWrapper::PdfReportOutput(_)));
    }

    assert!(matches!(
      OutputWrapper::from_url(&Url::parse("rtsp://host/stream").unwrap()),
      Err(OutputError::SchemeMismatch)
    ));
  }
}
