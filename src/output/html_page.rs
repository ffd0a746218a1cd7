// 该文件是 Retinex （视网膜筛查） 项目的一部分。
// src/output/html_page.rs - 网页渲染
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

use std::fmt::Write as _;
use std::path::PathBuf;

use chrono::Local;
use html_escape::{encode_double_quoted_attribute, encode_text};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::FundusFrame,
  model::{ClassificationResult, Finding, LabelMap, ModelLoadError, ModelManifest},
  output::{Render, report::REPORT_TITLE},
  path_from_url,
};

/// 页面上显示的时间格式
pub const TIMESTAMP_FORMAT: &str = "%d-%m-%Y %H:%M";

const STYLE: &str = "body{font-family:Helvetica,Arial,sans-serif;margin:0;background:#f4f7f6;color:#333}\
header{background:#0b5e3a;color:#fff;padding:18px 32px}\
main{max-width:760px;margin:32px auto;background:#fff;padding:28px 36px;border-radius:8px}\
.message{background:#ffebee;border:1px solid #d32f2f;color:#d32f2f;padding:10px;margin-bottom:16px}\
.verdict{font-weight:bold;font-size:1.2em;padding:12px;text-align:center;border:1px solid}\
.positive{color:#d32f2f;background:#ffebee}\
.negative{color:#0b5e3a;background:#e8f5e9}\
table{border-collapse:collapse;width:100%;margin:16px 0}\
td,th{border:1px solid #0b5e3a;padding:6px 10px;text-align:left}\
th{background:#0b5e3a;color:#fff}\
img{max-width:320px;display:block;margin:16px auto;border:2px solid #0b5e3a}\
button{background:#0b5e3a;color:#fff;border:0;padding:10px 18px;border-radius:4px;cursor:pointer}";

fn page(title: &str, body: &str) -> String {
  format!(
    "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
     <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
     <title>{title}</title>\n<style>{STYLE}</style>\n</head>\n<body>\n\
     <header><h1>{REPORT_TITLE}</h1></header>\n<main>\n{body}</main>\n</body>\n</html>\n",
    title = encode_text(title),
  )
}

/// 上传页，`message` 用于显示上一次提交的问题
pub fn index_page(message: Option<&str>) -> String {
  let mut body = String::new();
  if let Some(message) = message {
    let _ = writeln!(body, "<p class=\"message\">{}</p>", encode_text(message));
  }
  body.push_str(
    "<h2>Upload a fundus photograph</h2>\n\
     <form action=\"/predict\" method=\"post\" enctype=\"multipart/form-data\">\n\
     <input type=\"file\" name=\"file\" accept=\".png,.jpg,.jpeg\">\n\
     <button type=\"submit\">Analyze</button>\n</form>\n",
  );
  page(REPORT_TITLE, &body)
}

/// 结果页参数
pub struct ResultPage<'a> {
  pub result: &'a ClassificationResult,
  pub labels: &'a LabelMap,
  /// `<img>` 的地址
  pub image_src: &'a str,
  /// 上传目录中的文件名，有值时附带下载报告的表单
  pub image_name: Option<&'a str>,
  pub timestamp: &'a str,
  pub processing_ms: Option<u128>,
}

pub fn result_page(p: &ResultPage<'_>) -> String {
  let class = match p.result.finding {
    Finding::Positive => "positive",
    Finding::Negative => "negative",
  };

  let mut body = String::new();
  let _ = writeln!(body, "<h2>Screening Result</h2>");
  let _ = writeln!(
    body,
    "<p class=\"verdict {class}\">{}</p>",
    encode_text(&p.result.label)
  );
  let _ = writeln!(body, "<p>Analysed on {}</p>", encode_text(p.timestamp));

  body.push_str("<table>\n<tr><th>Classification</th><th>Probability</th></tr>\n");
  for entry in p.labels.iter() {
    let prob = p
      .result
      .probabilities
      .get(entry.index)
      .copied()
      .unwrap_or(0.0);
    let _ = writeln!(
      body,
      "<tr><td>{}</td><td>{:.2}%</td></tr>",
      encode_text(&entry.name),
      prob * 100.0
    );
  }
  body.push_str("</table>\n");

  let _ = writeln!(
    body,
    "<img src=\"{}\" alt=\"Uploaded fundus image\">",
    encode_double_quoted_attribute(p.image_src)
  );

  if let Some(name) = p.image_name {
    body.push_str("<form action=\"/download_report\" method=\"post\">\n");
    let _ = writeln!(
      body,
      "<input type=\"hidden\" name=\"image_path\" value=\"{}\">",
      encode_double_quoted_attribute(name)
    );
    let _ = writeln!(
      body,
      "<input type=\"hidden\" name=\"diagnosis\" value=\"{}\">",
      encode_double_quoted_attribute(&p.result.label)
    );
    for prob in &p.result.probabilities {
      let _ = writeln!(
        body,
        "<input type=\"hidden\" name=\"probabilities\" value=\"{}\">",
        prob
      );
    }
    if let Some(ms) = p.processing_ms {
      let _ = writeln!(
        body,
        "<input type=\"hidden\" name=\"processing_ms\" value=\"{}\">",
        ms
      );
    }
    body.push_str("<button type=\"submit\">Download PDF Report</button>\n</form>\n");
  }
  body.push_str("<p><a href=\"/\">Analyze another image</a></p>\n");

  page("Screening Result", &body)
}

pub fn error_page(status: u16, message: &str) -> String {
  let body = format!(
    "<h2>Error {status}</h2>\n<p class=\"message\">{}</p>\n<p><a href=\"/\">Back</a></p>\n",
    encode_text(message)
  );
  page("Error", &body)
}

#[derive(Error, Debug)]
pub enum HtmlPageError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("模型清单错误: {0}")]
  Manifest(#[from] ModelLoadError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// `html:///path/to/result.html` 输出，写出独立的结果页
pub struct HtmlPageOutput {
  path: PathBuf,
  manifest: ModelManifest,
}

impl FromUrlWithScheme for HtmlPageOutput {
  const SCHEME: &'static str = "html";
}

impl FromUrl for HtmlPageOutput {
  type Error = HtmlPageError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(HtmlPageError::SchemeMismatch(format!(
        "期望输出方式 '{}', 实际输出方式 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    Ok(HtmlPageOutput {
      path: path_from_url(url),
      manifest: ModelManifest::builtin()?,
    })
  }
}

impl HtmlPageOutput {
  pub fn with_manifest(mut self, manifest: ModelManifest) -> Self {
    self.manifest = manifest;
    self
  }
}

impl Render<FundusFrame, ClassificationResult> for HtmlPageOutput {
  type Error = HtmlPageError;

  fn render_result(
    &self,
    frame: &FundusFrame,
    result: &ClassificationResult,
  ) -> Result<(), Self::Error> {
    let source = std::path::absolute(frame.source())?;
    let image_src = Url::from_file_path(&source)
      .map(String::from)
      .unwrap_or_else(|_| source.display().to_string());
    let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();

    let html = result_page(&ResultPage {
      result,
      labels: self.manifest.labels(),
      image_src: &image_src,
      image_name: None,
      timestamp: &timestamp,
      processing_ms: None,
    });

    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&self.path, html)?;

    info!("结果页已写入: {}", self.path.display());
    Ok(())
  }
}
