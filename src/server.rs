// 该文件是 Retinex （视网膜筛查） 项目的一部分。
// src/server.rs - 网页服务
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

//! 上传眼底照片、查看筛查结果、下载 PDF 报告。
//!
//! 路由：
//! - `GET /` 上传页
//! - `POST /predict` 上传并分类
//! - `POST /download_report` 生成 PDF 报告
//! - `GET /static/uploads/<file>` 已上传的图像
//! - `GET /health` 服务与模型状态

use std::convert::Infallible;
use std::io::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes};
use chrono::Local;
use futures_util::TryStreamExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use warp::http::StatusCode;
use warp::multipart::FormData;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::{
  input::{DecodeError, has_allowed_extension, preprocess},
  model::{
    ClassificationResult, ClassifierError, InferenceError, LabelMap, ModelLoadError, ModelSlot,
    RetinopathyClassifier, SlotStatus,
  },
  output::{
    PdfReportWriter, ReportError,
    html_page::{ResultPage, TIMESTAMP_FORMAT, error_page, index_page, result_page},
    report::{REPORT_FILE_NAME, Report, ReportContext},
  },
};

/// 默认上传目录
pub const DEFAULT_UPLOAD_DIR: &str = "static/uploads";
/// 报告表单的最大长度
const REPORT_FORM_LIMIT: u64 = 64 * 1024;

pub const MSG_NO_FILE_PART: &str = "No file part";
pub const MSG_NO_SELECTED_FILE: &str = "No selected file";
pub const MSG_ERROR_OCCURRED: &str = "Error occurred";

pub type SharedState = Arc<AppState>;

/// 服务的共享状态
pub struct AppState {
  slot: Arc<ModelSlot<RetinopathyClassifier>>,
  upload_dir: PathBuf,
  report_dir: Option<PathBuf>,
  max_upload_bytes: u64,
  inference_timeout: Option<Duration>,
}

impl AppState {
  pub fn new(slot: Arc<ModelSlot<RetinopathyClassifier>>, upload_dir: impl Into<PathBuf>) -> Self {
    Self {
      slot,
      upload_dir: upload_dir.into(),
      report_dir: None,
      max_upload_bytes: 16 * 1024 * 1024,
      inference_timeout: None,
    }
  }

  /// 生成的报告另存一份到该目录
  pub fn with_report_dir(mut self, dir: Option<PathBuf>) -> Self {
    self.report_dir = dir;
    self
  }

  pub fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
    self.max_upload_bytes = bytes;
    self
  }

  /// 超时按推理失败处理，后台线程仍会跑完
  pub fn with_inference_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.inference_timeout = timeout;
    self
  }

  pub fn upload_dir(&self) -> &Path {
    &self.upload_dir
  }

  pub fn slot(&self) -> &ModelSlot<RetinopathyClassifier> {
    &self.slot
  }
}

/// 一次上传请求的失败原因
#[derive(Error, Debug)]
enum ScreeningError {
  #[error(transparent)]
  Decode(#[from] DecodeError),
  #[error(transparent)]
  Classifier(#[from] ClassifierError),
  #[error("后台任务失败: {0}")]
  Join(#[from] tokio::task::JoinError),
}

impl From<ModelLoadError> for ScreeningError {
  fn from(err: ModelLoadError) -> Self {
    ScreeningError::Classifier(ClassifierError::ModelLoad(err))
  }
}

impl From<InferenceError> for ScreeningError {
  fn from(err: InferenceError) -> Self {
    ScreeningError::Classifier(ClassifierError::Inference(err))
  }
}

impl ScreeningError {
  fn status(&self) -> StatusCode {
    match self {
      ScreeningError::Decode(DecodeError::Shape(_)) => StatusCode::INTERNAL_SERVER_ERROR,
      ScreeningError::Decode(_) => StatusCode::BAD_REQUEST,
      ScreeningError::Classifier(ClassifierError::ModelLoad(_)) => StatusCode::SERVICE_UNAVAILABLE,
      ScreeningError::Classifier(_) | ScreeningError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  fn public_message(&self) -> &'static str {
    match self {
      ScreeningError::Decode(DecodeError::Shape(_)) => {
        "The image could not be analysed. Please try again."
      }
      ScreeningError::Decode(_) => "The uploaded file could not be read as an image.",
      ScreeningError::Classifier(ClassifierError::ModelLoad(_)) => {
        "The screening model is currently unavailable."
      }
      ScreeningError::Classifier(_) | ScreeningError::Join(_) => {
        "The image could not be analysed. Please try again."
      }
    }
  }
}

/// 报告下载请求的失败原因
#[derive(Error, Debug)]
enum DownloadError {
  #[error("请求无效: {0}")]
  BadRequest(String),
  #[error(transparent)]
  ModelLoad(#[from] ModelLoadError),
  #[error(transparent)]
  Report(#[from] ReportError),
  #[error("后台任务失败: {0}")]
  Join(#[from] tokio::task::JoinError),
}

impl DownloadError {
  fn status(&self) -> StatusCode {
    match self {
      DownloadError::BadRequest(_) => StatusCode::BAD_REQUEST,
      DownloadError::ModelLoad(_) => StatusCode::SERVICE_UNAVAILABLE,
      DownloadError::Report(_) | DownloadError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

fn html_reply(status: StatusCode, html: String) -> Response {
  warp::reply::with_status(warp::reply::html(html), status).into_response()
}

fn error_reply(status: StatusCode, message: &str) -> Response {
  html_reply(status, error_page(status.as_u16(), message))
}

fn with_state(state: SharedState) -> impl Filter<Extract = (SharedState,), Error = Infallible> + Clone {
  warp::any().map(move || state.clone())
}

/// 完整的路由
pub fn routes(state: SharedState) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
  let index = warp::path::end()
    .and(warp::get())
    .map(|| warp::reply::html(index_page(None)));

  let predict = warp::path("predict")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::multipart::form().max_length(state.max_upload_bytes))
    .and(with_state(state.clone()))
    .and_then(handle_predict);

  let download_report = warp::path("download_report")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::content_length_limit(REPORT_FORM_LIMIT))
    .and(warp::body::bytes())
    .and(with_state(state.clone()))
    .and_then(handle_download_report);

  let uploads = warp::path("static")
    .and(warp::path("uploads"))
    .and(warp::get())
    .and(warp::fs::dir(state.upload_dir.clone()));

  let health = warp::path("health")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_state(state))
    .map(handle_health);

  index
    .or(predict)
    .or(download_report)
    .or(uploads)
    .or(health)
    .recover(handle_rejection)
    .with(warp::trace::request())
}

/// 绑定地址并运行，收到 Ctrl-C 后优雅退出
pub async fn serve(state: SharedState, addr: SocketAddr) -> Result<(), warp::Error> {
  let (bound, server) =
    warp::serve(routes(state)).try_bind_with_graceful_shutdown(addr, async {
      if tokio::signal::ctrl_c().await.is_ok() {
        info!("收到中断信号，准备退出...");
      }
    })?;
  info!("服务已启动: http://{}", bound);
  server.await;
  info!("服务已退出");
  Ok(())
}

struct FilePart {
  filename: Option<String>,
  data: Vec<u8>,
}

/// 取出表单中名为 `file` 的字段
async fn take_file_part(form: FormData) -> Result<Option<FilePart>, warp::Error> {
  let mut form = std::pin::pin!(form);
  while let Some(part) = form.try_next().await? {
    if part.name() != "file" {
      continue;
    }
    let filename = part.filename().map(str::to_string);
    let data = part
      .stream()
      .try_fold(Vec::new(), |mut acc, buf| async move {
        acc.put(buf);
        Ok(acc)
      })
      .await?;
    return Ok(Some(FilePart { filename, data }));
  }
  Ok(None)
}

/// 上传文件名只保留最后一段，非 `[A-Za-z0-9._-]` 字符替换为 `_`
pub fn sanitize_filename(name: &str) -> Option<String> {
  let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
  let cleaned: String = base
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
        c
      } else {
        '_'
      }
    })
    .collect();
  let cleaned = cleaned.trim_start_matches('.');
  if cleaned.is_empty() || !has_allowed_extension(cleaned) {
    None
  } else {
    Some(cleaned.to_string())
  }
}

/// 报告表单中的图像必须是上传目录中的普通文件名
pub fn is_plain_file_name(name: &str) -> bool {
  !name.is_empty()
    && name != "."
    && name != ".."
    && !name.contains(['/', '\\', '\0'])
    && Path::new(name).file_name().is_some_and(|f| f == name)
}

/// 以 `<时间>-<原文件名>-<随机串>.<扩展名>` 新建文件保存上传内容，
/// 返回上传目录中的文件名。同名上传互不覆盖。
fn store_upload(dir: &Path, filename: &str, data: &[u8]) -> std::io::Result<String> {
  std::fs::create_dir_all(dir)?;
  let (stem, ext) = filename.rsplit_once('.').unwrap_or((filename, ""));
  let mut file = tempfile::Builder::new()
    .prefix(&format!("{}-{}-", Local::now().format("%Y%m%d%H%M%S"), stem))
    .suffix(&format!(".{ext}"))
    .rand_bytes(6)
    .tempfile_in(dir)?;
  file.write_all(data)?;
  let (_, path) = file.keep().map_err(|e| e.error)?;
  path
    .file_name()
    .and_then(|name| name.to_str())
    .map(str::to_string)
    .ok_or_else(|| std::io::Error::other(format!("无效的保存路径: {}", path.display())))
}

fn classify_file(
  slot: &ModelSlot<RetinopathyClassifier>,
  path: &Path,
) -> Result<(ClassificationResult, LabelMap, Duration), ScreeningError> {
  let tensor = preprocess(path)?;
  let classifier = slot.get()?;
  let now = Instant::now();
  let result = classifier.classify(&tensor)?;
  Ok((result, classifier.labels().clone(), now.elapsed()))
}

async fn handle_predict(form: FormData, state: SharedState) -> Result<Response, Infallible> {
  let part = match take_file_part(form).await {
    Ok(Some(part)) => part,
    Ok(None) => return Ok(html_reply(StatusCode::OK, index_page(Some(MSG_NO_FILE_PART)))),
    Err(e) => {
      warn!("读取上传表单失败: {}", e);
      return Ok(html_reply(
        StatusCode::BAD_REQUEST,
        index_page(Some(MSG_ERROR_OCCURRED)),
      ));
    }
  };

  let original = part.filename.unwrap_or_default();
  if original.is_empty() {
    return Ok(html_reply(StatusCode::OK, index_page(Some(MSG_NO_SELECTED_FILE))));
  }

  let Some(filename) = sanitize_filename(&original) else {
    info!("拒绝上传文件: {:?}", original);
    return Ok(html_reply(StatusCode::OK, index_page(Some(MSG_ERROR_OCCURRED))));
  };

  let size = part.data.len();
  let stored = {
    let dir = state.upload_dir.clone();
    tokio::task::spawn_blocking(move || store_upload(&dir, &filename, &part.data))
  };
  let stored_name = match stored.await.map_err(std::io::Error::other).and_then(|r| r) {
    Ok(name) => name,
    Err(e) => {
      error!("保存上传文件失败: {:?}, 错误: {}", original, e);
      return Ok(error_reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        "The uploaded file could not be stored.",
      ));
    }
  };
  let save_path = state.upload_dir.join(&stored_name);
  info!("收到上传文件: {} ({} 字节)", save_path.display(), size);

  let job = {
    let state = state.clone();
    let path = save_path.clone();
    tokio::task::spawn_blocking(move || classify_file(&state.slot, &path))
  };

  let outcome = match state.inference_timeout {
    Some(limit) => match tokio::time::timeout(limit, job).await {
      Ok(joined) => joined.map_err(ScreeningError::from).and_then(|r| r),
      Err(_) => Err(ScreeningError::from(InferenceError::new(format!(
        "推理超过 {:?} 未完成",
        limit
      )))),
    },
    None => job.await.map_err(ScreeningError::from).and_then(|r| r),
  };

  let (result, labels, elapsed) = match outcome {
    Ok(done) => done,
    Err(e) => {
      error!("分类失败: {}, 错误: {}", save_path.display(), e);
      return Ok(error_reply(e.status(), e.public_message()));
    }
  };

  let image_src = format!("/static/uploads/{}", urlencoding::encode(&stored_name));
  let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
  let html = result_page(&ResultPage {
    result: &result,
    labels: &labels,
    image_src: &image_src,
    image_name: Some(&stored_name),
    timestamp: &timestamp,
    processing_ms: Some(elapsed.as_millis()),
  });

  Ok(html_reply(StatusCode::OK, html))
}

/// `POST /download_report` 的表单
#[derive(Debug, PartialEq)]
struct ReportForm {
  image_path: String,
  diagnosis: String,
  probabilities: Vec<f32>,
  processing_ms: Option<u64>,
}

impl ReportForm {
  fn parse(body: &[u8]) -> Result<Self, String> {
    let mut image_path = None;
    let mut diagnosis = None;
    let mut probabilities = Vec::new();
    let mut processing_ms = None;

    for (key, value) in url::form_urlencoded::parse(body) {
      match key.as_ref() {
        "image_path" => image_path = Some(value.into_owned()),
        "diagnosis" => diagnosis = Some(value.into_owned()),
        "probabilities" => {
          let p = value
            .trim()
            .parse::<f32>()
            .map_err(|_| format!("invalid probability {:?}", value))?;
          probabilities.push(p);
        }
        "processing_ms" => processing_ms = value.trim().parse::<u64>().ok(),
        other => debug!("忽略报告表单字段: {}", other),
      }
    }

    let image_path = image_path.ok_or("missing image_path")?;
    let diagnosis = diagnosis.ok_or("missing diagnosis")?;
    if !is_plain_file_name(&image_path) {
      return Err(format!("invalid image_path {:?}", image_path));
    }

    Ok(Self {
      image_path,
      diagnosis,
      probabilities,
      processing_ms,
    })
  }
}

fn render_report(state: &AppState, form: ReportForm) -> Result<(String, Vec<u8>), DownloadError> {
  let classifier = state.slot.get()?;
  let manifest = classifier.manifest();
  let result = manifest
    .labels()
    .result_for_label(&form.diagnosis, form.probabilities)
    .map_err(|e| DownloadError::BadRequest(e.to_string()))?;

  let image_path = state.upload_dir.join(&form.image_path);
  let report = Report::build(&ReportContext {
    image_path: &image_path,
    result: &result,
    labels: manifest.labels(),
    model: manifest.model(),
    analysed_at: Local::now(),
    processing_time: form.processing_ms.map(Duration::from_millis),
  });
  let bytes = PdfReportWriter.to_bytes(&report)?;

  if let Some(dir) = &state.report_dir {
    let target = dir.join(format!("{}.pdf", report.id));
    let saved = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&target, &bytes));
    match saved {
      Ok(()) => info!("报告已保存: {}", target.display()),
      Err(e) => warn!("报告保存失败: {}, 错误: {}", target.display(), e),
    }
  }

  Ok((report.id, bytes))
}

async fn handle_download_report(body: Bytes, state: SharedState) -> Result<Response, Infallible> {
  let form = match ReportForm::parse(&body) {
    Ok(form) => form,
    Err(msg) => {
      warn!("报告请求无效: {}", msg);
      return Ok(error_reply(StatusCode::BAD_REQUEST, &msg));
    }
  };

  let job = {
    let state = state.clone();
    tokio::task::spawn_blocking(move || render_report(&state, form))
  };

  match job.await.map_err(DownloadError::from).and_then(|r| r) {
    Ok((id, bytes)) => {
      info!("报告 {} 生成完成 ({} 字节)", id, bytes.len());
      let reply = warp::reply::with_header(bytes, "content-type", "application/pdf");
      let reply = warp::reply::with_header(
        reply,
        "content-disposition",
        format!("attachment; filename=\"{}\"", REPORT_FILE_NAME),
      );
      Ok(reply.into_response())
    }
    Err(e) => {
      error!("报告生成失败: {}", e);
      let message = match &e {
        DownloadError::BadRequest(msg) => msg.clone(),
        DownloadError::ModelLoad(_) => "The screening model is currently unavailable.".to_string(),
        _ => "The report could not be generated.".to_string(),
      };
      Ok(error_reply(e.status(), &message))
    }
  }
}

#[derive(Debug, Serialize)]
struct Health {
  status: &'static str,
  model: &'static str,
}

fn handle_health(state: SharedState) -> Response {
  let model = state.slot.status();
  let (status, code) = match model {
    SlotStatus::Failed => ("degraded", StatusCode::SERVICE_UNAVAILABLE),
    _ => ("ok", StatusCode::OK),
  };
  let body = Health {
    status,
    model: model.as_str(),
  };
  warp::reply::with_status(warp::reply::json(&body), code).into_response()
}

async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
  let (code, message) = if err.is_not_found() {
    (StatusCode::NOT_FOUND, "Not found.")
  } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
    (StatusCode::PAYLOAD_TOO_LARGE, "The uploaded file is too large.")
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed.")
  } else {
    (StatusCode::BAD_REQUEST, "Bad request.")
  };
  debug!("请求被拒绝: {:?}", err);
  Ok(error_reply(code, message))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{ForwardPass, ModelManifest};
  use image::{Rgb, RgbImage};
  use std::io::Cursor;

  const BOUNDARY: &str = "retinex-test-boundary";

  struct Fixed(Vec<f32>);

  impl ForwardPass for Fixed {
    fn forward(&self, _: &[f32], _: [usize; 4]) -> Result<Vec<f32>, InferenceError> {
      Ok(self.0.clone())
    }
  }

  fn state_with(dir: &Path, output: Vec<f32>) -> SharedState {
    let slot = ModelSlot::new(move || {
      Ok(RetinopathyClassifier::new(
        Fixed(output.clone()),
        ModelManifest::builtin()?,
      ))
    });
    Arc::new(AppState::new(Arc::new(slot), dir.join("uploads")).with_report_dir(Some(dir.join("reports"))))
  }

  fn failing_state(dir: &Path) -> SharedState {
    let slot = ModelSlot::new(|| Err(ModelLoadError::NotFound(PathBuf::from("64x3-CNN.model"))));
    Arc::new(AppState::new(Arc::new(slot), dir.join("uploads")))
  }

  fn png_bytes() -> Vec<u8> {
    let mut bytes = Vec::new();
    RgbImage::from_pixel(300, 200, Rgb([200, 90, 40]))
      .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
      .unwrap();
    bytes
  }

  fn multipart(field: &str, filename: &str, data: &[u8]) -> Vec<u8> {
    let mut body = format!(
      "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n\
       Content-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
  }

  async fn post_upload(state: SharedState, body: Vec<u8>) -> warp::http::Response<Bytes> {
    warp::test::request()
      .method("POST")
      .path("/predict")
      .header(
        "content-type",
        format!("multipart/form-data; boundary={BOUNDARY}"),
      )
      .body(body)
      .reply(&routes(state))
      .await
  }

  fn text(resp: &warp::http::Response<Bytes>) -> String {
    String::from_utf8_lossy(resp.body()).into_owned()
  }

  /// 结果页报告表单中的上传文件名
  fn stored_name(html: &str) -> String {
    let marker = "name=\"image_path\" value=\"";
    let start = html.find(marker).unwrap() + marker.len();
    let len = html[start..].find('"').unwrap();
    html[start..start + len].to_string()
  }

  /// 第一次推理耗时 `delay`，之后立即返回
  struct SlowOnce {
    delay: Duration,
    calls: std::sync::atomic::AtomicUsize,
  }

  impl ForwardPass for SlowOnce {
    fn forward(&self, _: &[f32], _: [usize; 4]) -> Result<Vec<f32>, InferenceError> {
      if self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
        std::thread::sleep(self.delay);
      }
      Ok(vec![0.3, 0.7])
    }
  }

  #[tokio::test]
  async fn index_serves_upload_form() {
    let dir = tempfile::tempdir().unwrap();
    let resp = warp::test::request()
      .path("/")
      .reply(&routes(state_with(dir.path(), vec![0.1, 0.9])))
      .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(text(&resp).contains("action=\"/predict\""));
  }

  #[tokio::test]
  async fn predict_classifies_upload() {
    let dir = tempfile::tempdir().unwrap();
    let state = state_with(dir.path(), vec![0.12, 0.88]);
    let resp = post_upload(state, multipart("file", "my eye.PNG", &png_bytes())).await;

    assert_eq!(resp.status(), StatusCode::OK);
    let html = text(&resp);
    assert!(html.contains("No Diabetic Retinopathy Detected"));
    assert!(html.contains("name=\"probabilities\" value=\"0.88\""));

    let name = stored_name(&html);
    assert!(name.contains("-my_eye-"), "{name}");
    assert!(name.ends_with(".PNG"), "{name}");
    assert!(html.contains(&format!("src=\"/static/uploads/{name}\"")));
    assert_eq!(
      std::fs::read(dir.path().join("uploads").join(&name)).unwrap(),
      png_bytes()
    );
  }

  #[tokio::test]
  async fn same_named_uploads_are_kept_apart() {
    let dir = tempfile::tempdir().unwrap();
    let state = state_with(dir.path(), vec![0.4, 0.6]);
    let encode = |color: [u8; 3]| {
      let mut bytes = Vec::new();
      RgbImage::from_pixel(64, 64, Rgb(color))
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
      bytes
    };
    let (left, right) = (encode([255, 0, 0]), encode([0, 0, 255]));

    let (a, b) = tokio::join!(
      post_upload(state.clone(), multipart("file", "eye.png", &left)),
      post_upload(state.clone(), multipart("file", "eye.png", &right)),
    );
    assert_eq!(a.status(), StatusCode::OK);
    assert_eq!(b.status(), StatusCode::OK);

    let (name_a, name_b) = (stored_name(&text(&a)), stored_name(&text(&b)));
    assert_ne!(name_a, name_b);
    assert!(text(&a).contains(&format!("/static/uploads/{name_a}")));
    assert!(text(&b).contains(&format!("/static/uploads/{name_b}")));
    assert_eq!(std::fs::read(state.upload_dir().join(&name_a)).unwrap(), left);
    assert_eq!(std::fs::read(state.upload_dir().join(&name_b)).unwrap(), right);
  }

  #[tokio::test]
  async fn slow_inference_times_out_and_server_keeps_serving() {
    let dir = tempfile::tempdir().unwrap();
    let slot = ModelSlot::new(|| {
      Ok(RetinopathyClassifier::new(
        SlowOnce {
          delay: Duration::from_millis(400),
          calls: Default::default(),
        },
        ModelManifest::builtin()?,
      ))
    });
    let state = Arc::new(
      AppState::new(Arc::new(slot), dir.path().join("uploads"))
        .with_inference_timeout(Some(Duration::from_millis(50))),
    );

    let resp = post_upload(state.clone(), multipart("file", "eye.png", &png_bytes())).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(text(&resp).contains("could not be analysed"));

    let resp = post_upload(state.clone(), multipart("file", "eye.png", &png_bytes())).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(text(&resp).contains("No Diabetic Retinopathy Detected"));
  }

  #[tokio::test]
  async fn health_answers_while_model_is_loading() {
    let dir = tempfile::tempdir().unwrap();
    let (release, gate) = std::sync::mpsc::channel::<()>();
    let gate = std::sync::Mutex::new(gate);
    let entered = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = entered.clone();
    let slot = ModelSlot::new(move || {
      flag.store(true, std::sync::atomic::Ordering::SeqCst);
      let _ = gate.lock().unwrap().recv();
      Ok(RetinopathyClassifier::new(
        Fixed(vec![0.5, 0.5]),
        ModelManifest::builtin()?,
      ))
    });
    let state = Arc::new(AppState::new(Arc::new(slot), dir.path().join("uploads")));

    let upload = post_upload(state.clone(), multipart("file", "eye.png", &png_bytes()));
    let check_health = async {
      while !entered.load(std::sync::atomic::Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
      let resp = tokio::time::timeout(
        Duration::from_secs(1),
        warp::test::request().path("/health").reply(&routes(state.clone())),
      )
      .await;
      let _ = release.send(());
      resp
    };
    let (uploaded, health) = tokio::join!(upload, check_health);

    let health = health.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(health.body()).unwrap();
    assert_eq!(body["model"], "loading");
    assert_eq!(uploaded.status(), StatusCode::OK);
    assert_eq!(state.slot().status(), SlotStatus::Ready);
  }

  #[tokio::test]
  async fn predict_reports_form_problems() {
    let dir = tempfile::tempdir().unwrap();

    let resp = post_upload(
      state_with(dir.path(), vec![0.5, 0.5]),
      multipart("other", "eye.png", b"x"),
    )
    .await;
    assert!(text(&resp).contains(MSG_NO_FILE_PART));

    let resp = post_upload(
      state_with(dir.path(), vec![0.5, 0.5]),
      multipart("file", "", b""),
    )
    .await;
    assert!(text(&resp).contains(MSG_NO_SELECTED_FILE));

    let resp = post_upload(
      state_with(dir.path(), vec![0.5, 0.5]),
      multipart("file", "eye.bmp", b"BM"),
    )
    .await;
    assert!(text(&resp).contains(MSG_ERROR_OCCURRED));
    assert!(!dir.path().join("uploads/eye.bmp").exists());
  }

  #[tokio::test]
  async fn corrupt_upload_is_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let resp = post_upload(
      state_with(dir.path(), vec![0.5, 0.5]),
      multipart("file", "eye.jpg", b"not really a jpeg"),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn model_failure_is_service_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let state = failing_state(dir.path());
    let resp = post_upload(state.clone(), multipart("file", "eye.png", &png_bytes())).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let resp = warp::test::request()
      .path("/health")
      .reply(&routes(state))
      .await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
    assert_eq!(body["model"], "failed");
  }

  #[tokio::test]
  async fn bad_model_output_is_internal_error() {
    let dir = tempfile::tempdir().unwrap();
    let resp = post_upload(
      state_with(dir.path(), vec![0.2, 0.3, 0.5]),
      multipart("file", "eye.png", &png_bytes()),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
  }

  #[tokio::test]
  async fn health_reports_lazy_model_state() {
    let dir = tempfile::tempdir().unwrap();
    let state = state_with(dir.path(), vec![0.5, 0.5]);
    let resp = warp::test::request()
      .path("/health")
      .reply(&routes(state.clone()))
      .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
    assert_eq!(body["model"], "unloaded");

    state.slot().preload().unwrap();
    let resp = warp::test::request()
      .path("/health")
      .reply(&routes(state))
      .await;
    let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
    assert_eq!(body["model"], "ready");
  }

  #[tokio::test]
  async fn uploaded_images_are_served() {
    let dir = tempfile::tempdir().unwrap();
    let state = state_with(dir.path(), vec![0.5, 0.5]);
    std::fs::create_dir_all(state.upload_dir()).unwrap();
    std::fs::write(state.upload_dir().join("eye.png"), png_bytes()).unwrap();

    let resp = warp::test::request()
      .path("/static/uploads/eye.png")
      .reply(&routes(state.clone()))
      .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.body().as_ref(), png_bytes().as_slice());

    let resp = warp::test::request()
      .path("/static/uploads/missing.png")
      .reply(&routes(state))
      .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
  }

  #[tokio::test]
  async fn download_report_returns_pdf_attachment() {
    let dir = tempfile::tempdir().unwrap();
    let state = state_with(dir.path(), vec![0.5, 0.5]);
    std::fs::create_dir_all(state.upload_dir()).unwrap();
    std::fs::write(state.upload_dir().join("eye.png"), png_bytes()).unwrap();

    let resp = warp::test::request()
      .method("POST")
      .path("/download_report")
      .header("content-type", "application/x-www-form-urlencoded")
      .body(
        "image_path=eye.png&diagnosis=Diabetic+Retinopathy+Detected\
         &probabilities=0.83&probabilities=0.17&processing_ms=40",
      )
      .reply(&routes(state))
      .await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "application/pdf");
    assert_eq!(
      resp.headers()["content-disposition"],
      "attachment; filename=\"Medical_Analysis_Report.pdf\""
    );
    assert!(resp.body().starts_with(b"%PDF"));

    let saved: Vec<_> = std::fs::read_dir(dir.path().join("reports"))
      .unwrap()
      .collect();
    assert_eq!(saved.len(), 1);
  }

  #[tokio::test]
  async fn download_report_rejects_bad_forms() {
    let dir = tempfile::tempdir().unwrap();
    let cases = [
      "image_path=../../etc/passwd&diagnosis=Diabetic+Retinopathy+Detected&probabilities=0.5&probabilities=0.5",
      "image_path=eye.png&diagnosis=Glaucoma&probabilities=0.5&probabilities=0.5",
      "image_path=eye.png&diagnosis=Diabetic+Retinopathy+Detected&probabilities=0.5",
      "image_path=eye.png&diagnosis=Diabetic+Retinopathy+Detected&probabilities=abc",
      "diagnosis=Diabetic+Retinopathy+Detected&probabilities=0.5&probabilities=0.5",
    ];
    for body in cases {
      let resp = warp::test::request()
        .method("POST")
        .path("/download_report")
        .body(body)
        .reply(&routes(state_with(dir.path(), vec![0.5, 0.5])))
        .await;
      assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{body}");
    }
  }

  #[test]
  fn internal_shape_error_is_not_blamed_on_upload() {
    let shape = crate::frame::RgbNhwcTensor::from_shape_vec([224, 224, 3], vec![0.0; 3]).unwrap_err();
    let err = ScreeningError::from(DecodeError::from(shape));
    assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let err = ScreeningError::from(DecodeError::EmptyImage { width: 0, height: 0 });
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
  }

  #[test]
  fn filenames_are_sanitized() {
    assert_eq!(sanitize_filename("eye.png").as_deref(), Some("eye.png"));
    assert_eq!(
      sanitize_filename("../../etc/eye.jpg").as_deref(),
      Some("eye.jpg")
    );
    assert_eq!(
      sanitize_filename("C:\\scans\\left eye (1).JPEG").as_deref(),
      Some("left_eye__1_.JPEG")
    );
    assert_eq!(sanitize_filename("..png"), None);
    assert_eq!(sanitize_filename("notes.txt"), None);
    assert_eq!(sanitize_filename("dir/"), None);
  }

  #[test]
  fn report_image_must_be_plain_name() {
    assert!(is_plain_file_name("eye.png"));
    assert!(!is_plain_file_name(""));
    assert!(!is_plain_file_name(".."));
    assert!(!is_plain_file_name("a/eye.png"));
    assert!(!is_plain_file_name("..\\eye.png"));
  }

  #[test]
  fn report_form_parses_repeated_probabilities() {
    let form = ReportForm::parse(
      b"image_path=eye.png&diagnosis=No+Diabetic+Retinopathy+Detected&probabilities=0.1&probabilities=0.9",
    )
    .unwrap();
    assert_eq!(
      form,
      ReportForm {
        image_path: "eye.png".to_string(),
        diagnosis: "No Diabetic Retinopathy Detected".to_string(),
        probabilities: vec![0.1, 0.9],
        processing_ms: None,
      }
    );
  }
}
