// 该文件是 Retinex （视网膜筛查） 项目的一部分。
// src/main.rs - 网页服务主程序
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

mod args;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use retinex::model::{ModelSlot, load_classifier};
use retinex::server::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = args::Args::parse();

  info!("Retinex 视网膜筛查服务");
  info!("模型目录: {}", args.model.display());
  info!("上传目录: {}", args.upload_dir.display());
  if let Some(dir) = &args.report_dir {
    info!("报告目录: {}", dir.display());
  }

  std::fs::create_dir_all(&args.upload_dir)
    .with_context(|| format!("无法创建上传目录 {}", args.upload_dir.display()))?;

  let model_dir = args.model.clone();
  let slot = Arc::new(ModelSlot::new(move || load_classifier(&model_dir)));

  if args.lazy_load {
    info!("模型将在首次分类请求时加载");
  } else {
    let preload = slot.clone();
    let loaded = tokio::task::spawn_blocking(move || preload.preload()).await?;
    if let Err(e) = loaded {
      // 服务继续运行，分类请求返回 503
      error!("模型加载失败: {}", e);
      warn!("服务以降级模式启动");
    }
  }

  let state = AppState::new(slot, args.upload_dir)
    .with_report_dir(args.report_dir)
    .with_max_upload_bytes(args.max_upload_mb.saturating_mul(1024 * 1024))
    .with_inference_timeout(args.inference_timeout_secs.map(Duration::from_secs));

  let ip: IpAddr = args
    .bind
    .parse()
    .with_context(|| format!("无效的监听地址 '{}'", args.bind))?;

  server::serve(Arc::new(state), SocketAddr::new(ip, args.port))
    .await
    .context("服务启动失败")?;

  Ok(())
}
