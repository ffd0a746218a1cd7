// 该文件是 Retinex （视网膜筛查） 项目的一部分。
// src/bin/retinex_oneshot.rs - 单张图像筛查
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

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use retinex::{
  FromUrl,
  input::ImageFileInput,
  model::RetinopathyBuilder,
  output::OutputWrapper,
  task::{OneShotTask, Task},
};

/// 对一张眼底照片做一次筛查并输出报告
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型目录，例如 onnx:///srv/64x3-CNN.model
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入图像，例如 image:///data/eye.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出，pdf:///、html:/// 或 json:///
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();

  info!("模型目录: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let input = ImageFileInput::from_url(&args.input)?;
  let model = RetinopathyBuilder::from_url(&args.model)?.build()?;
  let output = OutputWrapper::from_url(&args.output)?.with_manifest(model.manifest().clone());

  OneShotTask.run_task(input.into_nhwc(), model, output)?;

  Ok(())
}
