// 该文件是 Retinex （视网膜筛查） 项目的一部分。
// src/args.rs - 服务参数配置
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

use clap::Parser;

use retinex::model::DEFAULT_MODEL_DIR;
use retinex::server::DEFAULT_UPLOAD_DIR;

/// Retinex 视网膜筛查网页服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型目录，包含 model.onnx 和可选的 labels.toml
  #[arg(long, default_value = DEFAULT_MODEL_DIR, value_name = "DIR")]
  pub model: PathBuf,

  /// 监听地址
  #[arg(long, default_value = "127.0.0.1", value_name = "ADDR")]
  pub bind: String,

  /// 监听端口
  #[arg(long, default_value_t = 5000, value_name = "PORT")]
  pub port: u16,

  /// 上传文件保存目录
  #[arg(long, default_value = DEFAULT_UPLOAD_DIR, value_name = "DIR")]
  pub upload_dir: PathBuf,

  /// 生成的 PDF 报告另存目录，不指定则只返回给浏览器
  #[arg(long, value_name = "DIR")]
  pub report_dir: Option<PathBuf>,

  /// 首次分类请求时才加载模型
  #[arg(long)]
  pub lazy_load: bool,

  /// 上传文件大小上限（MB）
  #[arg(long, default_value_t = 16, value_name = "MB")]
  pub max_upload_mb: u64,

  /// 单次推理超时（秒），超时按推理失败处理
  #[arg(long, value_name = "SECS")]
  pub inference_timeout_secs: Option<u64>,
}
