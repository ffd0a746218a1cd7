// 该文件是 Retinex （视网膜筛查） 项目的一部分。
// src/lib.rs - 库主文件
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

pub mod frame;
pub mod input;
pub mod model;
pub mod output;
#[cfg(feature = "web_server")]
pub mod server;
pub mod task;

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}

/// URL 路径按百分号编码解码后作为本地路径，`image:///data/my%20eye.jpg` 对应 `/data/my eye.jpg`
pub fn path_from_url(url: &url::Url) -> std::path::PathBuf {
  match urlencoding::decode(url.path()) {
    Ok(path) => std::path::PathBuf::from(path.into_owned()),
    Err(_) => std::path::PathBuf::from(url.path()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::path::Path;

  #[test]
  fn url_paths_are_percent_decoded() {
    let url = url::Url::parse("image:///data/my eye.jpg").unwrap();
    assert_eq!(url.path(), "/data/my%20eye.jpg");
    assert_eq!(path_from_url(&url), Path::new("/data/my eye.jpg"));

    let url = url::Url::parse("pdf:///srv/%E6%8A%A5%E5%91%8A/r.pdf").unwrap();
    assert_eq!(path_from_url(&url), Path::new("/srv/报告/r.pdf"));
  }
}
