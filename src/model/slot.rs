// 该文件是 Retinex （视网膜筛查） 项目的一部分。
// src/model/slot.rs - 进程级模型槽位
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

//! 模型的生命周期：`Unloaded -> Loading -> Ready` 或 `Unloaded -> Loading -> Failed`。
//!
//! 首次调用 [`ModelSlot::get`]（或启动时调用 [`ModelSlot::preload`]）时加载，
//! 之后只读共享。加载失败会被缓存，之后每次请求都返回同一个
//! [`ModelLoadError`]，直到调用 [`ModelSlot::reload`] 或进程重启。
//!
//! 加载过程由单独的互斥锁串行化，状态锁只在读写状态时短暂持有，
//! 加载期间 [`ModelSlot::status`] 立即返回 `Loading`。

use std::sync::{Arc, Mutex, RwLock};

use tracing::{error, info, warn};

use crate::model::ModelLoadError;

type Loader<M> = Box<dyn Fn() -> Result<M, ModelLoadError> + Send + Sync>;

enum SlotState<M> {
  Unloaded,
  Loading,
  Ready(Arc<M>),
  Failed(ModelLoadError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
  Unloaded,
  Loading,
  Ready,
  Failed,
}

impl SlotStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      SlotStatus::Unloaded => "unloaded",
      SlotStatus::Loading => "loading",
      SlotStatus::Ready => "ready",
      SlotStatus::Failed => "failed",
    }
  }
}

pub struct ModelSlot<M> {
  loader: Loader<M>,
  load_lock: Mutex<()>,
  state: RwLock<SlotState<M>>,
}

impl<M> ModelSlot<M> {
  pub fn new(loader: impl Fn() -> Result<M, ModelLoadError> + Send + Sync + 'static) -> Self {
    Self {
      loader: Box::new(loader),
      load_lock: Mutex::new(()),
      state: RwLock::new(SlotState::Unloaded),
    }
  }

  /// 已有结论时返回，`Unloaded`/`Loading` 返回 `None`
  fn settled(&self) -> Option<Result<Arc<M>, ModelLoadError>> {
    match &*self.state.read().unwrap_or_else(|e| e.into_inner()) {
      SlotState::Ready(model) => Some(Ok(model.clone())),
      SlotState::Failed(err) => Some(Err(err.clone())),
      SlotState::Unloaded | SlotState::Loading => None,
    }
  }

  fn set_state(&self, next: SlotState<M>) {
    *self.state.write().unwrap_or_else(|e| e.into_inner()) = next;
  }

  /// 取得已加载的模型，未加载时在当前线程同步加载
  ///
  /// 会阻塞调用线程，异步代码中应放在阻塞线程池里调用。
  pub fn get(&self) -> Result<Arc<M>, ModelLoadError> {
    if let Some(settled) = self.settled() {
      return settled;
    }

    let _loading = self.load_lock.lock().unwrap_or_else(|e| e.into_inner());
    // 等待加载锁期间可能已有其它线程完成加载
    if let Some(settled) = self.settled() {
      return settled;
    }
    self.load()
  }

  /// 启动时立即加载
  pub fn preload(&self) -> Result<(), ModelLoadError> {
    self.get().map(|_| ())
  }

  /// 丢弃当前模型（或失败记录）并重新加载
  pub fn reload(&self) -> Result<Arc<M>, ModelLoadError> {
    let _loading = self.load_lock.lock().unwrap_or_else(|e| e.into_inner());
    warn!("重新加载模型");
    self.load()
  }

  /// 不会等待正在进行的加载
  pub fn status(&self) -> SlotStatus {
    match &*self.state.read().unwrap_or_else(|e| e.into_inner()) {
      SlotState::Unloaded => SlotStatus::Unloaded,
      SlotState::Loading => SlotStatus::Loading,
      SlotState::Ready(_) => SlotStatus::Ready,
      SlotState::Failed(_) => SlotStatus::Failed,
    }
  }

  /// 调用方必须持有 `load_lock`
  fn load(&self) -> Result<Arc<M>, ModelLoadError> {
    self.set_state(SlotState::Loading);
    info!("加载模型...");
    match (self.loader)() {
      Ok(model) => {
        info!("模型加载完成");
        let model = Arc::new(model);
        self.set_state(SlotState::Ready(model.clone()));
        Ok(model)
      }
      Err(err) => {
        error!("模型加载失败: {}", err);
        self.set_state(SlotState::Failed(err.clone()));
        Err(err)
      }
    }
  }
}
