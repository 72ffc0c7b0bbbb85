//! 任务处理器模块
//! Job handler module
//!
//! 外部代码通过 `(类型名, fn(params) -> Result)` 提供任务实现，核心不关心任务语义
//! External code supplies job bodies as `(type name, fn(params) -> Result)`; the core never inspects them

use crate::error::Result;
use crate::job::JobParams;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

/// 任务处理器特性
/// Job handler trait
#[async_trait]
pub trait JobHandler: Send + Sync {
  /// 处理任务参数
  /// Handle the job parameters
  async fn handle(&self, params: JobParams) -> Result<()>;
}

/// 函数式处理器适配器
/// Functional handler adapter
pub struct HandlerFunc<F> {
  func: F,
}

impl<F> HandlerFunc<F>
where
  F: Fn(JobParams) -> Result<()> + Send + Sync,
{
  /// 创建新的函数式处理器
  /// Create a new functional handler
  pub fn new(func: F) -> Self {
    Self { func }
  }
}

#[async_trait]
impl<F> JobHandler for HandlerFunc<F>
where
  F: Fn(JobParams) -> Result<()> + Send + Sync,
{
  async fn handle(&self, params: JobParams) -> Result<()> {
    (self.func)(params)
  }
}

/// 异步函数式处理器适配器
/// Asynchronous functional handler adapter
pub struct AsyncHandlerFunc<F, Fut> {
  func: F,
  _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncHandlerFunc<F, Fut>
where
  F: Fn(JobParams) -> Fut + Send + Sync,
  Fut: Future<Output = Result<()>> + Send,
{
  /// 创建新的异步函数式处理器
  /// Create a new asynchronous functional handler
  pub fn new(func: F) -> Self {
    Self {
      func,
      _phantom: PhantomData,
    }
  }
}

#[async_trait]
impl<F, Fut> JobHandler for AsyncHandlerFunc<F, Fut>
where
  F: Fn(JobParams) -> Fut + Send + Sync,
  Fut: Future<Output = Result<()>> + Send,
{
  async fn handle(&self, params: JobParams) -> Result<()> {
    (self.func)(params).await
  }
}

/// 按类型名索引的处理器注册表
/// Handler registry keyed by job type name
///
/// 克隆共享同一张表
/// Clones share the same table
#[derive(Clone, Default)]
pub struct HandlerRegistry {
  handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
}

impl HandlerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// 注册处理器，同名处理器会被替换
  /// Register a handler, replacing any handler with the same type name
  pub fn register<S: Into<String>>(&self, job_type: S, handler: Arc<dyn JobHandler>) {
    let mut handlers = self
      .handlers
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    handlers.insert(job_type.into(), handler);
  }

  /// 查找处理器
  /// Look up a handler
  pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
    let handlers = self
      .handlers
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    handlers.get(job_type).cloned()
  }

  pub fn contains(&self, job_type: &str) -> bool {
    self.get(job_type).is_some()
  }

  /// 已注册的类型名（排序后）
  /// Registered type names, sorted
  pub fn job_types(&self) -> Vec<String> {
    let handlers = self
      .handlers
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut types: Vec<String> = handlers.keys().cloned().collect();
    types.sort();
    types
  }
}

impl std::fmt::Debug for HandlerRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HandlerRegistry")
      .field("job_types", &self.job_types())
      .finish()
  }
}
