//! 持久化模块
//! Persistence module
//!
//! 为工作池状态、调度器状态和任务执行记录提供持久化存储。
//! Durable storage for pool state, scheduler state and job executions.
//! `with_transaction` 让调用方在事务内外使用同一套接口。
//! `with_transaction` lets callers use the same interface inside and outside a transaction.

use crate::base::TenantId;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::warn;

pub mod memdb;
pub mod model;
#[cfg(feature = "postgres")]
pub mod pgdb;

pub use memdb::MemoryStateStore;
pub use model::{
  JobExecution, JobStatus, LifecycleStatus, Metadata, PoolState, PoolStatus, SchedulerState,
  SchedulerStatus,
};
#[cfg(feature = "postgres")]
pub use pgdb::SeaOrmStateStore;

/// 状态仓库特性，事务内外共用
/// State repository trait, shared by transactional and plain access
#[async_trait]
pub trait StateRepository: Send + Sync {
  // === 工作池状态 / Pool state ===

  /// 插入工作池状态，租户已存在时返回 `AlreadyExists`
  /// Insert pool state, `AlreadyExists` when the tenant already has one
  async fn create_pool_state(&self, state: &PoolState) -> Result<()>;

  /// 整行覆盖工作池状态
  /// Overwrite the whole pool state row
  async fn update_pool_state(&self, state: &PoolState) -> Result<()>;

  async fn get_pool_state(&self, tenant_id: TenantId) -> Result<PoolState>;

  /// 设置状态并记录时间戳: active 记 started_at，stopped/archived 记 stopped_at
  /// Set the status and stamp started_at on active, stopped_at on stopped/archived
  async fn set_pool_status(&self, tenant_id: TenantId, status: PoolStatus) -> Result<()>;

  async fn touch_pool_last_job(&self, tenant_id: TenantId, at: DateTime<Utc>) -> Result<()>;

  // === 调度器状态 / Scheduler state ===

  async fn create_scheduler_state(&self, state: &SchedulerState) -> Result<()>;

  async fn update_scheduler_state(&self, state: &SchedulerState) -> Result<()>;

  async fn get_scheduler_state(&self, tenant_id: TenantId) -> Result<SchedulerState>;

  async fn set_scheduler_status(&self, tenant_id: TenantId, status: SchedulerStatus)
    -> Result<()>;

  /// 记录一次调度: 更新 last_run_at/next_run_at，run_count 加一
  /// Record a tick: update last_run_at/next_run_at and increment run_count
  async fn record_scheduler_run(
    &self,
    tenant_id: TenantId,
    ran_at: DateTime<Utc>,
    next_run_at: DateTime<Utc>,
  ) -> Result<()>;

  // === 任务执行 / Job executions ===

  async fn create_job_execution(&self, execution: &JobExecution) -> Result<()>;

  async fn update_job_execution(&self, execution: &JobExecution) -> Result<()>;

  /// 按创建时间倒序列出租户的执行记录
  /// List a tenant's executions, newest first
  async fn list_job_executions(&self, tenant_id: TenantId, limit: u64)
    -> Result<Vec<JobExecution>>;

  // === 恢复与清理 / Recovery and cleanup ===

  /// 工作池与调度器同时为 active 的租户
  /// Tenants whose pool and scheduler are both active
  async fn load_active_tenants(&self) -> Result<Vec<TenantId>>;

  /// 删除租户的全部状态行与执行记录
  /// Delete every state row and execution of a tenant
  async fn delete_infrastructure(&self, tenant_id: TenantId) -> Result<()>;
}

/// 事务范围内的仓库
/// Transaction-scoped repository
#[async_trait]
pub trait StateTransaction: StateRepository {
  fn as_repository(&self) -> &dyn StateRepository;

  async fn commit(self: Box<Self>) -> Result<()>;

  async fn rollback(self: Box<Self>) -> Result<()>;
}

/// 可开启事务的状态存储
/// State store able to open transactions
#[async_trait]
pub trait StateStore: StateRepository {
  async fn begin(&self) -> Result<Box<dyn StateTransaction>>;
}

/// 在事务中执行 `f`，成功提交，失败回滚
/// Run `f` inside a transaction, committing on success and rolling back on error
///
/// ```rust,no_run
/// # use policy_worker::persistence::{with_transaction, StateStore, LifecycleStatus};
/// # use policy_worker::base::TenantId;
/// # async fn demo(store: &dyn StateStore, tenant: TenantId) -> policy_worker::Result<()> {
/// with_transaction(store, move |repo| {
///   Box::pin(async move {
///     repo.set_pool_status(tenant, LifecycleStatus::Stopped).await?;
///     repo.set_scheduler_status(tenant, LifecycleStatus::Stopped).await
///   })
/// })
/// .await
/// # }
/// ```
pub async fn with_transaction<T, F>(store: &dyn StateStore, f: F) -> Result<T>
where
  T: Send,
  F: for<'t> FnOnce(&'t dyn StateRepository) -> BoxFuture<'t, Result<T>> + Send,
{
  let tx = store.begin().await?;
  let outcome = f(tx.as_repository()).await;
  match outcome {
    Ok(value) => {
      tx.commit().await?;
      Ok(value)
    }
    Err(err) => {
      if let Err(rollback_err) = tx.rollback().await {
        warn!(error = %rollback_err, "Failed to roll back transaction");
      }
      Err(err)
    }
  }
}
