//! 工作管理器模块
//! Worker manager module
//!
//! 管理器为每个租户创建、启动、停止、归档和恢复一对工作池与调度器。
//! 持久化状态是权威来源: 内存注册表只在对应的状态行提交之后才会改变。
//! The manager creates, starts, stops, archives and recovers each tenant's pool and
//! scheduler pair. Persisted state is authoritative: the in-memory registry only changes
//! after the matching state rows were committed.
//!
//! 取消令牌的层级为: 根令牌 -> 租户令牌 -> 工作者与调度器
//! Token hierarchy: root token -> tenant token -> workers and scheduler
//!
//! 同一租户的生命周期操作由租户锁串行化，停止会一直持有锁直到任务退出且状态写入
//! Lifecycle operations on one tenant are serialised by a per-tenant lock; a stop holds it
//! until the tasks have exited and the status is written

use crate::base::keys::{pool_name, queue_name_base, scheduler_name, QueueKeys};
use crate::base::TenantId;
use crate::components::pool::{PoolOptions, WorkerPool};
use crate::components::scheduler::JobScheduler;
use crate::components::JobSubmitter;
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::handler::{HandlerRegistry, JobHandler};
use crate::persistence::{
  with_transaction, JobExecution, LifecycleStatus, PoolState, SchedulerState, StateRepository,
  StateStore,
};
use crate::queue::QueueBackend;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

mod infrastructure;
mod recovery;
mod registry;

pub use infrastructure::{InfrastructureConfig, MonitorFrequencyUnit};
pub use recovery::{ConfigSource, PersistedConfigSource, RecoveryReport};

use registry::{Registry, TenantRuntime};

const INFRASTRUCTURE: &str = "worker infrastructure";

/// 状态行的写入方式
/// How state rows are written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreateMode {
  /// 新建，重复时报 AlreadyExists
  /// Fresh insert, AlreadyExists on duplicates
  Insert,
  /// 恢复: 覆盖已有行的配置列，保留状态与时间戳
  /// Recovery: rewrite the config columns of the existing rows, keeping status and timestamps
  Rewrite,
}

/// 多租户工作管理器
/// Multi-tenant worker manager
pub struct WorkerManager {
  store: Arc<dyn StateStore>,
  backend: Arc<dyn QueueBackend>,
  config: ManagerConfig,
  handlers: HandlerRegistry,
  registry: RwLock<Registry>,
  /// 每个租户一把生命周期锁
  /// One lifecycle lock per tenant
  locks: StdMutex<HashMap<TenantId, Arc<Mutex<()>>>>,
  token: CancellationToken,
  tracker: TaskTracker,
}

impl WorkerManager {
  /// 创建管理器
  /// Create a manager
  pub fn new(
    store: Arc<dyn StateStore>,
    backend: Arc<dyn QueueBackend>,
    config: ManagerConfig,
  ) -> Result<Self> {
    config.validate()?;
    Ok(Self {
      store,
      backend,
      config,
      handlers: HandlerRegistry::new(),
      registry: RwLock::new(Registry::default()),
      locks: StdMutex::new(HashMap::new()),
      token: CancellationToken::new(),
      tracker: TaskTracker::new(),
    })
  }

  pub fn config(&self) -> &ManagerConfig {
    &self.config
  }

  /// 根取消令牌
  /// Root cancellation token
  pub fn token(&self) -> &CancellationToken {
    &self.token
  }

  pub fn store(&self) -> &Arc<dyn StateStore> {
    &self.store
  }

  /// 注册任务处理器，之后创建的基础设施都会使用它
  /// Register a job handler used by infrastructure created afterwards
  pub fn register_job_handler<S: Into<String>>(&self, job_type: S, handler: Arc<dyn JobHandler>) {
    let job_type = job_type.into();
    debug!(job_type = %job_type, "Job handler registered");
    self.handlers.register(job_type, handler);
  }

  pub fn job_handler(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
    self.handlers.get(job_type)
  }

  /// 取得租户的生命周期锁
  /// Take the tenant's lifecycle lock
  async fn lock_tenant(&self, tenant_id: TenantId) -> OwnedMutexGuard<()> {
    let lock = {
      let mut locks = self
        .locks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
      Arc::clone(locks.entry(tenant_id).or_default())
    };
    lock.lock_owned().await
  }

  /// 租户离开注册表后释放其锁条目，仍有其他等待者时保留
  /// Drop the lock entry of a tenant that left the registry, unless someone else still waits on it
  fn release_tenant_lock(&self, tenant_id: TenantId, guard: OwnedMutexGuard<()>) {
    let mut locks = self
      .locks
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    // map + guard
    if locks
      .get(&tenant_id)
      .is_some_and(|lock| Arc::strong_count(lock) == 2)
    {
      locks.remove(&tenant_id);
    }
    drop(guard);
  }

  /// 创建租户的工作池与调度器，并在一个事务中写入两行 `created` 状态
  /// Create a tenant's pool and scheduler, writing both `created` rows in one transaction
  pub async fn create_infrastructure(&self, config: InfrastructureConfig) -> Result<()> {
    let _guard = self.lock_tenant(config.tenant_id).await;
    if self.registry.read().await.contains(config.tenant_id) {
      return Err(Error::already_exists(INFRASTRUCTURE, config.tenant_id));
    }
    self.build(config, CreateMode::Insert).await
  }

  async fn build(&self, config: InfrastructureConfig, mode: CreateMode) -> Result<()> {
    let tenant_id = config.tenant_id;
    config.validate_overrides()?;
    let interval = config.interval()?;
    let unit = config.frequency_unit()?;
    let required = self.config.required_job_type.as_str();
    let handler = self
      .handlers
      .get(required)
      .ok_or_else(|| Error::HandlerNotRegistered(required.to_string()))?;

    let options = PoolOptions::new(pool_name(tenant_id), queue_name_base(tenant_id))
      .num_workers(config.num_workers.unwrap_or(self.config.num_workers))
      .job_timeout(config.job_timeout.unwrap_or(self.config.job_timeout))
      .poll_timeout(self.config.poll_timeout)
      .rate_limit(self.config.rate_limit)
      .daily_quota(self.config.daily_quota);
    let mut pool = WorkerPool::new(options, Arc::clone(&self.backend));
    if self.config.record_executions {
      pool = pool.with_execution_recorder(tenant_id, Arc::clone(&self.store));
    }
    pool.register_handler(required, handler);
    for job in &config.extra_jobs {
      if let Some(extra) = self.handlers.get(&job.job_type) {
        pool.register_handler(job.job_type.clone(), extra);
      }
    }
    let pool = Arc::new(pool);

    let submitter: Arc<dyn JobSubmitter> = Arc::clone(&pool) as Arc<dyn JobSubmitter>;
    let scheduler = JobScheduler::new(scheduler_name(tenant_id), interval, submitter)?
      .with_submit_timeout(self.config.submit_timeout)
      .with_run_recorder(tenant_id, Arc::clone(&self.store));
    scheduler.add_job(config.monitoring_job(required)).await;
    for job in &config.extra_jobs {
      scheduler.add_job(job.clone()).await;
    }
    let scheduler = Arc::new(scheduler);

    let now = Utc::now();
    let metadata = config.metadata();
    let pool_state = PoolState {
      tenant_id,
      pool_name: pool.name().to_string(),
      queue_name_base: pool.keys().prefix().to_string(),
      num_workers: u32::try_from(pool.options().num_workers).unwrap_or(u32::MAX),
      job_timeout: pool.options().job_timeout,
      pool_status: LifecycleStatus::Created,
      created_at: now,
      started_at: None,
      stopped_at: None,
      last_job_at: None,
      metadata: metadata.clone(),
    };
    let scheduler_state = SchedulerState {
      tenant_id,
      scheduler_name: scheduler.name().to_string(),
      monitor_interval: interval,
      monitor_frequency_unit: unit.as_str().to_string(),
      scheduler_status: LifecycleStatus::Created,
      created_at: now,
      started_at: None,
      stopped_at: None,
      last_run_at: None,
      next_run_at: None,
      run_count: 0,
      metadata,
    };

    with_transaction(self.store.as_ref(), move |repo| {
      Box::pin(async move {
        match mode {
          CreateMode::Insert => {
            repo.create_pool_state(&pool_state).await?;
            repo.create_scheduler_state(&scheduler_state).await
          }
          CreateMode::Rewrite => {
            let existing_pool = repo.get_pool_state(tenant_id).await?;
            let existing_scheduler = repo.get_scheduler_state(tenant_id).await?;
            repo
              .update_pool_state(&PoolState {
                pool_status: existing_pool.pool_status,
                created_at: existing_pool.created_at,
                started_at: existing_pool.started_at,
                stopped_at: existing_pool.stopped_at,
                last_job_at: existing_pool.last_job_at,
                ..pool_state
              })
              .await?;
            repo
              .update_scheduler_state(&SchedulerState {
                scheduler_status: existing_scheduler.scheduler_status,
                created_at: existing_scheduler.created_at,
                started_at: existing_scheduler.started_at,
                stopped_at: existing_scheduler.stopped_at,
                last_run_at: existing_scheduler.last_run_at,
                next_run_at: existing_scheduler.next_run_at,
                run_count: existing_scheduler.run_count,
                ..scheduler_state
              })
              .await
          }
        }
      })
    })
    .await?;

    let mut registry = self.registry.write().await;
    if registry.contains(tenant_id) {
      return Err(Error::already_exists(INFRASTRUCTURE, tenant_id));
    }
    registry.insert(tenant_id, pool, scheduler);
    info!(
      tenant_id = %tenant_id,
      interval = ?interval,
      recovery = mode == CreateMode::Rewrite,
      "Worker infrastructure created"
    );
    Ok(())
  }

  /// 启动租户: 两行状态变为 active 后再派生租户令牌并启动任务
  /// Start a tenant: both rows become active, then the tenant token is derived and the tasks spawned
  pub async fn start(&self, tenant_id: TenantId) -> Result<()> {
    let _guard = self.lock_tenant(tenant_id).await;
    self.start_locked(tenant_id).await
  }

  /// 调用方需持有租户锁
  /// The caller holds the tenant lock
  async fn start_locked(&self, tenant_id: TenantId) -> Result<()> {
    if self.token.is_cancelled() {
      return Err(Error::Cancelled);
    }
    let mut registry = self.registry.write().await;
    let (pool, scheduler) = registry
      .pair(tenant_id)
      .ok_or_else(|| Error::not_found(INFRASTRUCTURE, tenant_id))?;
    if registry.is_running(tenant_id) {
      return Err(Error::AlreadyRunning(tenant_id));
    }

    with_transaction(self.store.as_ref(), move |repo| {
      Box::pin(async move {
        repo.set_pool_status(tenant_id, LifecycleStatus::Active).await?;
        repo
          .set_scheduler_status(tenant_id, LifecycleStatus::Active)
          .await
      })
    })
    .await?;

    let token = self.token.child_token();
    let handles = vec![
      self.tracker.spawn(pool.run(token.clone())),
      self.tracker.spawn(scheduler.run(token.clone())),
    ];
    registry.set_runtime(tenant_id, TenantRuntime { token, handles });
    info!(tenant_id = %tenant_id, "Worker infrastructure started");
    Ok(())
  }

  /// 停止租户的任务并将两行状态置为 stopped
  /// Stop a tenant's tasks and set both rows to stopped
  ///
  /// 已创建但从未启动的租户直接置为 stopped；已经停止的租户返回 `NotRunning`
  /// A tenant created but never started moves straight to stopped; an already stopped one
  /// gives `NotRunning`
  pub async fn stop(&self, tenant_id: TenantId) -> Result<()> {
    let _guard = self.lock_tenant(tenant_id).await;
    match self.halt(tenant_id).await {
      Ok(()) => {}
      Err(Error::NotRunning(_)) => {
        let status = self.store.get_pool_state(tenant_id).await?.pool_status;
        if status != LifecycleStatus::Created {
          return Err(Error::NotRunning(tenant_id));
        }
        debug!(tenant_id = %tenant_id, "Stopping a tenant that was never started");
      }
      Err(err) => return Err(err),
    }
    with_transaction(self.store.as_ref(), move |repo| {
      Box::pin(async move {
        repo
          .set_pool_status(tenant_id, LifecycleStatus::Stopped)
          .await?;
        repo
          .set_scheduler_status(tenant_id, LifecycleStatus::Stopped)
          .await
      })
    })
    .await?;
    info!(tenant_id = %tenant_id, "Worker infrastructure stopped");
    Ok(())
  }

  /// 取消租户令牌并等待其任务退出，不修改持久化状态；调用方需持有租户锁
  /// Cancel the tenant token and wait for its tasks, leaving persisted state untouched.
  /// The caller holds the tenant lock
  async fn halt(&self, tenant_id: TenantId) -> Result<()> {
    let (runtime, scheduler) = {
      let mut registry = self.registry.write().await;
      let Some(scheduler) = registry.scheduler(tenant_id) else {
        return Err(Error::not_found(INFRASTRUCTURE, tenant_id));
      };
      let runtime = registry
        .take_runtime(tenant_id)
        .ok_or(Error::NotRunning(tenant_id))?;
      (runtime, scheduler)
    };

    scheduler.stop();
    join_runtime(tenant_id, runtime).await;
    Ok(())
  }

  /// 归档租户: 停止（容忍未运行）、两行置为 archived、移出注册表
  /// Archive a tenant: stop it (tolerating not running), set both rows archived, drop it from the registry
  pub async fn archive(&self, tenant_id: TenantId) -> Result<()> {
    let guard = self.lock_tenant(tenant_id).await;
    match self.halt(tenant_id).await {
      Ok(()) => {}
      Err(Error::NotRunning(_)) | Err(Error::NotFound { .. }) => {
        debug!(tenant_id = %tenant_id, "Tenant was not running before archive");
      }
      Err(err) => return Err(err),
    }

    with_transaction(self.store.as_ref(), move |repo| {
      Box::pin(async move {
        repo
          .set_pool_status(tenant_id, LifecycleStatus::Archived)
          .await?;
        repo
          .set_scheduler_status(tenant_id, LifecycleStatus::Archived)
          .await
      })
    })
    .await?;

    let leftover = self.registry.write().await.remove(tenant_id);
    if let Some(runtime) = leftover {
      warn!(tenant_id = %tenant_id, "Archived tenant still had a runtime, stopping it");
      join_runtime(tenant_id, runtime).await;
    }
    self.release_tenant_lock(tenant_id, guard);
    info!(tenant_id = %tenant_id, "Worker infrastructure archived");
    Ok(())
  }

  /// 删除已归档或不在内存中的租户的状态行、执行记录和队列
  /// Delete the state rows, executions and queues of a tenant that is archived or not loaded
  pub async fn cleanup(&self, tenant_id: TenantId) -> Result<()> {
    let guard = self.lock_tenant(tenant_id).await;
    {
      let registry = self.registry.read().await;
      if registry.is_running(tenant_id) {
        return Err(Error::AlreadyRunning(tenant_id));
      }
      if registry.contains(tenant_id) {
        let status = self.store.get_pool_state(tenant_id).await?.pool_status;
        if status != LifecycleStatus::Archived {
          return Err(Error::other(format!(
            "tenant {tenant_id} is still loaded with status {status}; archive it first"
          )));
        }
      }
    }

    with_transaction(self.store.as_ref(), move |repo| {
      Box::pin(async move { repo.delete_infrastructure(tenant_id).await })
    })
    .await?;

    if let Err(err) = self.backend.purge(&QueueKeys::for_tenant(tenant_id)).await {
      warn!(tenant_id = %tenant_id, error = %err, "Failed to purge tenant queues");
    }
    if let Some(runtime) = self.registry.write().await.remove(tenant_id) {
      join_runtime(tenant_id, runtime).await;
    }
    self.release_tenant_lock(tenant_id, guard);
    info!(tenant_id = %tenant_id, "Worker infrastructure cleaned up");
    Ok(())
  }

  /// 取消根令牌，停止所有运行中的租户任务并等待全部任务退出
  /// Cancel the root token, halt every running tenant and wait for every task
  ///
  /// 与 `stop` 不同，这里不会把状态写为 stopped: 持久化状态保持 active，下次启动时
  /// `recover` 会重建这些租户。需要重启后保持停止的租户应先调用 `stop`。
  /// Unlike `stop`, this does not write stopped: the persisted status stays active so the
  /// next boot's `recover` rebuilds these tenants. Call `stop` first for a tenant that must
  /// stay down across a restart.
  pub async fn shutdown(&self) {
    info!("Shutting down worker manager");
    self.token.cancel();
    let running = self.registry.read().await.running_tenants();
    for tenant_id in running {
      let _guard = self.lock_tenant(tenant_id).await;
      if let Err(err) = self.halt(tenant_id).await {
        debug!(tenant_id = %tenant_id, error = %err, "Tenant already halted before shutdown reached it");
      }
    }
    self.tracker.close();
    self.tracker.wait().await;
    info!("Worker manager shutdown complete");
  }

  pub async fn pool(&self, tenant_id: TenantId) -> Option<Arc<WorkerPool>> {
    self.registry.read().await.pool(tenant_id)
  }

  pub async fn pool_by_name(&self, name: &str) -> Option<Arc<WorkerPool>> {
    self.registry.read().await.pool_by_name(name)
  }

  pub async fn scheduler(&self, tenant_id: TenantId) -> Option<Arc<JobScheduler>> {
    self.registry.read().await.scheduler(tenant_id)
  }

  pub async fn scheduler_by_name(&self, name: &str) -> Option<Arc<JobScheduler>> {
    self.registry.read().await.scheduler_by_name(name)
  }

  /// 已加载的租户，按 ID 排序
  /// Loaded tenants, sorted by id
  pub async fn tenants(&self) -> Vec<TenantId> {
    self.registry.read().await.tenants()
  }

  pub async fn is_running(&self, tenant_id: TenantId) -> bool {
    self.registry.read().await.is_running(tenant_id)
  }

  /// 租户的执行审计记录，最新的在前
  /// A tenant's execution audit trail, newest first
  pub async fn job_executions(&self, tenant_id: TenantId, limit: u64) -> Result<Vec<JobExecution>> {
    self.store.list_job_executions(tenant_id, limit).await
  }
}

/// 取消运行时并等待其任务退出
/// Cancel a runtime and wait for its tasks to exit
async fn join_runtime(tenant_id: TenantId, runtime: TenantRuntime) {
  runtime.token.cancel();
  for handle in runtime.handles {
    if let Err(err) = handle.await {
      error!(tenant_id = %tenant_id, error = %err, "Tenant task ended abnormally");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::handler::HandlerFunc;
  use crate::job::JobParams;
  use crate::persistence::{MemoryStateStore, StateRepository};
  use crate::queue::MemoryQueue;
  use std::time::Duration;

  fn manager(store: Arc<MemoryStateStore>) -> WorkerManager {
    let config = ManagerConfig::default()
      .num_workers(2)
      .poll_timeout(Duration::from_millis(20));
    let manager = WorkerManager::new(store, Arc::new(MemoryQueue::new()), config).unwrap();
    manager.register_job_handler(
      "fetch-farm-monitoring-data",
      Arc::new(HandlerFunc::new(|_params: JobParams| Ok(()))),
    );
    manager
  }

  #[tokio::test]
  async fn test_create_registers_names_and_rows() {
    let store = Arc::new(MemoryStateStore::new());
    let manager = manager(Arc::clone(&store));
    let tenant = TenantId::new();
    manager
      .create_infrastructure(InfrastructureConfig::new(tenant, 1, "day").num_workers(3))
      .await
      .unwrap();

    let pool = manager.pool(tenant).await.unwrap();
    assert_eq!(pool.name(), format!("policy-{tenant}-pool"));
    assert_eq!(pool.options().num_workers, 3);
    assert!(manager
      .scheduler_by_name(&format!("policy-{tenant}-scheduler"))
      .await
      .is_some());

    let state = store.get_pool_state(tenant).await.unwrap();
    assert_eq!(state.pool_status, LifecycleStatus::Created);
    assert_eq!(state.num_workers, 3);
    let scheduler = store.get_scheduler_state(tenant).await.unwrap();
    assert_eq!(scheduler.monitor_interval, Duration::from_secs(86_400));
    assert_eq!(scheduler.monitor_frequency_unit, "day");
  }

  #[tokio::test]
  async fn test_invalid_unit_persists_nothing() {
    let store = Arc::new(MemoryStateStore::new());
    let manager = manager(Arc::clone(&store));
    let tenant = TenantId::new();
    let err = manager
      .create_infrastructure(InfrastructureConfig::new(tenant, 1, "fortnight"))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::InvalidFrequencyUnit(_)));
    assert!(store.get_pool_state(tenant).await.is_err());
    assert!(manager.tenants().await.is_empty());
  }

  #[tokio::test]
  async fn test_start_unknown_tenant_is_not_found() {
    let manager = manager(Arc::new(MemoryStateStore::new()));
    let err = manager.start(TenantId::new()).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
  }

  #[tokio::test]
  async fn test_start_twice_and_stop_twice() {
    let store = Arc::new(MemoryStateStore::new());
    let manager = manager(Arc::clone(&store));
    let tenant = TenantId::new();
    manager
      .create_infrastructure(InfrastructureConfig::new(tenant, 1, "hour"))
      .await
      .unwrap();

    manager.start(tenant).await.unwrap();
    assert!(manager.is_running(tenant).await);
    assert!(matches!(
      manager.start(tenant).await,
      Err(Error::AlreadyRunning(_))
    ));

    manager.stop(tenant).await.unwrap();
    assert!(!manager.is_running(tenant).await);
    let state = store.get_pool_state(tenant).await.unwrap();
    assert_eq!(state.pool_status, LifecycleStatus::Stopped);
    assert!(state.stopped_at.is_some());
    assert!(matches!(manager.stop(tenant).await, Err(Error::NotRunning(_))));

    manager.shutdown().await;
  }
}
