//! 内存状态存储实现
//! Memory state store implementation
//!
//! 事务持有整张表的锁并在副本上工作，提交时替换原表，回滚时丢弃副本
//! A transaction holds the table lock and works on a copy that replaces the tables on commit
//! and is discarded on rollback

use crate::base::TenantId;
use crate::error::{Error, Result};
use crate::persistence::model::{
  JobExecution, LifecycleStatus, PoolState, PoolStatus, SchedulerState, SchedulerStatus,
};
use crate::persistence::{StateRepository, StateStore, StateTransaction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

const POOL_STATE: &str = "pool state";
const SCHEDULER_STATE: &str = "scheduler state";
const JOB_EXECUTION: &str = "job execution";

#[derive(Debug, Clone, Default)]
struct Tables {
  pools: BTreeMap<TenantId, PoolState>,
  schedulers: BTreeMap<TenantId, SchedulerState>,
  executions: HashMap<Uuid, JobExecution>,
}

impl Tables {
  fn create_pool_state(&mut self, state: &PoolState) -> Result<()> {
    if self.pools.contains_key(&state.tenant_id) {
      return Err(Error::already_exists(POOL_STATE, state.tenant_id));
    }
    self.pools.insert(state.tenant_id, state.clone());
    Ok(())
  }

  fn update_pool_state(&mut self, state: &PoolState) -> Result<()> {
    let row = self
      .pools
      .get_mut(&state.tenant_id)
      .ok_or_else(|| Error::not_found(POOL_STATE, state.tenant_id))?;
    *row = state.clone();
    Ok(())
  }

  fn pool_mut(&mut self, tenant_id: TenantId) -> Result<&mut PoolState> {
    self
      .pools
      .get_mut(&tenant_id)
      .ok_or_else(|| Error::not_found(POOL_STATE, tenant_id))
  }

  fn set_pool_status(&mut self, tenant_id: TenantId, status: PoolStatus) -> Result<()> {
    let row = self.pool_mut(tenant_id)?;
    row.pool_status = status;
    status.stamp(Utc::now(), &mut row.started_at, &mut row.stopped_at);
    Ok(())
  }

  fn create_scheduler_state(&mut self, state: &SchedulerState) -> Result<()> {
    if self.schedulers.contains_key(&state.tenant_id) {
      return Err(Error::already_exists(SCHEDULER_STATE, state.tenant_id));
    }
    self.schedulers.insert(state.tenant_id, state.clone());
    Ok(())
  }

  fn update_scheduler_state(&mut self, state: &SchedulerState) -> Result<()> {
    let row = self.scheduler_mut(state.tenant_id)?;
    *row = state.clone();
    Ok(())
  }

  fn scheduler_mut(&mut self, tenant_id: TenantId) -> Result<&mut SchedulerState> {
    self
      .schedulers
      .get_mut(&tenant_id)
      .ok_or_else(|| Error::not_found(SCHEDULER_STATE, tenant_id))
  }

  fn set_scheduler_status(&mut self, tenant_id: TenantId, status: SchedulerStatus) -> Result<()> {
    let row = self.scheduler_mut(tenant_id)?;
    row.scheduler_status = status;
    status.stamp(Utc::now(), &mut row.started_at, &mut row.stopped_at);
    Ok(())
  }

  fn record_scheduler_run(
    &mut self,
    tenant_id: TenantId,
    ran_at: DateTime<Utc>,
    next_run_at: DateTime<Utc>,
  ) -> Result<()> {
    let row = self.scheduler_mut(tenant_id)?;
    row.last_run_at = Some(ran_at);
    row.next_run_at = Some(next_run_at);
    row.run_count += 1;
    Ok(())
  }

  fn create_job_execution(&mut self, execution: &JobExecution) -> Result<()> {
    if self.executions.contains_key(&execution.id) {
      return Err(Error::already_exists(JOB_EXECUTION, execution.tenant_id));
    }
    self.executions.insert(execution.id, execution.clone());
    Ok(())
  }

  fn update_job_execution(&mut self, execution: &JobExecution) -> Result<()> {
    let row = self
      .executions
      .get_mut(&execution.id)
      .ok_or_else(|| Error::not_found(JOB_EXECUTION, execution.tenant_id))?;
    *row = execution.clone();
    Ok(())
  }

  fn list_job_executions(&self, tenant_id: TenantId, limit: u64) -> Vec<JobExecution> {
    let mut rows: Vec<JobExecution> = self
      .executions
      .values()
      .filter(|e| e.tenant_id == tenant_id)
      .cloned()
      .collect();
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
    rows
  }

  fn load_active_tenants(&self) -> Vec<TenantId> {
    self
      .pools
      .values()
      .filter(|pool| pool.pool_status == LifecycleStatus::Active)
      .filter(|pool| {
        self
          .schedulers
          .get(&pool.tenant_id)
          .is_some_and(|s| s.scheduler_status == LifecycleStatus::Active)
      })
      .map(|pool| pool.tenant_id)
      .collect()
  }

  fn delete_infrastructure(&mut self, tenant_id: TenantId) {
    self.executions.retain(|_, e| e.tenant_id != tenant_id);
    self.schedulers.remove(&tenant_id);
    self.pools.remove(&tenant_id);
  }
}

/// 内存状态存储
/// In-memory state store
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
  tables: Arc<Mutex<Tables>>,
}

impl MemoryStateStore {
  pub fn new() -> Self {
    Self::default()
  }
}

/// 内存事务
/// In-memory transaction
pub struct MemoryTransaction {
  guard: OwnedMutexGuard<Tables>,
  working: Mutex<Tables>,
}

macro_rules! impl_memory_repository {
  ($ty:ty, |$this:ident| $tables:expr) => {
    #[async_trait]
    impl StateRepository for $ty {
      async fn create_pool_state(&self, state: &PoolState) -> Result<()> {
        let $this = self;
        $tables.create_pool_state(state)
      }

      async fn update_pool_state(&self, state: &PoolState) -> Result<()> {
        let $this = self;
        $tables.update_pool_state(state)
      }

      async fn get_pool_state(&self, tenant_id: TenantId) -> Result<PoolState> {
        let $this = self;
        $tables
          .pools
          .get(&tenant_id)
          .cloned()
          .ok_or_else(|| Error::not_found(POOL_STATE, tenant_id))
      }

      async fn set_pool_status(&self, tenant_id: TenantId, status: PoolStatus) -> Result<()> {
        let $this = self;
        $tables.set_pool_status(tenant_id, status)
      }

      async fn touch_pool_last_job(&self, tenant_id: TenantId, at: DateTime<Utc>) -> Result<()> {
        let $this = self;
        $tables.pool_mut(tenant_id)?.last_job_at = Some(at);
        Ok(())
      }

      async fn create_scheduler_state(&self, state: &SchedulerState) -> Result<()> {
        let $this = self;
        $tables.create_scheduler_state(state)
      }

      async fn update_scheduler_state(&self, state: &SchedulerState) -> Result<()> {
        let $this = self;
        $tables.update_scheduler_state(state)
      }

      async fn get_scheduler_state(&self, tenant_id: TenantId) -> Result<SchedulerState> {
        let $this = self;
        $tables
          .schedulers
          .get(&tenant_id)
          .cloned()
          .ok_or_else(|| Error::not_found(SCHEDULER_STATE, tenant_id))
      }

      async fn set_scheduler_status(
        &self,
        tenant_id: TenantId,
        status: SchedulerStatus,
      ) -> Result<()> {
        let $this = self;
        $tables.set_scheduler_status(tenant_id, status)
      }

      async fn record_scheduler_run(
        &self,
        tenant_id: TenantId,
        ran_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
      ) -> Result<()> {
        let $this = self;
        $tables.record_scheduler_run(tenant_id, ran_at, next_run_at)
      }

      async fn create_job_execution(&self, execution: &JobExecution) -> Result<()> {
        let $this = self;
        $tables.create_job_execution(execution)
      }

      async fn update_job_execution(&self, execution: &JobExecution) -> Result<()> {
        let $this = self;
        $tables.update_job_execution(execution)
      }

      async fn list_job_executions(
        &self,
        tenant_id: TenantId,
        limit: u64,
      ) -> Result<Vec<JobExecution>> {
        let $this = self;
        Ok($tables.list_job_executions(tenant_id, limit))
      }

      async fn load_active_tenants(&self) -> Result<Vec<TenantId>> {
        let $this = self;
        Ok($tables.load_active_tenants())
      }

      async fn delete_infrastructure(&self, tenant_id: TenantId) -> Result<()> {
        let $this = self;
        $tables.delete_infrastructure(tenant_id);
        Ok(())
      }
    }
  };
}

impl_memory_repository!(MemoryStateStore, |this| this.tables.lock().await);
impl_memory_repository!(MemoryTransaction, |this| this.working.lock().await);

#[async_trait]
impl StateTransaction for MemoryTransaction {
  fn as_repository(&self) -> &dyn StateRepository {
    self
  }

  async fn commit(self: Box<Self>) -> Result<()> {
    let MemoryTransaction { mut guard, working } = *self;
    *guard = working.into_inner();
    Ok(())
  }

  async fn rollback(self: Box<Self>) -> Result<()> {
    Ok(())
  }
}

#[async_trait]
impl StateStore for MemoryStateStore {
  async fn begin(&self) -> Result<Box<dyn StateTransaction>> {
    let guard = Arc::clone(&self.tables).lock_owned().await;
    let working = Mutex::new(guard.clone());
    Ok(Box::new(MemoryTransaction { guard, working }))
  }
}
