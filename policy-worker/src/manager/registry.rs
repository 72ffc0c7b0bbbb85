//! 内存注册表
//! In-memory registry of pools, schedulers and running tenants

use crate::base::TenantId;
use crate::components::pool::WorkerPool;
use crate::components::scheduler::JobScheduler;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 正在运行的租户: 租户令牌与其任务句柄
/// A running tenant: its token and task handles
pub(crate) struct TenantRuntime {
  pub(crate) token: CancellationToken,
  pub(crate) handles: Vec<JoinHandle<()>>,
}

/// 按租户与名称双重索引
/// Indexed both by tenant and by name
#[derive(Default)]
pub(crate) struct Registry {
  pools_by_tenant: HashMap<TenantId, Arc<WorkerPool>>,
  pools_by_name: HashMap<String, Arc<WorkerPool>>,
  schedulers_by_tenant: HashMap<TenantId, Arc<JobScheduler>>,
  schedulers_by_name: HashMap<String, Arc<JobScheduler>>,
  runtimes: HashMap<TenantId, TenantRuntime>,
}

impl Registry {
  pub(crate) fn contains(&self, tenant_id: TenantId) -> bool {
    self.pools_by_tenant.contains_key(&tenant_id)
  }

  pub(crate) fn insert(
    &mut self,
    tenant_id: TenantId,
    pool: Arc<WorkerPool>,
    scheduler: Arc<JobScheduler>,
  ) {
    self
      .pools_by_name
      .insert(pool.name().to_string(), Arc::clone(&pool));
    self.pools_by_tenant.insert(tenant_id, pool);
    self
      .schedulers_by_name
      .insert(scheduler.name().to_string(), Arc::clone(&scheduler));
    self.schedulers_by_tenant.insert(tenant_id, scheduler);
  }

  /// 移除租户的全部条目，返回其运行时（若仍在运行）
  /// Remove every entry of the tenant, returning its runtime if it was still running
  pub(crate) fn remove(&mut self, tenant_id: TenantId) -> Option<TenantRuntime> {
    if let Some(pool) = self.pools_by_tenant.remove(&tenant_id) {
      self.pools_by_name.remove(pool.name());
    }
    if let Some(scheduler) = self.schedulers_by_tenant.remove(&tenant_id) {
      self.schedulers_by_name.remove(scheduler.name());
    }
    self.runtimes.remove(&tenant_id)
  }

  pub(crate) fn pair(&self, tenant_id: TenantId) -> Option<(Arc<WorkerPool>, Arc<JobScheduler>)> {
    let pool = self.pools_by_tenant.get(&tenant_id)?;
    let scheduler = self.schedulers_by_tenant.get(&tenant_id)?;
    Some((Arc::clone(pool), Arc::clone(scheduler)))
  }

  pub(crate) fn pool(&self, tenant_id: TenantId) -> Option<Arc<WorkerPool>> {
    self.pools_by_tenant.get(&tenant_id).cloned()
  }

  pub(crate) fn pool_by_name(&self, name: &str) -> Option<Arc<WorkerPool>> {
    self.pools_by_name.get(name).cloned()
  }

  pub(crate) fn scheduler(&self, tenant_id: TenantId) -> Option<Arc<JobScheduler>> {
    self.schedulers_by_tenant.get(&tenant_id).cloned()
  }

  pub(crate) fn scheduler_by_name(&self, name: &str) -> Option<Arc<JobScheduler>> {
    self.schedulers_by_name.get(name).cloned()
  }

  pub(crate) fn tenants(&self) -> Vec<TenantId> {
    let mut tenants: Vec<TenantId> = self.pools_by_tenant.keys().copied().collect();
    tenants.sort();
    tenants
  }

  pub(crate) fn is_running(&self, tenant_id: TenantId) -> bool {
    self.runtimes.contains_key(&tenant_id)
  }

  pub(crate) fn running_tenants(&self) -> Vec<TenantId> {
    self.runtimes.keys().copied().collect()
  }

  pub(crate) fn set_runtime(&mut self, tenant_id: TenantId, runtime: TenantRuntime) {
    self.runtimes.insert(tenant_id, runtime);
  }

  pub(crate) fn take_runtime(&mut self, tenant_id: TenantId) -> Option<TenantRuntime> {
    self.runtimes.remove(&tenant_id)
  }
}
