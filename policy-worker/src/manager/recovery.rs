//! 灾难恢复
//! Disaster recovery
//!
//! 进程重启后，工作池与调度器同时为 active 的租户会被重建并启动。
//! 重建时覆盖已有的状态行，所以重复恢复不会产生重复记录。
//! After a restart, tenants whose pool and scheduler are both active are rebuilt and started.
//! Rebuilding rewrites the existing state rows, so recovering twice never duplicates them.

use super::infrastructure::{
  InfrastructureConfig, MonitorFrequencyUnit, META_BASE_POLICY_ID, META_FARM_ID,
  META_MONITOR_INTERVAL, META_TRIGGER_ID,
};
use super::{CreateMode, WorkerManager};
use crate::base::TenantId;
use crate::error::{Error, Result};
use crate::persistence::{Metadata, StateRepository, StateStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

/// 为待恢复的租户重建创建配置
/// Rebuilds the creation config of a tenant being recovered
#[async_trait]
pub trait ConfigSource: Send + Sync {
  async fn load(&self, tenant_id: TenantId) -> Result<InfrastructureConfig>;
}

/// 从持久化的状态行与元数据重建配置
/// Rebuilds the config from the persisted rows and their metadata
///
/// 额外任务不会被持久化，需要它们的调用方应提供自己的 [`ConfigSource`]
/// Extra jobs are not persisted; callers that need them supply their own [`ConfigSource`]
pub struct PersistedConfigSource {
  store: Arc<dyn StateStore>,
}

impl PersistedConfigSource {
  pub fn new(store: Arc<dyn StateStore>) -> Self {
    Self { store }
  }
}

#[async_trait]
impl ConfigSource for PersistedConfigSource {
  async fn load(&self, tenant_id: TenantId) -> Result<InfrastructureConfig> {
    let pool = self.store.get_pool_state(tenant_id).await?;
    let scheduler = self.store.get_scheduler_state(tenant_id).await?;
    let unit: MonitorFrequencyUnit = scheduler.monitor_frequency_unit.parse()?;

    let monitor_interval = match scheduler
      .metadata
      .get(META_MONITOR_INTERVAL)
      .and_then(|v| v.as_u64())
    {
      Some(count) => u32::try_from(count)
        .map_err(|_| Error::config(format!("monitor interval {count} out of range")))?,
      None => {
        let unit_secs = unit.duration(1).as_secs();
        u32::try_from(scheduler.monitor_interval.as_secs() / unit_secs)
          .map_err(|_| Error::config("persisted monitor interval out of range"))?
      }
    };

    let mut config = InfrastructureConfig::new(tenant_id, monitor_interval, unit.as_str())
      .base_policy_id(meta_str(&pool.metadata, META_BASE_POLICY_ID))
      .farm_id(meta_str(&pool.metadata, META_FARM_ID))
      .trigger_id(meta_str(&pool.metadata, META_TRIGGER_ID))
      .job_timeout(pool.job_timeout);
    if pool.num_workers > 0 {
      config = config.num_workers(pool.num_workers as usize);
    }
    Ok(config)
  }
}

fn meta_str(metadata: &Metadata, key: &str) -> String {
  metadata
    .get(key)
    .and_then(|v| v.as_str())
    .unwrap_or_default()
    .to_string()
}

/// 恢复结果
/// Recovery result
#[derive(Debug, Default)]
pub struct RecoveryReport {
  pub recovered: Vec<TenantId>,
  pub failed: Vec<(TenantId, Error)>,
}

impl RecoveryReport {
  pub fn is_clean(&self) -> bool {
    self.failed.is_empty()
  }
}

impl WorkerManager {
  /// 使用持久化状态恢复所有 active 租户
  /// Recover every active tenant from persisted state
  pub async fn recover(&self) -> Result<RecoveryReport> {
    let source = PersistedConfigSource::new(Arc::clone(&self.store));
    self.recover_with(&source).await
  }

  /// 使用给定的配置来源恢复，单个租户失败不会中断其余租户
  /// Recover with the given config source; one tenant failing never stops the rest
  pub async fn recover_with(&self, source: &dyn ConfigSource) -> Result<RecoveryReport> {
    let tenants = self.store.load_active_tenants().await?;
    info!(count = tenants.len(), "Recovering worker infrastructure");

    let mut report = RecoveryReport::default();
    for tenant_id in tenants {
      match self.recover_tenant(tenant_id, source).await {
        Ok(()) => report.recovered.push(tenant_id),
        Err(err) => {
          error!(tenant_id = %tenant_id, error = %err, "Failed to recover worker infrastructure");
          report.failed.push((tenant_id, err));
        }
      }
    }

    info!(
      recovered = report.recovered.len(),
      failed = report.failed.len(),
      "Worker infrastructure recovery finished"
    );
    Ok(report)
  }

  async fn recover_tenant(&self, tenant_id: TenantId, source: &dyn ConfigSource) -> Result<()> {
    let _guard = self.lock_tenant(tenant_id).await;
    if self.is_running(tenant_id).await {
      return Ok(());
    }
    if !self.registry.read().await.contains(tenant_id) {
      let config = source.load(tenant_id).await?;
      self.build(config, CreateMode::Rewrite).await?;
    }
    self.start_locked(tenant_id).await
  }
}
