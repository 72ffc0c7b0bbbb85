//! 租户基础设施的创建参数
//! Creation parameters of a tenant's infrastructure

use crate::base::TenantId;
use crate::error::{Error, Result};
use crate::job::JobPayload;
use crate::persistence::Metadata;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const HOUR_SECS: u64 = 60 * 60;
const DAY_SECS: u64 = 24 * HOUR_SECS;

/// 元数据键
/// Metadata keys
pub(crate) const META_BASE_POLICY_ID: &str = "base_policy_id";
pub(crate) const META_FARM_ID: &str = "farm_id";
pub(crate) const META_TRIGGER_ID: &str = "trigger_id";
pub(crate) const META_MONITOR_INTERVAL: &str = "monitor_interval";

/// 监控频率单位
/// Monitor frequency unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitorFrequencyUnit {
  Hour,
  Day,
  Week,
  /// 按 30 天计
  /// Counted as 30 days
  Month,
}

impl MonitorFrequencyUnit {
  pub fn as_str(&self) -> &'static str {
    match self {
      MonitorFrequencyUnit::Hour => "hour",
      MonitorFrequencyUnit::Day => "day",
      MonitorFrequencyUnit::Week => "week",
      MonitorFrequencyUnit::Month => "month",
    }
  }

  /// 单位时长乘以次数
  /// The unit length multiplied by `count`
  pub fn duration(&self, count: u32) -> Duration {
    let unit = match self {
      MonitorFrequencyUnit::Hour => HOUR_SECS,
      MonitorFrequencyUnit::Day => DAY_SECS,
      MonitorFrequencyUnit::Week => 7 * DAY_SECS,
      MonitorFrequencyUnit::Month => 30 * DAY_SECS,
    };
    Duration::from_secs(unit.saturating_mul(u64::from(count)))
  }
}

impl fmt::Display for MonitorFrequencyUnit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for MonitorFrequencyUnit {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_ascii_lowercase().as_str() {
      "hour" => Ok(MonitorFrequencyUnit::Hour),
      "day" => Ok(MonitorFrequencyUnit::Day),
      "week" => Ok(MonitorFrequencyUnit::Week),
      "month" => Ok(MonitorFrequencyUnit::Month),
      _ => Err(Error::InvalidFrequencyUnit(s.to_string())),
    }
  }
}

/// 创建租户基础设施所需的配置
/// Configuration needed to create a tenant's infrastructure
#[derive(Debug, Clone)]
pub struct InfrastructureConfig {
  pub tenant_id: TenantId,
  pub base_policy_id: String,
  pub farm_id: String,
  pub trigger_id: String,
  /// 每多少个单位执行一次监控
  /// Run monitoring once every this many units
  pub monitor_interval: u32,
  /// 原样保存，在创建时解析
  /// Kept verbatim and parsed at creation
  pub monitor_frequency_unit: String,
  /// 覆盖管理器默认的工作者数量
  /// Overrides the manager's default worker count
  pub num_workers: Option<usize>,
  pub job_timeout: Option<Duration>,
  /// 监控任务之外额外调度的任务
  /// Jobs scheduled in addition to the monitoring job
  pub extra_jobs: Vec<JobPayload>,
}

impl InfrastructureConfig {
  pub fn new<U: Into<String>>(tenant_id: TenantId, monitor_interval: u32, unit: U) -> Self {
    Self {
      tenant_id,
      base_policy_id: String::new(),
      farm_id: String::new(),
      trigger_id: String::new(),
      monitor_interval,
      monitor_frequency_unit: unit.into(),
      num_workers: None,
      job_timeout: None,
      extra_jobs: Vec::new(),
    }
  }

  pub fn base_policy_id<S: Into<String>>(mut self, id: S) -> Self {
    self.base_policy_id = id.into();
    self
  }

  pub fn farm_id<S: Into<String>>(mut self, id: S) -> Self {
    self.farm_id = id.into();
    self
  }

  pub fn trigger_id<S: Into<String>>(mut self, id: S) -> Self {
    self.trigger_id = id.into();
    self
  }

  pub fn num_workers(mut self, num_workers: usize) -> Self {
    self.num_workers = Some(num_workers);
    self
  }

  pub fn job_timeout(mut self, timeout: Duration) -> Self {
    self.job_timeout = Some(timeout);
    self
  }

  pub fn extra_job(mut self, job: JobPayload) -> Self {
    self.extra_jobs.push(job);
    self
  }

  pub fn frequency_unit(&self) -> Result<MonitorFrequencyUnit> {
    self.monitor_frequency_unit.parse()
  }

  /// 调度间隔
  /// Scheduling interval
  pub fn interval(&self) -> Result<Duration> {
    let unit = self.frequency_unit()?;
    if self.monitor_interval == 0 {
      return Err(Error::config("monitor interval must be greater than zero"));
    }
    Ok(unit.duration(self.monitor_interval))
  }

  /// 拒绝会让工作池永远不执行任务的覆盖值
  /// Reject overrides that would leave the pool unable to run any job
  pub fn validate_overrides(&self) -> Result<()> {
    if self.num_workers == Some(0) {
      return Err(Error::config(format!(
        "num_workers override for tenant {} must be greater than 0",
        self.tenant_id
      )));
    }
    if self.job_timeout.is_some_and(|timeout| timeout.is_zero()) {
      return Err(Error::config(format!(
        "job_timeout override for tenant {} must be greater than 0",
        self.tenant_id
      )));
    }
    Ok(())
  }

  /// 周期性的监控任务
  /// The recurring monitoring job
  pub fn monitoring_job(&self, job_type: &str) -> JobPayload {
    JobPayload::new(job_type)
      .with_param("policy_id", self.tenant_id.to_string())
      .with_param(META_BASE_POLICY_ID, self.base_policy_id.clone())
      .with_param(META_FARM_ID, self.farm_id.clone())
      .with_param(META_TRIGGER_ID, self.trigger_id.clone())
  }

  /// 持久化到状态行的元数据，恢复时据此重建配置
  /// Metadata persisted on the state rows, used to rebuild the config on recovery
  pub fn metadata(&self) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(META_BASE_POLICY_ID.into(), Value::from(self.base_policy_id.clone()));
    metadata.insert(META_FARM_ID.into(), Value::from(self.farm_id.clone()));
    metadata.insert(META_TRIGGER_ID.into(), Value::from(self.trigger_id.clone()));
    metadata.insert(META_MONITOR_INTERVAL.into(), Value::from(self.monitor_interval));
    metadata
  }
}
