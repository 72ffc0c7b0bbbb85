//! 持久化状态模型
//! Persisted state model

use crate::base::TenantId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// 不透明的 JSON 元数据
/// Opaque JSON metadata
pub type Metadata = Map<String, Value>;

/// 工作池与调度器共用的生命周期状态
/// Lifecycle status shared by pools and schedulers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
  /// 结构已创建，尚未启动
  /// Structure created, not started
  Created,
  /// 正在运行
  /// Running
  Active,
  /// 已正常停止
  /// Stopped gracefully
  Stopped,
  /// 已归档（保单终止），恢复时不会重建
  /// Archived (policy terminated), never rebuilt on recovery
  Archived,
}

pub type PoolStatus = LifecycleStatus;
pub type SchedulerStatus = LifecycleStatus;

impl LifecycleStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      LifecycleStatus::Created => "created",
      LifecycleStatus::Active => "active",
      LifecycleStatus::Stopped => "stopped",
      LifecycleStatus::Archived => "archived",
    }
  }

  /// 根据新状态更新启动/停止时间戳
  /// Stamp the started/stopped timestamps for a transition into this status
  pub fn stamp(
    &self,
    now: DateTime<Utc>,
    started_at: &mut Option<DateTime<Utc>>,
    stopped_at: &mut Option<DateTime<Utc>>,
  ) {
    match self {
      LifecycleStatus::Active => *started_at = Some(now),
      LifecycleStatus::Stopped | LifecycleStatus::Archived => *stopped_at = Some(now),
      LifecycleStatus::Created => {}
    }
  }
}

impl fmt::Display for LifecycleStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for LifecycleStatus {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "created" => Ok(LifecycleStatus::Created),
      "active" => Ok(LifecycleStatus::Active),
      "stopped" => Ok(LifecycleStatus::Stopped),
      "archived" => Ok(LifecycleStatus::Archived),
      other => Err(Error::other(format!("invalid lifecycle status: {other}"))),
    }
  }
}

/// 任务执行状态
/// Job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
  Pending,
  Running,
  Completed,
  Failed,
  Retrying,
}

impl JobStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      JobStatus::Pending => "pending",
      JobStatus::Running => "running",
      JobStatus::Completed => "completed",
      JobStatus::Failed => "failed",
      JobStatus::Retrying => "retrying",
    }
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for JobStatus {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(JobStatus::Pending),
      "running" => Ok(JobStatus::Running),
      "completed" => Ok(JobStatus::Completed),
      "failed" => Ok(JobStatus::Failed),
      "retrying" => Ok(JobStatus::Retrying),
      other => Err(Error::other(format!("invalid job status: {other}"))),
    }
  }
}

/// 工作池的持久化状态
/// Persisted state of a worker pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolState {
  pub tenant_id: TenantId,
  pub pool_name: String,
  pub queue_name_base: String,
  pub num_workers: u32,
  pub job_timeout: Duration,
  pub pool_status: PoolStatus,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub stopped_at: Option<DateTime<Utc>>,
  pub last_job_at: Option<DateTime<Utc>>,
  pub metadata: Metadata,
}

/// 调度器的持久化状态
/// Persisted state of a scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
  pub tenant_id: TenantId,
  pub scheduler_name: String,
  pub monitor_interval: Duration,
  pub monitor_frequency_unit: String,
  pub scheduler_status: SchedulerStatus,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub stopped_at: Option<DateTime<Utc>>,
  pub last_run_at: Option<DateTime<Utc>>,
  pub next_run_at: Option<DateTime<Utc>>,
  pub run_count: i64,
  pub metadata: Metadata,
}

/// 任务执行审计记录
/// Job execution audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
  pub id: Uuid,
  pub tenant_id: TenantId,
  pub job_id: String,
  pub job_type: String,
  pub status: JobStatus,
  pub retry_count: u32,
  pub max_retries: u32,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub error_message: Option<String>,
  pub result_summary: Option<Metadata>,
  pub created_at: DateTime<Utc>,
}

impl JobExecution {
  /// 为刚开始执行的任务创建记录
  /// Create the record of a job that just started running
  pub fn started(
    tenant_id: TenantId,
    job_id: &str,
    job_type: &str,
    retry_count: u32,
    max_retries: u32,
  ) -> Self {
    let now = Utc::now();
    Self {
      id: Uuid::new_v4(),
      tenant_id,
      job_id: job_id.to_string(),
      job_type: job_type.to_string(),
      status: JobStatus::Running,
      retry_count,
      max_retries,
      started_at: Some(now),
      completed_at: None,
      error_message: None,
      result_summary: None,
      created_at: now,
    }
  }

  /// 以最终状态结束记录
  /// Close the record with its final status
  pub fn finish(&mut self, status: JobStatus, error_message: Option<String>) {
    self.status = status;
    self.completed_at = Some(Utc::now());
    self.error_message = error_message;
  }
}
