//! 队列键名与基础设施命名
//! Queue key names and infrastructure naming
//!
//! 所有名称都由租户 ID 确定性地推导，不同租户之间不会共享任何队列
//! Every name is derived deterministically from the tenant id, so no two tenants share a queue

use crate::base::constants::{DEAD_LETTER_SUFFIX, PENDING_SUFFIX, QUOTA_SEGMENT, RUNNING_SUFFIX};
use crate::base::TenantId;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 租户队列中的三个列表之一
/// One of the three lists backing a tenant queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueList {
  /// 等待被工作者取走
  /// Waiting to be picked up by a worker
  Pending,
  /// 已被工作者取走，正在处理
  /// Claimed by a worker and being processed
  Running,
  /// 重试次数耗尽
  /// Retry budget exhausted
  DeadLetter,
}

impl QueueList {
  pub fn suffix(&self) -> &'static str {
    match self {
      QueueList::Pending => PENDING_SUFFIX,
      QueueList::Running => RUNNING_SUFFIX,
      QueueList::DeadLetter => DEAD_LETTER_SUFFIX,
    }
  }
}

impl fmt::Display for QueueList {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.suffix())
  }
}

/// 一个租户队列的三个 Redis 键
/// The three Redis keys of one tenant queue
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKeys {
  prefix: String,
  pending: String,
  running: String,
  dead_letter: String,
}

impl QueueKeys {
  /// 由队列前缀创建键集合
  /// Build the key set from a queue prefix
  pub fn new<S: Into<String>>(prefix: S) -> Self {
    let prefix = prefix.into();
    Self {
      pending: format!("{prefix}:{PENDING_SUFFIX}"),
      running: format!("{prefix}:{RUNNING_SUFFIX}"),
      dead_letter: format!("{prefix}:{DEAD_LETTER_SUFFIX}"),
      prefix,
    }
  }

  pub fn for_tenant(tenant_id: TenantId) -> Self {
    Self::new(queue_name_base(tenant_id))
  }

  pub fn prefix(&self) -> &str {
    &self.prefix
  }

  pub fn pending(&self) -> &str {
    &self.pending
  }

  pub fn running(&self) -> &str {
    &self.running
  }

  pub fn dead_letter(&self) -> &str {
    &self.dead_letter
  }

  /// 获取指定列表的键
  /// Get the key of the given list
  pub fn key(&self, list: QueueList) -> &str {
    match list {
      QueueList::Pending => &self.pending,
      QueueList::Running => &self.running,
      QueueList::DeadLetter => &self.dead_letter,
    }
  }

  /// 某个 UTC 日期的每日配额计数器键: `<prefix>:quota:<YYYY-MM-DD>`
  /// Daily quota counter key for a UTC date: `<prefix>:quota:<YYYY-MM-DD>`
  pub fn quota(&self, date: NaiveDate) -> String {
    format!("{}:{QUOTA_SEGMENT}:{}", self.prefix, date.format("%Y-%m-%d"))
  }
}

/// 租户队列前缀: `policy-<id>`
/// Tenant queue prefix: `policy-<id>`
pub fn queue_name_base(tenant_id: TenantId) -> String {
  format!("policy-{tenant_id}")
}

/// 租户工作池名称: `policy-<id>-pool`
/// Tenant pool name: `policy-<id>-pool`
pub fn pool_name(tenant_id: TenantId) -> String {
  format!("policy-{tenant_id}-pool")
}

/// 租户调度器名称: `policy-<id>-scheduler`
/// Tenant scheduler name: `policy-<id>-scheduler`
pub fn scheduler_name(tenant_id: TenantId) -> String {
  format!("policy-{tenant_id}-scheduler")
}

#[cfg(test)]
mod tests {
  use super::*;
  use uuid::Uuid;

  #[test]
  fn test_queue_keys() {
    let keys = QueueKeys::new("policy-abc");
    assert_eq!(keys.prefix(), "policy-abc");
    assert_eq!(keys.pending(), "policy-abc:pending");
    assert_eq!(keys.running(), "policy-abc:running");
    assert_eq!(keys.dead_letter(), "policy-abc:dlq");
    assert_eq!(keys.key(QueueList::DeadLetter), "policy-abc:dlq");
    let day = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
    assert_eq!(keys.quota(day), "policy-abc:quota:2026-03-09");
  }

  #[test]
  fn test_tenant_names() {
    let id = Uuid::parse_str("6f1c1e9a-3c1d-4a5e-9f00-0a1b2c3d4e5f").unwrap();
    let tenant = TenantId::from(id);
    assert_eq!(
      pool_name(tenant),
      "policy-6f1c1e9a-3c1d-4a5e-9f00-0a1b2c3d4e5f-pool"
    );
    assert_eq!(
      scheduler_name(tenant),
      "policy-6f1c1e9a-3c1d-4a5e-9f00-0a1b2c3d4e5f-scheduler"
    );
    assert_eq!(
      QueueKeys::for_tenant(tenant).pending(),
      "policy-6f1c1e9a-3c1d-4a5e-9f00-0a1b2c3d4e5f:pending"
    );
  }

  #[test]
  fn test_distinct_tenants_never_share_keys() {
    let a = QueueKeys::for_tenant(TenantId::new());
    let b = QueueKeys::for_tenant(TenantId::new());
    assert_ne!(a.pending(), b.pending());
    assert_ne!(a.running(), b.running());
  }
}
