//! 基础类型模块
//! Base types module
//!
//! 租户标识与跨模块共享的常量、键名
//! Tenant identity plus the constants and key names shared across modules

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod constants;
pub mod keys;

/// 租户 ID（保单 ID），所有基础设施的分区键
/// Tenant id (the policy id), the partition key of all infrastructure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
  /// 生成一个随机租户 ID
  /// Generate a random tenant id
  pub fn new() -> Self {
    Self(Uuid::new_v4())
  }

  pub fn as_uuid(&self) -> Uuid {
    self.0
  }
}

impl Default for TenantId {
  fn default() -> Self {
    Self::new()
  }
}

impl From<Uuid> for TenantId {
  fn from(id: Uuid) -> Self {
    Self(id)
  }
}

impl From<TenantId> for Uuid {
  fn from(id: TenantId) -> Self {
    id.0
  }
}

impl FromStr for TenantId {
  type Err = uuid::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Uuid::parse_str(s).map(Self)
  }
}

impl fmt::Display for TenantId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_tenant_id_roundtrip_through_string() {
    let tenant = TenantId::new();
    let parsed: TenantId = tenant.to_string().parse().unwrap();
    assert_eq!(tenant, parsed);
    assert!("not-a-uuid".parse::<TenantId>().is_err());
  }
}
