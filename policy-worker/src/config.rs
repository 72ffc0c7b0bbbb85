//! 配置模块
//! Configuration module
//!
//! 定义了管理器、Redis 与 PostgreSQL 的配置选项
//! Defines configuration options for the manager, Redis and PostgreSQL

use crate::base::constants::{
  DEFAULT_JOB_TIMEOUT, DEFAULT_NUM_WORKERS, DEFAULT_POLL_TIMEOUT, DEFAULT_SUBMIT_TIMEOUT,
  FETCH_FARM_MONITORING_DATA,
};
use crate::components::rate_limiter::RateLimit;
use crate::error::{Error, Result};
use std::time::Duration;

/// 管理器配置
/// Manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
  /// 每个租户池的工作者数量
  /// Number of workers per tenant pool
  pub num_workers: usize,
  /// 单个任务的超时时间
  /// Per-job timeout
  pub job_timeout: Duration,
  /// 工作者阻塞取任务的最长等待
  /// Upper bound of a worker's blocking pop
  pub poll_timeout: Duration,
  /// 调度器单次提交的超时
  /// Per-submit timeout used by schedulers
  pub submit_timeout: Duration,
  /// 每个租户周期任务所需的处理器类型
  /// Handler type every tenant's recurring job needs
  pub required_job_type: String,
  /// 是否为池记录任务执行审计
  /// Whether pools record job executions
  pub record_executions: bool,
  /// 每个租户池的令牌桶限流
  /// Token bucket applied to each tenant pool
  pub rate_limit: Option<RateLimit>,
  /// 每个租户池每个 UTC 日最多执行的任务数
  /// Most jobs each tenant pool runs per UTC day
  pub daily_quota: Option<u64>,
}

impl Default for ManagerConfig {
  fn default() -> Self {
    Self {
      num_workers: DEFAULT_NUM_WORKERS,
      job_timeout: DEFAULT_JOB_TIMEOUT,
      poll_timeout: DEFAULT_POLL_TIMEOUT,
      submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
      required_job_type: FETCH_FARM_MONITORING_DATA.to_string(),
      record_executions: true,
      rate_limit: None,
      daily_quota: None,
    }
  }
}

impl ManagerConfig {
  /// 创建默认配置
  /// Create the default configuration
  pub fn new() -> Self {
    Self::default()
  }

  pub fn num_workers(mut self, num_workers: usize) -> Self {
    self.num_workers = num_workers;
    self
  }

  pub fn job_timeout(mut self, timeout: Duration) -> Self {
    self.job_timeout = timeout;
    self
  }

  pub fn poll_timeout(mut self, timeout: Duration) -> Self {
    self.poll_timeout = timeout;
    self
  }

  pub fn submit_timeout(mut self, timeout: Duration) -> Self {
    self.submit_timeout = timeout;
    self
  }

  /// 设置所需的处理器类型
  /// Set the handler type required by each tenant
  pub fn required_job_type<S: Into<String>>(mut self, job_type: S) -> Self {
    self.required_job_type = job_type.into();
    self
  }

  pub fn record_executions(mut self, enabled: bool) -> Self {
    self.record_executions = enabled;
    self
  }

  pub fn rate_limit(mut self, limit: RateLimit) -> Self {
    self.rate_limit = Some(limit);
    self
  }

  pub fn daily_quota(mut self, quota: u64) -> Self {
    self.daily_quota = Some(quota);
    self
  }

  /// 验证配置
  /// Validate the configuration
  pub fn validate(&self) -> Result<()> {
    if self.num_workers == 0 {
      return Err(Error::config("num_workers must be greater than 0"));
    }
    if self.job_timeout.is_zero() {
      return Err(Error::config("job_timeout must be greater than 0"));
    }
    if self.poll_timeout.is_zero() {
      return Err(Error::config("poll_timeout must be greater than 0"));
    }
    if self.submit_timeout.is_zero() {
      return Err(Error::config("submit_timeout must be greater than 0"));
    }
    if self.required_job_type.trim().is_empty() {
      return Err(Error::config("required_job_type cannot be empty"));
    }
    if self.daily_quota == Some(0) {
      return Err(Error::config("daily_quota must be greater than 0"));
    }
    Ok(())
  }
}

/// Redis 连接配置
/// Redis connection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
  pub host: String,
  pub port: u16,
  pub password: Option<String>,
  pub db: i64,
  /// 完整 URL，设置后优先于其他字段
  /// Full URL, takes precedence over the other fields when set
  pub url: Option<String>,
}

impl Default for RedisConfig {
  fn default() -> Self {
    Self {
      host: "localhost".to_string(),
      port: 6379,
      password: None,
      db: 0,
      url: None,
    }
  }
}

impl RedisConfig {
  /// 从环境变量读取: REDIS_URL 或 REDIS_HOST/REDIS_PORT/REDIS_PASSWORD/REDIS_DB
  /// Read from the environment: REDIS_URL or REDIS_HOST/REDIS_PORT/REDIS_PASSWORD/REDIS_DB
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// 使用自定义查找函数读取配置
  /// Read the configuration through a custom lookup function
  pub fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let defaults = Self::default();
    let port = match lookup("REDIS_PORT") {
      Some(raw) => raw
        .parse()
        .map_err(|_| Error::config(format!("invalid REDIS_PORT: {raw}")))?,
      None => defaults.port,
    };
    let db = match lookup("REDIS_DB") {
      Some(raw) => raw
        .parse()
        .map_err(|_| Error::config(format!("invalid REDIS_DB: {raw}")))?,
      None => defaults.db,
    };
    Ok(Self {
      host: lookup("REDIS_HOST").unwrap_or(defaults.host),
      port,
      password: lookup("REDIS_PASSWORD").filter(|p| !p.is_empty()),
      db,
      url: lookup("REDIS_URL").filter(|u| !u.is_empty()),
    })
  }

  /// 连接 URL
  /// Connection URL
  pub fn url(&self) -> String {
    if let Some(url) = &self.url {
      return url.clone();
    }
    match &self.password {
      Some(password) => format!(
        "redis://:{}@{}:{}/{}",
        password, self.host, self.port, self.db
      ),
      None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
    }
  }
}

/// PostgreSQL 连接配置
/// PostgreSQL connection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
  pub host: String,
  pub port: u16,
  pub user: String,
  pub password: String,
  pub database: String,
  pub sslmode: String,
  pub max_connections: u32,
  pub url: Option<String>,
}

impl Default for DatabaseConfig {
  fn default() -> Self {
    Self {
      host: "localhost".to_string(),
      port: 5432,
      user: "postgres".to_string(),
      password: "postgres".to_string(),
      database: "policy_service".to_string(),
      sslmode: "disable".to_string(),
      max_connections: 10,
      url: None,
    }
  }
}

impl DatabaseConfig {
  /// 从环境变量读取: DATABASE_URL 或 POSTGRES_*
  /// Read from the environment: DATABASE_URL or POSTGRES_*
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let defaults = Self::default();
    let port = match lookup("POSTGRES_PORT") {
      Some(raw) => raw
        .parse()
        .map_err(|_| Error::config(format!("invalid POSTGRES_PORT: {raw}")))?,
      None => defaults.port,
    };
    let max_connections = match lookup("POSTGRES_MAX_CONNECTIONS") {
      Some(raw) => raw
        .parse()
        .map_err(|_| Error::config(format!("invalid POSTGRES_MAX_CONNECTIONS: {raw}")))?,
      None => defaults.max_connections,
    };
    Ok(Self {
      host: lookup("POSTGRES_HOST").unwrap_or(defaults.host),
      port,
      user: lookup("POSTGRES_USER").unwrap_or(defaults.user),
      password: lookup("POSTGRES_PASSWORD").unwrap_or(defaults.password),
      database: lookup("POSTGRES_DB").unwrap_or(defaults.database),
      sslmode: lookup("POSTGRES_SSLMODE").unwrap_or(defaults.sslmode),
      max_connections,
      url: lookup("DATABASE_URL").filter(|u| !u.is_empty()),
    })
  }

  /// 连接 URL
  /// Connection URL
  pub fn url(&self) -> String {
    if let Some(url) = &self.url {
      return url.clone();
    }
    format!(
      "postgres://{}:{}@{}:{}/{}?sslmode={}",
      self.user, self.password, self.host, self.port, self.database, self.sslmode
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |key| map.get(key).cloned()
  }

  #[test]
  fn test_manager_config_defaults_validate() {
    let config = ManagerConfig::default();
    assert_eq!(config.num_workers, 5);
    assert_eq!(config.job_timeout, Duration::from_secs(30 * 60));
    assert_eq!(config.required_job_type, "fetch-farm-monitoring-data");
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_manager_config_rejects_zero_values() {
    assert!(ManagerConfig::new().num_workers(0).validate().is_err());
    assert!(ManagerConfig::new()
      .poll_timeout(Duration::ZERO)
      .validate()
      .is_err());
    assert!(ManagerConfig::new()
      .required_job_type("  ")
      .validate()
      .is_err());
    assert!(ManagerConfig::new().daily_quota(0).validate().is_err());
    assert!(ManagerConfig::new().daily_quota(1_000).validate().is_ok());
  }

  #[test]
  fn test_redis_config_from_lookup() {
    let config = RedisConfig::from_lookup(lookup_from(&[
      ("REDIS_HOST", "cache"),
      ("REDIS_PORT", "6380"),
      ("REDIS_PASSWORD", "secret"),
      ("REDIS_DB", "2"),
    ]))
    .unwrap();
    assert_eq!(config.url(), "redis://:secret@cache:6380/2");

    let defaults = RedisConfig::from_lookup(lookup_from(&[])).unwrap();
    assert_eq!(defaults.url(), "redis://localhost:6379/0");

    assert!(RedisConfig::from_lookup(lookup_from(&[("REDIS_PORT", "x")])).is_err());
  }

  #[test]
  fn test_url_override_wins() {
    let config = RedisConfig::from_lookup(lookup_from(&[
      ("REDIS_URL", "redis://elsewhere:1/0"),
      ("REDIS_HOST", "ignored"),
    ]))
    .unwrap();
    assert_eq!(config.url(), "redis://elsewhere:1/0");

    let db = DatabaseConfig::from_lookup(lookup_from(&[("DATABASE_URL", "postgres://x/y")])).unwrap();
    assert_eq!(db.url(), "postgres://x/y");
  }

  #[test]
  fn test_database_config_from_lookup() {
    let config = DatabaseConfig::from_lookup(lookup_from(&[
      ("POSTGRES_HOST", "db"),
      ("POSTGRES_USER", "svc"),
      ("POSTGRES_PASSWORD", "pw"),
      ("POSTGRES_DB", "policies"),
    ]))
    .unwrap();
    assert_eq!(
      config.url(),
      "postgres://svc:pw@db:5432/policies?sslmode=disable"
    );
    assert_eq!(config.max_connections, 10);
  }
}
