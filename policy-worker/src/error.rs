//! 错误处理模块
//! Error handling module
//!
//! 定义了 policy-worker 库中使用的各种错误类型
//! Defines the error types used across the policy-worker library

use crate::base::TenantId;
use std::time::Duration;
use thiserror::Error;

/// policy-worker 库的结果类型
/// Result type for the policy-worker library
pub type Result<T> = std::result::Result<T, Error>;

/// policy-worker 错误类型
/// policy-worker error type
#[derive(Error, Debug)]
pub enum Error {
  /// Redis connection error
  #[error("Redis error: {0}")]
  Redis(#[from] redis::RedisError),

  #[cfg(feature = "postgres")]
  /// SeaORM 数据库错误
  /// SeaORM database error
  #[error("Database error: {0}")]
  Database(#[from] sea_orm::DbErr),

  /// 序列化错误
  /// Serialization error
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// 操作超时
  /// Operation timeout
  #[error("Operation timed out after {0:?}")]
  Timeout(Duration),

  /// 取消错误
  /// Cancellation error
  #[error("Operation cancelled")]
  Cancelled,

  /// 任务处理器返回的错误
  /// Error returned by a job handler
  #[error("Job handler error: {0}")]
  Handler(String),

  /// 未注册的任务类型
  /// Job type with no registered handler
  #[error("No handler registered for job type: {0}")]
  UnknownJobType(String),

  /// 创建基础设施时所需的处理器缺失
  /// A handler required to build a tenant's infrastructure is missing
  #[error("Job handler not registered: {0}")]
  HandlerNotRegistered(String),

  /// 实体未找到
  /// Entity not found
  #[error("{entity} not found for tenant {tenant_id}")]
  NotFound {
    entity: &'static str,
    tenant_id: TenantId,
  },

  /// 实体已存在
  /// Entity already exists
  #[error("{entity} already exists for tenant {tenant_id}")]
  AlreadyExists {
    entity: &'static str,
    tenant_id: TenantId,
  },

  /// 租户基础设施已在运行
  /// Tenant infrastructure is already running
  #[error("Worker infrastructure already running for tenant {0}")]
  AlreadyRunning(TenantId),

  /// 租户基础设施未运行
  /// Tenant infrastructure is not running
  #[error("Worker infrastructure not running for tenant {0}")]
  NotRunning(TenantId),

  /// 不支持的监控频率单位
  /// Unsupported monitor frequency unit
  #[error("Unsupported monitor frequency unit: {0}")]
  InvalidFrequencyUnit(String),

  /// 配置错误
  /// Configuration error
  #[error("Configuration error: {message}")]
  Config { message: String },

  /// 其他错误
  /// Other error
  #[error("Other error: {message}")]
  Other { message: String },
}

impl Error {
  /// 创建配置错误
  /// Create a configuration error
  pub fn config<S: Into<String>>(message: S) -> Self {
    Self::Config {
      message: message.into(),
    }
  }

  /// 创建其他错误
  /// Create another type of error
  pub fn other<S: Into<String>>(message: S) -> Self {
    Self::Other {
      message: message.into(),
    }
  }

  /// 创建处理器错误
  /// Create a handler error
  pub fn handler<S: Into<String>>(message: S) -> Self {
    Self::Handler(message.into())
  }

  pub fn not_found(entity: &'static str, tenant_id: TenantId) -> Self {
    Self::NotFound { entity, tenant_id }
  }

  pub fn already_exists(entity: &'static str, tenant_id: TenantId) -> Self {
    Self::AlreadyExists { entity, tenant_id }
  }

  /// 是否为瞬时基础设施错误（调用方可以重试）
  /// Whether this is a transient infrastructure error the caller may retry
  pub fn is_transient(&self) -> bool {
    match self {
      Error::Redis(e) => {
        e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal()
      }
      #[cfg(feature = "postgres")]
      Error::Database(e) => matches!(
        e,
        sea_orm::DbErr::Conn(_) | sea_orm::DbErr::ConnectionAcquire(_)
      ),
      Error::Timeout(_) => true,
      _ => false,
    }
  }

  /// 是否为生命周期不一致错误
  /// Whether this error reports a lifecycle inconsistency
  pub fn is_lifecycle(&self) -> bool {
    matches!(
      self,
      Error::NotFound { .. }
        | Error::AlreadyExists { .. }
        | Error::AlreadyRunning(_)
        | Error::NotRunning(_)
        | Error::HandlerNotRegistered(_)
    )
  }
}
