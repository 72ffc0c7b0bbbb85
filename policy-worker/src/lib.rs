//! # Policy Worker
//!
//! 按租户隔离的后台任务基础设施
//! Per-tenant background job infrastructure
//!
//! 每个有效保单（租户）拥有自己的工作池与调度器。调度器按监控频率提交任务，
//! 工作池从租户专属的持久队列中消费任务，失败时重试，耗尽重试后进入死信列表。
//! Every active policy (tenant) owns a worker pool and a scheduler. The scheduler submits
//! jobs at the monitoring frequency; the pool consumes them from the tenant's durable queue,
//! retries failures and dead-letters jobs that exhausted their retries.
//!
//! ## 特性
//! ## Features
//!
//! - 保证任务至少执行一次，进程崩溃后 running 中的任务会被重新排队
//!   - At-least-once execution; jobs left in running by a crash are re-queued
//! - 每个租户独立的 pending / running / dlq 列表
//!   - Separate pending / running / dlq lists per tenant
//! - 有上限的重试与死信列表
//!   - Bounded retries and a dead-letter list
//! - 任务超时与 panic 隔离
//!   - Job timeouts and panic isolation
//! - 事务性的状态持久化与重启后的灾难恢复
//!   - Transactional state persistence and disaster recovery after restart
//! - Redis 与 PostgreSQL 后端，以及用于测试的内存后端
//!   - Redis and PostgreSQL backends, plus in-memory backends for tests
//!
//! ## 快速开始
//! ## Quick Start
//!
//! ```rust,no_run
//! use policy_worker::base::TenantId;
//! use policy_worker::config::ManagerConfig;
//! use policy_worker::handler::HandlerFunc;
//! use policy_worker::manager::{InfrastructureConfig, WorkerManager};
//! use policy_worker::persistence::MemoryStateStore;
//! use policy_worker::queue::MemoryQueue;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> policy_worker::Result<()> {
//!   let manager = WorkerManager::new(
//!     Arc::new(MemoryStateStore::new()),
//!     Arc::new(MemoryQueue::new()),
//!     ManagerConfig::default(),
//!   )?;
//!
//!   // 注册监控任务处理器
//!   // Register the monitoring handler
//!   manager.register_job_handler(
//!     "fetch-farm-monitoring-data",
//!     Arc::new(HandlerFunc::new(|params| {
//!       println!("monitoring farm {:?}", params.get("farm_id"));
//!       Ok(())
//!     })),
//!   );
//!
//!   let tenant = TenantId::new();
//!   manager
//!     .create_infrastructure(InfrastructureConfig::new(tenant, 1, "day").farm_id("farm-1"))
//!     .await?;
//!   manager.start(tenant).await?;
//!
//!   manager.archive(tenant).await?;
//!   manager.shutdown().await;
//!   Ok(())
//! }
//! ```

pub mod base;
pub mod components;
pub mod config;
pub mod error;
pub mod handler;
pub mod job;
pub mod manager;
pub mod persistence;
pub mod queue;

pub use error::{Error, Result};
pub use job::{JobParams, JobPayload};
pub use manager::WorkerManager;
