//! Policy worker server binary
//!
//! 独立进程: 连接 Redis 与 PostgreSQL，启动时恢复所有 active 租户，收到 ctrl-c 后优雅关闭。
//! A standalone process: connects to Redis and PostgreSQL, recovers every active tenant at boot
//! and shuts down gracefully on ctrl-c.

use anyhow::Context;
use policy_worker::base::constants::VERSION;
use policy_worker::components::rate_limiter::RateLimit;
use policy_worker::config::{DatabaseConfig, ManagerConfig, RedisConfig};
use policy_worker::handler::HandlerFunc;
use policy_worker::persistence::SeaOrmStateStore;
use policy_worker::queue::RedisQueue;
use policy_worker::{JobParams, WorkerManager};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 从环境变量读取管理器配置，未设置的项使用默认值
/// Read the manager configuration from the environment, keeping defaults for unset values
fn manager_config() -> anyhow::Result<ManagerConfig> {
  let mut config = ManagerConfig::default();
  if let Ok(value) = std::env::var("WORKER_NUM_WORKERS") {
    config = config.num_workers(value.parse().context("WORKER_NUM_WORKERS")?);
  }
  if let Ok(value) = std::env::var("WORKER_JOB_TIMEOUT_SECS") {
    let secs: u64 = value.parse().context("WORKER_JOB_TIMEOUT_SECS")?;
    config = config.job_timeout(Duration::from_secs(secs));
  }
  if let Ok(value) = std::env::var("WORKER_JOB_TYPE") {
    config = config.required_job_type(value);
  }
  if let Ok(value) = std::env::var("WORKER_CALLS_PER_SECOND") {
    let per_second: f64 = value.parse().context("WORKER_CALLS_PER_SECOND")?;
    let burst = match std::env::var("WORKER_BURST") {
      Ok(value) => value.parse().context("WORKER_BURST")?,
      Err(_) => 1,
    };
    config = config.rate_limit(RateLimit::new(per_second, burst)?);
  }
  if let Ok(value) = std::env::var("WORKER_DAILY_QUOTA") {
    config = config.daily_quota(value.parse().context("WORKER_DAILY_QUOTA")?);
  }
  config.validate()?;
  Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialize logging
  tracing_subscriber::registry()
    .with(fmt::layer())
    .with(EnvFilter::from_default_env().add_directive("policy_worker=info".parse()?))
    .init();
  info!(version = VERSION, "Starting policy worker");

  let redis_config = RedisConfig::from_env()?;
  let database_config = DatabaseConfig::from_env()?;
  let config = manager_config()?;

  info!(host = %redis_config.host, port = redis_config.port, "Connecting to Redis");
  let queue = RedisQueue::from_config(&redis_config)
    .await
    .context("connecting to Redis")?;
  queue.ping().await.context("pinging Redis")?;

  info!(host = %database_config.host, database = %database_config.database, "Connecting to PostgreSQL");
  let store = SeaOrmStateStore::connect(&database_config)
    .await
    .context("connecting to PostgreSQL")?;

  let job_type = config.required_job_type.clone();
  let manager = WorkerManager::new(Arc::new(store), Arc::new(queue), config)?;

  // 真实的任务实现由上层服务注册，这里只记录收到的参数
  // Real job bodies are registered by the hosting service; this one only logs what it receives
  manager.register_job_handler(
    job_type.clone(),
    Arc::new(HandlerFunc::new(move |params: JobParams| {
      let params = serde_json::to_string(&params)?;
      info!(job_type = %job_type, params = %params, "Job received");
      Ok(())
    })),
  );

  let report = manager.recover().await?;
  info!(
    recovered = report.recovered.len(),
    failed = report.failed.len(),
    "Worker manager ready"
  );
  for (tenant_id, err) in &report.failed {
    warn!(tenant_id = %tenant_id, error = %err, "Tenant left unrecovered");
  }

  tokio::signal::ctrl_c()
    .await
    .context("waiting for ctrl-c")?;
  info!("Received ctrl-c, shutting down");
  manager.shutdown().await;

  Ok(())
}
