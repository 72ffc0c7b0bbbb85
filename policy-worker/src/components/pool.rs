//! 工作池模块
//! Worker pool module
//!
//! 固定数量的工作者从租户的 pending 列表原子地取任务到 running，执行后
//! 总是将负载从 running 中移除，然后完成、重试或进入死信列表。
//! A fixed number of workers atomically move jobs from the tenant's pending list to running.
//! After execution the payload always leaves running: it completes, goes back to pending for
//! a retry, or lands in the dead-letter list.

use crate::base::constants::{
  DEFAULT_JOB_TIMEOUT, DEFAULT_NUM_WORKERS, DEFAULT_POLL_TIMEOUT, QUOTA_EXHAUSTED_BACKOFF,
};
use crate::base::keys::{QueueKeys, QueueList};
use crate::base::TenantId;
use crate::components::rate_limiter::{RateLimit, TokenBucket};
use crate::components::JobSubmitter;
use crate::error::{Error, Result};
use crate::handler::{HandlerRegistry, JobHandler};
use crate::job::JobPayload;
use crate::persistence::{JobExecution, JobStatus, StateRepository, StateStore};
use crate::queue::{QueueBackend, QueueStats};
use async_trait::async_trait;
use chrono::Utc;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 队列存储出错后的退避时间
/// Backoff after a queue store error
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// 工作池选项
/// Worker pool options
#[derive(Debug, Clone)]
pub struct PoolOptions {
  /// 工作池名称
  /// Pool name
  pub name: String,
  /// 队列前缀，三个列表名由它派生
  /// Queue prefix the three list names derive from
  pub queue_name_base: String,
  pub num_workers: usize,
  /// 单个任务的执行期限
  /// Deadline of a single job
  pub job_timeout: Duration,
  /// 阻塞取任务的最长等待，决定了响应取消的延迟上限
  /// Longest blocking pop, which bounds how fast a worker notices cancellation
  pub poll_timeout: Duration,
  /// 执行任务前的令牌桶限流，`None` 表示不限流
  /// Token bucket applied before each job runs, `None` for unlimited
  pub rate_limit: Option<RateLimit>,
  /// 每个 UTC 日最多执行的任务数，`None` 表示不限
  /// Most jobs run per UTC day, `None` for unlimited
  pub daily_quota: Option<u64>,
}

impl PoolOptions {
  pub fn new<N: Into<String>, Q: Into<String>>(name: N, queue_name_base: Q) -> Self {
    Self {
      name: name.into(),
      queue_name_base: queue_name_base.into(),
      num_workers: DEFAULT_NUM_WORKERS,
      job_timeout: DEFAULT_JOB_TIMEOUT,
      poll_timeout: DEFAULT_POLL_TIMEOUT,
      rate_limit: None,
      daily_quota: None,
    }
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

  pub fn rate_limit(mut self, limit: Option<RateLimit>) -> Self {
    self.rate_limit = limit;
    self
  }

  pub fn daily_quota(mut self, quota: Option<u64>) -> Self {
    self.daily_quota = quota;
    self
  }
}

/// 取到任务后，执行前的准入结果
/// Admission of a dequeued job before it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
  Run,
  /// 已放回 pending，稍后再取
  /// Put back on pending to be taken later
  Deferred,
  /// 已放回 pending，工作者应退出
  /// Put back on pending and the worker should exit
  Cancelled,
}

/// 单次执行的结果
/// Outcome of one dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
  Succeeded,
  /// 处理器返回错误，或任务类型未注册
  /// The handler returned an error, or the job type has no handler
  Failed(String),
  /// 处理器 panic，已被捕获
  /// The handler panicked and the panic was caught
  Panicked(String),
  TimedOut(Duration),
  /// 租户被停止时任务仍在执行
  /// The tenant was stopped while the job was still running
  Cancelled,
}

impl JobOutcome {
  pub fn is_success(&self) -> bool {
    matches!(self, JobOutcome::Succeeded)
  }

  pub fn error_message(&self) -> Option<String> {
    match self {
      JobOutcome::Succeeded => None,
      other => Some(other.to_string()),
    }
  }
}

impl fmt::Display for JobOutcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      JobOutcome::Succeeded => f.write_str("succeeded"),
      JobOutcome::Failed(msg) => write!(f, "failed: {msg}"),
      JobOutcome::Panicked(msg) => write!(f, "panicked: {msg}"),
      JobOutcome::TimedOut(timeout) => write!(f, "timed out after {timeout:?}"),
      JobOutcome::Cancelled => f.write_str("cancelled by shutdown"),
    }
  }
}

struct ExecutionRecorder {
  tenant_id: TenantId,
  store: Arc<dyn StateStore>,
}

/// 租户工作池
/// Tenant worker pool
pub struct WorkerPool {
  options: PoolOptions,
  keys: QueueKeys,
  backend: Arc<dyn QueueBackend>,
  handlers: HandlerRegistry,
  limiter: Option<TokenBucket>,
  recorder: Option<ExecutionRecorder>,
}

impl WorkerPool {
  /// 创建工作池
  /// Create a worker pool
  pub fn new(options: PoolOptions, backend: Arc<dyn QueueBackend>) -> Self {
    let keys = QueueKeys::new(options.queue_name_base.clone());
    let limiter = options.rate_limit.map(TokenBucket::new);
    Self {
      options,
      keys,
      backend,
      handlers: HandlerRegistry::new(),
      limiter,
      recorder: None,
    }
  }

  /// 为每次执行写入审计记录
  /// Write an audit record for every execution
  pub fn with_execution_recorder(mut self, tenant_id: TenantId, store: Arc<dyn StateStore>) -> Self {
    self.recorder = Some(ExecutionRecorder { tenant_id, store });
    self
  }

  pub fn name(&self) -> &str {
    &self.options.name
  }

  pub fn options(&self) -> &PoolOptions {
    &self.options
  }

  pub fn keys(&self) -> &QueueKeys {
    &self.keys
  }

  /// 注册任务处理器
  /// Register a job handler
  pub fn register_handler<S: Into<String>>(&self, job_type: S, handler: Arc<dyn JobHandler>) {
    self.handlers.register(job_type, handler);
  }

  pub fn handlers(&self) -> &HandlerRegistry {
    &self.handlers
  }

  /// 将任务序列化后追加到 pending 列表
  /// Serialize the job and append it to the pending list
  pub async fn submit(&self, job: &JobPayload) -> Result<()> {
    let payload = job.encode()?;
    self.backend.push_pending(&self.keys, &payload).await?;
    debug!(pool = %self.options.name, job_id = %job.job_id, job_type = %job.job_type, "Job submitted");
    Ok(())
  }

  pub async fn queue_stats(&self) -> Result<QueueStats> {
    self.backend.stats(&self.keys).await
  }

  /// 解码指定列表中的任务，无法解码的条目会被跳过
  /// Decode the jobs held in a list, skipping entries that do not decode
  pub async fn jobs_in(&self, list: QueueList) -> Result<Vec<JobPayload>> {
    let raw = self.backend.list(&self.keys, list).await?;
    Ok(
      raw
        .iter()
        .filter_map(|item| match JobPayload::decode(item) {
          Ok(job) => Some(job),
          Err(err) => {
            warn!(pool = %self.options.name, list = %list, error = %err, "Skipping undecodable queue entry");
            None
          }
        })
        .collect(),
    )
  }

  /// 运行工作池: 先恢复过期任务，再启动工作者，直到令牌被取消
  /// Run the pool: recover stale jobs, then run the workers until the token is cancelled
  pub async fn run(self: Arc<Self>, token: CancellationToken) {
    match self.backend.requeue_stale(&self.keys).await {
      Ok(0) => debug!(pool = %self.options.name, "No stale jobs to recover"),
      Ok(moved) => info!(pool = %self.options.name, moved, "Recovered stale jobs from running list"),
      Err(err) => error!(pool = %self.options.name, error = %err, "Stale job recovery failed"),
    }

    info!(
      pool = %self.options.name,
      workers = self.options.num_workers,
      job_timeout = ?self.options.job_timeout,
      rate_limit = ?self.options.rate_limit,
      daily_quota = ?self.options.daily_quota,
      "Worker pool started"
    );

    let mut workers = JoinSet::new();
    for worker_id in 0..self.options.num_workers {
      let pool = Arc::clone(&self);
      let token = token.clone();
      workers.spawn(async move { pool.worker_loop(worker_id, token).await });
    }
    while let Some(joined) = workers.join_next().await {
      if let Err(err) = joined {
        error!(pool = %self.options.name, error = %err, "Worker task ended abnormally");
      }
    }

    info!(pool = %self.options.name, "Worker pool stopped");
  }

  async fn worker_loop(&self, worker_id: usize, token: CancellationToken) {
    debug!(pool = %self.options.name, worker_id, "Worker started");
    loop {
      let next = tokio::select! {
        biased;
        _ = token.cancelled() => break,
        next = self.backend.dequeue(&self.keys, self.options.poll_timeout) => next,
      };

      match next {
        Ok(Some(raw)) => match self.admit(worker_id, &raw, &token).await {
          Admission::Run => self.process(&raw, &token).await,
          Admission::Deferred => continue,
          Admission::Cancelled => break,
        },
        Ok(None) => continue,
        Err(err) => {
          error!(pool = %self.options.name, worker_id, error = %err, "Failed to dequeue job");
          tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(ERROR_BACKOFF) => {}
          }
        }
      }
    }
    debug!(pool = %self.options.name, worker_id, "Worker stopped");
  }

  /// 检查每日配额并等待限流令牌，不能执行的任务放回 pending
  /// Check the daily quota and wait for a rate limit token; a job that cannot run goes back to pending
  async fn admit(&self, worker_id: usize, raw: &str, token: &CancellationToken) -> Admission {
    if let Some(limit) = self.options.daily_quota {
      match self.backend.consume_quota(&self.keys, limit, Utc::now()).await {
        Ok(true) => {}
        Ok(false) => {
          warn!(pool = %self.options.name, worker_id, limit, "Daily quota exhausted, job put back on pending");
          self.put_back(raw).await;
          return self.back_off(token, QUOTA_EXHAUSTED_BACKOFF).await;
        }
        Err(err) => {
          error!(pool = %self.options.name, worker_id, error = %err, "Failed to check daily quota, job put back on pending");
          self.put_back(raw).await;
          return self.back_off(token, ERROR_BACKOFF).await;
        }
      }
    }

    if let Some(limiter) = &self.limiter {
      if limiter.acquire(token).await.is_err() {
        debug!(pool = %self.options.name, worker_id, "Cancelled while waiting for a rate limit token");
        self.put_back(raw).await;
        return Admission::Cancelled;
      }
    }
    Admission::Run
  }

  async fn back_off(&self, token: &CancellationToken, wait: Duration) -> Admission {
    tokio::select! {
      _ = token.cancelled() => Admission::Cancelled,
      _ = tokio::time::sleep(wait) => Admission::Deferred,
    }
  }

  /// 原样放回 pending，不计入重试次数
  /// Move the payload back to pending unchanged, without counting a retry
  async fn put_back(&self, raw: &str) {
    if let Err(err) = self.backend.retry(&self.keys, raw, raw).await {
      error!(
        critical = true,
        pool = %self.options.name,
        error = %err,
        "Failed to move job from running back to pending"
      );
    }
  }

  async fn process(&self, raw: &str, token: &CancellationToken) {
    let job = match JobPayload::decode(raw) {
      Ok(job) => job,
      Err(err) => {
        error!(pool = %self.options.name, error = %err, "Undecodable payload, moving it to the dead-letter list");
        self.dead_letter(raw, None).await;
        return;
      }
    };

    let execution = self.record_start(&job).await;
    let outcome = self.dispatch(&job, token).await;
    let status = self.settle(raw, &job, &outcome).await;
    self.record_finish(execution, status, outcome.error_message()).await;
  }

  /// 执行一个任务并分类结果，处理器的 panic 会被转换为普通失败
  /// Execute one job and classify its outcome; a handler panic becomes an ordinary failure
  pub async fn dispatch(&self, job: &JobPayload, token: &CancellationToken) -> JobOutcome {
    let Some(handler) = self.handlers.get(&job.job_type) else {
      return JobOutcome::Failed(Error::UnknownJobType(job.job_type.clone()).to_string());
    };

    let params = job.params.clone();
    let mut task = tokio::spawn(async move { handler.handle(params).await });
    tokio::select! {
      joined = &mut task => match joined {
        Ok(Ok(())) => JobOutcome::Succeeded,
        Ok(Err(err)) => JobOutcome::Failed(err.to_string()),
        Err(err) if err.is_panic() => JobOutcome::Panicked(panic_message(err.into_panic())),
        Err(err) => JobOutcome::Failed(err.to_string()),
      },
      _ = tokio::time::sleep(self.options.job_timeout) => {
        task.abort();
        JobOutcome::TimedOut(self.options.job_timeout)
      }
      _ = token.cancelled() => {
        task.abort();
        JobOutcome::Cancelled
      }
    }
  }

  /// 根据结果放置负载，返回用于审计的最终状态
  /// Place the payload according to the outcome and return the status to record
  async fn settle(&self, raw: &str, job: &JobPayload, outcome: &JobOutcome) -> JobStatus {
    if outcome.is_success() {
      match self.backend.complete(&self.keys, raw).await {
        Ok(true) => {}
        Ok(false) => warn!(pool = %self.options.name, job_id = %job.job_id, "Completed job was no longer in the running list"),
        Err(err) => error!(
          critical = true,
          pool = %self.options.name,
          job_id = %job.job_id,
          error = %err,
          "Failed to remove completed job from the running list"
        ),
      }
      debug!(pool = %self.options.name, job_id = %job.job_id, "Job completed");
      return JobStatus::Completed;
    }

    if job.can_retry() {
      let next = job.next_attempt();
      let next_payload = match next.encode() {
        Ok(payload) => payload,
        Err(err) => {
          error!(pool = %self.options.name, job_id = %job.job_id, error = %err, "Failed to encode retry payload");
          self.dead_letter(raw, Some(job)).await;
          return JobStatus::Failed;
        }
      };
      match self.backend.retry(&self.keys, raw, &next_payload).await {
        Ok(true) => warn!(
          pool = %self.options.name,
          job_id = %job.job_id,
          job_type = %job.job_type,
          retry_count = next.retry_count,
          max_retries = job.max_retries,
          outcome = %outcome,
          "Job failed, scheduled for retry"
        ),
        Ok(false) => warn!(pool = %self.options.name, job_id = %job.job_id, "Failed job was no longer in the running list, not retried"),
        Err(err) => error!(
          critical = true,
          pool = %self.options.name,
          job_id = %job.job_id,
          error = %err,
          "Failed to move job from running back to pending"
        ),
      }
      return JobStatus::Retrying;
    }

    error!(
      pool = %self.options.name,
      job_id = %job.job_id,
      job_type = %job.job_type,
      retry_count = job.retry_count,
      outcome = %outcome,
      "Job exhausted its retries, moving it to the dead-letter list"
    );
    self.dead_letter(raw, Some(job)).await;
    JobStatus::Failed
  }

  async fn dead_letter(&self, raw: &str, job: Option<&JobPayload>) {
    let job_id = job.map(|j| j.job_id.as_str()).unwrap_or("<unknown>");
    match self.backend.dead_letter(&self.keys, raw).await {
      Ok(true) => {}
      Ok(false) => warn!(pool = %self.options.name, job_id, "Dead-lettered job was no longer in the running list"),
      Err(err) => error!(
        critical = true,
        pool = %self.options.name,
        job_id,
        error = %err,
        "Failed to move job from running to the dead-letter list"
      ),
    }
  }

  async fn record_start(&self, job: &JobPayload) -> Option<JobExecution> {
    let recorder = self.recorder.as_ref()?;
    let execution = JobExecution::started(
      recorder.tenant_id,
      &job.job_id,
      &job.job_type,
      job.retry_count,
      job.max_retries,
    );
    if let Err(err) = recorder.store.create_job_execution(&execution).await {
      warn!(pool = %self.options.name, job_id = %job.job_id, error = %err, "Failed to record job execution");
      return None;
    }
    Some(execution)
  }

  async fn record_finish(
    &self,
    execution: Option<JobExecution>,
    status: JobStatus,
    error_message: Option<String>,
  ) {
    let (Some(recorder), Some(mut execution)) = (self.recorder.as_ref(), execution) else {
      return;
    };
    execution.finish(status, error_message);
    if let Err(err) = recorder.store.update_job_execution(&execution).await {
      warn!(pool = %self.options.name, job_id = %execution.job_id, error = %err, "Failed to update job execution");
    }
    if let Err(err) = recorder
      .store
      .touch_pool_last_job(recorder.tenant_id, Utc::now())
      .await
    {
      debug!(pool = %self.options.name, error = %err, "Failed to update pool last_job_at");
    }
  }
}

#[async_trait]
impl JobSubmitter for WorkerPool {
  async fn submit(&self, job: JobPayload) -> Result<()> {
    WorkerPool::submit(self, &job).await
  }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(msg) = payload.downcast_ref::<&str>() {
    (*msg).to_string()
  } else if let Some(msg) = payload.downcast_ref::<String>() {
    msg.clone()
  } else {
    "unknown panic payload".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::handler::{AsyncHandlerFunc, HandlerFunc};
  use crate::job::JobParams;
  use crate::queue::MemoryQueue;

  fn pool(backend: Arc<MemoryQueue>) -> WorkerPool {
    WorkerPool::new(
      PoolOptions::new("test-pool", "policy-test")
        .num_workers(1)
        .job_timeout(Duration::from_millis(200))
        .poll_timeout(Duration::from_millis(20)),
      backend,
    )
  }

  #[tokio::test]
  async fn test_dispatch_unknown_type_fails() {
    let pool = pool(Arc::new(MemoryQueue::new()));
    let outcome = pool
      .dispatch(&JobPayload::new("missing"), &CancellationToken::new())
      .await;
    assert_eq!(
      outcome,
      JobOutcome::Failed("No handler registered for job type: missing".to_string())
    );
  }

  #[tokio::test]
  async fn test_dispatch_catches_panic() {
    let pool = pool(Arc::new(MemoryQueue::new()));
    pool.register_handler(
      "explode",
      Arc::new(HandlerFunc::new(|_params: JobParams| -> Result<()> {
        panic!("handler blew up")
      })),
    );
    let outcome = pool
      .dispatch(&JobPayload::new("explode"), &CancellationToken::new())
      .await;
    assert_eq!(outcome, JobOutcome::Panicked("handler blew up".to_string()));
    assert!(!outcome.is_success());
  }

  #[tokio::test]
  async fn test_dispatch_times_out() {
    let pool = pool(Arc::new(MemoryQueue::new()));
    pool.register_handler(
      "slow",
      Arc::new(AsyncHandlerFunc::new(|_params: JobParams| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(())
      })),
    );
    let outcome = pool
      .dispatch(&JobPayload::new("slow"), &CancellationToken::new())
      .await;
    assert_eq!(outcome, JobOutcome::TimedOut(Duration::from_millis(200)));
  }

  #[tokio::test]
  async fn test_dispatch_cancelled_by_token() {
    let pool = pool(Arc::new(MemoryQueue::new()));
    pool.register_handler(
      "slow",
      Arc::new(AsyncHandlerFunc::new(|_params: JobParams| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(())
      })),
    );
    let token = CancellationToken::new();
    token.cancel();
    let outcome = pool.dispatch(&JobPayload::new("slow"), &token).await;
    assert_eq!(outcome, JobOutcome::Cancelled);
  }

  #[tokio::test]
  async fn test_dispatch_passes_params_and_reports_error() {
    let pool = pool(Arc::new(MemoryQueue::new()));
    pool.register_handler(
      "check",
      Arc::new(HandlerFunc::new(|params: JobParams| {
        match params.get("farm_id").and_then(|v| v.as_str()) {
          Some("farm-1") => Ok(()),
          _ => Err(Error::handler("unexpected farm")),
        }
      })),
    );
    let token = CancellationToken::new();
    let ok = JobPayload::new("check").with_param("farm_id", "farm-1");
    assert!(pool.dispatch(&ok, &token).await.is_success());
    let bad = JobPayload::new("check").with_param("farm_id", "farm-2");
    assert_eq!(
      pool.dispatch(&bad, &token).await,
      JobOutcome::Failed("Job handler error: unexpected farm".to_string())
    );
  }

  #[tokio::test]
  async fn test_submit_appends_to_pending() {
    let backend = Arc::new(MemoryQueue::new());
    let pool = pool(Arc::clone(&backend));
    let job = JobPayload::new("t").with_param("policy_id", "p");
    pool.submit(&job).await.unwrap();
    let pending = pool.jobs_in(QueueList::Pending).await.unwrap();
    assert_eq!(pending, vec![job]);
  }

  #[tokio::test]
  async fn test_admit_puts_job_back_when_quota_exhausted() {
    let backend = Arc::new(MemoryQueue::new());
    let pool = WorkerPool::new(
      PoolOptions::new("quota-pool", "policy-quota").daily_quota(Some(1)),
      Arc::clone(&backend) as Arc<dyn QueueBackend>,
    );
    let keys = pool.keys().clone();
    backend.push_pending(&keys, "first").await.unwrap();
    backend.push_pending(&keys, "second").await.unwrap();

    let token = CancellationToken::new();
    let first = backend.dequeue(&keys, Duration::from_millis(10)).await.unwrap().unwrap();
    assert_eq!(pool.admit(0, &first, &token).await, Admission::Run);

    let second = backend.dequeue(&keys, Duration::from_millis(10)).await.unwrap().unwrap();
    token.cancel();
    assert_eq!(pool.admit(0, &second, &token).await, Admission::Cancelled);
    assert_eq!(backend.list(&keys, QueueList::Pending).await.unwrap(), vec!["second"]);
    assert_eq!(backend.list(&keys, QueueList::Running).await.unwrap(), vec!["first"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_admit_waits_for_rate_limit_token() {
    let backend = Arc::new(MemoryQueue::new());
    let limit = RateLimit::new(1.0, 1).unwrap();
    let pool = WorkerPool::new(
      PoolOptions::new("rate-pool", "policy-rate").rate_limit(Some(limit)),
      Arc::clone(&backend) as Arc<dyn QueueBackend>,
    );
    let keys = pool.keys().clone();
    let token = CancellationToken::new();
    let started = tokio::time::Instant::now();

    assert_eq!(pool.admit(0, "a", &token).await, Admission::Run);
    assert_eq!(pool.admit(0, "b", &token).await, Admission::Run);
    assert!(started.elapsed() >= Duration::from_secs(1));

    backend.seed(&keys, QueueList::Running, "c").await;
    let canceller = token.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(100)).await;
      canceller.cancel();
    });
    assert_eq!(pool.admit(0, "c", &token).await, Admission::Cancelled);
    assert_eq!(backend.list(&keys, QueueList::Pending).await.unwrap(), vec!["c"]);
  }

  #[test]
  fn test_outcome_messages() {
    assert_eq!(JobOutcome::Succeeded.error_message(), None);
    assert_eq!(
      JobOutcome::Cancelled.error_message().as_deref(),
      Some("cancelled by shutdown")
    );
  }
}
