//! Worker pool tests against the in-memory queue
//!
//! Covers payload placement, the retry bound, crash recovery of the running list,
//! failure classification and the execution audit trail.

use policy_worker::base::keys::{QueueKeys, QueueList};
use policy_worker::base::TenantId;
use policy_worker::components::pool::{PoolOptions, WorkerPool};
use policy_worker::components::rate_limiter::RateLimit;
use policy_worker::handler::{AsyncHandlerFunc, HandlerFunc, JobHandler};
use policy_worker::persistence::{JobStatus, MemoryStateStore, StateRepository, StateStore};
use policy_worker::queue::{MemoryQueue, QueueBackend, QueueStats};
use policy_worker::{Error, JobParams, JobPayload};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

fn options(prefix: &str) -> PoolOptions {
  PoolOptions::new(format!("{prefix}-pool"), prefix)
    .num_workers(3)
    .job_timeout(Duration::from_millis(200))
    .poll_timeout(Duration::from_millis(20))
}

fn start(pool: &Arc<WorkerPool>) -> (CancellationToken, JoinHandle<()>) {
  let token = CancellationToken::new();
  let handle = tokio::spawn(Arc::clone(pool).run(token.clone()));
  (token, handle)
}

async fn stop(token: CancellationToken, handle: JoinHandle<()>) {
  token.cancel();
  handle.await.expect("pool task should exit cleanly");
}

async fn wait_for_stats(pool: &WorkerPool, want: impl Fn(&QueueStats) -> bool) -> QueueStats {
  let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
  loop {
    let stats = pool.queue_stats().await.expect("stats should be readable");
    if want(&stats) {
      return stats;
    }
    assert!(
      tokio::time::Instant::now() < deadline,
      "queue never reached the expected state: {stats:?}"
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}

async fn wait_for_count(counter: &AtomicUsize, expected: usize) {
  let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
  while counter.load(Ordering::SeqCst) < expected {
    assert!(
      tokio::time::Instant::now() < deadline,
      "handler ran {} times, expected {expected}",
      counter.load(Ordering::SeqCst)
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}

fn counting_handler(counter: Arc<AtomicUsize>, fail: bool) -> Arc<dyn JobHandler> {
  Arc::new(HandlerFunc::new(move |_params: JobParams| {
    counter.fetch_add(1, Ordering::SeqCst);
    if fail {
      Err(Error::handler("monitoring source unavailable"))
    } else {
      Ok(())
    }
  }))
}

#[tokio::test]
async fn test_successful_jobs_leave_every_list() {
  let backend = Arc::new(MemoryQueue::new());
  let pool = Arc::new(WorkerPool::new(options("policy-ok"), backend));
  let counter = Arc::new(AtomicUsize::new(0));
  pool.register_handler("monitor", counting_handler(Arc::clone(&counter), false));

  for i in 0..20 {
    pool
      .submit(&JobPayload::new("monitor").with_param("n", i))
      .await
      .unwrap();
  }

  let (token, handle) = start(&pool);
  wait_for_count(&counter, 20).await;
  let stats = wait_for_stats(&pool, |s| s.running == 0 && s.pending == 0).await;
  assert_eq!(stats, QueueStats::default());
  stop(token, handle).await;

  assert_eq!(counter.load(Ordering::SeqCst), 20);
}

/// 每个列表中的 (job_id, retry_count)
/// (job_id, retry_count) of every entry in a list
async fn placement(pool: &WorkerPool, list: QueueList) -> Vec<(String, u32)> {
  pool
    .jobs_in(list)
    .await
    .unwrap()
    .into_iter()
    .map(|job| (job.job_id, job.retry_count))
    .collect()
}

#[tokio::test]
async fn test_payload_sits_in_exactly_one_list_while_handled() {
  let backend = Arc::new(MemoryQueue::new());
  let pool = Arc::new(WorkerPool::new(
    options("policy-place")
      .num_workers(1)
      .job_timeout(Duration::from_secs(5)),
    backend,
  ));
  let attempts = Arc::new(AtomicUsize::new(0));
  let gate = Arc::new(Notify::new());
  {
    let attempts = Arc::clone(&attempts);
    let gate = Arc::clone(&gate);
    pool.register_handler(
      "monitor",
      Arc::new(AsyncHandlerFunc::new(move |_params: JobParams| {
        let attempts = Arc::clone(&attempts);
        let gate = Arc::clone(&gate);
        async move {
          let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
          gate.notified().await;
          if attempt == 1 {
            Err(Error::handler("first attempt fails"))
          } else {
            Ok(())
          }
        }
      })),
    );
  }

  let job = JobPayload::new("monitor").with_max_retries(1);
  let id = job.job_id.clone();
  pool.submit(&job).await.unwrap();
  assert_eq!(placement(&pool, QueueList::Pending).await, vec![(id.clone(), 0)]);
  assert!(placement(&pool, QueueList::Running).await.is_empty());

  let (token, handle) = start(&pool);

  // 第一次执行被阻塞: 只在 running 中
  // First attempt blocked: only in running
  wait_for_count(&attempts, 1).await;
  assert_eq!(placement(&pool, QueueList::Running).await, vec![(id.clone(), 0)]);
  assert!(placement(&pool, QueueList::Pending).await.is_empty());
  assert!(placement(&pool, QueueList::DeadLetter).await.is_empty());

  // 失败后重试，第二次执行被阻塞: 仍然只有一份，且重试次数加一
  // Failed and retried, second attempt blocked: still one copy, retry count incremented
  gate.notify_one();
  wait_for_count(&attempts, 2).await;
  assert_eq!(placement(&pool, QueueList::Running).await, vec![(id.clone(), 1)]);
  assert!(placement(&pool, QueueList::Pending).await.is_empty());
  assert!(placement(&pool, QueueList::DeadLetter).await.is_empty());

  gate.notify_one();
  let stats = wait_for_stats(&pool, |s| s.running == 0 && s.pending == 0).await;
  stop(token, handle).await;
  assert_eq!(stats, QueueStats::default());
  assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retry_bound_then_dead_letter() {
  let backend = Arc::new(MemoryQueue::new());
  let pool = Arc::new(WorkerPool::new(options("policy-retry"), backend));
  let attempts = Arc::new(AtomicUsize::new(0));
  pool.register_handler("monitor", counting_handler(Arc::clone(&attempts), true));

  let job = JobPayload::new("monitor").with_max_retries(2);
  pool.submit(&job).await.unwrap();

  let (token, handle) = start(&pool);
  let stats = wait_for_stats(&pool, |s| s.dead_letter == 1).await;
  stop(token, handle).await;

  assert_eq!(stats.pending, 0);
  assert_eq!(stats.running, 0);
  assert_eq!(attempts.load(Ordering::SeqCst), 3);

  let dead = pool.jobs_in(QueueList::DeadLetter).await.unwrap();
  assert_eq!(dead.len(), 1);
  assert_eq!(dead[0].job_id, job.job_id);
  assert_eq!(dead[0].retry_count, 2);
}

#[tokio::test]
async fn test_stale_running_jobs_are_recovered_on_start() {
  let backend = Arc::new(MemoryQueue::new());
  let keys = QueueKeys::new("policy-crash");
  for i in 0..5 {
    let payload = JobPayload::new("monitor").with_param("n", i).encode().unwrap();
    backend.seed(&keys, QueueList::Running, &payload).await;
  }

  let pool = Arc::new(WorkerPool::new(
    options("policy-crash"),
    Arc::clone(&backend) as Arc<dyn QueueBackend>,
  ));
  let counter = Arc::new(AtomicUsize::new(0));
  pool.register_handler("monitor", counting_handler(Arc::clone(&counter), false));

  let (token, handle) = start(&pool);
  wait_for_count(&counter, 5).await;
  let stats = wait_for_stats(&pool, |s| s.running == 0).await;
  stop(token, handle).await;

  assert_eq!(stats, QueueStats::default());
  assert_eq!(counter.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_panicking_handler_is_retried_like_a_failure() {
  let backend = Arc::new(MemoryQueue::new());
  let pool = Arc::new(WorkerPool::new(options("policy-panic"), backend));
  let attempts = Arc::new(AtomicUsize::new(0));
  let seen = Arc::clone(&attempts);
  pool.register_handler(
    "explode",
    Arc::new(HandlerFunc::new(move |_params: JobParams| -> policy_worker::Result<()> {
      seen.fetch_add(1, Ordering::SeqCst);
      panic!("parser bug")
    })),
  );

  pool
    .submit(&JobPayload::new("explode").with_max_retries(1))
    .await
    .unwrap();

  let (token, handle) = start(&pool);
  wait_for_stats(&pool, |s| s.dead_letter == 1).await;
  stop(token, handle).await;

  assert_eq!(attempts.load(Ordering::SeqCst), 2);
  let dead = pool.jobs_in(QueueList::DeadLetter).await.unwrap();
  assert_eq!(dead[0].retry_count, 1);
}

#[tokio::test]
async fn test_timed_out_job_is_dead_lettered_without_retries() {
  let backend = Arc::new(MemoryQueue::new());
  let pool = Arc::new(WorkerPool::new(options("policy-slow"), backend));
  pool.register_handler(
    "slow",
    Arc::new(AsyncHandlerFunc::new(|_params: JobParams| async {
      tokio::time::sleep(Duration::from_secs(30)).await;
      Ok(())
    })),
  );

  pool
    .submit(&JobPayload::new("slow").with_max_retries(0))
    .await
    .unwrap();

  let (token, handle) = start(&pool);
  let stats = wait_for_stats(&pool, |s| s.dead_letter == 1).await;
  stop(token, handle).await;
  assert_eq!(stats.running, 0);
}

#[tokio::test]
async fn test_unknown_job_type_consumes_retries() {
  let backend = Arc::new(MemoryQueue::new());
  let pool = Arc::new(WorkerPool::new(options("policy-unknown"), backend));

  pool
    .submit(&JobPayload::new("not-registered").with_max_retries(1))
    .await
    .unwrap();

  let (token, handle) = start(&pool);
  wait_for_stats(&pool, |s| s.dead_letter == 1).await;
  stop(token, handle).await;

  let dead = pool.jobs_in(QueueList::DeadLetter).await.unwrap();
  assert_eq!(dead[0].job_type, "not-registered");
  assert_eq!(dead[0].retry_count, 1);
}

#[tokio::test]
async fn test_undecodable_payload_is_dead_lettered_raw() {
  let backend = Arc::new(MemoryQueue::new());
  let pool = Arc::new(WorkerPool::new(
    options("policy-garbage"),
    Arc::clone(&backend) as Arc<dyn QueueBackend>,
  ));
  backend
    .push_pending(pool.keys(), "{not json")
    .await
    .unwrap();

  let (token, handle) = start(&pool);
  wait_for_stats(&pool, |s| s.dead_letter == 1).await;
  stop(token, handle).await;

  let raw = backend.list(pool.keys(), QueueList::DeadLetter).await.unwrap();
  assert_eq!(raw, vec!["{not json".to_string()]);
}

#[tokio::test]
async fn test_tenants_never_share_queues() {
  let backend: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::new());
  let healthy = Arc::new(WorkerPool::new(options("policy-a"), Arc::clone(&backend)));
  let broken = Arc::new(WorkerPool::new(options("policy-b"), Arc::clone(&backend)));
  let healthy_runs = Arc::new(AtomicUsize::new(0));
  healthy.register_handler("monitor", counting_handler(Arc::clone(&healthy_runs), false));
  broken.register_handler("monitor", counting_handler(Arc::new(AtomicUsize::new(0)), true));

  for _ in 0..3 {
    healthy.submit(&JobPayload::new("monitor")).await.unwrap();
    broken
      .submit(&JobPayload::new("monitor").with_max_retries(0))
      .await
      .unwrap();
  }

  let (healthy_token, healthy_handle) = start(&healthy);
  let (broken_token, broken_handle) = start(&broken);
  wait_for_stats(&broken, |s| s.dead_letter == 3).await;
  wait_for_count(&healthy_runs, 3).await;
  stop(broken_token, broken_handle).await;
  stop(healthy_token, healthy_handle).await;

  assert_eq!(healthy.queue_stats().await.unwrap(), QueueStats::default());
  assert_eq!(healthy_runs.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_daily_quota_leaves_excess_jobs_pending() {
  let backend = Arc::new(MemoryQueue::new());
  let pool = Arc::new(WorkerPool::new(options("policy-quota").daily_quota(Some(2)), backend));
  let counter = Arc::new(AtomicUsize::new(0));
  pool.register_handler("monitor", counting_handler(Arc::clone(&counter), false));
  for i in 0..5 {
    pool
      .submit(&JobPayload::new("monitor").with_param("n", i))
      .await
      .unwrap();
  }

  let (token, handle) = start(&pool);
  wait_for_count(&counter, 2).await;
  let stats = wait_for_stats(&pool, |s| s.pending == 3 && s.running == 0).await;
  stop(token, handle).await;

  assert_eq!(stats.dead_letter, 0);
  assert_eq!(counter.load(Ordering::SeqCst), 2);
  for job in pool.jobs_in(QueueList::Pending).await.unwrap() {
    assert_eq!(job.retry_count, 0);
  }
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_spaces_out_dispatch() {
  let backend = Arc::new(MemoryQueue::new());
  let limit = RateLimit::new(1.0, 1).unwrap();
  let pool = Arc::new(WorkerPool::new(
    options("policy-rate").rate_limit(Some(limit)),
    backend,
  ));
  let started_at = Arc::new(std::sync::Mutex::new(Vec::new()));
  {
    let started_at = Arc::clone(&started_at);
    pool.register_handler(
      "monitor",
      Arc::new(HandlerFunc::new(move |_params: JobParams| {
        started_at
          .lock()
          .unwrap()
          .push(tokio::time::Instant::now());
        Ok(())
      })),
    );
  }
  for _ in 0..3 {
    pool.submit(&JobPayload::new("monitor")).await.unwrap();
  }

  let (token, handle) = start(&pool);
  wait_for_stats(&pool, |s| s.pending == 0 && s.running == 0).await;
  stop(token, handle).await;

  let mut times = started_at.lock().unwrap().clone();
  times.sort();
  assert_eq!(times.len(), 3);
  assert!(times[2] - times[0] >= Duration::from_secs(2));
}

#[tokio::test]
async fn test_execution_audit_records_outcomes() {
  let tenant = TenantId::new();
  let store = Arc::new(MemoryStateStore::new());
  let backend = Arc::new(MemoryQueue::new());
  let audit_store: Arc<dyn StateStore> = Arc::clone(&store) as Arc<dyn StateStore>;
  let pool = Arc::new(
    WorkerPool::new(options("policy-audit"), backend).with_execution_recorder(tenant, audit_store),
  );
  pool.register_handler(
    "check",
    Arc::new(HandlerFunc::new(|params: JobParams| {
      if params.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
        Ok(())
      } else {
        Err(Error::handler("check failed"))
      }
    })),
  );

  pool
    .submit(&JobPayload::new("check").with_param("ok", true))
    .await
    .unwrap();
  pool
    .submit(&JobPayload::new("check").with_param("ok", false).with_max_retries(0))
    .await
    .unwrap();

  let (token, handle) = start(&pool);
  wait_for_stats(&pool, |s| s.dead_letter == 1 && s.pending == 0 && s.running == 0).await;

  let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
  let executions = loop {
    let executions = store.list_job_executions(tenant, 10).await.unwrap();
    if executions.len() == 2 && executions.iter().all(|e| e.completed_at.is_some()) {
      break executions;
    }
    assert!(tokio::time::Instant::now() < deadline, "executions not finished: {executions:?}");
    tokio::time::sleep(Duration::from_millis(10)).await;
  };
  stop(token, handle).await;

  let mut statuses: Vec<JobStatus> = executions.iter().map(|e| e.status).collect();
  statuses.sort_by_key(|s| s.as_str());
  assert_eq!(statuses, vec![JobStatus::Completed, JobStatus::Failed]);
  let failed = executions
    .iter()
    .find(|e| e.status == JobStatus::Failed)
    .unwrap();
  assert_eq!(failed.error_message.as_deref(), Some("failed: Job handler error: check failed"));
}
