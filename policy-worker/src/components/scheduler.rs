//! 调度器模块
//! Scheduler module
//!
//! 按固定间隔将注册的任务提交给工作池。每次提交的是带新 job_id 的副本，
//! 一次性任务在成功提交后从注册表中移除。
//! Submits the registered jobs to a pool on a fixed interval. Every submission is a copy
//! with a fresh job_id; one-time jobs leave the registry once they were submitted.

use crate::base::constants::DEFAULT_SUBMIT_TIMEOUT;
use crate::base::TenantId;
use crate::components::JobSubmitter;
use crate::error::{Error, Result};
use crate::job::JobPayload;
use crate::persistence::{StateRepository, StateStore};
use chrono::{TimeDelta, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct RunRecorder {
  tenant_id: TenantId,
  store: Arc<dyn StateStore>,
}

/// 租户任务调度器
/// Tenant job scheduler
pub struct JobScheduler {
  name: String,
  interval: Duration,
  submit_timeout: Duration,
  submitter: Arc<dyn JobSubmitter>,
  jobs: Mutex<Vec<JobPayload>>,
  wake: Notify,
  current: StdMutex<Option<CancellationToken>>,
  recorder: Option<RunRecorder>,
}

impl JobScheduler {
  /// 创建调度器，间隔必须大于零
  /// Create a scheduler; the interval must be greater than zero
  pub fn new<S: Into<String>>(
    name: S,
    interval: Duration,
    submitter: Arc<dyn JobSubmitter>,
  ) -> Result<Self> {
    if interval.is_zero() {
      return Err(Error::config("scheduler interval must be greater than zero"));
    }
    Ok(Self {
      name: name.into(),
      interval,
      submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
      submitter,
      jobs: Mutex::new(Vec::new()),
      wake: Notify::new(),
      current: StdMutex::new(None),
      recorder: None,
    })
  }

  pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
    self.submit_timeout = timeout;
    self
  }

  /// 每次调度后更新持久化的运行统计
  /// Update the persisted run statistics after every tick
  pub fn with_run_recorder(mut self, tenant_id: TenantId, store: Arc<dyn StateStore>) -> Self {
    self.recorder = Some(RunRecorder { tenant_id, store });
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }

  /// 注册任务；设置了 run_now 的任务会在调度器运行时立即提交
  /// Register a job; a job flagged run_now is submitted right away once the scheduler runs
  pub async fn add_job(&self, job: JobPayload) {
    let run_now = job.run_now;
    debug!(scheduler = %self.name, job_id = %job.job_id, job_type = %job.job_type, one_time = job.one_time, "Job registered");
    self.jobs.lock().await.push(job);
    if run_now {
      self.wake.notify_one();
    }
  }

  /// 当前注册的任务
  /// Currently registered jobs
  pub async fn jobs(&self) -> Vec<JobPayload> {
    self.jobs.lock().await.clone()
  }

  pub async fn remove_job(&self, job_id: &str) -> bool {
    let mut jobs = self.jobs.lock().await;
    let before = jobs.len();
    jobs.retain(|job| job.job_id != job_id);
    jobs.len() != before
  }

  /// 运行调度循环，直到令牌或 [`JobScheduler::stop`] 取消
  /// Run the scheduling loop until the token is cancelled or [`JobScheduler::stop`] is called
  ///
  /// 第一次调度发生在启动后一个间隔
  /// The first tick fires one interval after start
  pub async fn run(self: Arc<Self>, token: CancellationToken) {
    let token = token.child_token();
    *self
      .current
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token.clone());

    info!(scheduler = %self.name, interval = ?self.interval, "Scheduler started");
    self.submit_run_now().await;

    let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        biased;
        _ = token.cancelled() => break,
        _ = ticker.tick() => {
          self.tick().await;
        }
        _ = self.wake.notified() => {
          self.submit_run_now().await;
        }
      }
    }

    info!(scheduler = %self.name, "Scheduler stopped");
  }

  /// 停止正在运行的调度循环，不影响已提交的任务
  /// Stop the running loop; jobs already submitted are unaffected
  pub fn stop(&self) {
    if let Some(token) = self
      .current
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .take()
    {
      token.cancel();
    }
  }

  /// 执行一次调度，返回成功提交的任务数
  /// Perform one tick and return how many jobs were submitted
  pub async fn tick(&self) -> usize {
    let snapshot = self.jobs.lock().await.clone();
    let mut submitted = HashSet::new();
    for job in &snapshot {
      if self.submit_one(job).await {
        submitted.insert(job.job_id.clone());
      }
    }

    self.drop_submitted_one_time(&snapshot, &submitted).await;

    if submitted.len() < snapshot.len() {
      warn!(
        scheduler = %self.name,
        submitted = submitted.len(),
        total = snapshot.len(),
        "Some jobs were not submitted this tick"
      );
    } else {
      debug!(scheduler = %self.name, submitted = submitted.len(), "Tick finished");
    }

    self.record_run().await;
    submitted.len()
  }

  async fn submit_run_now(&self) {
    let due: Vec<JobPayload> = {
      let mut jobs = self.jobs.lock().await;
      jobs
        .iter_mut()
        .filter(|job| job.run_now)
        .map(|job| {
          job.run_now = false;
          job.clone()
        })
        .collect()
    };
    if due.is_empty() {
      return;
    }

    let mut submitted = HashSet::new();
    for job in &due {
      if self.submit_one(job).await {
        submitted.insert(job.job_id.clone());
      }
    }
    info!(scheduler = %self.name, submitted = submitted.len(), "Submitted run-now jobs");
    self.drop_submitted_one_time(&due, &submitted).await;
  }

  async fn drop_submitted_one_time(&self, snapshot: &[JobPayload], submitted: &HashSet<String>) {
    let finished: HashSet<&str> = snapshot
      .iter()
      .filter(|job| job.one_time && submitted.contains(&job.job_id))
      .map(|job| job.job_id.as_str())
      .collect();
    if finished.is_empty() {
      return;
    }
    self
      .jobs
      .lock()
      .await
      .retain(|job| !finished.contains(job.job_id.as_str()));
  }

  async fn submit_one(&self, job: &JobPayload) -> bool {
    match self.submit_instance(job.fresh_instance()).await {
      Ok(()) => true,
      Err(err) => {
        error!(scheduler = %self.name, job_id = %job.job_id, job_type = %job.job_type, error = %err, "Failed to submit job");
        false
      }
    }
  }

  /// 在提交超时内提交一个实例，超时返回 `Error::Timeout`
  /// Submit one instance within the submit timeout, `Error::Timeout` when it elapses
  async fn submit_instance(&self, instance: JobPayload) -> Result<()> {
    tokio::time::timeout(self.submit_timeout, self.submitter.submit(instance))
      .await
      .map_err(|_| Error::Timeout(self.submit_timeout))?
  }

  async fn record_run(&self) {
    let Some(recorder) = &self.recorder else {
      return;
    };
    let ran_at = Utc::now();
    let next_run_at = TimeDelta::from_std(self.interval)
      .ok()
      .and_then(|delta| ran_at.checked_add_signed(delta))
      .unwrap_or(ran_at);
    if let Err(err) = recorder
      .store
      .record_scheduler_run(recorder.tenant_id, ran_at, next_run_at)
      .await
    {
      warn!(scheduler = %self.name, error = %err, "Failed to record scheduler run");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicBool, Ordering};

  #[derive(Default)]
  struct RecordingSubmitter {
    submitted: Mutex<Vec<JobPayload>>,
    failing: AtomicBool,
  }

  #[async_trait]
  impl JobSubmitter for RecordingSubmitter {
    async fn submit(&self, job: JobPayload) -> Result<()> {
      if self.failing.load(Ordering::SeqCst) {
        return Err(Error::other("queue unreachable"));
      }
      self.submitted.lock().await.push(job);
      Ok(())
    }
  }

  struct StalledSubmitter;

  #[async_trait]
  impl JobSubmitter for StalledSubmitter {
    async fn submit(&self, _job: JobPayload) -> Result<()> {
      futures::future::pending::<()>().await;
      Ok(())
    }
  }

  fn scheduler(submitter: Arc<RecordingSubmitter>) -> JobScheduler {
    JobScheduler::new("test-scheduler", Duration::from_secs(60), submitter).unwrap()
  }

  #[test]
  fn test_zero_interval_rejected() {
    let submitter = Arc::new(RecordingSubmitter::default());
    assert!(JobScheduler::new("s", Duration::ZERO, submitter).is_err());
  }

  #[tokio::test]
  async fn test_tick_submits_fresh_instances() {
    let submitter = Arc::new(RecordingSubmitter::default());
    let scheduler = scheduler(Arc::clone(&submitter));
    let job = JobPayload::new("monitor").with_param("farm_id", "f1");
    scheduler.add_job(job.clone()).await;

    assert_eq!(scheduler.tick().await, 1);
    assert_eq!(scheduler.tick().await, 1);

    let submitted = submitter.submitted.lock().await;
    assert_eq!(submitted.len(), 2);
    assert_ne!(submitted[0].job_id, job.job_id);
    assert_ne!(submitted[0].job_id, submitted[1].job_id);
    assert_eq!(submitted[0].params, job.params);
    assert_eq!(scheduler.jobs().await, vec![job]);
  }

  #[tokio::test]
  async fn test_one_time_job_kept_when_submit_fails() {
    let submitter = Arc::new(RecordingSubmitter::default());
    submitter.failing.store(true, Ordering::SeqCst);
    let scheduler = scheduler(Arc::clone(&submitter));
    scheduler
      .add_job(JobPayload::new("once").with_one_time(true))
      .await;

    assert_eq!(scheduler.tick().await, 0);
    assert_eq!(scheduler.jobs().await.len(), 1);

    submitter.failing.store(false, Ordering::SeqCst);
    assert_eq!(scheduler.tick().await, 1);
    assert!(scheduler.jobs().await.is_empty());
    assert_eq!(scheduler.tick().await, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stalled_submit_times_out() {
    let scheduler = JobScheduler::new("stalled", Duration::from_secs(60), Arc::new(StalledSubmitter))
      .unwrap()
      .with_submit_timeout(Duration::from_secs(2));
    let err = scheduler
      .submit_instance(JobPayload::new("monitor"))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Timeout(d) if d == Duration::from_secs(2)));

    scheduler
      .add_job(JobPayload::new("once").with_one_time(true))
      .await;
    assert_eq!(scheduler.tick().await, 0);
    assert_eq!(scheduler.jobs().await.len(), 1);
  }

  #[tokio::test]
  async fn test_remove_job() {
    let scheduler = scheduler(Arc::new(RecordingSubmitter::default()));
    let job = JobPayload::new("monitor");
    scheduler.add_job(job.clone()).await;
    assert!(scheduler.remove_job(&job.job_id).await);
    assert!(!scheduler.remove_job(&job.job_id).await);
  }

  #[tokio::test(start_paused = true)]
  async fn test_run_ticks_on_interval_and_stops() {
    let submitter = Arc::new(RecordingSubmitter::default());
    let scheduler = Arc::new(scheduler(Arc::clone(&submitter)));
    scheduler.add_job(JobPayload::new("recurring")).await;
    scheduler
      .add_job(JobPayload::new("once").with_one_time(true))
      .await;

    let handle = tokio::spawn(Arc::clone(&scheduler).run(CancellationToken::new()));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(submitter.submitted.lock().await.is_empty());

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(submitter.submitted.lock().await.len(), 2);

    tokio::time::sleep(Duration::from_secs(60)).await;
    let types: Vec<String> = submitter
      .submitted
      .lock()
      .await
      .iter()
      .map(|job| job.job_type.clone())
      .collect();
    assert_eq!(types, vec!["recurring", "once", "recurring"]);

    scheduler.stop();
    handle.await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_run_now_submits_immediately() {
    let submitter = Arc::new(RecordingSubmitter::default());
    let scheduler = Arc::new(scheduler(Arc::clone(&submitter)));
    let token = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&scheduler).run(token.clone()));
    tokio::task::yield_now().await;

    scheduler
      .add_job(JobPayload::new("urgent").with_run_now(true).with_one_time(true))
      .await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(submitter.submitted.lock().await.len(), 1);
    assert!(scheduler.jobs().await.is_empty());

    token.cancel();
    handle.await.unwrap();
  }
}
