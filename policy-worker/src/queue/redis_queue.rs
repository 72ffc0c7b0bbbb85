//! Redis 队列实现
//! Redis queue implementation
//!
//! 普通命令共享一个多路复用连接；阻塞的 BLMOVE 独占一个连接，
//! 用完后放回空闲列表。
//! Regular commands share one multiplexed connection. Each blocking BLMOVE
//! takes a dedicated connection and returns it to a free list afterwards.

use crate::base::keys::{QueueKeys, QueueList};
use crate::config::RedisConfig;
use crate::error::Result;
use crate::queue::redis_scripts;
use crate::queue::{next_utc_midnight, QueueBackend};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, IntoConnectionInfo, Script};
use std::time::Duration;
use tokio::sync::Mutex;

/// 基于 Redis 列表的队列后端
/// Queue backend built on Redis lists
pub struct RedisQueue {
  client: Client,
  conn: MultiplexedConnection,
  blocking: Mutex<Vec<MultiplexedConnection>>,
  retry_script: Script,
  dead_letter_script: Script,
  requeue_stale_script: Script,
  quota_script: Script,
}

impl RedisQueue {
  /// 连接 Redis 并创建队列后端
  /// Connect to Redis and create the queue backend
  pub async fn connect<T: IntoConnectionInfo>(info: T) -> Result<Self> {
    let client = Client::open(info)?;
    let conn = client.get_multiplexed_async_connection().await?;
    Ok(Self {
      client,
      conn,
      blocking: Mutex::new(Vec::new()),
      retry_script: Script::new(redis_scripts::RETRY),
      dead_letter_script: Script::new(redis_scripts::DEAD_LETTER),
      requeue_stale_script: Script::new(redis_scripts::REQUEUE_STALE),
      quota_script: Script::new(redis_scripts::CONSUME_QUOTA),
    })
  }

  pub async fn from_config(config: &RedisConfig) -> Result<Self> {
    Self::connect(config.url()).await
  }

  /// Ping Redis 连接
  /// Ping the Redis connection
  pub async fn ping(&self) -> Result<()> {
    let mut conn = self.conn.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
  }

  async fn acquire_blocking(&self) -> Result<MultiplexedConnection> {
    if let Some(conn) = self.blocking.lock().await.pop() {
      return Ok(conn);
    }
    Ok(self.client.get_multiplexed_async_connection().await?)
  }

  async fn release_blocking(&self, conn: MultiplexedConnection) {
    self.blocking.lock().await.push(conn);
  }
}

#[async_trait]
impl QueueBackend for RedisQueue {
  async fn push_pending(&self, keys: &QueueKeys, payload: &str) -> Result<()> {
    let mut conn = self.conn.clone();
    let _: i64 = conn.lpush(keys.pending(), payload).await?;
    Ok(())
  }

  async fn dequeue(&self, keys: &QueueKeys, timeout: Duration) -> Result<Option<String>> {
    // 若调用方在等待中途放弃，这个连接随 future 一起被丢弃，不会回到空闲列表
    let mut conn = self.acquire_blocking().await?;
    let item: Option<String> = redis::cmd("BLMOVE")
      .arg(keys.pending())
      .arg(keys.running())
      .arg("RIGHT")
      .arg("LEFT")
      .arg(timeout.as_secs_f64())
      .query_async(&mut conn)
      .await?;
    self.release_blocking(conn).await;
    Ok(item)
  }

  async fn requeue_stale(&self, keys: &QueueKeys) -> Result<usize> {
    let mut conn = self.conn.clone();
    let moved: usize = self
      .requeue_stale_script
      .key(keys.running())
      .key(keys.pending())
      .invoke_async(&mut conn)
      .await?;
    Ok(moved)
  }

  async fn complete(&self, keys: &QueueKeys, payload: &str) -> Result<bool> {
    let mut conn = self.conn.clone();
    let removed: i64 = conn.lrem(keys.running(), 1, payload).await?;
    Ok(removed > 0)
  }

  async fn retry(&self, keys: &QueueKeys, payload: &str, next_payload: &str) -> Result<bool> {
    let mut conn = self.conn.clone();
    let removed: i64 = self
      .retry_script
      .key(keys.running())
      .key(keys.pending())
      .arg(payload)
      .arg(next_payload)
      .invoke_async(&mut conn)
      .await?;
    Ok(removed > 0)
  }

  async fn dead_letter(&self, keys: &QueueKeys, payload: &str) -> Result<bool> {
    let mut conn = self.conn.clone();
    let removed: i64 = self
      .dead_letter_script
      .key(keys.running())
      .key(keys.dead_letter())
      .arg(payload)
      .invoke_async(&mut conn)
      .await?;
    Ok(removed > 0)
  }

  async fn len(&self, keys: &QueueKeys, list: QueueList) -> Result<usize> {
    let mut conn = self.conn.clone();
    let len: usize = conn.llen(keys.key(list)).await?;
    Ok(len)
  }

  async fn list(&self, keys: &QueueKeys, list: QueueList) -> Result<Vec<String>> {
    let mut conn = self.conn.clone();
    let items: Vec<String> = conn.lrange(keys.key(list), 0, -1).await?;
    Ok(items)
  }

  async fn consume_quota(&self, keys: &QueueKeys, limit: u64, now: DateTime<Utc>) -> Result<bool> {
    let mut conn = self.conn.clone();
    let count: u64 = self
      .quota_script
      .key(keys.quota(now.date_naive()))
      .arg(next_utc_midnight(now).timestamp())
      .invoke_async(&mut conn)
      .await?;
    Ok(count <= limit)
  }

  async fn purge(&self, keys: &QueueKeys) -> Result<()> {
    let mut conn = self.conn.clone();
    let _: i64 = conn
      .del(vec![keys.pending(), keys.running(), keys.dead_letter()])
      .await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::QueueStats;
  use uuid::Uuid;

  fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
  }

  #[tokio::test]
  #[ignore = "requires a running Redis"]
  async fn test_redis_queue_protocol() {
    let queue = RedisQueue::connect(redis_url()).await.unwrap();
    queue.ping().await.unwrap();
    let keys = QueueKeys::new(format!("policy-test-{}", Uuid::new_v4()));

    queue.push_pending(&keys, "a").await.unwrap();
    queue.push_pending(&keys, "b").await.unwrap();
    let first = queue.dequeue(&keys, Duration::from_secs(1)).await.unwrap();
    assert_eq!(first.as_deref(), Some("a"));

    assert!(queue.retry(&keys, "a", "a2").await.unwrap());
    assert!(!queue.retry(&keys, "a", "a3").await.unwrap());
    let second = queue.dequeue(&keys, Duration::from_secs(1)).await.unwrap();
    assert_eq!(second.as_deref(), Some("b"));
    assert!(queue.dead_letter(&keys, "b").await.unwrap());

    let stats = queue.stats(&keys).await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.running, 0);
    assert_eq!(stats.dead_letter, 1);

    queue.purge(&keys).await.unwrap();
    assert_eq!(queue.stats(&keys).await.unwrap(), QueueStats::default());
  }

  #[tokio::test]
  #[ignore = "requires a running Redis"]
  async fn test_redis_requeue_stale() {
    let queue = RedisQueue::connect(redis_url()).await.unwrap();
    let keys = QueueKeys::new(format!("policy-test-{}", Uuid::new_v4()));
    for i in 0..5 {
      queue.push_pending(&keys, &format!("job-{i}")).await.unwrap();
      queue.dequeue(&keys, Duration::from_secs(1)).await.unwrap();
    }
    assert_eq!(queue.len(&keys, QueueList::Running).await.unwrap(), 5);
    assert_eq!(queue.requeue_stale(&keys).await.unwrap(), 5);
    assert_eq!(queue.len(&keys, QueueList::Running).await.unwrap(), 0);
    assert_eq!(queue.len(&keys, QueueList::Pending).await.unwrap(), 5);
    queue.purge(&keys).await.unwrap();
  }

  #[tokio::test]
  #[ignore = "requires a running Redis"]
  async fn test_redis_daily_quota() {
    let queue = RedisQueue::connect(redis_url()).await.unwrap();
    let keys = QueueKeys::new(format!("policy-test-{}", Uuid::new_v4()));
    let now = Utc::now();
    assert!(queue.consume_quota(&keys, 2, now).await.unwrap());
    assert!(queue.consume_quota(&keys, 2, now).await.unwrap());
    assert!(!queue.consume_quota(&keys, 2, now).await.unwrap());

    let mut conn = queue.conn.clone();
    let ttl: i64 = conn.ttl(keys.quota(now.date_naive())).await.unwrap();
    assert!(ttl > 0 && ttl <= 86_400, "ttl {ttl}");
    let _: i64 = conn.del(keys.quota(now.date_naive())).await.unwrap();
  }

  #[tokio::test]
  #[ignore = "requires a running Redis"]
  async fn test_redis_dequeue_times_out_empty() {
    let queue = RedisQueue::connect(redis_url()).await.unwrap();
    let keys = QueueKeys::new(format!("policy-test-{}", Uuid::new_v4()));
    let item = queue
      .dequeue(&keys, Duration::from_millis(100))
      .await
      .unwrap();
    assert!(item.is_none());
  }
}
