//! 持久化队列模块
//! Durable queue module
//!
//! 每个租户队列由三个列表组成: pending、running、dlq。
//! Each tenant queue is made of three lists: pending, running and dlq.
//! 负载（按序列化后的字符串标识）在任意时刻恰好位于其中一个列表中，或已完成。
//! A payload (identified by its serialized string) sits in exactly one of them at any instant, or is done.

use crate::base::keys::{QueueKeys, QueueList};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod memory_queue;
pub mod redis_queue;
mod redis_scripts;

pub use memory_queue::MemoryQueue;
pub use redis_queue::RedisQueue;

/// 队列长度统计
/// Queue length statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
  pub pending: usize,
  pub running: usize,
  pub dead_letter: usize,
}

/// 队列后端特性，定义了三列表协议的原子操作
/// Queue backend trait, the atomic operations of the three-list protocol
#[async_trait]
pub trait QueueBackend: Send + Sync {
  /// 将负载追加到 pending 头部 (LPUSH)
  /// Append a payload to the head of pending (LPUSH)
  async fn push_pending(&self, keys: &QueueKeys, payload: &str) -> Result<()>;

  /// 原子地将 pending 尾部的负载移动到 running 头部，最多阻塞 `timeout`
  /// Atomically move the tail of pending to the head of running, blocking at most `timeout`
  ///
  /// 超时且没有任务时返回 `None`
  /// Returns `None` when the timeout elapses with nothing to take
  async fn dequeue(&self, keys: &QueueKeys, timeout: Duration) -> Result<Option<String>>;

  /// 将 running 中的所有负载移回 pending，返回移动数量
  /// Move every payload in running back to pending, returning how many moved
  async fn requeue_stale(&self, keys: &QueueKeys) -> Result<usize>;

  /// 从 running 删除一个负载实例，返回是否找到
  /// Remove one instance of the payload from running, returning whether it was there
  async fn complete(&self, keys: &QueueKeys, payload: &str) -> Result<bool>;

  /// 原子地从 running 删除 `payload` 并将 `next_payload` 放入 pending
  /// Atomically remove `payload` from running and push `next_payload` to pending
  ///
  /// 只有在 running 中确实删除了负载时才会推入 pending
  /// Only pushes when the payload was actually removed from running
  async fn retry(&self, keys: &QueueKeys, payload: &str, next_payload: &str) -> Result<bool>;

  /// 原子地从 running 删除负载并放入死信列表
  /// Atomically remove the payload from running and push it to the dead-letter list
  async fn dead_letter(&self, keys: &QueueKeys, payload: &str) -> Result<bool>;

  /// 列表长度
  /// Length of a list
  async fn len(&self, keys: &QueueKeys, list: QueueList) -> Result<usize>;

  /// 列表内容，从头到尾
  /// Contents of a list, head to tail
  async fn list(&self, keys: &QueueKeys, list: QueueList) -> Result<Vec<String>>;

  /// 为 `now` 所在的 UTC 日期的配额计数器加一，返回加一后是否仍未超过 `limit`
  /// Increment the quota counter of the UTC day containing `now`, returning whether it is
  /// still within `limit` afterwards
  ///
  /// 计数器在下一个 UTC 零点过期
  /// The counter expires at the next UTC midnight
  async fn consume_quota(&self, keys: &QueueKeys, limit: u64, now: DateTime<Utc>) -> Result<bool>;

  /// 删除租户的三个列表
  /// Delete the three lists of a tenant
  async fn purge(&self, keys: &QueueKeys) -> Result<()>;

  async fn stats(&self, keys: &QueueKeys) -> Result<QueueStats> {
    Ok(QueueStats {
      pending: self.len(keys, QueueList::Pending).await?,
      running: self.len(keys, QueueList::Running).await?,
      dead_letter: self.len(keys, QueueList::DeadLetter).await?,
    })
  }
}

/// `now` 之后的下一个 UTC 零点
/// The next UTC midnight after `now`
pub(crate) fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
  let tomorrow = now.date_naive().succ_opt().unwrap_or(chrono::NaiveDate::MAX);
  tomorrow.and_time(chrono::NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_next_utc_midnight() {
    let now = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 30).unwrap();
    assert_eq!(
      next_utc_midnight(now),
      Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap()
    );
    let midnight = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
    assert_eq!(
      next_utc_midnight(midnight),
      Utc.with_ymd_and_hms(2026, 5, 2, 0, 0, 0).unwrap()
    );
  }
}
