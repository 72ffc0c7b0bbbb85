//! 内存队列实现
//! Memory queue implementation
//!
//! 使用内存列表模拟 Redis 列表语义（LPUSH 入头，RPOP 出尾），不依赖任何外部服务
//! Mimics Redis list semantics (LPUSH at the head, RPOP at the tail) in memory, without external services

use crate::base::keys::{QueueKeys, QueueList};
use crate::error::Result;
use crate::queue::QueueBackend;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// 内存队列后端
/// In-memory queue backend
#[derive(Default)]
pub struct MemoryQueue {
  lists: Mutex<HashMap<String, VecDeque<String>>>,
  /// 每个队列前缀当天的配额计数
  /// Quota count of the current day, per queue prefix
  quotas: Mutex<HashMap<String, (NaiveDate, u64)>>,
  notify: Notify,
}

impl MemoryQueue {
  pub fn new() -> Self {
    Self::default()
  }

  /// 直接向指定列表头部写入负载，用于模拟崩溃后残留的状态
  /// Push a payload straight onto the head of a list, used to simulate state left behind by a crash
  pub async fn seed(&self, keys: &QueueKeys, list: QueueList, payload: &str) {
    let mut lists = self.lists.lock().await;
    lists
      .entry(keys.key(list).to_string())
      .or_default()
      .push_front(payload.to_string());
    drop(lists);
    if list == QueueList::Pending {
      self.notify.notify_waiters();
    }
  }

  async fn try_move(&self, keys: &QueueKeys) -> Option<String> {
    let mut lists = self.lists.lock().await;
    let item = lists.get_mut(keys.pending())?.pop_back()?;
    lists
      .entry(keys.running().to_string())
      .or_default()
      .push_front(item.clone());
    Some(item)
  }
}

fn remove_first(list: Option<&mut VecDeque<String>>, payload: &str) -> bool {
  let Some(list) = list else {
    return false;
  };
  match list.iter().position(|item| item == payload) {
    Some(index) => {
      list.remove(index);
      true
    }
    None => false,
  }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
  async fn push_pending(&self, keys: &QueueKeys, payload: &str) -> Result<()> {
    self.seed(keys, QueueList::Pending, payload).await;
    Ok(())
  }

  async fn dequeue(&self, keys: &QueueKeys, timeout: Duration) -> Result<Option<String>> {
    let deadline = Instant::now() + timeout;
    loop {
      let notified = self.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if let Some(item) = self.try_move(keys).await {
        return Ok(Some(item));
      }
      if tokio::time::timeout_at(deadline, notified).await.is_err() {
        return Ok(None);
      }
    }
  }

  async fn requeue_stale(&self, keys: &QueueKeys) -> Result<usize> {
    let mut lists = self.lists.lock().await;
    let mut moved = Vec::new();
    if let Some(running) = lists.get_mut(keys.running()) {
      while let Some(item) = running.pop_back() {
        moved.push(item);
      }
    }
    let count = moved.len();
    let pending = lists.entry(keys.pending().to_string()).or_default();
    for item in moved {
      pending.push_front(item);
    }
    drop(lists);
    if count > 0 {
      self.notify.notify_waiters();
    }
    Ok(count)
  }

  async fn complete(&self, keys: &QueueKeys, payload: &str) -> Result<bool> {
    let mut lists = self.lists.lock().await;
    Ok(remove_first(lists.get_mut(keys.running()), payload))
  }

  async fn retry(&self, keys: &QueueKeys, payload: &str, next_payload: &str) -> Result<bool> {
    let mut lists = self.lists.lock().await;
    if !remove_first(lists.get_mut(keys.running()), payload) {
      return Ok(false);
    }
    lists
      .entry(keys.pending().to_string())
      .or_default()
      .push_front(next_payload.to_string());
    drop(lists);
    self.notify.notify_waiters();
    Ok(true)
  }

  async fn dead_letter(&self, keys: &QueueKeys, payload: &str) -> Result<bool> {
    let mut lists = self.lists.lock().await;
    if !remove_first(lists.get_mut(keys.running()), payload) {
      return Ok(false);
    }
    lists
      .entry(keys.dead_letter().to_string())
      .or_default()
      .push_front(payload.to_string());
    Ok(true)
  }

  async fn len(&self, keys: &QueueKeys, list: QueueList) -> Result<usize> {
    let lists = self.lists.lock().await;
    Ok(lists.get(keys.key(list)).map_or(0, VecDeque::len))
  }

  async fn list(&self, keys: &QueueKeys, list: QueueList) -> Result<Vec<String>> {
    let lists = self.lists.lock().await;
    Ok(
      lists
        .get(keys.key(list))
        .map(|items| items.iter().cloned().collect())
        .unwrap_or_default(),
    )
  }

  async fn consume_quota(&self, keys: &QueueKeys, limit: u64, now: DateTime<Utc>) -> Result<bool> {
    let today = now.date_naive();
    let mut quotas = self.quotas.lock().await;
    let entry = quotas
      .entry(keys.prefix().to_string())
      .or_insert((today, 0));
    if entry.0 != today {
      *entry = (today, 0);
    }
    entry.1 += 1;
    Ok(entry.1 <= limit)
  }

  async fn purge(&self, keys: &QueueKeys) -> Result<()> {
    let mut lists = self.lists.lock().await;
    lists.remove(keys.pending());
    lists.remove(keys.running());
    lists.remove(keys.dead_letter());
    Ok(())
  }
}
