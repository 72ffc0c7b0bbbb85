//! 令牌桶限流
//! Token bucket rate limiting
//!
//! 工作池在执行每个任务前从桶中取一个令牌，用来保护外部监控接口。
//! 令牌按固定速率补充，容量即突发上限。
//! A pool takes one token before running each job, shielding the external monitoring API.
//! Tokens refill at a fixed rate and the capacity is the burst size.

use crate::error::{Error, Result};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 限流参数
/// Rate limit parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
  per_second: f64,
  burst: u32,
}

impl RateLimit {
  /// 每秒补充 `per_second` 个令牌，最多累积 `burst` 个
  /// Refill `per_second` tokens each second, holding at most `burst`
  pub fn new(per_second: f64, burst: u32) -> Result<Self> {
    if !per_second.is_finite() || per_second <= 0.0 {
      return Err(Error::config("rate limit must be a positive number of calls per second"));
    }
    if burst == 0 {
      return Err(Error::config("rate limit burst must be greater than 0"));
    }
    Ok(Self { per_second, burst })
  }

  pub fn per_second(&self) -> f64 {
    self.per_second
  }

  pub fn burst(&self) -> u32 {
    self.burst
  }
}

#[derive(Debug)]
struct BucketState {
  tokens: f64,
  last_update: Instant,
}

/// 令牌桶，一个池的所有工作者共享
/// Token bucket shared by every worker of a pool
#[derive(Debug)]
pub struct TokenBucket {
  limit: RateLimit,
  state: Mutex<BucketState>,
}

impl TokenBucket {
  /// 创建满桶
  /// Create a full bucket
  pub fn new(limit: RateLimit) -> Self {
    Self {
      limit,
      state: Mutex::new(BucketState {
        tokens: f64::from(limit.burst),
        last_update: Instant::now(),
      }),
    }
  }

  pub fn limit(&self) -> RateLimit {
    self.limit
  }

  /// 立即尝试取一个令牌，失败时返回还需等待的时间
  /// Try to take a token right now, returning how long to wait when none is left
  async fn try_take(&self) -> std::result::Result<(), Duration> {
    let mut state = self.state.lock().await;
    let now = Instant::now();
    let elapsed = now.duration_since(state.last_update).as_secs_f64();
    state.tokens = (state.tokens + elapsed * self.limit.per_second).min(f64::from(self.limit.burst));
    state.last_update = now;

    if state.tokens >= 1.0 {
      state.tokens -= 1.0;
      Ok(())
    } else {
      Err(Duration::from_secs_f64(
        (1.0 - state.tokens) / self.limit.per_second,
      ))
    }
  }

  /// 等待并取得一个令牌；令牌被取消时返回 `Error::Cancelled`
  /// Wait for and take one token; returns `Error::Cancelled` when the token is cancelled
  pub async fn acquire(&self, token: &CancellationToken) -> Result<()> {
    loop {
      let wait = match self.try_take().await {
        Ok(()) => return Ok(()),
        Err(wait) => wait,
      };
      tokio::select! {
        biased;
        _ = token.cancelled() => return Err(Error::Cancelled),
        _ = tokio::time::sleep(wait) => {}
      }
    }
  }
}
