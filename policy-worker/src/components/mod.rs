//! 组件模块
//! Components module
//!
//! 每个租户运行一对组件: 工作池消费队列，调度器按固定间隔向工作池提交任务
//! Each tenant runs a pair of components: the worker pool consumes the queue and the
//! scheduler feeds it on a fixed interval
//!
//! 两者都以 `run(self: Arc<Self>, token)` 的形式运行，直到令牌被取消
//! Both run as `run(self: Arc<Self>, token)` until the token is cancelled

use crate::error::Result;
use crate::job::JobPayload;
use async_trait::async_trait;

pub mod pool;
pub mod rate_limiter;
pub mod scheduler;

/// 接收任务提交的一方
/// Anything that accepts job submissions
#[async_trait]
pub trait JobSubmitter: Send + Sync {
  /// 提交任务到 pending 队列，存储不可达时返回瞬时错误
  /// Submit a job to the pending list, returning a transient error when the store is unreachable
  async fn submit(&self, job: JobPayload) -> Result<()>;
}
