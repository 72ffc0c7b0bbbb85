//! 预导入模块
//! Prelude module

pub use super::worker_job_execution::Entity as WorkerJobExecution;
pub use super::worker_pool_state::Entity as WorkerPoolState;
pub use super::worker_scheduler_state::Entity as WorkerSchedulerState;
