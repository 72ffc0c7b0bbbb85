//! SeaORM 实体模块
//! SeaORM entity module
//!
//! 定义了与 PostgreSQL 表对应的实体模型
//! Defines entity models corresponding to PostgreSQL tables

pub mod prelude;
pub mod worker_job_execution;
pub mod worker_pool_state;
pub mod worker_scheduler_state;

pub use prelude::*;
