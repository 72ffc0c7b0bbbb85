//! PostgreSQL 状态存储
//! PostgreSQL state store
//!
//! 使用 SeaORM 持久化工作池、调度器状态与任务执行记录
//! Persists pool state, scheduler state and job executions with SeaORM

pub mod entity;
mod store;

pub use store::{SeaOrmStateStore, SeaOrmTransaction};
