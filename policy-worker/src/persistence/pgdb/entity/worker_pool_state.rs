//! 工作池状态实体
//! Worker pool state entity

use sea_orm::entity::prelude::*;

/// 工作池状态实体模型，每个租户一行
/// Worker pool state entity model, one row per tenant
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "worker_pool_state")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub tenant_id: Uuid,
  #[sea_orm(unique)]
  pub pool_name: String,
  pub queue_name_base: String,
  pub num_workers: i32,
  pub job_timeout_secs: i64,
  pub pool_status: String,
  pub created_at: DateTimeWithTimeZone,
  pub started_at: Option<DateTimeWithTimeZone>,
  pub stopped_at: Option<DateTimeWithTimeZone>,
  pub last_job_at: Option<DateTimeWithTimeZone>,
  #[sea_orm(column_type = "JsonBinary", nullable)]
  pub metadata: Option<Json>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
  #[sea_orm(has_many = "super::worker_job_execution::Entity")]
  WorkerJobExecution,
}

impl Related<super::worker_job_execution::Entity> for Entity {
  fn to() -> RelationDef {
    Relation::WorkerJobExecution.def()
  }
}

impl ActiveModelBehavior for ActiveModel {}
