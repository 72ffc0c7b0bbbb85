//! 任务执行记录实体
//! Job execution record entity

use sea_orm::entity::prelude::*;

/// 任务执行记录，仅作审计用途
/// Job execution record, kept as an audit trail
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "worker_job_execution")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub id: Uuid,
  pub tenant_id: Uuid,
  pub job_id: String,
  pub job_type: String,
  pub status: String,
  pub retry_count: i32,
  pub max_retries: i32,
  pub started_at: Option<DateTimeWithTimeZone>,
  pub completed_at: Option<DateTimeWithTimeZone>,
  #[sea_orm(column_type = "Text", nullable)]
  pub error_message: Option<String>,
  #[sea_orm(column_type = "JsonBinary", nullable)]
  pub result_summary: Option<Json>,
  pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
  #[sea_orm(
    belongs_to = "super::worker_pool_state::Entity",
    from = "Column::TenantId",
    to = "super::worker_pool_state::Column::TenantId",
    on_delete = "Cascade"
  )]
  WorkerPoolState,
}

impl Related<super::worker_pool_state::Entity> for Entity {
  fn to() -> RelationDef {
    Relation::WorkerPoolState.def()
  }
}

impl ActiveModelBehavior for ActiveModel {}
