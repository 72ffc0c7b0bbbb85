//! 调度器状态实体
//! Worker scheduler state entity

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "worker_scheduler_state")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub tenant_id: Uuid,
  #[sea_orm(unique)]
  pub scheduler_name: String,
  pub monitor_interval_secs: i64,
  pub monitor_frequency_unit: String,
  pub scheduler_status: String,
  pub created_at: DateTimeWithTimeZone,
  pub started_at: Option<DateTimeWithTimeZone>,
  pub stopped_at: Option<DateTimeWithTimeZone>,
  pub last_run_at: Option<DateTimeWithTimeZone>,
  pub next_run_at: Option<DateTimeWithTimeZone>,
  pub run_count: i64,
  #[sea_orm(column_type = "JsonBinary", nullable)]
  pub metadata: Option<Json>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
