//! SeaORM 状态存储实现
//! SeaORM state store implementation
//!
//! 所有查询都写成对 `ConnectionTrait` 泛型的函数，连接与事务共用同一份实现
//! Every query is a function generic over `ConnectionTrait`, so the connection and the
//! transaction share one implementation

use crate::base::TenantId;
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::persistence::model::{
  JobExecution, LifecycleStatus, Metadata, PoolState, PoolStatus, SchedulerState, SchedulerStatus,
};
use crate::persistence::pgdb::entity::{
  worker_job_execution, worker_pool_state, worker_scheduler_state, WorkerJobExecution,
  WorkerPoolState, WorkerSchedulerState,
};
use crate::persistence::{StateRepository, StateStore, StateTransaction};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
  ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
  DatabaseTransaction, DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Schema, Set,
  SqlErr, Statement, TransactionTrait,
};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const POOL_STATE: &str = "pool state";
const SCHEDULER_STATE: &str = "scheduler state";
const JOB_EXECUTION: &str = "job execution";

const INDEX_STATEMENTS: &[&str] = &[
  "CREATE INDEX IF NOT EXISTS idx_worker_pool_state_status ON worker_pool_state (pool_status)",
  "CREATE INDEX IF NOT EXISTS idx_worker_scheduler_state_status ON worker_scheduler_state (scheduler_status)",
  "CREATE INDEX IF NOT EXISTS idx_worker_job_execution_tenant_created ON worker_job_execution (tenant_id, created_at DESC)",
  "CREATE INDEX IF NOT EXISTS idx_worker_job_execution_job_id ON worker_job_execution (job_id)",
];

const ACTIVE_TENANTS_SQL: &str = r#"
  SELECT p.tenant_id
  FROM worker_pool_state p
  INNER JOIN worker_scheduler_state s ON s.tenant_id = p.tenant_id
  WHERE p.pool_status = $1 AND s.scheduler_status = $2
  ORDER BY p.tenant_id
"#;

/// 基于 SeaORM 的 PostgreSQL 状态存储
/// PostgreSQL state store built on SeaORM
#[derive(Debug, Clone)]
pub struct SeaOrmStateStore {
  db: DatabaseConnection,
}

impl SeaOrmStateStore {
  /// 连接数据库并初始化 schema
  /// Connect to the database and initialize the schema
  pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
    let opt = ConnectOptions::new(config.url())
      .max_connections(config.max_connections)
      .sqlx_logging(false)
      .to_owned();
    let db = Database::connect(opt).await?;
    let store = Self { db };
    store.init_schema().await?;
    Ok(store)
  }

  /// 从现有数据库连接创建
  /// Create from an existing database connection
  pub fn from_connection(db: DatabaseConnection) -> Self {
    Self { db }
  }

  pub fn db(&self) -> &DatabaseConnection {
    &self.db
  }

  /// 初始化数据库 schema，可重复执行
  /// Initialize the database schema, safe to run repeatedly
  pub async fn init_schema(&self) -> Result<()> {
    let backend = self.db.get_database_backend();
    let schema = Schema::new(backend);

    let mut stmt = schema.create_table_from_entity(WorkerPoolState);
    self.db.execute(backend.build(stmt.if_not_exists())).await?;

    let mut stmt = schema.create_table_from_entity(WorkerSchedulerState);
    self.db.execute(backend.build(stmt.if_not_exists())).await?;

    let mut stmt = schema.create_table_from_entity(WorkerJobExecution);
    self.db.execute(backend.build(stmt.if_not_exists())).await?;

    for index_sql in INDEX_STATEMENTS {
      self
        .db
        .execute(Statement::from_string(backend, *index_sql))
        .await?;
    }
    debug!("Worker state schema initialized");
    Ok(())
  }
}

/// SeaORM 事务
/// SeaORM transaction
pub struct SeaOrmTransaction {
  txn: DatabaseTransaction,
}

fn to_db_time(at: DateTime<Utc>) -> DateTime<FixedOffset> {
  at.fixed_offset()
}

fn from_db_time(at: DateTime<FixedOffset>) -> DateTime<Utc> {
  at.with_timezone(&Utc)
}

fn to_secs(duration: Duration) -> i64 {
  i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

fn from_secs(secs: i64) -> Duration {
  Duration::from_secs(u64::try_from(secs).unwrap_or_default())
}

fn to_i32(value: u32) -> i32 {
  i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_i32(value: i32) -> u32 {
  u32::try_from(value).unwrap_or_default()
}

fn to_json(metadata: &Metadata) -> Value {
  Value::Object(metadata.clone())
}

fn from_json(value: Option<Value>) -> Metadata {
  match value {
    Some(Value::Object(map)) => map,
    _ => Metadata::new(),
  }
}

fn insert_error(err: DbErr, entity: &'static str, tenant_id: TenantId) -> Error {
  match err.sql_err() {
    Some(SqlErr::UniqueConstraintViolation(_)) => Error::already_exists(entity, tenant_id),
    _ => Error::Database(err),
  }
}

fn update_error(err: DbErr, entity: &'static str, tenant_id: TenantId) -> Error {
  match err {
    DbErr::RecordNotUpdated => Error::not_found(entity, tenant_id),
    other => Error::Database(other),
  }
}

fn pool_active_model(state: &PoolState) -> worker_pool_state::ActiveModel {
  worker_pool_state::ActiveModel {
    tenant_id: Set(state.tenant_id.as_uuid()),
    pool_name: Set(state.pool_name.clone()),
    queue_name_base: Set(state.queue_name_base.clone()),
    num_workers: Set(to_i32(state.num_workers)),
    job_timeout_secs: Set(to_secs(state.job_timeout)),
    pool_status: Set(state.pool_status.as_str().to_string()),
    created_at: Set(to_db_time(state.created_at)),
    started_at: Set(state.started_at.map(to_db_time)),
    stopped_at: Set(state.stopped_at.map(to_db_time)),
    last_job_at: Set(state.last_job_at.map(to_db_time)),
    metadata: Set(Some(to_json(&state.metadata))),
  }
}

impl TryFrom<worker_pool_state::Model> for PoolState {
  type Error = Error;

  fn try_from(model: worker_pool_state::Model) -> Result<Self> {
    Ok(Self {
      tenant_id: TenantId::from(model.tenant_id),
      pool_name: model.pool_name,
      queue_name_base: model.queue_name_base,
      num_workers: from_i32(model.num_workers),
      job_timeout: from_secs(model.job_timeout_secs),
      pool_status: model.pool_status.parse()?,
      created_at: from_db_time(model.created_at),
      started_at: model.started_at.map(from_db_time),
      stopped_at: model.stopped_at.map(from_db_time),
      last_job_at: model.last_job_at.map(from_db_time),
      metadata: from_json(model.metadata),
    })
  }
}

fn scheduler_active_model(state: &SchedulerState) -> worker_scheduler_state::ActiveModel {
  worker_scheduler_state::ActiveModel {
    tenant_id: Set(state.tenant_id.as_uuid()),
    scheduler_name: Set(state.scheduler_name.clone()),
    monitor_interval_secs: Set(to_secs(state.monitor_interval)),
    monitor_frequency_unit: Set(state.monitor_frequency_unit.clone()),
    scheduler_status: Set(state.scheduler_status.as_str().to_string()),
    created_at: Set(to_db_time(state.created_at)),
    started_at: Set(state.started_at.map(to_db_time)),
    stopped_at: Set(state.stopped_at.map(to_db_time)),
    last_run_at: Set(state.last_run_at.map(to_db_time)),
    next_run_at: Set(state.next_run_at.map(to_db_time)),
    run_count: Set(state.run_count),
    metadata: Set(Some(to_json(&state.metadata))),
  }
}

impl TryFrom<worker_scheduler_state::Model> for SchedulerState {
  type Error = Error;

  fn try_from(model: worker_scheduler_state::Model) -> Result<Self> {
    Ok(Self {
      tenant_id: TenantId::from(model.tenant_id),
      scheduler_name: model.scheduler_name,
      monitor_interval: from_secs(model.monitor_interval_secs),
      monitor_frequency_unit: model.monitor_frequency_unit,
      scheduler_status: model.scheduler_status.parse()?,
      created_at: from_db_time(model.created_at),
      started_at: model.started_at.map(from_db_time),
      stopped_at: model.stopped_at.map(from_db_time),
      last_run_at: model.last_run_at.map(from_db_time),
      next_run_at: model.next_run_at.map(from_db_time),
      run_count: model.run_count,
      metadata: from_json(model.metadata),
    })
  }
}

fn execution_active_model(execution: &JobExecution) -> worker_job_execution::ActiveModel {
  worker_job_execution::ActiveModel {
    id: Set(execution.id),
    tenant_id: Set(execution.tenant_id.as_uuid()),
    job_id: Set(execution.job_id.clone()),
    job_type: Set(execution.job_type.clone()),
    status: Set(execution.status.as_str().to_string()),
    retry_count: Set(to_i32(execution.retry_count)),
    max_retries: Set(to_i32(execution.max_retries)),
    started_at: Set(execution.started_at.map(to_db_time)),
    completed_at: Set(execution.completed_at.map(to_db_time)),
    error_message: Set(execution.error_message.clone()),
    result_summary: Set(execution.result_summary.as_ref().map(to_json)),
    created_at: Set(to_db_time(execution.created_at)),
  }
}

impl TryFrom<worker_job_execution::Model> for JobExecution {
  type Error = Error;

  fn try_from(model: worker_job_execution::Model) -> Result<Self> {
    Ok(Self {
      id: model.id,
      tenant_id: TenantId::from(model.tenant_id),
      job_id: model.job_id,
      job_type: model.job_type,
      status: model.status.parse()?,
      retry_count: from_i32(model.retry_count),
      max_retries: from_i32(model.max_retries),
      started_at: model.started_at.map(from_db_time),
      completed_at: model.completed_at.map(from_db_time),
      error_message: model.error_message,
      result_summary: model.result_summary.map(|v| from_json(Some(v))),
      created_at: from_db_time(model.created_at),
    })
  }
}

async fn create_pool_state<C: ConnectionTrait>(conn: &C, state: &PoolState) -> Result<()> {
  WorkerPoolState::insert(pool_active_model(state))
    .exec_without_returning(conn)
    .await
    .map_err(|e| insert_error(e, POOL_STATE, state.tenant_id))?;
  Ok(())
}

async fn update_pool_state<C: ConnectionTrait>(conn: &C, state: &PoolState) -> Result<()> {
  pool_active_model(state)
    .update(conn)
    .await
    .map_err(|e| update_error(e, POOL_STATE, state.tenant_id))?;
  Ok(())
}

async fn get_pool_state<C: ConnectionTrait>(conn: &C, tenant_id: TenantId) -> Result<PoolState> {
  WorkerPoolState::find_by_id(tenant_id.as_uuid())
    .one(conn)
    .await?
    .ok_or_else(|| Error::not_found(POOL_STATE, tenant_id))?
    .try_into()
}

async fn set_pool_status<C: ConnectionTrait>(
  conn: &C,
  tenant_id: TenantId,
  status: PoolStatus,
) -> Result<()> {
  let now = to_db_time(Utc::now());
  let mut update = WorkerPoolState::update_many().col_expr(
    worker_pool_state::Column::PoolStatus,
    Expr::value(status.as_str()),
  );
  update = match status {
    LifecycleStatus::Active => update.col_expr(worker_pool_state::Column::StartedAt, Expr::value(now)),
    LifecycleStatus::Stopped | LifecycleStatus::Archived => {
      update.col_expr(worker_pool_state::Column::StoppedAt, Expr::value(now))
    }
    LifecycleStatus::Created => update,
  };
  let result = update
    .filter(worker_pool_state::Column::TenantId.eq(tenant_id.as_uuid()))
    .exec(conn)
    .await?;
  if result.rows_affected == 0 {
    return Err(Error::not_found(POOL_STATE, tenant_id));
  }
  Ok(())
}

async fn touch_pool_last_job<C: ConnectionTrait>(
  conn: &C,
  tenant_id: TenantId,
  at: DateTime<Utc>,
) -> Result<()> {
  let result = WorkerPoolState::update_many()
    .col_expr(
      worker_pool_state::Column::LastJobAt,
      Expr::value(to_db_time(at)),
    )
    .filter(worker_pool_state::Column::TenantId.eq(tenant_id.as_uuid()))
    .exec(conn)
    .await?;
  if result.rows_affected == 0 {
    return Err(Error::not_found(POOL_STATE, tenant_id));
  }
  Ok(())
}

async fn create_scheduler_state<C: ConnectionTrait>(
  conn: &C,
  state: &SchedulerState,
) -> Result<()> {
  WorkerSchedulerState::insert(scheduler_active_model(state))
    .exec_without_returning(conn)
    .await
    .map_err(|e| insert_error(e, SCHEDULER_STATE, state.tenant_id))?;
  Ok(())
}

async fn update_scheduler_state<C: ConnectionTrait>(
  conn: &C,
  state: &SchedulerState,
) -> Result<()> {
  scheduler_active_model(state)
    .update(conn)
    .await
    .map_err(|e| update_error(e, SCHEDULER_STATE, state.tenant_id))?;
  Ok(())
}

async fn get_scheduler_state<C: ConnectionTrait>(
  conn: &C,
  tenant_id: TenantId,
) -> Result<SchedulerState> {
  WorkerSchedulerState::find_by_id(tenant_id.as_uuid())
    .one(conn)
    .await?
    .ok_or_else(|| Error::not_found(SCHEDULER_STATE, tenant_id))?
    .try_into()
}

async fn set_scheduler_status<C: ConnectionTrait>(
  conn: &C,
  tenant_id: TenantId,
  status: SchedulerStatus,
) -> Result<()> {
  let now = to_db_time(Utc::now());
  let mut update = WorkerSchedulerState::update_many().col_expr(
    worker_scheduler_state::Column::SchedulerStatus,
    Expr::value(status.as_str()),
  );
  update = match status {
    LifecycleStatus::Active => {
      update.col_expr(worker_scheduler_state::Column::StartedAt, Expr::value(now))
    }
    LifecycleStatus::Stopped | LifecycleStatus::Archived => {
      update.col_expr(worker_scheduler_state::Column::StoppedAt, Expr::value(now))
    }
    LifecycleStatus::Created => update,
  };
  let result = update
    .filter(worker_scheduler_state::Column::TenantId.eq(tenant_id.as_uuid()))
    .exec(conn)
    .await?;
  if result.rows_affected == 0 {
    return Err(Error::not_found(SCHEDULER_STATE, tenant_id));
  }
  Ok(())
}

async fn record_scheduler_run<C: ConnectionTrait>(
  conn: &C,
  tenant_id: TenantId,
  ran_at: DateTime<Utc>,
  next_run_at: DateTime<Utc>,
) -> Result<()> {
  let result = WorkerSchedulerState::update_many()
    .col_expr(
      worker_scheduler_state::Column::LastRunAt,
      Expr::value(to_db_time(ran_at)),
    )
    .col_expr(
      worker_scheduler_state::Column::NextRunAt,
      Expr::value(to_db_time(next_run_at)),
    )
    .col_expr(
      worker_scheduler_state::Column::RunCount,
      Expr::col(worker_scheduler_state::Column::RunCount).add(1),
    )
    .filter(worker_scheduler_state::Column::TenantId.eq(tenant_id.as_uuid()))
    .exec(conn)
    .await?;
  if result.rows_affected == 0 {
    return Err(Error::not_found(SCHEDULER_STATE, tenant_id));
  }
  Ok(())
}

async fn create_job_execution<C: ConnectionTrait>(
  conn: &C,
  execution: &JobExecution,
) -> Result<()> {
  WorkerJobExecution::insert(execution_active_model(execution))
    .exec_without_returning(conn)
    .await
    .map_err(|e| insert_error(e, JOB_EXECUTION, execution.tenant_id))?;
  Ok(())
}

async fn update_job_execution<C: ConnectionTrait>(
  conn: &C,
  execution: &JobExecution,
) -> Result<()> {
  execution_active_model(execution)
    .update(conn)
    .await
    .map_err(|e| update_error(e, JOB_EXECUTION, execution.tenant_id))?;
  Ok(())
}

async fn list_job_executions<C: ConnectionTrait>(
  conn: &C,
  tenant_id: TenantId,
  limit: u64,
) -> Result<Vec<JobExecution>> {
  WorkerJobExecution::find()
    .filter(worker_job_execution::Column::TenantId.eq(tenant_id.as_uuid()))
    .order_by_desc(worker_job_execution::Column::CreatedAt)
    .limit(limit)
    .all(conn)
    .await?
    .into_iter()
    .map(JobExecution::try_from)
    .collect()
}

async fn load_active_tenants<C: ConnectionTrait>(conn: &C) -> Result<Vec<TenantId>> {
  let active = LifecycleStatus::Active.as_str();
  let stmt = Statement::from_sql_and_values(
    conn.get_database_backend(),
    ACTIVE_TENANTS_SQL,
    vec![active.into(), active.into()],
  );
  let rows = conn.query_all(stmt).await?;
  let mut tenants = Vec::with_capacity(rows.len());
  for row in rows {
    let id: uuid::Uuid = row.try_get("", "tenant_id")?;
    tenants.push(TenantId::from(id));
  }
  Ok(tenants)
}

async fn delete_infrastructure<C: ConnectionTrait>(conn: &C, tenant_id: TenantId) -> Result<()> {
  let id = tenant_id.as_uuid();
  WorkerJobExecution::delete_many()
    .filter(worker_job_execution::Column::TenantId.eq(id))
    .exec(conn)
    .await?;
  WorkerSchedulerState::delete_many()
    .filter(worker_scheduler_state::Column::TenantId.eq(id))
    .exec(conn)
    .await?;
  WorkerPoolState::delete_many()
    .filter(worker_pool_state::Column::TenantId.eq(id))
    .exec(conn)
    .await?;
  Ok(())
}

macro_rules! impl_sea_orm_repository {
  ($ty:ty, $conn:ident) => {
    #[async_trait]
    impl StateRepository for $ty {
      async fn create_pool_state(&self, state: &PoolState) -> Result<()> {
        create_pool_state(&self.$conn, state).await
      }

      async fn update_pool_state(&self, state: &PoolState) -> Result<()> {
        update_pool_state(&self.$conn, state).await
      }

      async fn get_pool_state(&self, tenant_id: TenantId) -> Result<PoolState> {
        get_pool_state(&self.$conn, tenant_id).await
      }

      async fn set_pool_status(&self, tenant_id: TenantId, status: PoolStatus) -> Result<()> {
        set_pool_status(&self.$conn, tenant_id, status).await
      }

      async fn touch_pool_last_job(&self, tenant_id: TenantId, at: DateTime<Utc>) -> Result<()> {
        touch_pool_last_job(&self.$conn, tenant_id, at).await
      }

      async fn create_scheduler_state(&self, state: &SchedulerState) -> Result<()> {
        create_scheduler_state(&self.$conn, state).await
      }

      async fn update_scheduler_state(&self, state: &SchedulerState) -> Result<()> {
        update_scheduler_state(&self.$conn, state).await
      }

      async fn get_scheduler_state(&self, tenant_id: TenantId) -> Result<SchedulerState> {
        get_scheduler_state(&self.$conn, tenant_id).await
      }

      async fn set_scheduler_status(
        &self,
        tenant_id: TenantId,
        status: SchedulerStatus,
      ) -> Result<()> {
        set_scheduler_status(&self.$conn, tenant_id, status).await
      }

      async fn record_scheduler_run(
        &self,
        tenant_id: TenantId,
        ran_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
      ) -> Result<()> {
        record_scheduler_run(&self.$conn, tenant_id, ran_at, next_run_at).await
      }

      async fn create_job_execution(&self, execution: &JobExecution) -> Result<()> {
        create_job_execution(&self.$conn, execution).await
      }

      async fn update_job_execution(&self, execution: &JobExecution) -> Result<()> {
        update_job_execution(&self.$conn, execution).await
      }

      async fn list_job_executions(
        &self,
        tenant_id: TenantId,
        limit: u64,
      ) -> Result<Vec<JobExecution>> {
        list_job_executions(&self.$conn, tenant_id, limit).await
      }

      async fn load_active_tenants(&self) -> Result<Vec<TenantId>> {
        load_active_tenants(&self.$conn).await
      }

      async fn delete_infrastructure(&self, tenant_id: TenantId) -> Result<()> {
        delete_infrastructure(&self.$conn, tenant_id).await
      }
    }
  };
}

impl_sea_orm_repository!(SeaOrmStateStore, db);
impl_sea_orm_repository!(SeaOrmTransaction, txn);

#[async_trait]
impl StateTransaction for SeaOrmTransaction {
  fn as_repository(&self) -> &dyn StateRepository {
    self
  }

  async fn commit(self: Box<Self>) -> Result<()> {
    self.txn.commit().await?;
    Ok(())
  }

  async fn rollback(self: Box<Self>) -> Result<()> {
    self.txn.rollback().await?;
    Ok(())
  }
}

#[async_trait]
impl StateStore for SeaOrmStateStore {
  async fn begin(&self) -> Result<Box<dyn StateTransaction>> {
    let txn = self.db.begin().await?;
    Ok(Box::new(SeaOrmTransaction { txn }))
  }
}
