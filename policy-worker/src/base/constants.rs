use std::time::Duration;

/// 每个租户池的默认工作者数量
pub const DEFAULT_NUM_WORKERS: usize = 5;
/// 默认任务超时时间
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60); // 30 分钟
/// 工作者从 pending 阻塞取任务的默认等待时间
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);
/// 调度器单次提交的超时时间
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);
/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// 每个租户周期任务所需的处理器类型
pub const FETCH_FARM_MONITORING_DATA: &str = "fetch-farm-monitoring-data";
/// 每日配额用尽后工作者再次检查前的等待时间
pub const QUOTA_EXHAUSTED_BACKOFF: Duration = Duration::from_secs(60 * 60);

pub const PENDING_SUFFIX: &str = "pending";
pub const RUNNING_SUFFIX: &str = "running";
pub const DEAD_LETTER_SUFFIX: &str = "dlq";
pub const QUOTA_SEGMENT: &str = "quota";

/// 版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
