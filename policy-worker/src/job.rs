//! 任务模块
//! Job module
//!
//! 定义了在队列中流转的任务负载及其 JSON 线格式
//! Defines the job payload moved through the queue and its JSON wire format

use crate::base::constants::DEFAULT_MAX_RETRIES;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// 任务参数，对处理器来说是不透明的 JSON 对象
/// Job parameters, an opaque JSON object handed to the handler
pub type JobParams = Map<String, Value>;

/// 队列中的工作单元
/// The unit of work moved through the queue
///
/// 线格式: `{job_id, type, params, max_retries, retry_count, one_time, run_now}`
/// Wire format: `{job_id, type, params, max_retries, retry_count, one_time, run_now}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
  pub job_id: String,
  #[serde(rename = "type")]
  pub job_type: String,
  #[serde(default)]
  pub params: JobParams,
  pub max_retries: u32,
  #[serde(default)]
  pub retry_count: u32,
  #[serde(default)]
  pub one_time: bool,
  #[serde(default)]
  pub run_now: bool,
}

impl JobPayload {
  /// 创建新任务，使用默认重试次数
  /// Create a new job with the default retry budget
  pub fn new<S: Into<String>>(job_type: S) -> Self {
    Self {
      job_id: Uuid::new_v4().to_string(),
      job_type: job_type.into(),
      params: JobParams::new(),
      max_retries: DEFAULT_MAX_RETRIES,
      retry_count: 0,
      one_time: false,
      run_now: false,
    }
  }

  pub fn with_params(mut self, params: JobParams) -> Self {
    self.params = params;
    self
  }

  /// 设置单个参数
  /// Set a single parameter
  pub fn with_param<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
    self.params.insert(key.into(), value.into());
    self
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  pub fn with_one_time(mut self, one_time: bool) -> Self {
    self.one_time = one_time;
    self
  }

  pub fn with_run_now(mut self, run_now: bool) -> Self {
    self.run_now = run_now;
    self
  }

  /// 是否还有重试预算
  /// Whether the job still has retry budget left
  pub fn can_retry(&self) -> bool {
    self.retry_count < self.max_retries
  }

  /// 为下一次提交生成新实例: 新的 job_id，重试次数清零
  /// Produce a fresh instance for submission: new job_id, retry count reset
  pub fn fresh_instance(&self) -> Self {
    Self {
      job_id: Uuid::new_v4().to_string(),
      retry_count: 0,
      ..self.clone()
    }
  }

  /// 生成重试用的副本，重试次数加一
  /// Produce the copy to re-queue on retry, with the retry count incremented
  pub fn next_attempt(&self) -> Self {
    Self {
      retry_count: self.retry_count + 1,
      ..self.clone()
    }
  }

  /// 编码为队列中的 JSON 字符串
  /// Encode as the JSON string stored in the queue
  pub fn encode(&self) -> Result<String> {
    Ok(serde_json::to_string(self)?)
  }

  /// 从队列中的 JSON 字符串解码
  /// Decode from the JSON string stored in the queue
  pub fn decode(raw: &str) -> Result<Self> {
    Ok(serde_json::from_str(raw)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_wire_format_field_names() {
    let job = JobPayload::new("fetch-farm-monitoring-data")
      .with_param("policy_id", "p-1")
      .with_max_retries(2)
      .with_one_time(true);
    let value: Value = serde_json::from_str(&job.encode().unwrap()).unwrap();
    assert_eq!(value["type"], "fetch-farm-monitoring-data");
    assert_eq!(value["params"]["policy_id"], "p-1");
    assert_eq!(value["max_retries"], 2);
    assert_eq!(value["retry_count"], 0);
    assert_eq!(value["one_time"], true);
    assert_eq!(value["run_now"], false);
    assert!(value["job_id"].is_string());
  }

  #[test]
  fn test_decode_accepts_missing_optional_fields() {
    let raw = json!({"job_id": "j1", "type": "t", "max_retries": 1}).to_string();
    let job = JobPayload::decode(&raw).unwrap();
    assert_eq!(job.retry_count, 0);
    assert!(job.params.is_empty());
    assert!(!job.one_time && !job.run_now);
    assert!(JobPayload::decode("{not json").is_err());
  }

  #[test]
  fn test_retry_progression() {
    let job = JobPayload::new("t").with_max_retries(1);
    assert!(job.can_retry());
    let next = job.next_attempt();
    assert_eq!(next.retry_count, 1);
    assert_eq!(next.job_id, job.job_id);
    assert!(!next.can_retry());

    let fresh = next.fresh_instance();
    assert_eq!(fresh.retry_count, 0);
    assert_ne!(fresh.job_id, job.job_id);
  }
}
