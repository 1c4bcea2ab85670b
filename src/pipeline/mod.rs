// ==========================================
// 飞行训练排班系统 - 后台任务管道
// ==========================================
// 依据: Dispatch_Engine_Specs_v0.2.md - 5. Job Pipeline
// 职责: 把"跑一次安全检查/生成一次改期建议"从同步请求路径解耦,
//       大批量任务(全量未来课程/整机尾停飞)不阻塞调用方
// 说明: 管道是显式生命周期的注入服务(start/drain/stop),不是模块级单例,
//       测试可为每个用例实例化隔离管道
// ==========================================

pub mod queue;
pub mod worker;

pub use queue::{
    CheckJob, EnqueueOutcome, FlightJobStatus, JobQueue, JobSubmission, QueueStats,
};
pub use worker::{JobExecutor, JobPipeline};

use crate::config::config_manager::{
    KEY_BACKOFF_BASE_SECS, KEY_MAX_RETRIES, KEY_POLL_INTERVAL_MS, KEY_SUGGESTION_TIMEOUT_SECS,
    KEY_SYNC_WAIT_TIMEOUT_SECS, KEY_URGENT_HORIZON_HOURS, KEY_WEATHER_TIMEOUT_SECS,
    KEY_WORKER_COUNT,
};
use crate::config::ConfigManager;
use crate::repository::error::RepositoryResult;
use std::time::Duration;

// ==========================================
// PipelineConfig - 管道配置
// ==========================================
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub worker_count: usize,          // 工作协程数
    pub max_retries: i64,             // 单任务最大执行次数
    pub backoff_base: Duration,       // 指数退避基数
    pub poll_interval: Duration,      // 空闲轮询间隔
    pub sync_wait_timeout: Duration,  // 同步等待单任务的上限
    pub urgent_horizon_hours: i64,    // 高优先级时间窗(小时)
    pub weather_timeout: Duration,    // 气象读数获取硬超时
    pub suggestion_timeout: Duration, // 建议生成硬超时
    pub expiry_hours: i64,            // 新建改期请求有效期(小时)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_retries: 3,
            backoff_base: Duration::from_secs(30),
            poll_interval: Duration::from_millis(200),
            sync_wait_timeout: Duration::from_secs(10),
            urgent_horizon_hours: 24,
            weather_timeout: Duration::from_secs(10),
            suggestion_timeout: Duration::from_secs(30),
            expiry_hours: 48,
        }
    }
}

impl PipelineConfig {
    pub fn from_config(cfg: &ConfigManager) -> RepositoryResult<Self> {
        Ok(Self {
            worker_count: cfg.get_i64_or(KEY_WORKER_COUNT, 4)?.max(1) as usize,
            max_retries: cfg.get_i64_or(KEY_MAX_RETRIES, 3)?.max(1),
            backoff_base: Duration::from_secs(cfg.get_i64_or(KEY_BACKOFF_BASE_SECS, 30)?.max(0) as u64),
            poll_interval: Duration::from_millis(
                cfg.get_i64_or(KEY_POLL_INTERVAL_MS, 200)?.max(10) as u64,
            ),
            sync_wait_timeout: Duration::from_secs(
                cfg.get_i64_or(KEY_SYNC_WAIT_TIMEOUT_SECS, 10)?.max(1) as u64,
            ),
            urgent_horizon_hours: cfg.get_i64_or(KEY_URGENT_HORIZON_HOURS, 24)?.max(1),
            weather_timeout: Duration::from_secs(
                cfg.get_i64_or(KEY_WEATHER_TIMEOUT_SECS, 10)?.max(1) as u64,
            ),
            suggestion_timeout: Duration::from_secs(
                cfg.get_i64_or(KEY_SUGGESTION_TIMEOUT_SECS, 30)?.max(1) as u64,
            ),
            expiry_hours: cfg.reschedule_expiry_hours()?,
        })
    }
}
