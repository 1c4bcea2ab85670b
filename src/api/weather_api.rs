// ==========================================
// 飞行训练排班系统 - 天气检查 API
// ==========================================
// 依据: Dispatch_Engine_Specs_v0.2.md - 6. 对外暴露面
// 职责: 天气检查任务提交(单课程/时间窗批量)、状态查询、人工复飞
// 红线: 批量操作返回计数,绝不整体抛错;人工复飞必须留痕
// ==========================================

use crate::api::error::{ApiError, ApiResult};
use crate::domain::audit_log::{AuditActionType, AuditLog};
use crate::domain::types::{FlightStatus, JobKind, JobStatus};
use crate::domain::weather::WeatherCheck;
use crate::pipeline::queue::{FlightJobStatus, JobSubmission, QueueStats};
use crate::pipeline::JobPipeline;
use crate::repository::{AuditLogRepository, FlightRepository, WeatherCheckRepository};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

// ==========================================
// BatchSubmitOutcome - 批量提交结果
// ==========================================
// 说明: 按计数汇报,单条失败不中断批次
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSubmitOutcome {
    pub submitted: usize,    // 新入队任务数
    pub deduplicated: usize, // 命中在途任务跳过数
    pub failed: usize,       // 入队失败数
    pub job_ids: Vec<String>,
}

/// 单课程即时检查结果
#[derive(Debug, Clone)]
pub struct CheckNowOutcome {
    pub job_id: String,
    pub status: JobStatus, // 等待超时上限内未终态时汇报 FAILED
}

// ==========================================
// WeatherApi - 天气检查 API
// ==========================================
pub struct WeatherApi {
    pipeline: Arc<JobPipeline>,
    flight_repo: Arc<FlightRepository>,
    weather_check_repo: Arc<WeatherCheckRepository>,
    audit_repo: Arc<AuditLogRepository>,
}

impl WeatherApi {
    pub fn new(
        pipeline: Arc<JobPipeline>,
        flight_repo: Arc<FlightRepository>,
        weather_check_repo: Arc<WeatherCheckRepository>,
        audit_repo: Arc<AuditLogRepository>,
    ) -> Self {
        Self {
            pipeline,
            flight_repo,
            weather_check_repo,
            audit_repo,
        }
    }

    /// 提交单课程天气检查任务(异步路径)
    pub fn submit_check(&self, flight_id: &str, nonce: Option<String>) -> ApiResult<String> {
        let flight = self
            .flight_repo
            .find_by_id(flight_id)?
            .ok_or_else(|| ApiError::NotFound(format!("课程不存在: {}", flight_id)))?;

        let outcome = self.pipeline.submit(
            JobSubmission {
                flight_id: flight_id.to_string(),
                kind: JobKind::WeatherCheck,
                payload: None,
                nonce,
            },
            Some(flight.scheduled_start),
        )?;
        Ok(outcome.job_id)
    }

    /// 按时间窗批量提交天气检查任务
    ///
    /// 仅覆盖 PENDING/CONFIRMED 状态的课程;返回计数而非整体成败。
    pub fn submit_window(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ApiResult<BatchSubmitOutcome> {
        if from >= to {
            return Err(ApiError::InvalidInput(
                "时间窗起点必须早于终点".to_string(),
            ));
        }

        let flights = self
            .flight_repo
            .find_by_window(from, to, FlightStatus::checkable())?;

        let mut outcome = BatchSubmitOutcome {
            submitted: 0,
            deduplicated: 0,
            failed: 0,
            job_ids: Vec::new(),
        };
        for flight in &flights {
            match self.pipeline.submit(
                JobSubmission {
                    flight_id: flight.flight_id.clone(),
                    kind: JobKind::WeatherCheck,
                    payload: None,
                    nonce: None,
                },
                Some(flight.scheduled_start),
            ) {
                Ok(o) => {
                    if o.deduplicated {
                        outcome.deduplicated += 1;
                    } else {
                        outcome.submitted += 1;
                    }
                    outcome.job_ids.push(o.job_id);
                }
                Err(e) => {
                    outcome.failed += 1;
                    tracing::warn!(
                        flight_id = flight.flight_id.as_str(),
                        "批量天气检查入队失败: {}",
                        e
                    );
                }
            }
        }

        tracing::info!(
            submitted = outcome.submitted,
            deduplicated = outcome.deduplicated,
            failed = outcome.failed,
            "批量天气检查提交完成"
        );
        Ok(outcome)
    }

    /// 立即检查单课程(同步路径): 有上限地等待该任务终态
    pub async fn check_now(&self, flight_id: &str) -> ApiResult<CheckNowOutcome> {
        let job_id = self.submit_check(flight_id, None)?;
        let status = self.pipeline.wait_for_job(&job_id).await;
        Ok(CheckNowOutcome { job_id, status })
    }

    /// 按课程集合查询聚合任务状态
    pub fn batch_status(&self, flight_ids: &[String]) -> ApiResult<Vec<FlightJobStatus>> {
        Ok(self.pipeline.queue().status_by_flight(flight_ids)?)
    }

    /// 队列统计
    pub fn queue_stats(&self) -> ApiResult<QueueStats> {
        Ok(self.pipeline.queue().stats()?)
    }

    /// 某课程的评估历史
    pub fn check_history(&self, flight_id: &str) -> ApiResult<Vec<WeatherCheck>> {
        Ok(self.weather_check_repo.list_by_flight(flight_id)?)
    }

    /// 人工复飞(天气豁免): WEATHER_CANCELLED → CONFIRMED
    ///
    /// 仅写课程状态与审计,不与改期状态机交互。
    pub fn override_weather_cancellation(
        &self,
        flight_id: &str,
        reason: &str,
        approved_by: &str,
    ) -> ApiResult<()> {
        if reason.trim().is_empty() {
            return Err(ApiError::InvalidInput("复飞理由不能为空".to_string()));
        }
        if approved_by.trim().is_empty() {
            return Err(ApiError::InvalidInput("批准人不能为空".to_string()));
        }

        self.flight_repo
            .apply_weather_override(flight_id, reason, approved_by)?;

        self.audit_repo.record_best_effort(
            AuditLog::new(AuditActionType::WeatherOverride, approved_by)
                .with_flight(flight_id)
                .with_payload(json!({ "reason": reason }))
                .with_detail("人工复飞: WEATHER_CANCELLED → CONFIRMED"),
        );
        tracing::info!(flight_id, approved_by, "人工复飞已生效");
        Ok(())
    }
}
