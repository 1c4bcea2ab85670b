// ==========================================
// 飞行训练排班系统 - 故障报告 API
// ==========================================
// 依据: Dispatch_Engine_Specs_v0.2.md - 4. Grounding Cascade
// 职责: 故障报告登记(按严重度触发停飞级联)与排故关闭
// 红线: 级联第 1-3 步完成即视为报告落账成功,第 4 步在后台推进
// ==========================================

use crate::api::error::{ApiError, ApiResult};
use crate::domain::audit_log::{AuditActionType, AuditLog};
use crate::domain::squawk::Squawk;
use crate::domain::types::SquawkSeverity;
use crate::engine::cascade::{CascadeOutcome, GroundingCascadeHandler};
use crate::repository::{AircraftRepository, AuditLogRepository, SquawkRepository};
use std::sync::Arc;

/// 故障报告登记结果
#[derive(Debug, Clone)]
pub struct SquawkReportOutcome {
    pub squawk: Squawk,
    /// GROUNDING 严重度时的级联结果(其余严重度为 None)
    pub cascade: Option<CascadeOutcome>,
}

// ==========================================
// SquawkApi - 故障报告 API
// ==========================================
pub struct SquawkApi {
    squawk_repo: Arc<SquawkRepository>,
    aircraft_repo: Arc<AircraftRepository>,
    audit_repo: Arc<AuditLogRepository>,
    cascade: Arc<GroundingCascadeHandler>,
}

impl SquawkApi {
    pub fn new(
        squawk_repo: Arc<SquawkRepository>,
        aircraft_repo: Arc<AircraftRepository>,
        audit_repo: Arc<AuditLogRepository>,
        cascade: Arc<GroundingCascadeHandler>,
    ) -> Self {
        Self {
            squawk_repo,
            aircraft_repo,
            audit_repo,
            cascade,
        }
    }

    /// 登记故障报告
    ///
    /// 仅 GROUNDING 严重度触发停飞级联;
    /// 返回时级联第 1-3 步已完成,建议生成在后台限并发推进。
    pub fn report_squawk(
        &self,
        aircraft_id: &str,
        reported_by: &str,
        severity: SquawkSeverity,
        description: &str,
    ) -> ApiResult<SquawkReportOutcome> {
        if description.trim().is_empty() {
            return Err(ApiError::InvalidInput("故障描述不能为空".to_string()));
        }
        if self.aircraft_repo.find_by_id(aircraft_id)?.is_none() {
            return Err(ApiError::NotFound(format!("飞机不存在: {}", aircraft_id)));
        }

        let squawk = Squawk::new(
            aircraft_id.to_string(),
            reported_by.to_string(),
            severity,
            description.trim().to_string(),
        );
        self.squawk_repo.insert(&squawk)?;

        self.audit_repo.record_best_effort(
            AuditLog::new(AuditActionType::SquawkReport, reported_by)
                .with_aircraft(aircraft_id)
                .with_detail(format!(
                    "severity={}, squawk_id={}",
                    severity, squawk.squawk_id
                )),
        );

        let cascade = if squawk.triggers_cascade() {
            Some(self.cascade.trigger(&squawk)?)
        } else {
            None
        };

        // 返回带快照的最新报告
        let squawk = self
            .squawk_repo
            .find_by_id(&squawk.squawk_id)?
            .unwrap_or(squawk);
        Ok(SquawkReportOutcome { squawk, cascade })
    }

    /// 排故关闭
    ///
    /// 最后一条未排除的 GROUNDING 报告关闭后,飞机恢复可用;
    /// 已取消课程不自动恢复(由改期流程接管)。
    pub fn resolve_squawk(&self, squawk_id: &str, resolved_by: &str) -> ApiResult<Squawk> {
        let squawk = self
            .squawk_repo
            .find_by_id(squawk_id)?
            .ok_or_else(|| ApiError::NotFound(format!("故障报告不存在: {}", squawk_id)))?;

        if !self.squawk_repo.resolve_if_open(squawk_id)? {
            return Err(ApiError::Conflict(format!(
                "故障报告 {} 已关闭,不可重复排故",
                squawk_id
            )));
        }

        self.audit_repo.record_best_effort(
            AuditLog::new(AuditActionType::SquawkResolve, resolved_by)
                .with_aircraft(&squawk.aircraft_id)
                .with_detail(format!("squawk_id={}", squawk_id)),
        );

        // 无剩余停飞级报告时恢复可用
        if squawk.severity == SquawkSeverity::Grounding
            && self.squawk_repo.count_open_grounding(&squawk.aircraft_id)? == 0
            && self.aircraft_repo.release_if_grounded(&squawk.aircraft_id)?
        {
            self.audit_repo.record_best_effort(
                AuditLog::new(AuditActionType::AircraftReleased, resolved_by)
                    .with_aircraft(&squawk.aircraft_id),
            );
            tracing::info!(
                aircraft_id = squawk.aircraft_id.as_str(),
                "全部停飞级故障已排除,飞机恢复可用"
            );
        }

        self.squawk_repo
            .find_by_id(squawk_id)?
            .ok_or_else(|| ApiError::NotFound(format!("故障报告不存在: {}", squawk_id)))
    }

    /// 某飞机的未处理报告
    pub fn list_open_by_aircraft(&self, aircraft_id: &str) -> ApiResult<Vec<Squawk>> {
        Ok(self.squawk_repo.list_open_by_aircraft(aircraft_id)?)
    }
}
