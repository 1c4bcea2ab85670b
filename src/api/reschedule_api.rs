// ==========================================
// 飞行训练排班系统 - 改期请求 API
// ==========================================
// 依据: Dispatch_Engine_Specs_v0.2.md - 3. Reschedule State Machine
// 职责: 学员/教员两方确认入口,逐条执行身份与状态校验
// 红线: 校验全部通过前不做任何写入;竞争失败方收到确定性冲突
// ==========================================

use crate::api::error::{ApiError, ApiResult};
use crate::domain::audit_log::{AuditActionType, AuditLog};
use crate::domain::flight::Flight;
use crate::domain::reschedule::{RescheduleRequest, SuggestionBundle};
use crate::domain::types::{FlightStatus, NotificationKind, RescheduleStatus};
use crate::engine::providers::{notify_best_effort, Notifier};
use crate::repository::{
    AuditLogRepository, FlightRepository, RescheduleRequestRepository,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;

// ==========================================
// RescheduleApi - 改期状态机 API
// ==========================================
pub struct RescheduleApi {
    reschedule_repo: Arc<RescheduleRequestRepository>,
    flight_repo: Arc<FlightRepository>,
    audit_repo: Arc<AuditLogRepository>,
    notifier: Arc<dyn Notifier>,
    expiry_hours: i64,
}

impl RescheduleApi {
    pub fn new(
        reschedule_repo: Arc<RescheduleRequestRepository>,
        flight_repo: Arc<FlightRepository>,
        audit_repo: Arc<AuditLogRepository>,
        notifier: Arc<dyn Notifier>,
        expiry_hours: i64,
    ) -> Self {
        Self {
            reschedule_repo,
            flight_repo,
            audit_repo,
            notifier,
            expiry_hours,
        }
    }

    /// 创建改期请求(初始 PENDING_STUDENT,失效时刻 = 现在 + 有效期)
    pub fn create_request(
        &self,
        flight_id: &str,
        student_id: &str,
        bundle: SuggestionBundle,
    ) -> ApiResult<RescheduleRequest> {
        if bundle.suggestions.is_empty() {
            return Err(ApiError::InvalidInput("备选方案列表不能为空".to_string()));
        }
        let flight = self
            .flight_repo
            .find_by_id(flight_id)?
            .ok_or_else(|| ApiError::NotFound(format!("课程不存在: {}", flight_id)))?;
        if flight.student_id != student_id {
            return Err(ApiError::Forbidden(format!(
                "学员 {} 不是课程 {} 的学员",
                student_id, flight_id
            )));
        }

        let request = RescheduleRequest::new(
            flight_id.to_string(),
            student_id.to_string(),
            bundle.suggestions,
            Utc::now() + ChronoDuration::hours(self.expiry_hours),
        );
        self.reschedule_repo.create(&request)?;

        self.audit_repo.record_best_effort(
            AuditLog::new(AuditActionType::RescheduleCreate, student_id)
                .with_flight(flight_id)
                .with_request(&request.request_id)
                .with_detail(format!("options={}", request.suggestions.len())),
        );
        Ok(request)
    }

    /// 学员选择确认
    ///
    /// 校验顺序: 存在(404) → 失效(400, 专用错误) → 状态(409) → 身份(403) → 下标(400)
    pub fn student_confirm(
        &self,
        request_id: &str,
        caller_student_id: &str,
        option_index: usize,
    ) -> ApiResult<RescheduleRequest> {
        let request = self.load_request(request_id)?;
        self.check_expiry(&request)?;

        if request.status != RescheduleStatus::PendingStudent {
            return Err(ApiError::Conflict(format!(
                "请求 {} 当前状态为 {},不可由学员选择",
                request_id, request.status
            )));
        }
        if request.student_id != caller_student_id {
            return Err(ApiError::Forbidden(format!(
                "学员 {} 不是请求 {} 的归属学员",
                caller_student_id, request_id
            )));
        }
        let suggestion = request.suggestions.get(option_index).ok_or_else(|| {
            ApiError::InvalidInput(format!(
                "备选下标 {} 超出范围(共 {} 条)",
                option_index,
                request.suggestions.len()
            ))
        })?;

        // 原子效果: 请求 → PENDING_INSTRUCTOR + 课程 → RESCHEDULE_PENDING
        self.reschedule_repo.student_select(
            request_id,
            &request.flight_id,
            option_index,
            suggestion.instructor_id.as_deref(),
        )?;

        self.audit_repo.record_best_effort(
            AuditLog::new(AuditActionType::StudentConfirm, caller_student_id)
                .with_flight(&request.flight_id)
                .with_request(request_id)
                .with_payload(json!({ "selected_option": option_index })),
        );
        // 通知选中方案的教员待确认
        if let Some(instructor_id) = suggestion.instructor_id.as_deref() {
            notify_best_effort(
                self.notifier.as_ref(),
                instructor_id,
                NotificationKind::InstructorConfirmRequested,
                json!({
                    "request_id": request_id,
                    "flight_id": request.flight_id,
                    "selected_option": option_index,
                }),
            );
        }

        self.load_request(request_id)
    }

    /// 教员确认: 原子地创建后继课程并关闭请求
    ///
    /// 身份规则: 原课程教员 或 选中方案的教员均可确认
    /// (覆盖新时段换教员的交接场景)。
    pub fn instructor_confirm(
        &self,
        request_id: &str,
        caller_instructor_id: &str,
    ) -> ApiResult<Flight> {
        let request = self.load_request(request_id)?;
        self.check_expiry(&request)?;

        if request.status != RescheduleStatus::PendingInstructor {
            return Err(ApiError::Conflict(format!(
                "请求 {} 当前状态为 {},不可由教员确认",
                request_id, request.status
            )));
        }
        let suggestion = request.selected_suggestion().ok_or_else(|| {
            ApiError::Conflict(format!("请求 {} 尚未选择备选方案", request_id))
        })?;
        if !suggestion.is_complete() {
            return Err(ApiError::NotFound(format!(
                "请求 {} 选中的备选方案信息不完整(教员/飞机/时段缺失)",
                request_id
            )));
        }

        let flight = self
            .flight_repo
            .find_by_id(&request.flight_id)?
            .ok_or_else(|| ApiError::NotFound(format!("课程不存在: {}", request.flight_id)))?;

        let is_original = flight.instructor_id == caller_instructor_id;
        let is_selected = suggestion.instructor_id.as_deref() == Some(caller_instructor_id);
        if !is_original && !is_selected {
            return Err(ApiError::Forbidden(format!(
                "教员 {} 既非原课程教员也非选中方案教员",
                caller_instructor_id
            )));
        }

        // 校验通过后组装后继课程(沿用课目元数据,挂前驱链)
        let successor = build_successor(&flight, suggestion);
        self.reschedule_repo
            .accept_with_successor(request_id, &request.flight_id, &successor)?;

        self.audit_repo.record_best_effort(
            AuditLog::new(AuditActionType::InstructorConfirm, caller_instructor_id)
                .with_flight(&request.flight_id)
                .with_request(request_id)
                .with_detail(format!("new_flight_id={}", successor.flight_id)),
        );
        notify_best_effort(
            self.notifier.as_ref(),
            &request.student_id,
            NotificationKind::RescheduleAccepted,
            json!({
                "request_id": request_id,
                "new_flight_id": successor.flight_id,
                "scheduled_start": successor.scheduled_start.to_rfc3339(),
            }),
        );

        Ok(successor)
    }

    /// 拒绝(任一方,任一开放状态)
    ///
    /// 单向终态转移;不自动恢复课程先前状态(留给外围策略处理)。
    pub fn reject(&self, request_id: &str, caller_id: &str, reason: &str) -> ApiResult<()> {
        if reason.trim().is_empty() {
            return Err(ApiError::InvalidInput("拒绝理由不能为空".to_string()));
        }
        let request = self.load_request(request_id)?;

        let flight = self
            .flight_repo
            .find_by_id(&request.flight_id)?
            .ok_or_else(|| ApiError::NotFound(format!("课程不存在: {}", request.flight_id)))?;
        let allowed = caller_id == request.student_id
            || caller_id == flight.instructor_id
            || request.selected_instructor_id.as_deref() == Some(caller_id);
        if !allowed {
            return Err(ApiError::Forbidden(format!(
                "{} 不是请求 {} 的当事方",
                caller_id, request_id
            )));
        }

        // 终态请求拒绝 → 冲突(由条件更新落空给出)
        self.reschedule_repo.reject_if_open(request_id, reason)?;

        self.audit_repo.record_best_effort(
            AuditLog::new(AuditActionType::RescheduleReject, caller_id)
                .with_flight(&request.flight_id)
                .with_request(request_id)
                .with_detail(reason),
        );
        notify_best_effort(
            self.notifier.as_ref(),
            &request.student_id,
            NotificationKind::RescheduleRejected,
            json!({ "request_id": request_id, "reason": reason }),
        );
        Ok(())
    }

    /// 教员可见请求列表(可见性规则见仓储层)
    pub fn list_for_instructor(&self, instructor_id: &str) -> ApiResult<Vec<RescheduleRequest>> {
        Ok(self.reschedule_repo.list_for_instructor(instructor_id)?)
    }

    /// 学员可见请求列表
    pub fn list_for_student(&self, student_id: &str) -> ApiResult<Vec<RescheduleRequest>> {
        Ok(self.reschedule_repo.list_for_student(student_id)?)
    }

    /// 查询单条请求
    pub fn get_request(&self, request_id: &str) -> ApiResult<RescheduleRequest> {
        self.load_request(request_id)
    }

    /// 批量失效扫描(运维兜底)
    pub fn expire_overdue(&self) -> ApiResult<usize> {
        Ok(self.reschedule_repo.expire_overdue(Utc::now())?)
    }

    fn load_request(&self, request_id: &str) -> ApiResult<RescheduleRequest> {
        self.reschedule_repo
            .find_by_id(request_id)?
            .ok_or_else(|| ApiError::NotFound(format!("改期请求不存在: {}", request_id)))
    }

    /// 惰性失效检查: 开放且已过期的请求就地转 EXPIRED,
    /// 并返回失效专用错误(区别于一般冲突)
    fn check_expiry(&self, request: &RescheduleRequest) -> ApiResult<()> {
        if request.is_expired(Utc::now()) {
            let _ = self.reschedule_repo.mark_expired_if_open(&request.request_id);
            return Err(ApiError::RequestExpired(format!(
                "请求 {} 已于 {} 失效",
                request.request_id,
                request.expires_at.to_rfc3339()
            )));
        }
        Ok(())
    }
}

/// 按选中方案组装后继课程
///
/// 课目元数据(学员/课目/训练等级/课程类型)沿用原课程,
/// 教员/飞机/时段取自选中方案,讲评窗口按原提前/延后量平移。
fn build_successor(original: &Flight, suggestion: &crate::domain::reschedule::SlotSuggestion) -> Flight {
    // 调用方已验证方案三要素齐全
    let slot_start = suggestion.slot_start.unwrap_or(original.scheduled_start);
    let slot_end = suggestion.slot_end.unwrap_or(original.scheduled_end);
    let now = Utc::now();
    Flight {
        flight_id: uuid::Uuid::new_v4().to_string(),
        school_id: original.school_id.clone(),
        student_id: original.student_id.clone(),
        instructor_id: suggestion
            .instructor_id
            .clone()
            .unwrap_or_else(|| original.instructor_id.clone()),
        aircraft_id: suggestion
            .aircraft_id
            .clone()
            .unwrap_or_else(|| original.aircraft_id.clone()),
        aircraft_type: original.aircraft_type.clone(),
        training_level: original.training_level,
        flight_type: original.flight_type,
        lesson_code: original.lesson_code.clone(),
        airport_code: original.airport_code.clone(),
        scheduled_start: slot_start,
        scheduled_end: slot_end,
        briefing_start: original.briefing_lead().map(|lead| slot_start - lead),
        debrief_end: original.debrief_tail().map(|tail| slot_end + tail),
        status: FlightStatus::RescheduleConfirmed,
        rescheduled_from_id: Some(original.flight_id.clone()),
        weather_override_flag: false,
        weather_override_reason: None,
        weather_override_by: None,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::reschedule::SlotSuggestion;
    use crate::domain::types::{FlightType, TrainingLevel};
    use crate::engine::providers::NoOpNotifier;
    use rusqlite::Connection;
    use std::sync::Mutex;

    struct Fixture {
        flight_repo: Arc<FlightRepository>,
        reschedule_repo: Arc<RescheduleRequestRepository>,
        api: RescheduleApi,
    }

    fn setup() -> Fixture {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let flight_repo = Arc::new(FlightRepository::new(conn.clone()));
        let reschedule_repo = Arc::new(RescheduleRequestRepository::new(conn.clone()));
        let audit_repo = Arc::new(AuditLogRepository::new(conn));
        let api = RescheduleApi::new(
            reschedule_repo.clone(),
            flight_repo.clone(),
            audit_repo,
            Arc::new(NoOpNotifier),
            48,
        );
        Fixture {
            flight_repo,
            reschedule_repo,
            api,
        }
    }

    fn make_flight(id: &str, status: FlightStatus) -> Flight {
        let start = Utc::now() + ChronoDuration::hours(24);
        Flight {
            flight_id: id.to_string(),
            school_id: "S01".to_string(),
            student_id: "STU-1".to_string(),
            instructor_id: "INS-1".to_string(),
            aircraft_id: "AC-1".to_string(),
            aircraft_type: "C172".to_string(),
            training_level: TrainingLevel::Private,
            flight_type: FlightType::Dual,
            lesson_code: Some("L-08".to_string()),
            airport_code: "ZBAA".to_string(),
            scheduled_start: start,
            scheduled_end: start + ChronoDuration::hours(2),
            briefing_start: Some(start - ChronoDuration::minutes(30)),
            debrief_end: Some(start + ChronoDuration::hours(2) + ChronoDuration::minutes(20)),
            status,
            rescheduled_from_id: None,
            weather_override_flag: false,
            weather_override_reason: None,
            weather_override_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn suggestion(instructor: &str, offset_days: i64) -> SlotSuggestion {
        let start = Utc::now() + ChronoDuration::days(offset_days);
        SlotSuggestion {
            instructor_id: Some(instructor.to_string()),
            aircraft_id: Some("AC-2".to_string()),
            slot_start: Some(start),
            slot_end: Some(start + ChronoDuration::hours(2)),
        }
    }

    fn bundle(suggestions: Vec<SlotSuggestion>) -> SuggestionBundle {
        SuggestionBundle {
            suggestions,
            reasoning: None,
        }
    }

    fn create_cancelled_flight_with_request(fixture: &Fixture) -> RescheduleRequest {
        fixture
            .flight_repo
            .insert(&make_flight("F001", FlightStatus::WeatherCancelled))
            .unwrap();
        fixture
            .api
            .create_request(
                "F001",
                "STU-1",
                bundle(vec![suggestion("INS-1", 2), suggestion("INS-2", 3)]),
            )
            .unwrap()
    }

    #[test]
    fn test_student_confirm_happy_path() {
        let fixture = setup();
        let request = create_cancelled_flight_with_request(&fixture);

        // 学员选择第 1 号备选(INS-2 的方案)
        let updated = fixture
            .api
            .student_confirm(&request.request_id, "STU-1", 1)
            .unwrap();

        assert_eq!(updated.status, RescheduleStatus::PendingInstructor);
        assert_eq!(updated.selected_option, Some(1));
        assert_eq!(updated.selected_instructor_id.as_deref(), Some("INS-2"));
        assert_eq!(
            fixture.flight_repo.current_status("F001").unwrap(),
            Some(FlightStatus::ReschedulePending)
        );
    }

    #[test]
    fn test_student_confirm_out_of_range_index_is_validation_error() {
        let fixture = setup();
        let request = create_cancelled_flight_with_request(&fixture);

        let err = fixture
            .api
            .student_confirm(&request.request_id, "STU-1", 2)
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidInput(_)));
        assert_eq!(err.status_code(), 400);

        // 状态不变
        let loaded = fixture
            .reschedule_repo
            .find_by_id(&request.request_id)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, RescheduleStatus::PendingStudent);
        assert_eq!(loaded.selected_option, None);
    }

    #[test]
    fn test_student_confirm_identity_mismatch_forbidden() {
        let fixture = setup();
        let request = create_cancelled_flight_with_request(&fixture);

        let err = fixture
            .api
            .student_confirm(&request.request_id, "STU-2", 0)
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn test_expired_request_gets_expiry_specific_error() {
        let fixture = setup();
        fixture
            .flight_repo
            .insert(&make_flight("F001", FlightStatus::WeatherCancelled))
            .unwrap();
        let mut request = RescheduleRequest::new(
            "F001".to_string(),
            "STU-1".to_string(),
            vec![suggestion("INS-1", 2)],
            Utc::now() - ChronoDuration::hours(1),
        );
        request.expires_at = Utc::now() - ChronoDuration::hours(1);
        fixture.reschedule_repo.create(&request).unwrap();

        // 失效专用错误,而非一般冲突
        let err = fixture
            .api
            .student_confirm(&request.request_id, "STU-1", 0)
            .unwrap_err();
        assert!(matches!(err, ApiError::RequestExpired(_)));

        // 惰性失效: 访问即落库
        let loaded = fixture
            .reschedule_repo
            .find_by_id(&request.request_id)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, RescheduleStatus::Expired);

        // 教员确认同样拿到失效专用错误
        let err = fixture
            .api
            .instructor_confirm(&request.request_id, "INS-1")
            .unwrap_err();
        assert!(matches!(
            err,
            ApiError::RequestExpired(_) | ApiError::Conflict(_)
        ));
    }

    #[test]
    fn test_instructor_confirm_by_selected_instructor() {
        let fixture = setup();
        let request = create_cancelled_flight_with_request(&fixture);
        fixture
            .api
            .student_confirm(&request.request_id, "STU-1", 1)
            .unwrap();

        // 新方案教员(非原课程教员)确认
        let successor = fixture
            .api
            .instructor_confirm(&request.request_id, "INS-2")
            .unwrap();

        assert_eq!(successor.instructor_id, "INS-2");
        assert_eq!(successor.aircraft_id, "AC-2");
        assert_eq!(successor.lesson_code.as_deref(), Some("L-08"));
        assert_eq!(successor.rescheduled_from_id.as_deref(), Some("F001"));
        assert_eq!(successor.status, FlightStatus::RescheduleConfirmed);
        // 讲评窗口按原提前量平移
        assert_eq!(
            successor.briefing_lead(),
            Some(ChronoDuration::minutes(30))
        );

        assert_eq!(
            fixture.flight_repo.current_status("F001").unwrap(),
            Some(FlightStatus::Rescheduled)
        );
        let loaded = fixture
            .reschedule_repo
            .find_by_id(&request.request_id)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, RescheduleStatus::Accepted);
        assert_eq!(
            loaded.new_flight_id.as_deref(),
            Some(successor.flight_id.as_str())
        );
    }

    #[test]
    fn test_instructor_confirm_identity_check() {
        let fixture = setup();
        let request = create_cancelled_flight_with_request(&fixture);
        fixture
            .api
            .student_confirm(&request.request_id, "STU-1", 1)
            .unwrap();

        // 既非原教员也非选中方案教员 → 403
        let err = fixture
            .api
            .instructor_confirm(&request.request_id, "INS-9")
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));

        // 原课程教员也可确认(即使方案换了教员)
        fixture
            .api
            .instructor_confirm(&request.request_id, "INS-1")
            .unwrap();
    }

    #[test]
    fn test_instructor_confirm_incomplete_suggestion_is_not_found() {
        let fixture = setup();
        fixture
            .flight_repo
            .insert(&make_flight("F001", FlightStatus::WeatherCancelled))
            .unwrap();
        let mut incomplete = suggestion("INS-2", 2);
        incomplete.aircraft_id = None;
        let request = fixture
            .api
            .create_request("F001", "STU-1", bundle(vec![incomplete]))
            .unwrap();
        fixture
            .api
            .student_confirm(&request.request_id, "STU-1", 0)
            .unwrap();

        let err = fixture
            .api
            .instructor_confirm(&request.request_id, "INS-2")
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_reject_requires_reason_and_open_status() {
        let fixture = setup();
        let request = create_cancelled_flight_with_request(&fixture);

        // 空理由 → 校验错误
        let err = fixture
            .api
            .reject(&request.request_id, "STU-1", "  ")
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidInput(_)));

        // 非当事方 → 403
        let err = fixture
            .api
            .reject(&request.request_id, "STU-9", "时间不合适")
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));

        // 正常拒绝: 单向终态,课程状态不自动恢复
        fixture
            .api
            .reject(&request.request_id, "STU-1", "时间不合适")
            .unwrap();
        let loaded = fixture
            .reschedule_repo
            .find_by_id(&request.request_id)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, RescheduleStatus::Rejected);
        assert_eq!(loaded.reject_reason.as_deref(), Some("时间不合适"));
        assert_eq!(
            fixture.flight_repo.current_status("F001").unwrap(),
            Some(FlightStatus::WeatherCancelled)
        );

        // 再次拒绝终态请求 → 冲突
        let err = fixture
            .api
            .reject(&request.request_id, "STU-1", "再拒一次")
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn test_create_request_duplicate_open_conflict() {
        let fixture = setup();
        create_cancelled_flight_with_request(&fixture);

        let err = fixture
            .api
            .create_request("F001", "STU-1", bundle(vec![suggestion("INS-1", 2)]))
            .unwrap_err();
        assert!(matches!(err, ApiError::DuplicateOpenRequest(_)));
        assert_eq!(err.status_code(), 409);
    }
}
