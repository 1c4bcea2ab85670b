// ==========================================
// 飞行训练排班系统 - 改期请求领域模型
// ==========================================
// 依据: Dispatch_Engine_Specs_v0.2.md - 3. Reschedule State Machine
// 红线: 同一课程同时最多一条开放请求(数据层唯一约束兜底)
// ==========================================

use crate::domain::types::{RescheduleStatus, SelectedBy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ==========================================
// SlotSuggestion - 备选方案(教员 × 飞机 × 时段)
// ==========================================
// 说明: 字段为 Option 以表达生成器返回的不完整方案;
//       教员确认前必须校验三要素齐全
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSuggestion {
    pub instructor_id: Option<String>,       // 备选教员
    pub aircraft_id: Option<String>,         // 备选飞机
    pub slot_start: Option<DateTime<Utc>>,   // 备选时段起
    pub slot_end: Option<DateTime<Utc>>,     // 备选时段止
}

impl SlotSuggestion {
    /// 三要素(教员/飞机/时段)是否齐全
    pub fn is_complete(&self) -> bool {
        self.instructor_id.is_some()
            && self.aircraft_id.is_some()
            && self.slot_start.is_some()
            && self.slot_end.is_some()
    }
}

// ==========================================
// SuggestionBundle - 生成器输出
// ==========================================
// 用途: 建议生成器(外部协作方)返回的有序备选列表 + 推理说明
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionBundle {
    pub suggestions: Vec<SlotSuggestion>, // 按推荐度排序
    pub reasoning: Option<JsonValue>,     // 推理负载(透传,不解释)
}

// ==========================================
// RescheduleRequest - 改期请求(状态机主体)
// ==========================================
// 生命周期: 一次取消事件创建一条;进入终态后不可变
// 对齐: reschedule_request 表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescheduleRequest {
    // ===== 主键与关联 =====
    pub request_id: String, // 请求 ID(UUID)
    pub flight_id: String,  // 被取消课程
    pub student_id: String, // 学员

    // ===== 备选方案 =====
    pub suggestions: Vec<SlotSuggestion>, // 有序备选列表

    // ===== 选择结果 =====
    pub selected_option: Option<usize>,        // 选中下标(必须落在 suggestions 内)
    pub selected_by: Option<SelectedBy>,       // 选择方
    pub selected_instructor_id: Option<String>, // 选中方案的教员(冗余,供可见性规则过滤)

    // ===== 状态 =====
    pub status: RescheduleStatus,     // 请求状态
    pub reject_reason: Option<String>, // 拒绝理由(REJECTED 时必填)

    // ===== 确认时间戳 =====
    pub student_confirmed_at: Option<DateTime<Utc>>,    // 学员确认时刻
    pub instructor_confirmed_at: Option<DateTime<Utc>>, // 教员确认时刻

    // ===== 时限与结果 =====
    pub expires_at: DateTime<Utc>,    // 失效时刻(创建时 +48h)
    pub new_flight_id: Option<String>, // ACCEPTED 后的后继课程 ID

    // ===== 审计字段 =====
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RescheduleRequest {
    /// 构造初始请求(PENDING_STUDENT)
    pub fn new(
        flight_id: String,
        student_id: String,
        suggestions: Vec<SlotSuggestion>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            flight_id,
            student_id,
            suggestions,
            selected_option: None,
            selected_by: None,
            selected_instructor_id: None,
            status: RescheduleStatus::PendingStudent,
            reject_reason: None,
            student_confirmed_at: None,
            instructor_confirmed_at: None,
            expires_at,
            new_flight_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 是否开放(PENDING_*)
    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// 是否已过失效时刻(仅对开放请求有意义)
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && now > self.expires_at
    }

    /// 取选中的备选方案
    pub fn selected_suggestion(&self) -> Option<&SlotSuggestion> {
        self.selected_option.and_then(|i| self.suggestions.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn suggestion(instructor: &str) -> SlotSuggestion {
        let start = Utc::now() + Duration::days(1);
        SlotSuggestion {
            instructor_id: Some(instructor.to_string()),
            aircraft_id: Some("AC-2".to_string()),
            slot_start: Some(start),
            slot_end: Some(start + Duration::hours(2)),
        }
    }

    #[test]
    fn test_new_request_is_open_pending_student() {
        let req = RescheduleRequest::new(
            "F001".to_string(),
            "STU-1".to_string(),
            vec![suggestion("INS-1")],
            Utc::now() + Duration::hours(48),
        );
        assert_eq!(req.status, RescheduleStatus::PendingStudent);
        assert!(req.is_open());
        assert!(!req.is_expired(Utc::now()));
        assert!(req.selected_suggestion().is_none());
    }

    #[test]
    fn test_expired_only_when_open() {
        let mut req = RescheduleRequest::new(
            "F001".to_string(),
            "STU-1".to_string(),
            vec![suggestion("INS-1")],
            Utc::now() - Duration::hours(1),
        );
        assert!(req.is_expired(Utc::now()));

        // 终态请求不再参与失效判定
        req.status = RescheduleStatus::Rejected;
        assert!(!req.is_expired(Utc::now()));
    }

    #[test]
    fn test_incomplete_suggestion_detected() {
        let mut s = suggestion("INS-1");
        s.aircraft_id = None;
        assert!(!s.is_complete());
        assert!(suggestion("INS-1").is_complete());
    }
}
