// ==========================================
// 飞行训练排班系统 - 操作日志领域模型
// ==========================================
// 依据: Dispatch_Master_Spec.md - PART A3 审计增强
// 红线: 所有状态写入必须留痕
// ==========================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ==========================================
// AuditLog - 操作日志
// ==========================================
// 用途: 审计追踪(人工复飞/停飞级联/状态机转移)
// 对齐: audit_log 表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub audit_id: String,            // 日志 ID(UUID)
    pub action_type: AuditActionType, // 操作类型
    pub actor: String,               // 操作人/系统标识
    pub flight_id: Option<String>,   // 关联课程
    pub aircraft_id: Option<String>, // 关联飞机
    pub request_id: Option<String>,  // 关联改期请求
    pub payload_json: Option<JsonValue>, // 操作参数(JSON)
    pub detail: Option<String>,      // 详细描述
    pub action_ts: DateTime<Utc>,    // 操作时间戳
}

impl AuditLog {
    pub fn new(action_type: AuditActionType, actor: impl Into<String>) -> Self {
        Self {
            audit_id: uuid::Uuid::new_v4().to_string(),
            action_type,
            actor: actor.into(),
            flight_id: None,
            aircraft_id: None,
            request_id: None,
            payload_json: None,
            detail: None,
            action_ts: Utc::now(),
        }
    }

    pub fn with_flight(mut self, flight_id: impl Into<String>) -> Self {
        self.flight_id = Some(flight_id.into());
        self
    }

    pub fn with_aircraft(mut self, aircraft_id: impl Into<String>) -> Self {
        self.aircraft_id = Some(aircraft_id.into());
        self
    }

    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload_json = Some(payload);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ==========================================
// AuditActionType - 操作类型
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditActionType {
    WeatherCancel,     // 天气取消
    MaintenanceCancel, // 机务停飞取消
    AircraftGrounded,  // 飞机停飞
    AircraftReleased,  // 飞机恢复可用
    RescheduleCreate,  // 改期请求创建
    StudentConfirm,    // 学员选择确认
    InstructorConfirm, // 教员确认
    RescheduleReject,  // 改期拒绝
    WeatherOverride,   // 人工复飞(天气豁免)
    SquawkReport,      // 故障报告
    SquawkResolve,     // 故障排除
}

impl AuditActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditActionType::WeatherCancel => "WEATHER_CANCEL",
            AuditActionType::MaintenanceCancel => "MAINTENANCE_CANCEL",
            AuditActionType::AircraftGrounded => "AIRCRAFT_GROUNDED",
            AuditActionType::AircraftReleased => "AIRCRAFT_RELEASED",
            AuditActionType::RescheduleCreate => "RESCHEDULE_CREATE",
            AuditActionType::StudentConfirm => "STUDENT_CONFIRM",
            AuditActionType::InstructorConfirm => "INSTRUCTOR_CONFIRM",
            AuditActionType::RescheduleReject => "RESCHEDULE_REJECT",
            AuditActionType::WeatherOverride => "WEATHER_OVERRIDE",
            AuditActionType::SquawkReport => "SQUAWK_REPORT",
            AuditActionType::SquawkResolve => "SQUAWK_RESOLVE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "WEATHER_CANCEL" => Some(AuditActionType::WeatherCancel),
            "MAINTENANCE_CANCEL" => Some(AuditActionType::MaintenanceCancel),
            "AIRCRAFT_GROUNDED" => Some(AuditActionType::AircraftGrounded),
            "AIRCRAFT_RELEASED" => Some(AuditActionType::AircraftReleased),
            "RESCHEDULE_CREATE" => Some(AuditActionType::RescheduleCreate),
            "STUDENT_CONFIRM" => Some(AuditActionType::StudentConfirm),
            "INSTRUCTOR_CONFIRM" => Some(AuditActionType::InstructorConfirm),
            "RESCHEDULE_REJECT" => Some(AuditActionType::RescheduleReject),
            "WEATHER_OVERRIDE" => Some(AuditActionType::WeatherOverride),
            "SQUAWK_REPORT" => Some(AuditActionType::SquawkReport),
            "SQUAWK_RESOLVE" => Some(AuditActionType::SquawkResolve),
            _ => None,
        }
    }
}
