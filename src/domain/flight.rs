// ==========================================
// 飞行训练排班系统 - 训练课程领域模型
// ==========================================
// 依据: Dispatch_Master_Spec.md - PART C 数据与状态体系
// 红线: status 只能由安全评估/停飞级联/改期状态机/人工复飞写入
// ==========================================

use crate::domain::types::{FlightStatus, FlightType, TrainingLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// Flight - 训练课程(一次排定的飞行训练)
// ==========================================
// 对齐: flight 表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flight {
    // ===== 主键 =====
    pub flight_id: String, // 课程唯一标识(UUID)

    // ===== 关联方 =====
    pub school_id: String,     // 所属航校
    pub student_id: String,    // 学员
    pub instructor_id: String, // 教员
    pub aircraft_id: String,   // 飞机(机尾号关联)

    // ===== 课程属性 =====
    pub aircraft_type: String,         // 机型(最低标准解析维度)
    pub training_level: TrainingLevel, // 学员训练等级(冗余自学员档案)
    pub flight_type: FlightType,       // 课程类型
    pub lesson_code: Option<String>,   // 大纲课目编号(改期时随课程带走)
    pub airport_code: String,          // 基地机场(天气读数来源)

    // ===== 时间窗口 =====
    pub scheduled_start: DateTime<Utc>,       // 起飞时刻
    pub scheduled_end: DateTime<Utc>,         // 落地时刻
    pub briefing_start: Option<DateTime<Utc>>, // 课前讲评开始
    pub debrief_end: Option<DateTime<Utc>>,    // 课后讲评结束

    // ===== 状态 =====
    pub status: FlightStatus, // 课程状态

    // ===== 改期链 =====
    // 红线: 前驱链必须无环,且前驱起飞时刻严格早于本课程
    pub rescheduled_from_id: Option<String>, // 前驱课程 ID

    // ===== 人工复飞(天气豁免) =====
    pub weather_override_flag: bool,           // 人工复飞标记
    pub weather_override_reason: Option<String>, // 复飞理由
    pub weather_override_by: Option<String>,     // 批准人

    // ===== 审计字段 =====
    pub created_at: DateTime<Utc>, // 记录创建时间
    pub updated_at: DateTime<Utc>, // 记录更新时间
}

impl Flight {
    /// 课前讲评相对起飞时刻的提前量
    pub fn briefing_lead(&self) -> Option<chrono::Duration> {
        self.briefing_start.map(|b| self.scheduled_start - b)
    }

    /// 课后讲评相对落地时刻的延后量
    pub fn debrief_tail(&self) -> Option<chrono::Duration> {
        self.debrief_end.map(|d| d - self.scheduled_end)
    }

    /// 距起飞的剩余时间(用于任务优先级计算)
    pub fn hours_until_start(&self, now: DateTime<Utc>) -> i64 {
        (self.scheduled_start - now).num_hours()
    }
}
