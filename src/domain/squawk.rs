// ==========================================
// 飞行训练排班系统 - 故障报告与飞机领域模型
// ==========================================
// 依据: Dispatch_Engine_Specs_v0.2.md - 4. Grounding Cascade
// ==========================================

use crate::domain::types::{AircraftStatus, SquawkSeverity, SquawkStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// Aircraft - 训练飞机
// ==========================================
// 对齐: aircraft 表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aircraft {
    pub aircraft_id: String,        // 飞机 ID
    pub tail_number: String,        // 机尾号
    pub aircraft_type: String,      // 机型
    pub status: AircraftStatus,     // AVAILABLE / GROUNDED
    pub updated_at: DateTime<Utc>,  // 最后更新时间
}

// ==========================================
// Squawk - 故障报告
// ==========================================
// 红线: 仅 GROUNDING 严重度对其他实体产生副作用
// 对齐: squawk 表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Squawk {
    // ===== 主键与关联 =====
    pub squawk_id: String,   // 报告 ID(UUID)
    pub aircraft_id: String, // 涉事飞机

    // ===== 报告内容 =====
    pub reported_by: String,        // 报告人(教员/管理员)
    pub severity: SquawkSeverity,   // 严重度
    pub description: String,        // 故障描述

    // ===== 状态 =====
    pub status: SquawkStatus, // OPEN / RESOLVED

    // ===== 级联快照(仅 GROUNDING) =====
    pub impacted_flight_ids: Vec<String>, // 受影响课程 ID 快照

    // ===== 审计字段 =====
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Squawk {
    /// 构造新报告(OPEN)
    pub fn new(
        aircraft_id: String,
        reported_by: String,
        severity: SquawkSeverity,
        description: String,
    ) -> Self {
        Self {
            squawk_id: uuid::Uuid::new_v4().to_string(),
            aircraft_id,
            reported_by,
            severity,
            description,
            status: SquawkStatus::Open,
            impacted_flight_ids: Vec::new(),
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// 是否触发停飞级联
    pub fn triggers_cascade(&self) -> bool {
        self.severity == SquawkSeverity::Grounding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_grounding_triggers_cascade() {
        let mk = |sev| {
            Squawk::new(
                "AC-1".to_string(),
                "INS-1".to_string(),
                sev,
                "左磁电机跳点超限".to_string(),
            )
        };
        assert!(!mk(SquawkSeverity::Minor).triggers_cascade());
        assert!(!mk(SquawkSeverity::Major).triggers_cascade());
        assert!(mk(SquawkSeverity::Grounding).triggers_cascade());
    }
}
