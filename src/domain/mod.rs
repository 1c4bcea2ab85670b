// ==========================================
// 飞行训练排班系统 - 领域层
// ==========================================
// 依据: Dispatch_Master_Spec.md - PART C 数据与状态体系
// 红线: 领域层不含数据访问与外部调用
// ==========================================

pub mod audit_log;
pub mod flight;
pub mod reschedule;
pub mod squawk;
pub mod types;
pub mod weather;

// 重导出核心实体
pub use audit_log::{AuditActionType, AuditLog};
pub use flight::Flight;
pub use reschedule::{RescheduleRequest, SlotSuggestion, SuggestionBundle};
pub use squawk::{Aircraft, Squawk};
pub use weather::{Minimums, SafetyMargins, WeatherCheck, WeatherReading};
