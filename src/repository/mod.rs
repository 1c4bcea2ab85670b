// ==========================================
// 飞行训练排班系统 - 数据仓储层
// ==========================================
// 依据: Dispatch_Master_Spec.md - PART D 数据访问铁律
// 红线: Repository 不含业务逻辑
// ==========================================
// 职责: 提供数据访问接口,屏蔽数据库细节
// 约束: 所有查询使用参数化,防止 SQL 注入;
//       共享可变状态(课程/请求状态)只走条件更新
// ==========================================

pub mod audit_log_repo;
pub mod error;
pub mod flight_repo;
pub mod reschedule_repo;
pub mod squawk_repo;
pub mod weather_check_repo;

// 重导出核心仓储
pub use audit_log_repo::AuditLogRepository;
pub use error::{RepositoryError, RepositoryResult};
pub use flight_repo::FlightRepository;
pub use reschedule_repo::RescheduleRequestRepository;
pub use squawk_repo::{AircraftRepository, SquawkRepository};
pub use weather_check_repo::WeatherCheckRepository;

/// 枚举列解析失败时的统一错误构造
pub(crate) fn invalid_enum(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("非法枚举值: {}", value).into(),
    )
}
