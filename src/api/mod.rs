// ==========================================
// 飞行训练排班系统 - API 层
// ==========================================
// 职责: 业务入口(供外围 CRUD/HTTP 壳调用),逐条执行校验后落库
// 红线: 校验(400) / 越权(403) / 冲突(409) / 未找到(404) 分级明确
// ==========================================

pub mod error;
pub mod reschedule_api;
pub mod squawk_api;
pub mod weather_api;

pub use error::{ApiError, ApiResult};
pub use reschedule_api::RescheduleApi;
pub use squawk_api::{SquawkApi, SquawkReportOutcome};
pub use weather_api::{BatchSubmitOutcome, CheckNowOutcome, WeatherApi};
