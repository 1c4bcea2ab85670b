// ==========================================
// 飞行训练排班系统 - 核心库
// ==========================================
// 依据: Dispatch_Master_Spec.md - 系统宪法
// 系统定位: 天气驱动改期引擎(安全评估/任务管道/改期状态机/停飞级联)
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与类型
pub mod domain;

// 数据仓储层 - 数据访问
pub mod repository;

// 引擎层 - 业务规则
pub mod engine;

// 管道层 - 后台任务队列与工作池
pub mod pipeline;

// 配置层 - 系统配置
pub mod config;

// 数据库基础设施(连接初始化/PRAGMA 统一)
pub mod db;

// 日志系统
pub mod logging;

// API 层 - 业务接口
pub mod api;

// 应用层 - 状态装配
pub mod app;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::types::{
    AircraftStatus, FlightStatus, FlightType, JobKind, JobStatus, NotificationKind,
    RescheduleStatus, SafetyResult, SelectedBy, SquawkSeverity, SquawkStatus, TrainingLevel,
};

// 领域实体
pub use domain::{
    Aircraft, AuditLog, Flight, Minimums, RescheduleRequest, SafetyMargins, SlotSuggestion,
    Squawk, SuggestionBundle, WeatherCheck, WeatherReading,
};

// 引擎
pub use engine::{
    CascadeOutcome, GroundingCascadeHandler, MinimumsResolver, NoOpNotifier, Notifier,
    ProviderError, SafetyEvaluation, SafetyEvaluator, StaticMinimumsResolver,
    SuggestionGenerator, WeatherProvider,
};

// 管道
pub use pipeline::{JobPipeline, JobQueue, JobSubmission, PipelineConfig};

// API
pub use api::{ApiError, ApiResult, RescheduleApi, SquawkApi, WeatherApi};

// 应用装配
pub use app::{AppState, Collaborators};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "飞行训练排班系统";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
