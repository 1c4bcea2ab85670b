// ==========================================
// 飞行训练排班系统 - 引擎层
// ==========================================
// 依据: Dispatch_Master_Spec.md - PART D 引擎铁律
// 职责: 业务规则(安全评估/停飞级联)与外部协作方接口
// ==========================================

pub mod cascade;
pub mod providers;
pub mod safety;

pub use cascade::{CascadeConfig, CascadeOutcome, GroundingCascadeHandler};
pub use providers::{
    notify_best_effort, MinimumsResolver, NoOpNotifier, Notifier, ProviderError,
    StaticMinimumsResolver, SuggestionGenerator, WeatherProvider,
};
pub use safety::{SafetyEvaluation, SafetyEvaluator};
