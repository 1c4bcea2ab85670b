// ==========================================
// 飞行训练排班系统 - 应用状态装配
// ==========================================
// 职责: 管理应用级别的共享状态和API实例
// 说明: 外部协作方(气象/建议生成/通知)由调用方注入,
//       引擎只依赖接口
// ==========================================

use std::sync::{Arc, Mutex};

use crate::api::{RescheduleApi, SquawkApi, WeatherApi};
use crate::config::ConfigManager;
use crate::db::open_sqlite_connection;
use crate::engine::cascade::{CascadeConfig, GroundingCascadeHandler};
use crate::engine::providers::{
    MinimumsResolver, Notifier, SuggestionGenerator, WeatherProvider,
};
use crate::engine::safety::SafetyEvaluator;
use crate::pipeline::queue::JobQueue;
use crate::pipeline::worker::{JobExecutor, JobPipeline};
use crate::pipeline::PipelineConfig;
use crate::repository::{
    AircraftRepository, AuditLogRepository, FlightRepository, RescheduleRequestRepository,
    SquawkRepository, WeatherCheckRepository,
};

/// 外部协作方集合(装配入参)
pub struct Collaborators {
    pub weather: Arc<dyn WeatherProvider>,
    pub minimums: Arc<dyn MinimumsResolver>,
    pub generator: Arc<dyn SuggestionGenerator>,
    pub notifier: Arc<dyn Notifier>,
}

/// 应用状态
///
/// 包含所有API实例和共享资源
pub struct AppState {
    /// 数据库路径
    pub db_path: String,

    /// 天气检查API
    pub weather_api: Arc<WeatherApi>,

    /// 改期请求API
    pub reschedule_api: Arc<RescheduleApi>,

    /// 故障报告API
    pub squawk_api: Arc<SquawkApi>,

    /// 后台任务管道(显式生命周期: start/drain/stop)
    pub pipeline: Arc<JobPipeline>,

    /// 操作日志仓储(用于审计追踪)
    pub audit_log_repo: Arc<AuditLogRepository>,
}

impl AppState {
    /// 创建新的AppState实例
    ///
    /// # 说明
    /// 该方法会:
    /// 1. 初始化所有Repository
    /// 2. 加载配置并初始化引擎/管道
    /// 3. 创建所有API实例
    ///
    /// 管道工作协程不会自动启动,调用方在运行时上下文内执行
    /// `state.pipeline.start()`。
    pub fn new(db_path: String, collaborators: Collaborators) -> Result<Self, String> {
        tracing::info!("初始化AppState,数据库路径: {}", db_path);

        let conn = open_sqlite_connection(&db_path)
            .map_err(|e| format!("无法打开数据库: {}", e))?;
        let conn = Arc::new(Mutex::new(conn));

        // ==========================================
        // 初始化Repository层
        // ==========================================
        let flight_repo = Arc::new(FlightRepository::new(conn.clone()));
        let weather_check_repo = Arc::new(WeatherCheckRepository::new(conn.clone()));
        let reschedule_repo = Arc::new(RescheduleRequestRepository::new(conn.clone()));
        let squawk_repo = Arc::new(SquawkRepository::new(conn.clone()));
        let aircraft_repo = Arc::new(AircraftRepository::new(conn.clone()));
        let audit_log_repo = Arc::new(AuditLogRepository::new(conn.clone()));

        // ==========================================
        // 配置与引擎层
        // ==========================================
        let config_manager = ConfigManager::from_connection(conn.clone());
        let pipeline_config = PipelineConfig::from_config(&config_manager)
            .map_err(|e| format!("管道配置加载失败: {}", e))?;
        let cascade_config = CascadeConfig::from_config(&config_manager)
            .map_err(|e| format!("级联配置加载失败: {}", e))?;
        let margins = config_manager
            .safety_margins()
            .map_err(|e| format!("安全余量配置加载失败: {}", e))?;
        let evaluator = SafetyEvaluator::new(margins);

        // ==========================================
        // 后台任务管道
        // ==========================================
        let queue = Arc::new(
            JobQueue::new(conn, &pipeline_config)
                .map_err(|e| format!("无法创建JobQueue: {}", e))?,
        );
        let executor = Arc::new(JobExecutor::new(
            flight_repo.clone(),
            weather_check_repo.clone(),
            reschedule_repo.clone(),
            audit_log_repo.clone(),
            queue.clone(),
            collaborators.weather,
            collaborators.minimums,
            collaborators.generator.clone(),
            collaborators.notifier.clone(),
            evaluator,
            pipeline_config.clone(),
        ));
        let pipeline = Arc::new(JobPipeline::new(queue, executor, pipeline_config.clone()));

        // ==========================================
        // 停飞级联处理器
        // ==========================================
        let cascade = Arc::new(GroundingCascadeHandler::new(
            flight_repo.clone(),
            reschedule_repo.clone(),
            squawk_repo.clone(),
            aircraft_repo.clone(),
            audit_log_repo.clone(),
            collaborators.generator,
            collaborators.notifier.clone(),
            cascade_config,
            tokio::runtime::Handle::current(),
        ));

        // ==========================================
        // 初始化API层
        // ==========================================
        let weather_api = Arc::new(WeatherApi::new(
            pipeline.clone(),
            flight_repo.clone(),
            weather_check_repo,
            audit_log_repo.clone(),
        ));
        let reschedule_api = Arc::new(RescheduleApi::new(
            reschedule_repo,
            flight_repo,
            audit_log_repo.clone(),
            collaborators.notifier,
            pipeline_config.expiry_hours,
        ));
        let squawk_api = Arc::new(SquawkApi::new(
            squawk_repo,
            aircraft_repo,
            audit_log_repo.clone(),
            cascade,
        ));

        tracing::info!("AppState初始化完成");

        Ok(Self {
            db_path,
            weather_api,
            reschedule_api,
            squawk_api,
            pipeline,
            audit_log_repo,
        })
    }

    /// 获取数据库路径
    pub fn get_db_path(&self) -> &str {
        &self.db_path
    }
}
