// ==========================================
// 飞行训练排班系统 - 停飞级联处理器
// ==========================================
// 依据: Dispatch_Engine_Specs_v0.2.md - 4. Grounding Cascade
// 红线: 第 1-3 步(停飞/快照/批量取消)决定报告是否"落账成功";
//       第 4 步(逐课程生成改期建议)后台限并发执行,单课程失败不致命
// ==========================================

use crate::config::ConfigManager;
use crate::domain::audit_log::{AuditActionType, AuditLog};
use crate::domain::flight::Flight;
use crate::domain::reschedule::RescheduleRequest;
use crate::domain::squawk::Squawk;
use crate::domain::types::{FlightStatus, NotificationKind};
use crate::engine::providers::{notify_best_effort, Notifier, SuggestionGenerator};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::{
    AircraftRepository, AuditLogRepository, FlightRepository, RescheduleRequestRepository,
    SquawkRepository,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

// ==========================================
// CascadeConfig - 级联配置
// ==========================================
#[derive(Debug, Clone)]
pub struct CascadeConfig {
    pub concurrency: usize,              // 第 4 步扇出并发上限
    pub suggestion_timeout: Duration,    // 单课程建议生成硬超时
    pub expiry_hours: i64,               // 改期请求有效期(小时)
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            suggestion_timeout: Duration::from_secs(30),
            expiry_hours: 48,
        }
    }
}

impl CascadeConfig {
    pub fn from_config(cfg: &ConfigManager) -> RepositoryResult<Self> {
        Ok(Self {
            concurrency: cfg.get_i64_or(crate::config::config_manager::KEY_CASCADE_CONCURRENCY, 4)?
                .max(1) as usize,
            suggestion_timeout: Duration::from_secs(
                cfg.get_i64_or(
                    crate::config::config_manager::KEY_SUGGESTION_TIMEOUT_SECS,
                    30,
                )?
                .max(1) as u64,
            ),
            expiry_hours: cfg.reschedule_expiry_hours()?,
        })
    }
}

// ==========================================
// CascadeOutcome - 级联同步阶段结果
// ==========================================
// 说明: 第 3 步完成即返回,第 4 步继续在后台推进
#[derive(Debug, Clone)]
pub struct CascadeOutcome {
    pub newly_grounded: bool,            // 本次是否完成停飞(false=幂等跳过)
    pub impacted_flight_ids: Vec<String>, // 受影响课程快照
    pub cancelled_count: usize,          // 成功转为 MAINTENANCE_CANCELLED 的数量
}

struct CascadeDeps {
    flight_repo: Arc<FlightRepository>,
    reschedule_repo: Arc<RescheduleRequestRepository>,
    squawk_repo: Arc<SquawkRepository>,
    aircraft_repo: Arc<AircraftRepository>,
    audit_repo: Arc<AuditLogRepository>,
    generator: Arc<dyn SuggestionGenerator>,
    notifier: Arc<dyn Notifier>,
}

// ==========================================
// GroundingCascadeHandler - 停飞级联处理器
// ==========================================
pub struct GroundingCascadeHandler {
    deps: Arc<CascadeDeps>,
    config: CascadeConfig,
    runtime: tokio::runtime::Handle,
}

impl GroundingCascadeHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flight_repo: Arc<FlightRepository>,
        reschedule_repo: Arc<RescheduleRequestRepository>,
        squawk_repo: Arc<SquawkRepository>,
        aircraft_repo: Arc<AircraftRepository>,
        audit_repo: Arc<AuditLogRepository>,
        generator: Arc<dyn SuggestionGenerator>,
        notifier: Arc<dyn Notifier>,
        config: CascadeConfig,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            deps: Arc::new(CascadeDeps {
                flight_repo,
                reschedule_repo,
                squawk_repo,
                aircraft_repo,
                audit_repo,
                generator,
                notifier,
            }),
            config,
            runtime,
        }
    }

    /// 执行级联第 1-3 步并触发第 4 步后台扇出
    ///
    /// 幂等性: 重复停飞同一飞机时第 1 步为空操作,
    /// 但第 2-4 步仍按当前数据重算(补扫历史遗漏课程)。
    pub fn trigger(&self, squawk: &Squawk) -> RepositoryResult<CascadeOutcome> {
        let aircraft_id = squawk.aircraft_id.as_str();

        // === 第 1 步: 停飞(幂等) ===
        let newly_grounded = self.deps.aircraft_repo.ground_if_available(aircraft_id)?;
        if newly_grounded {
            self.deps.audit_repo.record_best_effort(
                AuditLog::new(AuditActionType::AircraftGrounded, &squawk.reported_by)
                    .with_aircraft(aircraft_id)
                    .with_detail(format!("squawk_id={}", squawk.squawk_id)),
            );
        } else {
            tracing::info!(
                aircraft_id,
                "飞机已处于停飞状态,按当前数据重算级联"
            );
        }

        // === 第 2 步: 查询未来待飞课程并写入快照 ===
        let flights = self.deps.flight_repo.find_future_by_aircraft(
            aircraft_id,
            Utc::now(),
            FlightStatus::cascade_eligible(),
        )?;
        let impacted_ids: Vec<String> = flights.iter().map(|f| f.flight_id.clone()).collect();
        self.deps
            .squawk_repo
            .set_impacted_flights(&squawk.squawk_id, &impacted_ids)?;

        // === 第 3 步: 批量转为 MAINTENANCE_CANCELLED ===
        // 单课程转移失败不中断批次,只记数
        let mut cancelled_count = 0;
        for flight in &flights {
            match self.deps.flight_repo.transition_status(
                &flight.flight_id,
                FlightStatus::cascade_eligible(),
                FlightStatus::MaintenanceCancelled,
            ) {
                Ok(()) => {
                    cancelled_count += 1;
                    self.deps.audit_repo.record_best_effort(
                        AuditLog::new(AuditActionType::MaintenanceCancel, "system")
                            .with_flight(&flight.flight_id)
                            .with_aircraft(aircraft_id)
                            .with_detail(format!("squawk_id={}", squawk.squawk_id)),
                    );
                    notify_best_effort(
                        self.deps.notifier.as_ref(),
                        &flight.student_id,
                        NotificationKind::MaintenanceCancelled,
                        json!({
                            "flight_id": flight.flight_id,
                            "aircraft_id": aircraft_id,
                        }),
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        flight_id = flight.flight_id.as_str(),
                        "级联取消失败(跳过该课程): {}",
                        e
                    );
                }
            }
        }

        tracing::info!(
            aircraft_id,
            impacted = impacted_ids.len(),
            cancelled = cancelled_count,
            "停飞级联第 1-3 步完成,改期建议生成转后台"
        );

        // === 第 4 步: 后台限并发扇出,不阻塞报告响应 ===
        let deps = self.deps.clone();
        let config = self.config.clone();
        self.runtime.spawn(async move {
            Self::fan_out(deps, config, flights).await;
        });

        Ok(CascadeOutcome {
            newly_grounded,
            impacted_flight_ids: impacted_ids,
            cancelled_count,
        })
    }

    /// 第 4 步: 逐课程生成改期请求(限并发 + 单课程硬超时)
    async fn fan_out(deps: Arc<CascadeDeps>, config: CascadeConfig, flights: Vec<Flight>) {
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        let mut handles = Vec::new();

        for flight in flights {
            let deps = deps.clone();
            let config = config.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                // 信号量关闭只会发生在进程退出路径,此处直接放弃即可
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return false,
                };
                match Self::generate_for_flight(&deps, &config, &flight).await {
                    Ok(created) => created,
                    Err(e) => {
                        // 软失败: 课程保持 MAINTENANCE_CANCELLED,等待重试或人工处理
                        tracing::warn!(
                            flight_id = flight.flight_id.as_str(),
                            "改期建议生成失败(课程保持取消状态): {}",
                            e
                        );
                        false
                    }
                }
            }));
        }

        let results = futures::future::join_all(handles).await;
        let created = results
            .iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();
        let total = results.len();
        tracing::info!(
            created,
            total,
            "停飞级联扇出完成: {}/{} 个课程已生成改期请求",
            created,
            total
        );
    }

    /// 单课程生成: 成功返回 Ok(true),幂等跳过返回 Ok(false)
    async fn generate_for_flight(
        deps: &CascadeDeps,
        config: &CascadeConfig,
        flight: &Flight,
    ) -> Result<bool, String> {
        // 只为仍处于机务取消状态的课程生成
        match deps.flight_repo.current_status(&flight.flight_id) {
            Ok(Some(FlightStatus::MaintenanceCancelled)) => {}
            Ok(_) => return Ok(false),
            Err(e) => return Err(e.to_string()),
        }
        if deps
            .reschedule_repo
            .has_open_for_flight(&flight.flight_id)
            .map_err(|e| e.to_string())?
        {
            return Ok(false);
        }

        // 建议生成套硬超时: 单个慢调用不得拖垮批次
        let bundle = match tokio::time::timeout(
            config.suggestion_timeout,
            deps.generator.generate(flight),
        )
        .await
        {
            Err(_) => return Err("建议生成超时".to_string()),
            Ok(Err(e)) => return Err(format!("建议生成失败: {}", e)),
            Ok(Ok(bundle)) => bundle,
        };
        if bundle.suggestions.is_empty() {
            return Err("建议生成器未返回备选方案".to_string());
        }

        let request = RescheduleRequest::new(
            flight.flight_id.clone(),
            flight.student_id.clone(),
            bundle.suggestions,
            Utc::now() + ChronoDuration::hours(config.expiry_hours),
        );
        match deps.reschedule_repo.create(&request) {
            Ok(()) => {}
            // 并发补扫竞争: 已有开放请求视作幂等跳过
            Err(RepositoryError::DuplicateOpenRequest(_)) => return Ok(false),
            Err(e) => return Err(e.to_string()),
        }

        deps.audit_repo.record_best_effort(
            AuditLog::new(AuditActionType::RescheduleCreate, "system")
                .with_flight(&flight.flight_id)
                .with_request(&request.request_id)
                .with_detail(format!("options={}", request.suggestions.len())),
        );
        notify_best_effort(
            deps.notifier.as_ref(),
            &flight.student_id,
            NotificationKind::RescheduleOptions,
            json!({
                "request_id": request.request_id,
                "flight_id": flight.flight_id,
                "option_count": request.suggestions.len(),
                "expires_at": request.expires_at.to_rfc3339(),
            }),
        );
        Ok(true)
    }
}
