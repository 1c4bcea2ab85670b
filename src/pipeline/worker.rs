// ==========================================
// 飞行训练排班系统 - 任务执行器与工作池
// ==========================================
// 依据: Dispatch_Engine_Specs_v0.2.md - 5. Job Pipeline
// 红线: 上游超时在任务层转为可重试失败,绝不让工作协程崩溃;
//       单任务失败不中断批次
// ==========================================

use crate::domain::audit_log::{AuditActionType, AuditLog};
use crate::domain::reschedule::RescheduleRequest;
use crate::domain::types::{FlightStatus, JobKind, JobStatus, NotificationKind, SafetyResult};
use crate::engine::providers::{
    notify_best_effort, MinimumsResolver, Notifier, SuggestionGenerator, WeatherProvider,
};
use crate::engine::safety::SafetyEvaluator;
use crate::pipeline::queue::{CheckJob, EnqueueOutcome, JobQueue, JobSubmission};
use crate::pipeline::PipelineConfig;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::{
    AuditLogRepository, FlightRepository, RescheduleRequestRepository, WeatherCheckRepository,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

// ==========================================
// JobError - 任务执行错误
// ==========================================
#[derive(Error, Debug)]
pub enum JobError {
    /// 可重试(上游超时/暂不可用): 次数内退避重试
    #[error("可重试失败: {0}")]
    Retriable(String),

    /// 不可重试(课程缺失等): 直接终态失败
    #[error("不可重试失败: {0}")]
    Permanent(String),
}

fn retriable(e: impl std::fmt::Display) -> JobError {
    JobError::Retriable(e.to_string())
}

// ==========================================
// JobExecutor - 类型分发执行器
// ==========================================
// 说明: 单一工作池处理两类任务,保证优先级全局有序
pub struct JobExecutor {
    flight_repo: Arc<FlightRepository>,
    weather_check_repo: Arc<WeatherCheckRepository>,
    reschedule_repo: Arc<RescheduleRequestRepository>,
    audit_repo: Arc<AuditLogRepository>,
    queue: Arc<JobQueue>,
    weather: Arc<dyn WeatherProvider>,
    minimums: Arc<dyn MinimumsResolver>,
    generator: Arc<dyn SuggestionGenerator>,
    notifier: Arc<dyn Notifier>,
    evaluator: SafetyEvaluator,
    config: PipelineConfig,
}

impl JobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flight_repo: Arc<FlightRepository>,
        weather_check_repo: Arc<WeatherCheckRepository>,
        reschedule_repo: Arc<RescheduleRequestRepository>,
        audit_repo: Arc<AuditLogRepository>,
        queue: Arc<JobQueue>,
        weather: Arc<dyn WeatherProvider>,
        minimums: Arc<dyn MinimumsResolver>,
        generator: Arc<dyn SuggestionGenerator>,
        notifier: Arc<dyn Notifier>,
        evaluator: SafetyEvaluator,
        config: PipelineConfig,
    ) -> Self {
        Self {
            flight_repo,
            weather_check_repo,
            reschedule_repo,
            audit_repo,
            queue,
            weather,
            minimums,
            generator,
            notifier,
            evaluator,
            config,
        }
    }

    pub async fn execute(&self, job: &CheckJob) -> Result<(), JobError> {
        match job.kind {
            JobKind::WeatherCheck => self.run_weather_check(job).await,
            JobKind::RescheduleGeneration => self.run_generation(job).await,
        }
    }

    /// 天气安全检查任务
    ///
    /// 失败语义: 读数不可得时评估器不被调用,记可重试失败;
    /// UNSAFE 时取消课程并追加一条建议生成任务。
    async fn run_weather_check(&self, job: &CheckJob) -> Result<(), JobError> {
        let flight = self
            .flight_repo
            .find_by_id(&job.flight_id)
            .map_err(retriable)?
            .ok_or_else(|| JobError::Permanent(format!("课程不存在: {}", job.flight_id)))?;

        // 已离开可检查状态(他方已取消/已完成) → 幂等跳过
        if !FlightStatus::checkable().contains(&flight.status) {
            tracing::debug!(
                flight_id = flight.flight_id.as_str(),
                status = flight.status.to_db_str(),
                "课程不在可检查状态,跳过天气检查"
            );
            return Ok(());
        }

        // 读数获取套硬超时
        let reading = match tokio::time::timeout(
            self.config.weather_timeout,
            self.weather.fetch(&flight.airport_code),
        )
        .await
        {
            Err(_) => return Err(JobError::Retriable("气象读数获取超时".to_string())),
            Ok(Err(e)) => return Err(JobError::Retriable(format!("气象读数不可得: {}", e))),
            Ok(Ok(reading)) => reading,
        };

        let minimums = self
            .minimums
            .resolve(flight.training_level, &flight.aircraft_type, flight.flight_type)
            .map_err(|e| JobError::Retriable(format!("最低标准解析失败: {}", e)))?;

        let evaluation = self.evaluator.evaluate(&reading, &minimums);
        let check = SafetyEvaluator::to_check(&flight.flight_id, &reading, &minimums, &evaluation);
        self.weather_check_repo.insert(&check).map_err(retriable)?;

        tracing::info!(
            flight_id = flight.flight_id.as_str(),
            result = evaluation.result.to_db_str(),
            confidence = evaluation.confidence,
            "天气安全检查完成"
        );

        if evaluation.result == SafetyResult::Unsafe {
            match self.flight_repo.transition_status(
                &flight.flight_id,
                FlightStatus::checkable(),
                FlightStatus::WeatherCancelled,
            ) {
                Ok(()) => {
                    self.audit_repo.record_best_effort(
                        AuditLog::new(AuditActionType::WeatherCancel, "system")
                            .with_flight(&flight.flight_id)
                            .with_payload(json!({
                                "check_id": check.check_id,
                                "reasons": evaluation.reasons,
                            })),
                    );
                    notify_best_effort(
                        self.notifier.as_ref(),
                        &flight.student_id,
                        NotificationKind::WeatherCancelled,
                        json!({
                            "flight_id": flight.flight_id,
                            "reasons": evaluation.reasons,
                        }),
                    );
                    // 追加建议生成任务(高优先级,学员在等备选)
                    if let Err(e) = self.queue.enqueue(
                        JobSubmission {
                            flight_id: flight.flight_id.clone(),
                            kind: JobKind::RescheduleGeneration,
                            payload: None,
                            nonce: None,
                        },
                        Some(flight.scheduled_start),
                    ) {
                        tracing::warn!(
                            flight_id = flight.flight_id.as_str(),
                            "建议生成任务入队失败: {}",
                            e
                        );
                    }
                }
                // 竞争失败: 他方已写过状态,天气检查证据已留,不算任务失败
                Err(RepositoryError::TransitionConflict { .. }) => {
                    tracing::debug!(
                        flight_id = flight.flight_id.as_str(),
                        "课程状态已被他方转移,跳过取消"
                    );
                }
                Err(e) => return Err(retriable(e)),
            }
        }

        Ok(())
    }

    /// 改期建议生成任务
    async fn run_generation(&self, job: &CheckJob) -> Result<(), JobError> {
        let flight = self
            .flight_repo
            .find_by_id(&job.flight_id)
            .map_err(retriable)?
            .ok_or_else(|| JobError::Permanent(format!("课程不存在: {}", job.flight_id)))?;

        // 只为仍处于取消状态的课程生成(人工复飞后任务作废)
        if !matches!(
            flight.status,
            FlightStatus::WeatherCancelled | FlightStatus::MaintenanceCancelled
        ) {
            tracing::debug!(
                flight_id = flight.flight_id.as_str(),
                status = flight.status.to_db_str(),
                "课程已离开取消状态,跳过建议生成"
            );
            return Ok(());
        }
        if self
            .reschedule_repo
            .has_open_for_flight(&flight.flight_id)
            .map_err(retriable)?
        {
            return Ok(());
        }

        let bundle = match tokio::time::timeout(
            self.config.suggestion_timeout,
            self.generator.generate(&flight),
        )
        .await
        {
            Err(_) => return Err(JobError::Retriable("建议生成超时".to_string())),
            Ok(Err(e)) => return Err(JobError::Retriable(format!("建议生成失败: {}", e))),
            Ok(Ok(bundle)) => bundle,
        };
        if bundle.suggestions.is_empty() {
            return Err(JobError::Retriable("建议生成器未返回备选方案".to_string()));
        }

        let request = RescheduleRequest::new(
            flight.flight_id.clone(),
            flight.student_id.clone(),
            bundle.suggestions,
            Utc::now() + ChronoDuration::hours(self.config.expiry_hours),
        );
        match self.reschedule_repo.create(&request) {
            Ok(()) => {}
            Err(RepositoryError::DuplicateOpenRequest(_)) => return Ok(()),
            Err(e) => return Err(retriable(e)),
        }

        self.audit_repo.record_best_effort(
            AuditLog::new(AuditActionType::RescheduleCreate, "system")
                .with_flight(&flight.flight_id)
                .with_request(&request.request_id)
                .with_detail(format!("options={}", request.suggestions.len())),
        );
        notify_best_effort(
            self.notifier.as_ref(),
            &flight.student_id,
            NotificationKind::RescheduleOptions,
            json!({
                "request_id": request.request_id,
                "flight_id": flight.flight_id,
                "option_count": request.suggestions.len(),
                "expires_at": request.expires_at.to_rfc3339(),
            }),
        );
        Ok(())
    }
}

// ==========================================
// JobPipeline - 工作池(显式生命周期)
// ==========================================
pub struct JobPipeline {
    queue: Arc<JobQueue>,
    executor: Arc<JobExecutor>,
    config: PipelineConfig,
    wake: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl JobPipeline {
    pub fn new(queue: Arc<JobQueue>, executor: Arc<JobExecutor>, config: PipelineConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queue,
            executor,
            config,
            wake: Arc::new(Notify::new()),
            shutdown_tx,
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// 启动工作协程(幂等: 已启动则忽略)
    ///
    /// 必须在 tokio 运行时上下文内调用。
    pub fn start(&self) {
        let mut workers = match self.workers.lock() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::error!("工作池锁获取失败: {}", e);
                return;
            }
        };
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.config.worker_count {
            let queue = self.queue.clone();
            let executor = self.executor.clone();
            let wake = self.wake.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            let poll_interval = self.config.poll_interval;
            workers.push(tokio::spawn(async move {
                worker_loop(worker_id, queue, executor, wake, shutdown_rx, poll_interval).await;
            }));
        }
        tracing::info!(worker_count = self.config.worker_count, "任务工作池已启动");
    }

    /// 提交任务并唤醒空闲工作协程
    pub fn submit(
        &self,
        submission: JobSubmission,
        scheduled_start: Option<DateTime<Utc>>,
    ) -> RepositoryResult<EnqueueOutcome> {
        let outcome = self.queue.enqueue(submission, scheduled_start)?;
        self.wake.notify_one();
        Ok(outcome)
    }

    /// 等待队列清空(在途任务全部进入终态)
    pub async fn drain(&self) {
        loop {
            match self.queue.has_open() {
                Ok(false) => return,
                Ok(true) => {}
                Err(e) => {
                    tracing::warn!("drain 查询失败: {}", e);
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    /// 停止工作池并等待全部协程退出
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.wake.notify_waiters();
        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(e) => {
                tracing::error!("工作池锁获取失败: {}", e);
                return;
            }
        };
        futures::future::join_all(handles).await;
        tracing::info!("任务工作池已停止");
    }

    /// 同步等待单个任务进入终态
    ///
    /// 超过上限时直接汇报 FAILED 而非继续挂起;
    /// 底层任务会继续跑完,结果仍可通过状态查询拿到。
    pub async fn wait_for_job(&self, job_id: &str) -> JobStatus {
        let poll = std::time::Duration::from_millis(50);
        let waited = tokio::time::timeout(self.config.sync_wait_timeout, async {
            loop {
                match self.queue.find_by_id(job_id) {
                    Ok(Some(job)) if job.status.is_terminal() => return job.status,
                    Ok(Some(_)) => {}
                    Ok(None) => return JobStatus::Failed,
                    Err(e) => {
                        tracing::warn!(job_id, "任务状态查询失败: {}", e);
                    }
                }
                tokio::time::sleep(poll).await;
            }
        })
        .await;

        match waited {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(job_id, "同步等待超时,任务继续后台执行");
                JobStatus::Failed
            }
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }
}

/// 工作协程主循环: 认领 → 执行 → 回写,空闲时等待唤醒或轮询
async fn worker_loop(
    worker_id: usize,
    queue: Arc<JobQueue>,
    executor: Arc<JobExecutor>,
    wake: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
    poll_interval: std::time::Duration,
) {
    tracing::debug!(worker_id, "工作协程启动");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        match queue.claim_next(Utc::now()) {
            Ok(Some(job)) => {
                let result = executor.execute(&job).await;
                let writeback = match result {
                    Ok(()) => queue.complete(&job.job_id),
                    Err(JobError::Retriable(msg)) => queue.fail(&job.job_id, &msg).map(|_| ()),
                    Err(JobError::Permanent(msg)) => queue.fail_permanent(&job.job_id, &msg),
                };
                if let Err(e) = writeback {
                    tracing::error!(
                        worker_id,
                        job_id = job.job_id.as_str(),
                        "任务状态回写失败: {}",
                        e
                    );
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
            Err(e) => {
                // 认领失败不退出循环: 短暂退避后继续
                tracing::error!(worker_id, "任务认领失败: {}", e);
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
    tracing::debug!(worker_id, "工作协程退出");
}
