// ==========================================
// 飞行训练排班系统 - 后台任务队列
// ==========================================
// 依据: Dispatch_Engine_Specs_v0.2.md - 5. Job Pipeline
// 职责: 管理天气检查/建议生成任务队列,支撑优先级出队与有限重试
// 红线: 认领走状态键控条件更新,多工作协程不得重复处理同一任务
// ==========================================

use crate::domain::types::{JobKind, JobStatus};
use crate::pipeline::PipelineConfig;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::invalid_enum;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const JOB_COLUMNS: &str = "job_id, flight_id, kind, payload_json, priority, idempotency_key, \
     status, retry_count, max_retries, next_attempt_at, created_at, started_at, completed_at, \
     error_message";

// ==========================================
// CheckJob - 队列任务
// ==========================================
#[derive(Debug, Clone)]
pub struct CheckJob {
    pub job_id: String,
    pub flight_id: String,                    // 所属课程(状态聚合维度)
    pub kind: JobKind,                        // 任务类型(单一工作池按类型分发)
    pub payload_json: Option<JsonValue>,      // 任务负载
    pub priority: i64,                        // 优先级(大者先出队)
    pub idempotency_key: String,              // 幂等键(flight × kind × nonce)
    pub status: JobStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    pub next_attempt_at: DateTime<Utc>,       // 指数退避后的下次可执行时刻
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

// ==========================================
// JobSubmission - 任务提交参数
// ==========================================
#[derive(Debug, Clone)]
pub struct JobSubmission {
    pub flight_id: String,
    pub kind: JobKind,
    pub payload: Option<JsonValue>,
    /// 提交序号: 同 (flight, kind) 默认去重,调用方显式换 nonce 才会并行入队
    pub nonce: Option<String>,
}

/// 入队结果
#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub job_id: String,
    pub deduplicated: bool, // true = 命中在途任务,未新建
}

/// 按课程聚合的任务状态
#[derive(Debug, Clone)]
pub struct FlightJobStatus {
    pub flight_id: String,
    pub status: JobStatus, // 取最高汇报优先级: COMPLETED > ACTIVE > WAITING > FAILED
    pub job_count: i64,
}

/// 队列统计信息
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub waiting_count: u32,
    pub active_count: u32,
    pub completed_count: u32,
    pub failed_count: u32,
}

// ==========================================
// JobQueue - 任务队列管理器
// ==========================================
pub struct JobQueue {
    conn: Arc<Mutex<Connection>>,
    max_retries: i64,
    backoff_base: ChronoDuration,
    urgent_horizon_hours: i64,
}

impl JobQueue {
    pub fn new(conn: Arc<Mutex<Connection>>, config: &PipelineConfig) -> RepositoryResult<Self> {
        let queue = Self {
            conn,
            max_retries: config.max_retries,
            backoff_base: ChronoDuration::from_std(config.backoff_base)
                .unwrap_or_else(|_| ChronoDuration::seconds(30)),
            urgent_horizon_hours: config.urgent_horizon_hours,
        };
        queue.ensure_tables()?;
        Ok(queue)
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    fn ensure_tables(&self) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS check_job_queue (
              job_id TEXT PRIMARY KEY,
              flight_id TEXT NOT NULL,
              kind TEXT NOT NULL,
              payload_json TEXT,
              priority INTEGER NOT NULL DEFAULT 10,
              idempotency_key TEXT NOT NULL,
              status TEXT NOT NULL DEFAULT 'WAITING',
              retry_count INTEGER NOT NULL DEFAULT 0,
              max_retries INTEGER NOT NULL DEFAULT 3,
              next_attempt_at TEXT NOT NULL,
              created_at TEXT NOT NULL,
              started_at TEXT,
              completed_at TEXT,
              error_message TEXT
            );

            -- 幂等兜底: 在途任务的幂等键唯一
            CREATE UNIQUE INDEX IF NOT EXISTS uq_job_open_idempotency
              ON check_job_queue(idempotency_key)
              WHERE status IN ('WAITING', 'ACTIVE');

            CREATE INDEX IF NOT EXISTS idx_job_status_priority
              ON check_job_queue(status, priority DESC, created_at);
            CREATE INDEX IF NOT EXISTS idx_job_flight
              ON check_job_queue(flight_id, status);
            "#,
        )?;
        Ok(())
    }

    /// 按紧迫度计算优先级: 24h 窗口内的课程优先处理
    fn compute_priority(
        &self,
        kind: JobKind,
        scheduled_start: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> i64 {
        // 建议生成任务总是高优先级(课程已被取消,学员在等方案)
        if kind == JobKind::RescheduleGeneration {
            return 100;
        }
        match scheduled_start {
            Some(start) => {
                let hours = (start - now).num_hours();
                if hours <= self.urgent_horizon_hours {
                    100
                } else if hours <= self.urgent_horizon_hours * 3 {
                    50
                } else {
                    10
                }
            }
            None => 10,
        }
    }

    /// 提交任务
    ///
    /// 幂等性: 同 (flight, kind, nonce) 已有在途任务时返回其 job_id,
    /// 不会对已在处理中的课程重复入队。
    pub fn enqueue(
        &self,
        submission: JobSubmission,
        scheduled_start: Option<DateTime<Utc>>,
    ) -> RepositoryResult<EnqueueOutcome> {
        let now = Utc::now();
        let nonce = submission.nonce.as_deref().unwrap_or("0");
        let idempotency_key = format!(
            "{}:{}:{}",
            submission.flight_id,
            submission.kind.to_db_str(),
            nonce
        );

        let conn = self.get_conn()?;

        // 在途去重(唯一索引是并发兜底)
        let existing: Option<String> = conn
            .query_row(
                "SELECT job_id FROM check_job_queue
                 WHERE idempotency_key = ?1 AND status IN ('WAITING', 'ACTIVE')
                 LIMIT 1",
                params![idempotency_key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(job_id) = existing {
            tracing::debug!(
                flight_id = submission.flight_id.as_str(),
                kind = submission.kind.to_db_str(),
                "命中在途任务,跳过重复入队"
            );
            return Ok(EnqueueOutcome {
                job_id,
                deduplicated: true,
            });
        }

        let job_id = Uuid::new_v4().to_string();
        let priority = self.compute_priority(submission.kind, scheduled_start, now);
        let result = conn.execute(
            r#"INSERT INTO check_job_queue (
                 job_id, flight_id, kind, payload_json, priority, idempotency_key,
                 status, retry_count, max_retries, next_attempt_at, created_at
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'WAITING', 0, ?7, ?8, ?8)"#,
            params![
                job_id,
                submission.flight_id,
                submission.kind.to_db_str(),
                submission.payload.as_ref().map(|v| v.to_string()),
                priority,
                idempotency_key,
                self.max_retries,
                now,
            ],
        );

        match result {
            Ok(_) => {
                tracing::info!(
                    job_id = job_id.as_str(),
                    flight_id = submission.flight_id.as_str(),
                    kind = submission.kind.to_db_str(),
                    priority,
                    "任务已入队"
                );
                Ok(EnqueueOutcome {
                    job_id,
                    deduplicated: false,
                })
            }
            Err(e) => {
                let mapped: RepositoryError = e.into();
                // 并发提交竞争: 唯一索引拦截后回查在途任务
                if matches!(mapped, RepositoryError::UniqueConstraintViolation(_)) {
                    let existing: Option<String> = conn
                        .query_row(
                            "SELECT job_id FROM check_job_queue
                             WHERE idempotency_key = ?1 AND status IN ('WAITING', 'ACTIVE')
                             LIMIT 1",
                            params![idempotency_key],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if let Some(job_id) = existing {
                        return Ok(EnqueueOutcome {
                            job_id,
                            deduplicated: true,
                        });
                    }
                }
                Err(mapped)
            }
        }
    }

    /// 认领下一个到期任务: WAITING → ACTIVE
    ///
    /// 出队顺序: priority 降序,同优先级按入队先后。
    /// 认领为条件更新,落空(被其他工作协程抢先)时继续取下一条。
    pub fn claim_next(&self, now: DateTime<Utc>) -> RepositoryResult<Option<CheckJob>> {
        let conn = self.get_conn()?;
        loop {
            let sql = format!(
                "SELECT {} FROM check_job_queue
                 WHERE status = 'WAITING' AND next_attempt_at <= ?1
                 ORDER BY priority DESC, created_at ASC
                 LIMIT 1",
                JOB_COLUMNS
            );
            let candidate = conn
                .query_row(&sql, params![now], map_job_row)
                .optional()?;

            let job = match candidate {
                Some(job) => job,
                None => return Ok(None),
            };

            let rows_affected = conn.execute(
                "UPDATE check_job_queue SET status = 'ACTIVE', started_at = ?1
                 WHERE job_id = ?2 AND status = 'WAITING'",
                params![now, job.job_id],
            )?;
            if rows_affected > 0 {
                let mut claimed = job;
                claimed.status = JobStatus::Active;
                claimed.started_at = Some(now);
                return Ok(Some(claimed));
            }
            // 竞争失败: 该任务已被认领,取下一条
        }
    }

    /// 任务成功: ACTIVE → COMPLETED
    pub fn complete(&self, job_id: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let rows_affected = conn.execute(
            "UPDATE check_job_queue SET status = 'COMPLETED', completed_at = ?1, error_message = NULL
             WHERE job_id = ?2 AND status = 'ACTIVE'",
            params![Utc::now(), job_id],
        )?;
        if rows_affected == 0 {
            tracing::warn!(job_id, "完成回写落空(任务已不处于 ACTIVE)");
        }
        Ok(())
    }

    /// 可重试失败: 次数内指数退避回到 WAITING,否则终态 FAILED
    ///
    /// 返回回写后的任务状态。
    pub fn fail(&self, job_id: &str, error_message: &str) -> RepositoryResult<JobStatus> {
        let conn = self.get_conn()?;
        let now = Utc::now();

        let counters: Option<(i64, i64)> = conn
            .query_row(
                "SELECT retry_count, max_retries FROM check_job_queue WHERE job_id = ?1",
                params![job_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (retry_count, max_retries) = match counters {
            Some(v) => v,
            None => {
                return Err(RepositoryError::NotFound {
                    entity: "CheckJob".to_string(),
                    id: job_id.to_string(),
                })
            }
        };

        let new_retry_count = retry_count + 1;
        if new_retry_count < max_retries {
            // 指数退避: base × 2^(重试次数-1)
            let backoff = self.backoff_base * 2_i32.pow((new_retry_count - 1).min(16) as u32);
            let next_attempt_at = now + backoff;
            conn.execute(
                r#"UPDATE check_job_queue
                   SET status = 'WAITING', retry_count = ?1, next_attempt_at = ?2, error_message = ?3
                   WHERE job_id = ?4 AND status = 'ACTIVE'"#,
                params![new_retry_count, next_attempt_at, error_message, job_id],
            )?;
            tracing::info!(
                job_id,
                retry_count = new_retry_count,
                "任务失败,退避后重试: {}",
                error_message
            );
            Ok(JobStatus::Waiting)
        } else {
            conn.execute(
                r#"UPDATE check_job_queue
                   SET status = 'FAILED', retry_count = ?1, completed_at = ?2, error_message = ?3
                   WHERE job_id = ?4 AND status = 'ACTIVE'"#,
                params![new_retry_count, now, error_message, job_id],
            )?;
            tracing::error!(
                job_id,
                retry_count = new_retry_count,
                "任务达到最大重试次数,转终态失败: {}",
                error_message
            );
            Ok(JobStatus::Failed)
        }
    }

    /// 不可重试失败: 直接转终态 FAILED
    pub fn fail_permanent(&self, job_id: &str, error_message: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"UPDATE check_job_queue
               SET status = 'FAILED', completed_at = ?1, error_message = ?2
               WHERE job_id = ?3 AND status = 'ACTIVE'"#,
            params![Utc::now(), error_message, job_id],
        )?;
        tracing::error!(job_id, "任务不可重试,转终态失败: {}", error_message);
        Ok(())
    }

    /// 取消等待中的任务(保留记录可查,不静默删除)
    pub fn cancel_waiting(&self, job_id: &str) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let rows_affected = conn.execute(
            r#"UPDATE check_job_queue
               SET status = 'FAILED', completed_at = ?1, error_message = '已被操作员取消'
               WHERE job_id = ?2 AND status = 'WAITING'"#,
            params![Utc::now(), job_id],
        )?;
        Ok(rows_affected > 0)
    }

    pub fn find_by_id(&self, job_id: &str) -> RepositoryResult<Option<CheckJob>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM check_job_queue WHERE job_id = ?1",
            JOB_COLUMNS
        );
        conn.query_row(&sql, params![job_id], map_job_row)
            .optional()
            .map_err(|e| e.into())
    }

    /// 按课程聚合状态查询
    ///
    /// 每个课程汇报其全部任务中汇报优先级最高的状态
    /// (COMPLETED > ACTIVE > WAITING > FAILED),
    /// 即"有一次已完成 + 一次陈旧失败"的课程汇报为已完成。
    pub fn status_by_flight(
        &self,
        flight_ids: &[String],
    ) -> RepositoryResult<Vec<FlightJobStatus>> {
        if flight_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;

        let mut sql = String::from(
            r#"SELECT flight_id,
                      MAX(CASE status
                            WHEN 'COMPLETED' THEN 4
                            WHEN 'ACTIVE' THEN 3
                            WHEN 'WAITING' THEN 2
                            WHEN 'FAILED' THEN 1
                            ELSE 0 END) AS rank,
                      COUNT(*) AS job_count
               FROM check_job_queue WHERE flight_id IN ("#,
        );
        for i in 0..flight_ids.len() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&format!("?{}", i + 1));
        }
        sql.push_str(") GROUP BY flight_id");

        let sql_params: Vec<&dyn ToSql> = flight_ids.iter().map(|s| s as &dyn ToSql).collect();
        let mut stmt = conn.prepare(&sql)?;
        let statuses = stmt
            .query_map(&sql_params[..], |row| {
                let flight_id: String = row.get(0)?;
                let rank: i32 = row.get(1)?;
                let job_count: i64 = row.get(2)?;
                Ok((flight_id, rank, job_count))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(statuses
            .into_iter()
            .filter_map(|(flight_id, rank, job_count)| {
                JobStatus::from_report_rank(rank).map(|status| FlightJobStatus {
                    flight_id,
                    status,
                    job_count,
                })
            })
            .collect())
    }

    /// 是否仍有在途任务(drain 判定)
    pub fn has_open(&self) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM check_job_queue WHERE status IN ('WAITING', 'ACTIVE')",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// 队列统计
    pub fn stats(&self) -> RepositoryResult<QueueStats> {
        let conn = self.get_conn()?;
        let (waiting, active, completed, failed): (i64, i64, i64, i64) = conn.query_row(
            r#"SELECT
                 COALESCE(SUM(CASE WHEN status = 'WAITING' THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN status = 'ACTIVE' THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN status = 'COMPLETED' THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END), 0)
               FROM check_job_queue"#,
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        Ok(QueueStats {
            waiting_count: waiting as u32,
            active_count: active as u32,
            completed_count: completed as u32,
            failed_count: failed as u32,
        })
    }
}

fn map_job_row(row: &Row) -> rusqlite::Result<CheckJob> {
    let kind: String = row.get(2)?;
    let payload_json: Option<String> = row.get(3)?;
    let status: String = row.get(6)?;
    Ok(CheckJob {
        job_id: row.get(0)?,
        flight_id: row.get(1)?,
        kind: JobKind::from_db_str(&kind).ok_or_else(|| invalid_enum(2, &kind))?,
        payload_json: payload_json.and_then(|s| serde_json::from_str(&s).ok()),
        priority: row.get(4)?,
        idempotency_key: row.get(5)?,
        status: JobStatus::from_db_str(&status).ok_or_else(|| invalid_enum(6, &status))?,
        retry_count: row.get(7)?,
        max_retries: row.get(8)?,
        next_attempt_at: row.get(9)?,
        created_at: row.get(10)?,
        started_at: row.get(11)?,
        completed_at: row.get(12)?,
        error_message: row.get(13)?,
    })
}
