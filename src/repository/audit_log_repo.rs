// ==========================================
// 飞行训练排班系统 - 操作日志仓储
// ==========================================
// 红线: 所有状态写入必须留痕;日志写失败只告警不阻断业务
// ==========================================

use crate::domain::audit_log::{AuditActionType, AuditLog};
use crate::repository::error::{RepositoryError, RepositoryResult};
use rusqlite::{params, Connection, Row};
use std::sync::{Arc, Mutex};

pub struct AuditLogRepository {
    conn: Arc<Mutex<Connection>>,
}

impl AuditLogRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        let repo = Self { conn };
        if let Err(e) = repo.ensure_tables() {
            tracing::warn!("audit_log 表初始化失败: {}", e);
        }
        repo
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
            CREATE TABLE IF NOT EXISTS audit_log (
              audit_id TEXT PRIMARY KEY,
              action_type TEXT NOT NULL,
              actor TEXT NOT NULL,
              flight_id TEXT,
              aircraft_id TEXT,
              request_id TEXT,
              payload_json TEXT,
              detail TEXT,
              action_ts TEXT NOT NULL
            );

            -- 按时间窗口查询是审计页的主路径
            CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_log(action_ts);
            CREATE INDEX IF NOT EXISTS idx_audit_flight ON audit_log(flight_id, action_ts);
            "#,
        )?;
        Ok(())
    }

    pub fn insert(&self, entry: &AuditLog) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"INSERT INTO audit_log (
                 audit_id, action_type, actor, flight_id, aircraft_id,
                 request_id, payload_json, detail, action_ts
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                entry.audit_id,
                entry.action_type.as_str(),
                entry.actor,
                entry.flight_id,
                entry.aircraft_id,
                entry.request_id,
                entry
                    .payload_json
                    .as_ref()
                    .map(|v| v.to_string()),
                entry.detail,
                entry.action_ts,
            ],
        )?;
        Ok(())
    }

    /// 写入日志,失败只告警(审计不阻断业务主路径)
    pub fn record_best_effort(&self, entry: AuditLog) {
        if let Err(e) = self.insert(&entry) {
            tracing::warn!(
                action = entry.action_type.as_str(),
                "audit_log 写入失败: {}",
                e
            );
        }
    }

    /// 某课程的操作轨迹(新→旧)
    pub fn list_by_flight(&self, flight_id: &str) -> RepositoryResult<Vec<AuditLog>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT audit_id, action_type, actor, flight_id, aircraft_id,
                    request_id, payload_json, detail, action_ts
             FROM audit_log WHERE flight_id = ?1 ORDER BY action_ts DESC",
        )?;
        let entries = stmt
            .query_map(params![flight_id], map_audit_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn map_audit_row(row: &Row) -> rusqlite::Result<AuditLog> {
    let action_type: String = row.get(1)?;
    let payload_json: Option<String> = row.get(6)?;
    Ok(AuditLog {
        audit_id: row.get(0)?,
        action_type: AuditActionType::from_str(&action_type)
            .ok_or_else(|| crate::repository::invalid_enum(1, &action_type))?,
        actor: row.get(2)?,
        flight_id: row.get(3)?,
        aircraft_id: row.get(4)?,
        request_id: row.get(5)?,
        payload_json: payload_json.and_then(|s| serde_json::from_str(&s).ok()),
        detail: row.get(7)?,
        action_ts: row.get(8)?,
    })
}
