// ==========================================
// 飞行训练排班系统 - 配置管理器
// ==========================================
// 依据: Dispatch_Engine_Specs_v0.2.md - 9. 配置项全集
// ==========================================
// 职责: 配置加载、查询、覆写管理
// 存储: config_kv 表 (key-value + scope)
// ==========================================

use crate::domain::weather::SafetyMargins;
use crate::repository::error::{RepositoryError, RepositoryResult};
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

// ==========================================
// 配置键与默认值
// ==========================================

pub const KEY_VISIBILITY_MARGIN_SM: &str = "safety/visibility_margin_sm";
pub const KEY_CEILING_MARGIN_FT: &str = "safety/ceiling_margin_ft";
pub const KEY_WIND_MARGIN_KT: &str = "safety/wind_margin_kt";
pub const KEY_EXPIRY_HOURS: &str = "reschedule/expiry_hours";
pub const KEY_MAX_RETRIES: &str = "pipeline/max_retries";
pub const KEY_BACKOFF_BASE_SECS: &str = "pipeline/backoff_base_secs";
pub const KEY_WORKER_COUNT: &str = "pipeline/worker_count";
pub const KEY_POLL_INTERVAL_MS: &str = "pipeline/poll_interval_ms";
pub const KEY_SYNC_WAIT_TIMEOUT_SECS: &str = "pipeline/sync_wait_timeout_secs";
pub const KEY_URGENT_HORIZON_HOURS: &str = "pipeline/urgent_horizon_hours";
pub const KEY_WEATHER_TIMEOUT_SECS: &str = "providers/weather_timeout_secs";
pub const KEY_SUGGESTION_TIMEOUT_SECS: &str = "providers/suggestion_timeout_secs";
pub const KEY_CASCADE_CONCURRENCY: &str = "cascade/concurrency";

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 从已有连接创建 ConfigManager
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        let manager = Self { conn };
        if let Err(e) = manager.ensure_tables() {
            tracing::warn!("config_kv 表初始化失败: {}", e);
        }
        manager
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
            CREATE TABLE IF NOT EXISTS config_kv (
              scope_id TEXT NOT NULL DEFAULT 'global',
              key TEXT NOT NULL,
              value TEXT NOT NULL,
              PRIMARY KEY (scope_id, key)
            );
            "#,
        )?;
        Ok(())
    }

    /// 从 config_kv 表读取配置值(scope_id='global')
    pub fn get_config_value(&self, key: &str) -> RepositoryResult<Option<String>> {
        let conn = self.get_conn()?;
        let result = conn.query_row(
            "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 写入/覆盖配置值(scope_id='global')
    pub fn set_config_value(&self, key: &str, value: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"INSERT INTO config_kv (scope_id, key, value) VALUES ('global', ?1, ?2)
               ON CONFLICT(scope_id, key) DO UPDATE SET value = excluded.value"#,
            params![key, value],
        )?;
        Ok(())
    }

    /// 读取 f64 配置,缺失或非法时取默认值
    pub fn get_f64_or(&self, key: &str, default: f64) -> RepositoryResult<f64> {
        Ok(self
            .get_config_value(key)?
            .and_then(|v| v.trim().parse::<f64>().ok())
            .unwrap_or(default))
    }

    /// 读取 i64 配置,缺失或非法时取默认值
    pub fn get_i64_or(&self, key: &str, default: i64) -> RepositoryResult<i64> {
        Ok(self
            .get_config_value(key)?
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(default))
    }

    // ==========================================
    // 业务配置组装
    // ==========================================

    /// 临界判定余量
    pub fn safety_margins(&self) -> RepositoryResult<SafetyMargins> {
        Ok(SafetyMargins {
            visibility_sm: self.get_f64_or(KEY_VISIBILITY_MARGIN_SM, 1.0)?,
            ceiling_ft: self.get_f64_or(KEY_CEILING_MARGIN_FT, 500.0)?,
            wind_kt: self.get_f64_or(KEY_WIND_MARGIN_KT, 5.0)?,
        })
    }

    /// 改期请求有效期(小时)
    pub fn reschedule_expiry_hours(&self) -> RepositoryResult<i64> {
        self.get_i64_or(KEY_EXPIRY_HOURS, 48)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> ConfigManager {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        ConfigManager::from_connection(conn)
    }

    #[test]
    fn test_defaults_when_missing() {
        let cfg = setup();
        let margins = cfg.safety_margins().unwrap();
        assert_eq!(margins.visibility_sm, 1.0);
        assert_eq!(margins.ceiling_ft, 500.0);
        assert_eq!(cfg.reschedule_expiry_hours().unwrap(), 48);
    }

    #[test]
    fn test_override_and_fallback_on_garbage() {
        let cfg = setup();
        cfg.set_config_value(KEY_EXPIRY_HOURS, "24").unwrap();
        assert_eq!(cfg.reschedule_expiry_hours().unwrap(), 24);

        // 非法值回退默认
        cfg.set_config_value(KEY_EXPIRY_HOURS, "not-a-number").unwrap();
        assert_eq!(cfg.reschedule_expiry_hours().unwrap(), 48);

        // 覆盖写幂等
        cfg.set_config_value(KEY_EXPIRY_HOURS, "72").unwrap();
        cfg.set_config_value(KEY_EXPIRY_HOURS, "72").unwrap();
        assert_eq!(cfg.reschedule_expiry_hours().unwrap(), 72);
    }
}
