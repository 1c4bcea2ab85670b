// ==========================================
// 飞行训练排班系统 - 安全评估记录仓储
// ==========================================
// 红线: 追加式证据层,只增不改
// ==========================================

use crate::domain::types::SafetyResult;
use crate::domain::weather::{Minimums, WeatherCheck};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::invalid_enum;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

const CHECK_COLUMNS: &str = "check_id, flight_id, airport_code, visibility_sm, ceiling_ft, \
     wind_speed_kt, wind_gust_kt, wind_direction_deg, temperature_c, condition_tags_json, \
     result, confidence, reasons_json, minimums_json, checked_at";

pub struct WeatherCheckRepository {
    conn: Arc<Mutex<Connection>>,
}

impl WeatherCheckRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        let repo = Self { conn };
        if let Err(e) = repo.ensure_tables() {
            tracing::warn!("weather_check 表初始化失败: {}", e);
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
            CREATE TABLE IF NOT EXISTS weather_check (
              check_id TEXT PRIMARY KEY,
              flight_id TEXT NOT NULL,
              airport_code TEXT NOT NULL,
              visibility_sm REAL,
              ceiling_ft REAL,
              wind_speed_kt REAL,
              wind_gust_kt REAL,
              wind_direction_deg REAL,
              temperature_c REAL,
              condition_tags_json TEXT NOT NULL,
              result TEXT NOT NULL,
              confidence INTEGER NOT NULL,
              reasons_json TEXT NOT NULL,
              minimums_json TEXT NOT NULL,
              checked_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_weather_check_flight
              ON weather_check(flight_id, checked_at DESC);
            "#,
        )?;
        Ok(())
    }

    /// 追加评估记录
    pub fn insert(&self, check: &WeatherCheck) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"INSERT INTO weather_check (
                 check_id, flight_id, airport_code, visibility_sm, ceiling_ft,
                 wind_speed_kt, wind_gust_kt, wind_direction_deg, temperature_c,
                 condition_tags_json, result, confidence, reasons_json, minimums_json, checked_at
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"#,
            params![
                check.check_id,
                check.flight_id,
                check.airport_code,
                check.visibility_sm,
                check.ceiling_ft,
                check.wind_speed_kt,
                check.wind_gust_kt,
                check.wind_direction_deg,
                check.temperature_c,
                serde_json::to_string(&check.condition_tags)?,
                check.result.to_db_str(),
                check.confidence,
                serde_json::to_string(&check.reasons)?,
                serde_json::to_string(&check.minimums)?,
                check.checked_at,
            ],
        )?;
        Ok(())
    }

    /// 某课程的评估历史(新→旧)
    pub fn list_by_flight(&self, flight_id: &str) -> RepositoryResult<Vec<WeatherCheck>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM weather_check WHERE flight_id = ?1 ORDER BY checked_at DESC",
            CHECK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let checks = stmt
            .query_map(params![flight_id], map_check_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(checks)
    }

    /// 某课程最近一次评估
    pub fn find_latest_by_flight(&self, flight_id: &str) -> RepositoryResult<Option<WeatherCheck>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM weather_check WHERE flight_id = ?1 ORDER BY checked_at DESC LIMIT 1",
            CHECK_COLUMNS
        );
        conn.query_row(&sql, params![flight_id], map_check_row)
            .optional()
            .map_err(|e| e.into())
    }
}

fn map_check_row(row: &Row) -> rusqlite::Result<WeatherCheck> {
    let condition_tags_json: String = row.get(9)?;
    let result_str: String = row.get(10)?;
    let reasons_json: String = row.get(12)?;
    let minimums_json: String = row.get(13)?;

    let json_err = |idx: usize, e: serde_json::Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    };

    let condition_tags: Vec<String> =
        serde_json::from_str(&condition_tags_json).map_err(|e| json_err(9, e))?;
    let reasons: Vec<String> = serde_json::from_str(&reasons_json).map_err(|e| json_err(12, e))?;
    let minimums: Minimums = serde_json::from_str(&minimums_json).map_err(|e| json_err(13, e))?;

    Ok(WeatherCheck {
        check_id: row.get(0)?,
        flight_id: row.get(1)?,
        airport_code: row.get(2)?,
        visibility_sm: row.get(3)?,
        ceiling_ft: row.get(4)?,
        wind_speed_kt: row.get(5)?,
        wind_gust_kt: row.get(6)?,
        wind_direction_deg: row.get(7)?,
        temperature_c: row.get(8)?,
        condition_tags,
        result: SafetyResult::from_db_str(&result_str)
            .ok_or_else(|| invalid_enum(10, &result_str))?,
        confidence: row.get(11)?,
        reasons,
        minimums,
        checked_at: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_check(flight_id: &str, result: SafetyResult) -> WeatherCheck {
        WeatherCheck {
            check_id: uuid::Uuid::new_v4().to_string(),
            flight_id: flight_id.to_string(),
            airport_code: "ZBAA".to_string(),
            visibility_sm: Some(6.0),
            ceiling_ft: Some(4500.0),
            wind_speed_kt: Some(8.0),
            wind_gust_kt: None,
            wind_direction_deg: Some(270.0),
            temperature_c: Some(18.0),
            condition_tags: vec![],
            result,
            confidence: 90,
            reasons: vec![],
            minimums: Minimums {
                min_visibility_sm: 3.0,
                min_ceiling_ft: 2000.0,
                max_wind_kt: 18.0,
                max_gust_kt: 25.0,
                prohibited_conditions: vec!["TS".to_string()],
            },
            checked_at: Utc::now(),
        }
    }

    #[test]
    fn test_append_and_list_history() {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let repo = WeatherCheckRepository::new(conn);

        repo.insert(&make_check("F001", SafetyResult::Safe)).unwrap();
        repo.insert(&make_check("F001", SafetyResult::Unsafe))
            .unwrap();
        repo.insert(&make_check("F002", SafetyResult::Marginal))
            .unwrap();

        let history = repo.list_by_flight("F001").unwrap();
        assert_eq!(history.len(), 2);

        let latest = repo.find_latest_by_flight("F002").unwrap().unwrap();
        assert_eq!(latest.result, SafetyResult::Marginal);
        assert_eq!(latest.minimums.min_ceiling_ft, 2000.0);
        assert!(repo.find_latest_by_flight("F999").unwrap().is_none());
    }
}
