// ==========================================
// 飞行训练排班系统 - 故障报告/飞机仓储
// ==========================================
// 依据: Dispatch_Engine_Specs_v0.2.md - 4. Grounding Cascade
// 红线: 飞机 GROUNDED 写入幂等(条件更新,重复停飞不报错)
// ==========================================

use crate::domain::squawk::{Aircraft, Squawk};
use crate::domain::types::{AircraftStatus, SquawkSeverity, SquawkStatus};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::invalid_enum;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

// ==========================================
// AircraftRepository - 飞机仓储
// ==========================================
pub struct AircraftRepository {
    conn: Arc<Mutex<Connection>>,
}

impl AircraftRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        let repo = Self { conn };
        if let Err(e) = repo.ensure_tables() {
            tracing::warn!("aircraft 表初始化失败: {}", e);
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
            CREATE TABLE IF NOT EXISTS aircraft (
              aircraft_id TEXT PRIMARY KEY,
              tail_number TEXT NOT NULL,
              aircraft_type TEXT NOT NULL,
              status TEXT NOT NULL DEFAULT 'AVAILABLE',
              updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// 登记/更新飞机
    pub fn upsert(&self, aircraft: &Aircraft) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"INSERT INTO aircraft (aircraft_id, tail_number, aircraft_type, status, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5)
               ON CONFLICT(aircraft_id) DO UPDATE SET
                 tail_number = excluded.tail_number,
                 aircraft_type = excluded.aircraft_type,
                 status = excluded.status,
                 updated_at = excluded.updated_at"#,
            params![
                aircraft.aircraft_id,
                aircraft.tail_number,
                aircraft.aircraft_type,
                aircraft.status.to_db_str(),
                aircraft.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn find_by_id(&self, aircraft_id: &str) -> RepositoryResult<Option<Aircraft>> {
        let conn = self.get_conn()?;
        conn.query_row(
            "SELECT aircraft_id, tail_number, aircraft_type, status, updated_at
             FROM aircraft WHERE aircraft_id = ?1",
            params![aircraft_id],
            map_aircraft_row,
        )
        .optional()
        .map_err(|e| e.into())
    }

    /// 停飞(幂等): AVAILABLE → GROUNDED
    ///
    /// 返回是否由本次调用完成停飞(false = 之前已停飞,属幂等跳过)。
    pub fn ground_if_available(&self, aircraft_id: &str) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let rows_affected = conn.execute(
            "UPDATE aircraft SET status = 'GROUNDED', updated_at = ?1
             WHERE aircraft_id = ?2 AND status != 'GROUNDED'",
            params![Utc::now(), aircraft_id],
        )?;
        if rows_affected == 0 {
            // 区分幂等跳过与记录不存在
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM aircraft WHERE aircraft_id = ?1",
                    params![aircraft_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(RepositoryError::NotFound {
                    entity: "Aircraft".to_string(),
                    id: aircraft_id.to_string(),
                });
            }
        }
        Ok(rows_affected > 0)
    }

    /// 恢复可用: GROUNDED → AVAILABLE
    pub fn release_if_grounded(&self, aircraft_id: &str) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let rows_affected = conn.execute(
            "UPDATE aircraft SET status = 'AVAILABLE', updated_at = ?1
             WHERE aircraft_id = ?2 AND status = 'GROUNDED'",
            params![Utc::now(), aircraft_id],
        )?;
        Ok(rows_affected > 0)
    }
}

fn map_aircraft_row(row: &Row) -> rusqlite::Result<Aircraft> {
    let status: String = row.get(3)?;
    Ok(Aircraft {
        aircraft_id: row.get(0)?,
        tail_number: row.get(1)?,
        aircraft_type: row.get(2)?,
        status: AircraftStatus::from_db_str(&status).ok_or_else(|| invalid_enum(3, &status))?,
        updated_at: row.get(4)?,
    })
}

// ==========================================
// SquawkRepository - 故障报告仓储
// ==========================================
pub struct SquawkRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SquawkRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        let repo = Self { conn };
        if let Err(e) = repo.ensure_tables() {
            tracing::warn!("squawk 表初始化失败: {}", e);
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
            CREATE TABLE IF NOT EXISTS squawk (
              squawk_id TEXT PRIMARY KEY,
              aircraft_id TEXT NOT NULL,
              reported_by TEXT NOT NULL,
              severity TEXT NOT NULL,
              description TEXT NOT NULL,
              status TEXT NOT NULL DEFAULT 'OPEN',
              impacted_flights_json TEXT NOT NULL DEFAULT '[]',
              created_at TEXT NOT NULL,
              resolved_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_squawk_aircraft
              ON squawk(aircraft_id, status);
            "#,
        )?;
        Ok(())
    }

    pub fn insert(&self, squawk: &Squawk) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"INSERT INTO squawk (
                 squawk_id, aircraft_id, reported_by, severity, description,
                 status, impacted_flights_json, created_at, resolved_at
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                squawk.squawk_id,
                squawk.aircraft_id,
                squawk.reported_by,
                squawk.severity.to_db_str(),
                squawk.description,
                squawk.status.to_db_str(),
                serde_json::to_string(&squawk.impacted_flight_ids)?,
                squawk.created_at,
                squawk.resolved_at,
            ],
        )?;
        Ok(())
    }

    pub fn find_by_id(&self, squawk_id: &str) -> RepositoryResult<Option<Squawk>> {
        let conn = self.get_conn()?;
        conn.query_row(
            "SELECT squawk_id, aircraft_id, reported_by, severity, description,
                    status, impacted_flights_json, created_at, resolved_at
             FROM squawk WHERE squawk_id = ?1",
            params![squawk_id],
            map_squawk_row,
        )
        .optional()
        .map_err(|e| e.into())
    }

    /// 写入受影响课程快照(停飞级联第 2 步)
    pub fn set_impacted_flights(
        &self,
        squawk_id: &str,
        flight_ids: &[String],
    ) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let rows_affected = conn.execute(
            "UPDATE squawk SET impacted_flights_json = ?1 WHERE squawk_id = ?2",
            params![serde_json::to_string(flight_ids)?, squawk_id],
        )?;
        if rows_affected == 0 {
            return Err(RepositoryError::NotFound {
                entity: "Squawk".to_string(),
                id: squawk_id.to_string(),
            });
        }
        Ok(())
    }

    /// 排故关闭: OPEN → RESOLVED
    pub fn resolve_if_open(&self, squawk_id: &str) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let rows_affected = conn.execute(
            "UPDATE squawk SET status = 'RESOLVED', resolved_at = ?1
             WHERE squawk_id = ?2 AND status = 'OPEN'",
            params![Utc::now(), squawk_id],
        )?;
        Ok(rows_affected > 0)
    }

    /// 某飞机未排除的 GROUNDING 报告数(恢复可用的前置检查)
    pub fn count_open_grounding(&self, aircraft_id: &str) -> RepositoryResult<i64> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM squawk
             WHERE aircraft_id = ?1 AND severity = 'GROUNDING' AND status = 'OPEN'",
            params![aircraft_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// 某飞机的未处理报告列表
    pub fn list_open_by_aircraft(&self, aircraft_id: &str) -> RepositoryResult<Vec<Squawk>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT squawk_id, aircraft_id, reported_by, severity, description,
                    status, impacted_flights_json, created_at, resolved_at
             FROM squawk WHERE aircraft_id = ?1 AND status = 'OPEN'
             ORDER BY created_at DESC",
        )?;
        let squawks = stmt
            .query_map(params![aircraft_id], map_squawk_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(squawks)
    }
}

fn map_squawk_row(row: &Row) -> rusqlite::Result<Squawk> {
    let severity: String = row.get(3)?;
    let status: String = row.get(5)?;
    let impacted_json: String = row.get(6)?;
    let impacted: Vec<String> = serde_json::from_str(&impacted_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Squawk {
        squawk_id: row.get(0)?,
        aircraft_id: row.get(1)?,
        reported_by: row.get(2)?,
        severity: SquawkSeverity::from_db_str(&severity)
            .ok_or_else(|| invalid_enum(3, &severity))?,
        description: row.get(4)?,
        status: SquawkStatus::from_db_str(&status).ok_or_else(|| invalid_enum(5, &status))?,
        impacted_flight_ids: impacted,
        created_at: row.get(7)?,
        resolved_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (AircraftRepository, SquawkRepository) {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        (
            AircraftRepository::new(conn.clone()),
            SquawkRepository::new(conn),
        )
    }

    fn make_aircraft(id: &str) -> Aircraft {
        Aircraft {
            aircraft_id: id.to_string(),
            tail_number: "B-8801".to_string(),
            aircraft_type: "C172".to_string(),
            status: AircraftStatus::Available,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_ground_is_idempotent() {
        let (aircraft_repo, _) = setup();
        aircraft_repo.upsert(&make_aircraft("AC-1")).unwrap();

        // 首次停飞 → true
        assert!(aircraft_repo.ground_if_available("AC-1").unwrap());
        // 重复停飞 → 幂等跳过
        assert!(!aircraft_repo.ground_if_available("AC-1").unwrap());
        assert_eq!(
            aircraft_repo.find_by_id("AC-1").unwrap().unwrap().status,
            AircraftStatus::Grounded
        );

        // 不存在的飞机 → NotFound
        let err = aircraft_repo.ground_if_available("NOPE").unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound { .. }));
    }

    #[test]
    fn test_squawk_snapshot_and_resolve() {
        let (aircraft_repo, squawk_repo) = setup();
        aircraft_repo.upsert(&make_aircraft("AC-1")).unwrap();

        let squawk = Squawk::new(
            "AC-1".to_string(),
            "INS-1".to_string(),
            SquawkSeverity::Grounding,
            "起落架减震支柱漏油".to_string(),
        );
        squawk_repo.insert(&squawk).unwrap();
        squawk_repo
            .set_impacted_flights(&squawk.squawk_id, &["F001".to_string(), "F002".to_string()])
            .unwrap();

        let loaded = squawk_repo.find_by_id(&squawk.squawk_id).unwrap().unwrap();
        assert_eq!(loaded.impacted_flight_ids, vec!["F001", "F002"]);
        assert_eq!(squawk_repo.count_open_grounding("AC-1").unwrap(), 1);

        assert!(squawk_repo.resolve_if_open(&squawk.squawk_id).unwrap());
        // 重复排故 → false
        assert!(!squawk_repo.resolve_if_open(&squawk.squawk_id).unwrap());
        assert_eq!(squawk_repo.count_open_grounding("AC-1").unwrap(), 0);
    }
}
