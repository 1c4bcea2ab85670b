// ==========================================
// 飞行训练排班系统 - 课程仓储
// ==========================================
// 依据: Dispatch_Master_Spec.md - PART D 数据访问铁律
// 红线: 课程状态变更一律走状态键控条件更新,禁止盲写
// ==========================================

use crate::domain::flight::Flight;
use crate::domain::types::{FlightStatus, FlightType, TrainingLevel};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::invalid_enum;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use std::sync::{Arc, Mutex};

/// 查询列顺序(与 map_row 对齐)
const FLIGHT_COLUMNS: &str = "flight_id, school_id, student_id, instructor_id, aircraft_id, \
     aircraft_type, training_level, flight_type, lesson_code, airport_code, \
     scheduled_start, scheduled_end, briefing_start, debrief_end, status, \
     rescheduled_from_id, weather_override_flag, weather_override_reason, \
     weather_override_by, created_at, updated_at";

pub struct FlightRepository {
    conn: Arc<Mutex<Connection>>,
}

impl FlightRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        let repo = Self { conn };
        // best-effort: 建表失败不阻塞启动,首次访问时会再次报错
        if let Err(e) = repo.ensure_tables() {
            tracing::warn!("flight 表初始化失败: {}", e);
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
            CREATE TABLE IF NOT EXISTS flight (
              flight_id TEXT PRIMARY KEY,
              school_id TEXT NOT NULL,
              student_id TEXT NOT NULL,
              instructor_id TEXT NOT NULL,
              aircraft_id TEXT NOT NULL,
              aircraft_type TEXT NOT NULL,
              training_level TEXT NOT NULL,
              flight_type TEXT NOT NULL,
              lesson_code TEXT,
              airport_code TEXT NOT NULL,
              scheduled_start TEXT NOT NULL,
              scheduled_end TEXT NOT NULL,
              briefing_start TEXT,
              debrief_end TEXT,
              status TEXT NOT NULL DEFAULT 'PENDING',
              rescheduled_from_id TEXT,
              weather_override_flag INTEGER NOT NULL DEFAULT 0,
              weather_override_reason TEXT,
              weather_override_by TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_flight_aircraft_start
              ON flight(aircraft_id, scheduled_start);
            CREATE INDEX IF NOT EXISTS idx_flight_status_start
              ON flight(status, scheduled_start);
            CREATE INDEX IF NOT EXISTS idx_flight_instructor
              ON flight(instructor_id, status);
            "#,
        )?;
        Ok(())
    }

    /// 新建课程
    pub fn insert(&self, flight: &Flight) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        Self::insert_with(&conn, flight)
    }

    /// 在指定连接/事务上写入课程(供跨表事务复用)
    pub(crate) fn insert_with(conn: &Connection, flight: &Flight) -> RepositoryResult<()> {
        conn.execute(
            r#"INSERT INTO flight (
                 flight_id, school_id, student_id, instructor_id, aircraft_id,
                 aircraft_type, training_level, flight_type, lesson_code, airport_code,
                 scheduled_start, scheduled_end, briefing_start, debrief_end, status,
                 rescheduled_from_id, weather_override_flag, weather_override_reason,
                 weather_override_by, created_at, updated_at
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                         ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)"#,
            params![
                flight.flight_id,
                flight.school_id,
                flight.student_id,
                flight.instructor_id,
                flight.aircraft_id,
                flight.aircraft_type,
                flight.training_level.to_db_str(),
                flight.flight_type.to_db_str(),
                flight.lesson_code,
                flight.airport_code,
                flight.scheduled_start,
                flight.scheduled_end,
                flight.briefing_start,
                flight.debrief_end,
                flight.status.to_db_str(),
                flight.rescheduled_from_id,
                flight.weather_override_flag as i64,
                flight.weather_override_reason,
                flight.weather_override_by,
                flight.created_at,
                flight.updated_at,
            ],
        )?;
        Ok(())
    }

    /// 按 ID 查询课程
    pub fn find_by_id(&self, flight_id: &str) -> RepositoryResult<Option<Flight>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM flight WHERE flight_id = ?1", FLIGHT_COLUMNS);
        conn.query_row(&sql, params![flight_id], map_flight_row)
            .optional()
            .map_err(|e| e.into())
    }

    /// 查询课程当前状态
    pub fn current_status(&self, flight_id: &str) -> RepositoryResult<Option<FlightStatus>> {
        let conn = self.get_conn()?;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM flight WHERE flight_id = ?1",
                params![flight_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.and_then(|s| FlightStatus::from_db_str(&s)))
    }

    /// 状态键控条件转移
    ///
    /// # 并发控制
    /// 单条条件更新("set status=X where id=? and status in (期望集合)"),
    /// 影响行数为 0 即竞争失败,返回 TransitionConflict(或 NotFound)。
    pub fn transition_status(
        &self,
        flight_id: &str,
        expected: &[FlightStatus],
        to: FlightStatus,
    ) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        Self::transition_status_with(&conn, flight_id, expected, to)
    }

    /// 在指定连接/事务上执行状态转移(供跨表事务复用)
    pub(crate) fn transition_status_with(
        conn: &Connection,
        flight_id: &str,
        expected: &[FlightStatus],
        to: FlightStatus,
    ) -> RepositoryResult<()> {
        let to_str = to.to_db_str().to_string();
        let now = Utc::now();
        let expected_strs: Vec<String> = expected
            .iter()
            .map(|s| s.to_db_str().to_string())
            .collect();

        let mut sql = String::from(
            "UPDATE flight SET status = ?1, updated_at = ?2 WHERE flight_id = ?3 AND status IN (",
        );
        for i in 0..expected_strs.len() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&format!("?{}", i + 4));
        }
        sql.push(')');

        let mut sql_params: Vec<&dyn ToSql> = vec![&to_str, &now, &flight_id];
        for s in &expected_strs {
            sql_params.push(s);
        }

        let rows_affected = conn.execute(&sql, &sql_params[..])?;
        if rows_affected == 0 {
            // 区分记录不存在与前置状态不匹配
            let actual: Option<String> = conn
                .query_row(
                    "SELECT status FROM flight WHERE flight_id = ?1",
                    params![flight_id],
                    |row| row.get(0),
                )
                .optional()?;
            return match actual {
                Some(_) => Err(RepositoryError::TransitionConflict {
                    entity: "Flight".to_string(),
                    id: flight_id.to_string(),
                    expected: expected_strs.join("|"),
                }),
                None => Err(RepositoryError::NotFound {
                    entity: "Flight".to_string(),
                    id: flight_id.to_string(),
                }),
            };
        }
        Ok(())
    }

    /// 人工复飞(天气豁免): WEATHER_CANCELLED → CONFIRMED
    ///
    /// 仅写课程状态与豁免审计字段,不触碰状态机。
    pub fn apply_weather_override(
        &self,
        flight_id: &str,
        reason: &str,
        approved_by: &str,
    ) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let rows_affected = conn.execute(
            r#"UPDATE flight
               SET status = 'CONFIRMED',
                   weather_override_flag = 1,
                   weather_override_reason = ?1,
                   weather_override_by = ?2,
                   updated_at = ?3
               WHERE flight_id = ?4 AND status = 'WEATHER_CANCELLED'"#,
            params![reason, approved_by, Utc::now(), flight_id],
        )?;

        if rows_affected == 0 {
            let actual: Option<String> = conn
                .query_row(
                    "SELECT status FROM flight WHERE flight_id = ?1",
                    params![flight_id],
                    |row| row.get(0),
                )
                .optional()?;
            return match actual {
                Some(actual) => Err(RepositoryError::InvalidStateTransition {
                    from: actual,
                    to: "CONFIRMED".to_string(),
                }),
                None => Err(RepositoryError::NotFound {
                    entity: "Flight".to_string(),
                    id: flight_id.to_string(),
                }),
            };
        }
        Ok(())
    }

    /// 查询某架飞机的未来课程(停飞级联第 2 步)
    pub fn find_future_by_aircraft(
        &self,
        aircraft_id: &str,
        after: DateTime<Utc>,
        statuses: &[FlightStatus],
    ) -> RepositoryResult<Vec<Flight>> {
        let conn = self.get_conn()?;
        let status_strs: Vec<String> = statuses
            .iter()
            .map(|s| s.to_db_str().to_string())
            .collect();

        let mut sql = format!(
            "SELECT {} FROM flight WHERE aircraft_id = ?1 AND scheduled_start > ?2 AND status IN (",
            FLIGHT_COLUMNS
        );
        for i in 0..status_strs.len() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&format!("?{}", i + 3));
        }
        sql.push_str(") ORDER BY scheduled_start ASC");

        let mut sql_params: Vec<&dyn ToSql> = vec![&aircraft_id, &after];
        for s in &status_strs {
            sql_params.push(s);
        }

        let mut stmt = conn.prepare(&sql)?;
        let flights = stmt
            .query_map(&sql_params[..], map_flight_row)?
            .collect::<Result<Vec<Flight>, _>>()?;
        Ok(flights)
    }

    /// 查询时间窗口内的课程(批量天气检查提交)
    pub fn find_by_window(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        statuses: &[FlightStatus],
    ) -> RepositoryResult<Vec<Flight>> {
        let conn = self.get_conn()?;
        let status_strs: Vec<String> = statuses
            .iter()
            .map(|s| s.to_db_str().to_string())
            .collect();

        let mut sql = format!(
            "SELECT {} FROM flight WHERE scheduled_start >= ?1 AND scheduled_start < ?2 AND status IN (",
            FLIGHT_COLUMNS
        );
        for i in 0..status_strs.len() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&format!("?{}", i + 3));
        }
        sql.push_str(") ORDER BY scheduled_start ASC");

        let mut sql_params: Vec<&dyn ToSql> = vec![&from, &to];
        for s in &status_strs {
            sql_params.push(s);
        }

        let mut stmt = conn.prepare(&sql)?;
        let flights = stmt
            .query_map(&sql_params[..], map_flight_row)?
            .collect::<Result<Vec<Flight>, _>>()?;
        Ok(flights)
    }
}

/// 改期链校验: 前驱必须存在、起飞时刻严格更早、且链上无环
///
/// 在后继课程写入前调用(与写入同事务),不依赖约定兜底。
pub(crate) fn validate_reschedule_chain(
    conn: &Connection,
    predecessor_id: &str,
    successor_start: DateTime<Utc>,
) -> RepositoryResult<()> {
    let mut visited: Vec<String> = Vec::new();
    let mut cursor = Some(predecessor_id.to_string());
    let mut upper_bound = successor_start;

    while let Some(id) = cursor {
        if visited.contains(&id) {
            return Err(RepositoryError::RescheduleChainViolation(format!(
                "前驱链成环: flight_id={}",
                id
            )));
        }

        let row: Option<(DateTime<Utc>, Option<String>)> = conn
            .query_row(
                "SELECT scheduled_start, rescheduled_from_id FROM flight WHERE flight_id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (start, prev) = match row {
            Some(v) => v,
            None => {
                return Err(RepositoryError::NotFound {
                    entity: "Flight".to_string(),
                    id,
                })
            }
        };

        if start >= upper_bound {
            return Err(RepositoryError::RescheduleChainViolation(format!(
                "前驱课程 {} 起飞时刻不早于后继",
                id
            )));
        }

        visited.push(id);
        upper_bound = start;
        cursor = prev;
    }

    Ok(())
}

fn map_flight_row(row: &Row) -> rusqlite::Result<Flight> {
    let training_level: String = row.get(6)?;
    let flight_type: String = row.get(7)?;
    let status: String = row.get(14)?;
    Ok(Flight {
        flight_id: row.get(0)?,
        school_id: row.get(1)?,
        student_id: row.get(2)?,
        instructor_id: row.get(3)?,
        aircraft_id: row.get(4)?,
        aircraft_type: row.get(5)?,
        training_level: TrainingLevel::from_db_str(&training_level)
            .ok_or_else(|| invalid_enum(6, &training_level))?,
        flight_type: FlightType::from_db_str(&flight_type)
            .ok_or_else(|| invalid_enum(7, &flight_type))?,
        lesson_code: row.get(8)?,
        airport_code: row.get(9)?,
        scheduled_start: row.get(10)?,
        scheduled_end: row.get(11)?,
        briefing_start: row.get(12)?,
        debrief_end: row.get(13)?,
        status: FlightStatus::from_db_str(&status).ok_or_else(|| invalid_enum(14, &status))?,
        rescheduled_from_id: row.get(15)?,
        weather_override_flag: row.get::<_, i64>(16)? != 0,
        weather_override_reason: row.get(17)?,
        weather_override_by: row.get(18)?,
        created_at: row.get(19)?,
        updated_at: row.get(20)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{FlightType, TrainingLevel};
    use chrono::Duration;

    fn setup_repo() -> FlightRepository {
        let conn = Connection::open_in_memory().unwrap();
        FlightRepository::new(Arc::new(Mutex::new(conn)))
    }

    fn make_flight(id: &str, status: FlightStatus, start_offset_hours: i64) -> Flight {
        let start = Utc::now() + Duration::hours(start_offset_hours);
        Flight {
            flight_id: id.to_string(),
            school_id: "S01".to_string(),
            student_id: "STU-1".to_string(),
            instructor_id: "INS-1".to_string(),
            aircraft_id: "AC-1".to_string(),
            aircraft_type: "C172".to_string(),
            training_level: TrainingLevel::Private,
            flight_type: FlightType::Dual,
            lesson_code: Some("L-08".to_string()),
            airport_code: "ZBAA".to_string(),
            scheduled_start: start,
            scheduled_end: start + Duration::hours(2),
            briefing_start: None,
            debrief_end: None,
            status,
            rescheduled_from_id: None,
            weather_override_flag: false,
            weather_override_reason: None,
            weather_override_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_find_roundtrip() {
        let repo = setup_repo();
        let flight = make_flight("F001", FlightStatus::Confirmed, 24);
        repo.insert(&flight).unwrap();

        let loaded = repo.find_by_id("F001").unwrap().unwrap();
        assert_eq!(loaded.flight_id, "F001");
        assert_eq!(loaded.status, FlightStatus::Confirmed);
        assert_eq!(loaded.training_level, TrainingLevel::Private);
        assert_eq!(loaded.lesson_code.as_deref(), Some("L-08"));
    }

    #[test]
    fn test_transition_status_cas() {
        let repo = setup_repo();
        repo.insert(&make_flight("F001", FlightStatus::Confirmed, 24))
            .unwrap();

        // 期望状态匹配 → 成功
        repo.transition_status(
            "F001",
            &[FlightStatus::Pending, FlightStatus::Confirmed],
            FlightStatus::WeatherCancelled,
        )
        .unwrap();
        assert_eq!(
            repo.current_status("F001").unwrap(),
            Some(FlightStatus::WeatherCancelled)
        );

        // 重复转移 → 竞争失败方收到确定性冲突
        let err = repo
            .transition_status(
                "F001",
                &[FlightStatus::Pending, FlightStatus::Confirmed],
                FlightStatus::WeatherCancelled,
            )
            .unwrap_err();
        assert!(matches!(err, RepositoryError::TransitionConflict { .. }));

        // 记录不存在 → NotFound
        let err = repo
            .transition_status("NOPE", &[FlightStatus::Pending], FlightStatus::Confirmed)
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound { .. }));
    }

    #[test]
    fn test_weather_override_requires_weather_cancelled() {
        let repo = setup_repo();
        repo.insert(&make_flight("F001", FlightStatus::WeatherCancelled, 24))
            .unwrap();
        repo.insert(&make_flight("F002", FlightStatus::Confirmed, 24))
            .unwrap();

        repo.apply_weather_override("F001", "机场实况好转", "OPS-1")
            .unwrap();
        let loaded = repo.find_by_id("F001").unwrap().unwrap();
        assert_eq!(loaded.status, FlightStatus::Confirmed);
        assert!(loaded.weather_override_flag);
        assert_eq!(loaded.weather_override_by.as_deref(), Some("OPS-1"));

        // 非 WEATHER_CANCELLED 状态 → 状态转换错误
        let err = repo
            .apply_weather_override("F002", "理由", "OPS-1")
            .unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_find_future_by_aircraft_filters_status_and_time() {
        let repo = setup_repo();
        repo.insert(&make_flight("F001", FlightStatus::Confirmed, 24))
            .unwrap();
        repo.insert(&make_flight("F002", FlightStatus::Pending, 48))
            .unwrap();
        repo.insert(&make_flight("F003", FlightStatus::Completed, 72))
            .unwrap();
        // 过去的课程不参与
        repo.insert(&make_flight("F004", FlightStatus::Confirmed, -24))
            .unwrap();

        let flights = repo
            .find_future_by_aircraft("AC-1", Utc::now(), FlightStatus::cascade_eligible())
            .unwrap();
        let ids: Vec<&str> = flights.iter().map(|f| f.flight_id.as_str()).collect();
        assert_eq!(ids, vec!["F001", "F002"]);
    }

    #[test]
    fn test_validate_reschedule_chain_rejects_late_predecessor() {
        let repo = setup_repo();
        let flight = make_flight("F001", FlightStatus::Rescheduled, 48);
        repo.insert(&flight).unwrap();

        let conn = repo.conn.lock().unwrap();
        // 后继起飞时刻晚于前驱 → 通过
        validate_reschedule_chain(&conn, "F001", flight.scheduled_start + Duration::days(1))
            .unwrap();
        // 后继起飞时刻不晚于前驱 → 违反
        let err = validate_reschedule_chain(&conn, "F001", flight.scheduled_start).unwrap_err();
        assert!(matches!(err, RepositoryError::RescheduleChainViolation(_)));
    }

    #[test]
    fn test_validate_reschedule_chain_detects_cycle() {
        let repo = setup_repo();
        let mut f1 = make_flight("F001", FlightStatus::Rescheduled, 24);
        let mut f2 = make_flight("F002", FlightStatus::Rescheduled, 48);
        // 人为构造环: F001 → F002 → F001
        f1.rescheduled_from_id = Some("F002".to_string());
        f2.rescheduled_from_id = Some("F001".to_string());
        // 让时间单调以绕过时序校验,专门验证环检测
        f1.scheduled_start = Utc::now() - Duration::days(2);
        f2.scheduled_start = Utc::now() - Duration::days(1);
        repo.insert(&f1).unwrap();
        repo.insert(&f2).unwrap();

        let conn = repo.conn.lock().unwrap();
        let err = validate_reschedule_chain(&conn, "F002", Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::RescheduleChainViolation(_) | RepositoryError::NotFound { .. }
        ));
    }
}
