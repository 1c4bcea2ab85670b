// ==========================================
// 飞行训练排班系统 - 改期请求仓储
// ==========================================
// 依据: Dispatch_Engine_Specs_v0.2.md - 3. Reschedule State Machine
// 依据: TD-002 并发控制设计
// 红线: 所有状态转移为状态键控条件更新;教员确认为单事务原子操作
// ==========================================

use crate::domain::flight::Flight;
use crate::domain::reschedule::{RescheduleRequest, SlotSuggestion};
use crate::domain::types::{FlightStatus, RescheduleStatus, SelectedBy};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::flight_repo::{validate_reschedule_chain, FlightRepository};
use crate::repository::invalid_enum;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

const REQUEST_COLUMNS: &str = "r.request_id, r.flight_id, r.student_id, r.suggestions_json, \
     r.selected_option, r.selected_by, r.selected_instructor_id, r.status, r.reject_reason, \
     r.student_confirmed_at, r.instructor_confirmed_at, r.expires_at, r.new_flight_id, \
     r.created_at, r.updated_at";

pub struct RescheduleRequestRepository {
    conn: Arc<Mutex<Connection>>,
}

impl RescheduleRequestRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        let repo = Self { conn };
        if let Err(e) = repo.ensure_tables() {
            tracing::warn!("reschedule_request 表初始化失败: {}", e);
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
            CREATE TABLE IF NOT EXISTS reschedule_request (
              request_id TEXT PRIMARY KEY,
              flight_id TEXT NOT NULL,
              student_id TEXT NOT NULL,
              suggestions_json TEXT NOT NULL,
              selected_option INTEGER,
              selected_by TEXT,
              selected_instructor_id TEXT,
              status TEXT NOT NULL DEFAULT 'PENDING_STUDENT',
              reject_reason TEXT,
              student_confirmed_at TEXT,
              instructor_confirmed_at TEXT,
              expires_at TEXT NOT NULL,
              new_flight_id TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );

            -- 红线: 同一课程同时最多一条开放请求(部分唯一索引兜底)
            CREATE UNIQUE INDEX IF NOT EXISTS uq_open_request_per_flight
              ON reschedule_request(flight_id)
              WHERE status IN ('PENDING_STUDENT', 'PENDING_INSTRUCTOR');

            CREATE INDEX IF NOT EXISTS idx_request_status
              ON reschedule_request(status, expires_at);
            CREATE INDEX IF NOT EXISTS idx_request_selected_instructor
              ON reschedule_request(selected_instructor_id, status);
            "#,
        )?;
        Ok(())
    }

    /// 创建改期请求(初始 PENDING_STUDENT)
    ///
    /// 幂等性: 同课程已有开放请求时返回 DuplicateOpenRequest,不产生第二条。
    pub fn create(&self, request: &RescheduleRequest) -> RepositoryResult<()> {
        let conn = self.get_conn()?;

        let suggestions_json = serde_json::to_string(&request.suggestions)?;
        let result = conn.execute(
            r#"INSERT INTO reschedule_request (
                 request_id, flight_id, student_id, suggestions_json,
                 selected_option, selected_by, selected_instructor_id, status, reject_reason,
                 student_confirmed_at, instructor_confirmed_at, expires_at, new_flight_id,
                 created_at, updated_at
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"#,
            params![
                request.request_id,
                request.flight_id,
                request.student_id,
                suggestions_json,
                request.selected_option.map(|i| i as i64),
                request.selected_by.map(|s| s.to_db_str()),
                request.selected_instructor_id,
                request.status.to_db_str(),
                request.reject_reason,
                request.student_confirmed_at,
                request.instructor_confirmed_at,
                request.expires_at,
                request.new_flight_id,
                request.created_at,
                request.updated_at,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let mapped: RepositoryError = e.into();
                // 唯一索引违反 → 业务语义: 已有开放请求
                if matches!(mapped, RepositoryError::UniqueConstraintViolation(_)) {
                    Err(RepositoryError::DuplicateOpenRequest(
                        request.flight_id.clone(),
                    ))
                } else {
                    Err(mapped)
                }
            }
        }
    }

    /// 按 ID 查询
    pub fn find_by_id(&self, request_id: &str) -> RepositoryResult<Option<RescheduleRequest>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM reschedule_request r WHERE r.request_id = ?1",
            REQUEST_COLUMNS
        );
        conn.query_row(&sql, params![request_id], map_request_row)
            .optional()
            .map_err(|e| e.into())
    }

    /// 某课程是否存在开放请求
    pub fn has_open_for_flight(&self, flight_id: &str) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM reschedule_request
             WHERE flight_id = ?1 AND status IN ('PENDING_STUDENT', 'PENDING_INSTRUCTOR')",
            params![flight_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// 学员选择确认: PENDING_STUDENT → PENDING_INSTRUCTOR
    ///
    /// 原子效果(单事务):
    /// 1. 写入 selected_option / selected_by / selected_instructor_id / 学员确认时刻
    /// 2. 课程 → RESCHEDULE_PENDING(期望前置: 已取消状态)
    pub fn student_select(
        &self,
        request_id: &str,
        flight_id: &str,
        option_index: usize,
        selected_instructor_id: Option<&str>,
    ) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        let now = Utc::now();

        let rows_affected = tx.execute(
            r#"UPDATE reschedule_request
               SET selected_option = ?1,
                   selected_by = 'STUDENT',
                   selected_instructor_id = ?2,
                   student_confirmed_at = ?3,
                   status = 'PENDING_INSTRUCTOR',
                   updated_at = ?3
               WHERE request_id = ?4 AND status = 'PENDING_STUDENT'"#,
            params![option_index as i64, selected_instructor_id, now, request_id],
        )?;
        if rows_affected == 0 {
            return Err(Self::discriminate_conflict(
                &tx,
                request_id,
                "PENDING_STUDENT",
            ));
        }

        FlightRepository::transition_status_with(
            &tx,
            flight_id,
            &[
                FlightStatus::WeatherCancelled,
                FlightStatus::MaintenanceCancelled,
            ],
            FlightStatus::ReschedulePending,
        )?;

        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        Ok(())
    }

    /// 教员确认: PENDING_INSTRUCTOR → ACCEPTED,并创建后继课程
    ///
    /// # 并发控制
    /// 请求状态的条件更新是守卫: 两个确认方竞争时仅一方影响行数 > 0,
    /// 失败方整个事务回滚并收到 TransitionConflict,不会产生第二条后继课程。
    pub fn accept_with_successor(
        &self,
        request_id: &str,
        original_flight_id: &str,
        successor: &Flight,
    ) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        let now = Utc::now();

        // 守卫转移: 仅 PENDING_INSTRUCTOR 可达 ACCEPTED
        let rows_affected = tx.execute(
            r#"UPDATE reschedule_request
               SET status = 'ACCEPTED',
                   instructor_confirmed_at = ?1,
                   new_flight_id = ?2,
                   updated_at = ?1
               WHERE request_id = ?3 AND status = 'PENDING_INSTRUCTOR'"#,
            params![now, successor.flight_id, request_id],
        )?;
        if rows_affected == 0 {
            return Err(Self::discriminate_conflict(
                &tx,
                request_id,
                "PENDING_INSTRUCTOR",
            ));
        }

        // 改期链校验(无环、时序单调)后写入后继课程
        validate_reschedule_chain(&tx, original_flight_id, successor.scheduled_start)?;
        FlightRepository::insert_with(&tx, successor)?;

        // 原课程 → RESCHEDULED
        FlightRepository::transition_status_with(
            &tx,
            original_flight_id,
            &[FlightStatus::ReschedulePending],
            FlightStatus::Rescheduled,
        )?;

        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        Ok(())
    }

    /// 拒绝: 任一开放状态 → REJECTED
    pub fn reject_if_open(&self, request_id: &str, reason: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let rows_affected = conn.execute(
            r#"UPDATE reschedule_request
               SET status = 'REJECTED', reject_reason = ?1, updated_at = ?2
               WHERE request_id = ?3 AND status IN ('PENDING_STUDENT', 'PENDING_INSTRUCTOR')"#,
            params![reason, Utc::now(), request_id],
        )?;
        if rows_affected == 0 {
            return Err(Self::discriminate_conflict(
                &conn,
                request_id,
                "PENDING_STUDENT|PENDING_INSTRUCTOR",
            ));
        }
        Ok(())
    }

    /// 惰性失效: 开放请求 → EXPIRED(访问时检查,而非后台扫描)
    ///
    /// 返回是否由本次调用完成转移(false = 已被他方转移)。
    pub fn mark_expired_if_open(&self, request_id: &str) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let rows_affected = conn.execute(
            r#"UPDATE reschedule_request
               SET status = 'EXPIRED', updated_at = ?1
               WHERE request_id = ?2 AND status IN ('PENDING_STUDENT', 'PENDING_INSTRUCTOR')"#,
            params![Utc::now(), request_id],
        )?;
        Ok(rows_affected > 0)
    }

    /// 批量失效扫描(运维兜底,非状态机契约的一部分)
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> RepositoryResult<usize> {
        let conn = self.get_conn()?;
        let rows_affected = conn.execute(
            r#"UPDATE reschedule_request
               SET status = 'EXPIRED', updated_at = ?1
               WHERE status IN ('PENDING_STUDENT', 'PENDING_INSTRUCTOR') AND expires_at < ?1"#,
            params![now],
        )?;
        Ok(rows_affected)
    }

    /// 教员可见请求列表
    ///
    /// 可见性规则: PENDING_INSTRUCTOR 仅选中方案的教员可见;
    /// 其余状态回归原课程教员可见(防止交接后原教员误操作)。
    pub fn list_for_instructor(
        &self,
        instructor_id: &str,
    ) -> RepositoryResult<Vec<RescheduleRequest>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"SELECT {} FROM reschedule_request r
               JOIN flight f ON f.flight_id = r.flight_id
               WHERE (r.status = 'PENDING_INSTRUCTOR' AND r.selected_instructor_id = ?1)
                  OR (r.status != 'PENDING_INSTRUCTOR' AND f.instructor_id = ?1)
               ORDER BY r.created_at DESC"#,
            REQUEST_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let requests = stmt
            .query_map(params![instructor_id], map_request_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(requests)
    }

    /// 学员可见请求列表
    pub fn list_for_student(&self, student_id: &str) -> RepositoryResult<Vec<RescheduleRequest>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM reschedule_request r WHERE r.student_id = ?1 ORDER BY r.created_at DESC",
            REQUEST_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let requests = stmt
            .query_map(params![student_id], map_request_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(requests)
    }

    /// 影响行数为 0 时区分 NotFound 与状态冲突
    fn discriminate_conflict(
        conn: &Connection,
        request_id: &str,
        expected: &str,
    ) -> RepositoryError {
        let actual: Result<Option<String>, _> = conn
            .query_row(
                "SELECT status FROM reschedule_request WHERE request_id = ?1",
                params![request_id],
                |row| row.get(0),
            )
            .optional();
        match actual {
            Ok(Some(_)) => RepositoryError::TransitionConflict {
                entity: "RescheduleRequest".to_string(),
                id: request_id.to_string(),
                expected: expected.to_string(),
            },
            Ok(None) => RepositoryError::NotFound {
                entity: "RescheduleRequest".to_string(),
                id: request_id.to_string(),
            },
            Err(e) => RepositoryError::DatabaseQueryError(e.to_string()),
        }
    }
}

fn map_request_row(row: &Row) -> rusqlite::Result<RescheduleRequest> {
    let suggestions_json: String = row.get(3)?;
    let suggestions: Vec<SlotSuggestion> = serde_json::from_str(&suggestions_json)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;
    let selected_by: Option<String> = row.get(5)?;
    let status: String = row.get(7)?;
    Ok(RescheduleRequest {
        request_id: row.get(0)?,
        flight_id: row.get(1)?,
        student_id: row.get(2)?,
        suggestions,
        selected_option: row.get::<_, Option<i64>>(4)?.map(|i| i as usize),
        selected_by: selected_by.and_then(|s| SelectedBy::from_db_str(&s)),
        selected_instructor_id: row.get(6)?,
        status: RescheduleStatus::from_db_str(&status).ok_or_else(|| invalid_enum(7, &status))?,
        reject_reason: row.get(8)?,
        student_confirmed_at: row.get(9)?,
        instructor_confirmed_at: row.get(10)?,
        expires_at: row.get(11)?,
        new_flight_id: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{FlightType, TrainingLevel};
    use chrono::Duration;

    fn setup() -> (
        Arc<Mutex<Connection>>,
        FlightRepository,
        RescheduleRequestRepository,
    ) {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let flight_repo = FlightRepository::new(conn.clone());
        let request_repo = RescheduleRequestRepository::new(conn.clone());
        (conn, flight_repo, request_repo)
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

    fn make_suggestion(instructor: &str, offset_days: i64) -> SlotSuggestion {
        let start = Utc::now() + Duration::days(offset_days);
        SlotSuggestion {
            instructor_id: Some(instructor.to_string()),
            aircraft_id: Some("AC-2".to_string()),
            slot_start: Some(start),
            slot_end: Some(start + Duration::hours(2)),
        }
    }

    fn make_request(flight_id: &str) -> RescheduleRequest {
        RescheduleRequest::new(
            flight_id.to_string(),
            "STU-1".to_string(),
            vec![make_suggestion("INS-1", 2), make_suggestion("INS-2", 3)],
            Utc::now() + Duration::hours(48),
        )
    }

    #[test]
    fn test_duplicate_open_request_rejected() {
        let (_conn, flight_repo, request_repo) = setup();
        flight_repo
            .insert(&make_flight("F001", FlightStatus::WeatherCancelled, 24))
            .unwrap();

        request_repo.create(&make_request("F001")).unwrap();
        let err = request_repo.create(&make_request("F001")).unwrap_err();
        assert!(matches!(err, RepositoryError::DuplicateOpenRequest(_)));

        // 前一条进入终态后允许再次创建
        let first = request_repo
            .list_for_student("STU-1")
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        request_repo
            .reject_if_open(&first.request_id, "时间不合适")
            .unwrap();
        request_repo.create(&make_request("F001")).unwrap();
    }

    #[test]
    fn test_student_select_moves_both_request_and_flight() {
        let (_conn, flight_repo, request_repo) = setup();
        flight_repo
            .insert(&make_flight("F001", FlightStatus::WeatherCancelled, 24))
            .unwrap();
        let request = make_request("F001");
        request_repo.create(&request).unwrap();

        request_repo
            .student_select(&request.request_id, "F001", 1, Some("INS-2"))
            .unwrap();

        let loaded = request_repo
            .find_by_id(&request.request_id)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, RescheduleStatus::PendingInstructor);
        assert_eq!(loaded.selected_option, Some(1));
        assert_eq!(loaded.selected_by, Some(SelectedBy::Student));
        assert!(loaded.student_confirmed_at.is_some());
        assert_eq!(
            flight_repo.current_status("F001").unwrap(),
            Some(FlightStatus::ReschedulePending)
        );

        // 重复选择 → 冲突
        let err = request_repo
            .student_select(&request.request_id, "F001", 0, Some("INS-1"))
            .unwrap_err();
        assert!(matches!(err, RepositoryError::TransitionConflict { .. }));
    }

    #[test]
    fn test_accept_with_successor_single_winner() {
        let (_conn, flight_repo, request_repo) = setup();
        flight_repo
            .insert(&make_flight("F001", FlightStatus::WeatherCancelled, 24))
            .unwrap();
        let request = make_request("F001");
        request_repo.create(&request).unwrap();
        request_repo
            .student_select(&request.request_id, "F001", 0, Some("INS-1"))
            .unwrap();

        let mut successor = make_flight("F002", FlightStatus::RescheduleConfirmed, 72);
        successor.rescheduled_from_id = Some("F001".to_string());

        request_repo
            .accept_with_successor(&request.request_id, "F001", &successor)
            .unwrap();

        let loaded = request_repo
            .find_by_id(&request.request_id)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, RescheduleStatus::Accepted);
        assert_eq!(loaded.new_flight_id.as_deref(), Some("F002"));
        assert_eq!(
            flight_repo.current_status("F001").unwrap(),
            Some(FlightStatus::Rescheduled)
        );
        assert_eq!(
            flight_repo.current_status("F002").unwrap(),
            Some(FlightStatus::RescheduleConfirmed)
        );

        // 竞争失败方: 状态守卫落空,且不会产生第二条后继课程
        let mut second = make_flight("F003", FlightStatus::RescheduleConfirmed, 96);
        second.rescheduled_from_id = Some("F001".to_string());
        let err = request_repo
            .accept_with_successor(&request.request_id, "F001", &second)
            .unwrap_err();
        assert!(matches!(err, RepositoryError::TransitionConflict { .. }));
        assert!(flight_repo.find_by_id("F003").unwrap().is_none());
    }

    #[test]
    fn test_concurrent_accept_exactly_one_succeeds() {
        let (conn, flight_repo, request_repo) = setup();
        flight_repo
            .insert(&make_flight("F001", FlightStatus::WeatherCancelled, 24))
            .unwrap();
        let request = make_request("F001");
        request_repo.create(&request).unwrap();
        request_repo
            .student_select(&request.request_id, "F001", 0, Some("INS-1"))
            .unwrap();

        // 两个线程同时确认同一请求
        let mut handles = Vec::new();
        for i in 0..2 {
            let conn = conn.clone();
            let request_id = request.request_id.clone();
            handles.push(std::thread::spawn(move || {
                let repo = RescheduleRequestRepository::new(conn);
                let mut successor =
                    make_flight(&format!("F10{}", i), FlightStatus::RescheduleConfirmed, 72);
                successor.rescheduled_from_id = Some("F001".to_string());
                repo.accept_with_successor(&request_id, "F001", &successor)
            }));
        }
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let ok_count = results.iter().filter(|r| r.is_ok()).count();
        let conflict_count = results
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    Err(RepositoryError::TransitionConflict { .. })
                )
            })
            .count();
        assert_eq!(ok_count, 1);
        assert_eq!(conflict_count, 1);

        // 恰好一条后继课程
        let f101 = flight_repo.find_by_id("F100").unwrap();
        let f102 = flight_repo.find_by_id("F101").unwrap();
        assert_eq!(f101.is_some() as u8 + f102.is_some() as u8, 1);
    }

    #[test]
    fn test_expire_overdue_sweep() {
        let (_conn, flight_repo, request_repo) = setup();
        flight_repo
            .insert(&make_flight("F001", FlightStatus::WeatherCancelled, 24))
            .unwrap();
        let mut request = make_request("F001");
        request.expires_at = Utc::now() - Duration::hours(1);
        request_repo.create(&request).unwrap();

        let count = request_repo.expire_overdue(Utc::now()).unwrap();
        assert_eq!(count, 1);
        let loaded = request_repo
            .find_by_id(&request.request_id)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, RescheduleStatus::Expired);

        // 再次扫描无新增
        assert_eq!(request_repo.expire_overdue(Utc::now()).unwrap(), 0);
    }

    #[test]
    fn test_instructor_visibility_follows_selected_suggestion() {
        let (_conn, flight_repo, request_repo) = setup();
        flight_repo
            .insert(&make_flight("F001", FlightStatus::WeatherCancelled, 24))
            .unwrap();
        let request = make_request("F001");
        request_repo.create(&request).unwrap();

        // PENDING_STUDENT: 原课程教员可见
        assert_eq!(request_repo.list_for_instructor("INS-1").unwrap().len(), 1);
        assert_eq!(request_repo.list_for_instructor("INS-2").unwrap().len(), 0);

        // 学员选择 INS-2 的方案后: 仅 INS-2 可见,原教员不再可见
        request_repo
            .student_select(&request.request_id, "F001", 1, Some("INS-2"))
            .unwrap();
        assert_eq!(request_repo.list_for_instructor("INS-1").unwrap().len(), 0);
        assert_eq!(request_repo.list_for_instructor("INS-2").unwrap().len(), 1);

        // 终态后回归原课程教员可见
        request_repo
            .reject_if_open(&request.request_id, "飞机不可用")
            .unwrap();
        assert_eq!(request_repo.list_for_instructor("INS-1").unwrap().len(), 1);
        assert_eq!(request_repo.list_for_instructor("INS-2").unwrap().len(), 0);
    }
}
