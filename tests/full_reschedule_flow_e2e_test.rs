// ==========================================
// 飞行训练排班系统 - 全链路端到端测试
// ==========================================
// 场景: 恶劣天气检查 → 课程取消 → 建议生成 → 学员选择 →
//       教员确认生成后继课程 → 停飞级联取消后继课程
// ==========================================

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use flight_training_aps::app::{AppState, Collaborators};
use flight_training_aps::domain::flight::Flight;
use flight_training_aps::domain::reschedule::{SlotSuggestion, SuggestionBundle};
use flight_training_aps::domain::squawk::Aircraft;
use flight_training_aps::domain::types::{
    AircraftStatus, FlightStatus, FlightType, JobStatus, RescheduleStatus, SquawkSeverity,
    TrainingLevel,
};
use flight_training_aps::domain::weather::WeatherReading;
use flight_training_aps::engine::providers::{
    NoOpNotifier, ProviderError, StaticMinimumsResolver, SuggestionGenerator, WeatherProvider,
};
use flight_training_aps::repository::{AircraftRepository, FlightRepository};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

/// 桩气象提供方: 低能见度 + 低云底高
struct BadWeather;

#[async_trait]
impl WeatherProvider for BadWeather {
    async fn fetch(&self, airport_code: &str) -> Result<WeatherReading, ProviderError> {
        Ok(WeatherReading {
            airport_code: airport_code.to_string(),
            visibility_sm: Some(1.0),
            ceiling_ft: Some(800.0),
            wind_speed_kt: Some(8.0),
            wind_gust_kt: Some(12.0),
            wind_direction_deg: Some(320.0),
            temperature_c: Some(6.0),
            condition_tags: vec!["BR".to_string()],
            observed_at: Utc::now(),
        })
    }
}

/// 桩建议生成器: 返回两条完整备选,1 号换教员换飞机
struct TwoOptionGenerator;

#[async_trait]
impl SuggestionGenerator for TwoOptionGenerator {
    async fn generate(&self, _flight: &Flight) -> Result<SuggestionBundle, ProviderError> {
        let base = Utc::now() + ChronoDuration::days(2);
        Ok(SuggestionBundle {
            suggestions: vec![
                SlotSuggestion {
                    instructor_id: Some("INS-1".to_string()),
                    aircraft_id: Some("AC-1".to_string()),
                    slot_start: Some(base),
                    slot_end: Some(base + ChronoDuration::hours(2)),
                },
                SlotSuggestion {
                    instructor_id: Some("INS-2".to_string()),
                    aircraft_id: Some("AC-2".to_string()),
                    slot_start: Some(base + ChronoDuration::days(1)),
                    slot_end: Some(base + ChronoDuration::days(1) + ChronoDuration::hours(2)),
                },
            ],
            reasoning: Some(serde_json::json!({ "ranking": "availability" })),
        })
    }
}

fn make_flight(id: &str, aircraft_id: &str, start_offset_hours: i64) -> Flight {
    let start = Utc::now() + ChronoDuration::hours(start_offset_hours);
    Flight {
        flight_id: id.to_string(),
        school_id: "S01".to_string(),
        student_id: "STU-1".to_string(),
        instructor_id: "INS-1".to_string(),
        aircraft_id: aircraft_id.to_string(),
        aircraft_type: "C172".to_string(),
        training_level: TrainingLevel::PreSolo,
        flight_type: FlightType::Dual,
        lesson_code: Some("L-05".to_string()),
        airport_code: "ZBAA".to_string(),
        scheduled_start: start,
        scheduled_end: start + ChronoDuration::hours(2),
        briefing_start: Some(start - ChronoDuration::minutes(30)),
        debrief_end: None,
        status: FlightStatus::Confirmed,
        rescheduled_from_id: None,
        weather_override_flag: false,
        weather_override_reason: None,
        weather_override_by: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn seed(db_path: &str) {
    let conn = Arc::new(Mutex::new(Connection::open(db_path).unwrap()));
    let flight_repo = FlightRepository::new(conn.clone());
    let aircraft_repo = AircraftRepository::new(conn);
    for (id, tail) in [("AC-1", "B-8801"), ("AC-2", "B-8802")] {
        aircraft_repo
            .upsert(&Aircraft {
                aircraft_id: id.to_string(),
                tail_number: tail.to_string(),
                aircraft_type: "C172".to_string(),
                status: AircraftStatus::Available,
                updated_at: Utc::now(),
            })
            .unwrap();
    }
    flight_repo.insert(&make_flight("F001", "AC-1", 12)).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_weather_cancellation_to_reschedule_to_grounding_cascade() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("e2e.db").to_str().unwrap().to_string();
    seed(&db_path);

    let state = AppState::new(
        db_path,
        Collaborators {
            weather: Arc::new(BadWeather),
            minimums: Arc::new(StaticMinimumsResolver::new()),
            generator: Arc::new(TwoOptionGenerator),
            notifier: Arc::new(NoOpNotifier),
        },
    )
    .unwrap();
    state.pipeline.start();

    // === 阶段 1: 恶劣天气 → 检查取消课程并生成改期请求 ===
    let outcome = state.weather_api.check_now("F001").await.unwrap();
    assert_eq!(outcome.status, JobStatus::Completed);
    state.pipeline.drain().await;

    let history = state.weather_api.check_history("F001").unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].reasons.iter().any(|r| r.contains("能见度")));
    assert!(history[0].reasons.iter().any(|r| r.contains("云底高")));
    assert!(history[0].confidence > 0);

    let requests = state.reschedule_api.list_for_student("STU-1").unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.status, RescheduleStatus::PendingStudent);
    assert_eq!(request.suggestions.len(), 2);

    // === 阶段 2: 学员选择 1 号备选(INS-2 / AC-2) ===
    let updated = state
        .reschedule_api
        .student_confirm(&request.request_id, "STU-1", 1)
        .unwrap();
    assert_eq!(updated.status, RescheduleStatus::PendingInstructor);
    assert_eq!(updated.selected_option, Some(1));

    // 交接可见性: 只有新方案教员能看到待确认请求
    assert!(state
        .reschedule_api
        .list_for_instructor("INS-1")
        .unwrap()
        .is_empty());
    assert_eq!(
        state
            .reschedule_api
            .list_for_instructor("INS-2")
            .unwrap()
            .len(),
        1
    );

    // === 阶段 3: 新方案教员确认,生成后继课程 ===
    let successor = state
        .reschedule_api
        .instructor_confirm(&request.request_id, "INS-2")
        .unwrap();
    assert_eq!(successor.instructor_id, "INS-2");
    assert_eq!(successor.aircraft_id, "AC-2");
    assert_eq!(successor.rescheduled_from_id.as_deref(), Some("F001"));
    assert_eq!(successor.lesson_code.as_deref(), Some("L-05"));

    // === 阶段 4: 新飞机停飞 → 级联取消后继课程并再次生成请求 ===
    let report = state
        .squawk_api
        .report_squawk(
            "AC-2",
            "INS-2",
            SquawkSeverity::Grounding,
            "恒速螺旋桨调速失效",
        )
        .unwrap();
    let cascade = report.cascade.unwrap();
    assert!(cascade.newly_grounded);
    assert_eq!(
        cascade.impacted_flight_ids,
        vec![successor.flight_id.clone()]
    );
    assert_eq!(cascade.cancelled_count, 1);

    // 后台扇出: 等待后继课程的新改期请求出现
    let mut found = false;
    for _ in 0..50 {
        let requests = state.reschedule_api.list_for_student("STU-1").unwrap();
        if requests
            .iter()
            .any(|r| r.flight_id == successor.flight_id && r.is_open())
        {
            found = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    assert!(found, "停飞级联应为后继课程生成改期请求");

    // 审计轨迹齐全
    let audit = state.audit_log_repo.list_by_flight("F001").unwrap();
    assert!(audit.len() >= 3); // 取消 + 创建请求 + 学员确认 + 教员确认

    state.pipeline.stop().await;
}
