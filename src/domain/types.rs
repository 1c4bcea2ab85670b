// ==========================================
// 飞行训练排班系统 - 领域类型定义
// ==========================================
// 依据: Dispatch_Engine_Specs_v0.2.md - 0.2 状态体系
// 安全红线: 状态字段只能由指定组件写入
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// 训练课程状态 (Flight Status)
// ==========================================
// 红线: 仅安全评估 / 停飞级联 / 改期状态机 / 人工复飞可写
// 序列化格式: SCREAMING_SNAKE_CASE (与数据库一致)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlightStatus {
    Pending,              // 已预约待确认
    Confirmed,            // 已确认
    WeatherCancelled,     // 天气取消
    MaintenanceCancelled, // 机务停飞取消
    ReschedulePending,    // 改期待教员确认
    Rescheduled,          // 已改期(有后继课程)
    RescheduleConfirmed,  // 改期后的新课程
    Completed,            // 已完成
}

impl FlightStatus {
    /// 转换为数据库存储的字符串
    pub fn to_db_str(&self) -> &'static str {
        match self {
            FlightStatus::Pending => "PENDING",
            FlightStatus::Confirmed => "CONFIRMED",
            FlightStatus::WeatherCancelled => "WEATHER_CANCELLED",
            FlightStatus::MaintenanceCancelled => "MAINTENANCE_CANCELLED",
            FlightStatus::ReschedulePending => "RESCHEDULE_PENDING",
            FlightStatus::Rescheduled => "RESCHEDULED",
            FlightStatus::RescheduleConfirmed => "RESCHEDULE_CONFIRMED",
            FlightStatus::Completed => "COMPLETED",
        }
    }

    /// 从字符串解析状态
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(FlightStatus::Pending),
            "CONFIRMED" => Some(FlightStatus::Confirmed),
            "WEATHER_CANCELLED" => Some(FlightStatus::WeatherCancelled),
            "MAINTENANCE_CANCELLED" => Some(FlightStatus::MaintenanceCancelled),
            "RESCHEDULE_PENDING" => Some(FlightStatus::ReschedulePending),
            "RESCHEDULED" => Some(FlightStatus::Rescheduled),
            "RESCHEDULE_CONFIRMED" => Some(FlightStatus::RescheduleConfirmed),
            "COMPLETED" => Some(FlightStatus::Completed),
            _ => None,
        }
    }

    /// 停飞级联可作用的状态集合(未来待飞课程)
    pub fn cascade_eligible() -> &'static [FlightStatus] {
        &[
            FlightStatus::Pending,
            FlightStatus::Confirmed,
            FlightStatus::ReschedulePending,
            FlightStatus::RescheduleConfirmed,
        ]
    }

    /// 天气检查可作用的状态集合
    pub fn checkable() -> &'static [FlightStatus] {
        &[FlightStatus::Pending, FlightStatus::Confirmed]
    }
}

impl fmt::Display for FlightStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_str())
    }
}

// ==========================================
// 安全评估结果 (Safety Result)
// ==========================================
// 依据: Dispatch_Engine_Specs_v0.2.md - 2. Safety Evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyResult {
    Safe,     // 全维度达标
    Marginal, // 临界(无硬性违反但接近阈值)
    Unsafe,   // 存在硬性违反
}

impl SafetyResult {
    pub fn to_db_str(&self) -> &'static str {
        match self {
            SafetyResult::Safe => "SAFE",
            SafetyResult::Marginal => "MARGINAL",
            SafetyResult::Unsafe => "UNSAFE",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "SAFE" => Some(SafetyResult::Safe),
            "MARGINAL" => Some(SafetyResult::Marginal),
            "UNSAFE" => Some(SafetyResult::Unsafe),
            _ => None,
        }
    }
}

impl fmt::Display for SafetyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_str())
    }
}

// ==========================================
// 改期请求状态 (Reschedule Status)
// ==========================================
// 状态机: PENDING_STUDENT → PENDING_INSTRUCTOR → ACCEPTED
//         PENDING_* → REJECTED / EXPIRED (终态)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RescheduleStatus {
    PendingStudent,    // 待学员选择
    PendingInstructor, // 待教员确认
    Accepted,          // 双方确认,已生成后继课程
    Rejected,          // 任一方拒绝
    Expired,           // 超时失效
}

impl RescheduleStatus {
    pub fn to_db_str(&self) -> &'static str {
        match self {
            RescheduleStatus::PendingStudent => "PENDING_STUDENT",
            RescheduleStatus::PendingInstructor => "PENDING_INSTRUCTOR",
            RescheduleStatus::Accepted => "ACCEPTED",
            RescheduleStatus::Rejected => "REJECTED",
            RescheduleStatus::Expired => "EXPIRED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING_STUDENT" => Some(RescheduleStatus::PendingStudent),
            "PENDING_INSTRUCTOR" => Some(RescheduleStatus::PendingInstructor),
            "ACCEPTED" => Some(RescheduleStatus::Accepted),
            "REJECTED" => Some(RescheduleStatus::Rejected),
            "EXPIRED" => Some(RescheduleStatus::Expired),
            _ => None,
        }
    }

    /// 是否为开放状态(同一课程同时最多一条开放请求)
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            RescheduleStatus::PendingStudent | RescheduleStatus::PendingInstructor
        )
    }
}

impl fmt::Display for RescheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_str())
    }
}

// ==========================================
// 选择方 (Selected By)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectedBy {
    Student,    // 学员
    Instructor, // 教员
}

impl SelectedBy {
    pub fn to_db_str(&self) -> &'static str {
        match self {
            SelectedBy::Student => "STUDENT",
            SelectedBy::Instructor => "INSTRUCTOR",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "STUDENT" => Some(SelectedBy::Student),
            "INSTRUCTOR" => Some(SelectedBy::Instructor),
            _ => None,
        }
    }
}

// ==========================================
// 故障报告严重度 (Squawk Severity)
// ==========================================
// 红线: 仅 GROUNDING 级别触发停飞级联
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SquawkSeverity {
    Minor,     // 轻微(不影响放飞)
    Major,     // 重要(限制性放飞)
    Grounding, // 停飞(禁止放飞,触发级联)
}

impl SquawkSeverity {
    pub fn to_db_str(&self) -> &'static str {
        match self {
            SquawkSeverity::Minor => "MINOR",
            SquawkSeverity::Major => "MAJOR",
            SquawkSeverity::Grounding => "GROUNDING",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "MINOR" => Some(SquawkSeverity::Minor),
            "MAJOR" => Some(SquawkSeverity::Major),
            "GROUNDING" => Some(SquawkSeverity::Grounding),
            _ => None,
        }
    }
}

impl fmt::Display for SquawkSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_str())
    }
}

// ==========================================
// 故障报告状态 (Squawk Status)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SquawkStatus {
    Open,     // 未处理
    Resolved, // 已排故
}

impl SquawkStatus {
    pub fn to_db_str(&self) -> &'static str {
        match self {
            SquawkStatus::Open => "OPEN",
            SquawkStatus::Resolved => "RESOLVED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "OPEN" => Some(SquawkStatus::Open),
            "RESOLVED" => Some(SquawkStatus::Resolved),
            _ => None,
        }
    }
}

// ==========================================
// 飞机状态 (Aircraft Status)
// ==========================================
// 红线: GROUNDED 的写入必须幂等
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AircraftStatus {
    Available, // 可用
    Grounded,  // 停飞
}

impl AircraftStatus {
    pub fn to_db_str(&self) -> &'static str {
        match self {
            AircraftStatus::Available => "AVAILABLE",
            AircraftStatus::Grounded => "GROUNDED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "AVAILABLE" => Some(AircraftStatus::Available),
            "GROUNDED" => Some(AircraftStatus::Grounded),
            _ => None,
        }
    }
}

// ==========================================
// 学员训练等级 (Training Level)
// ==========================================
// 用途: 最低气象标准按训练等级分级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrainingLevel {
    PreSolo,    // 单飞前学员
    Solo,       // 单飞阶段学员
    Private,    // 私照阶段
    Instrument, // 仪表阶段
    Commercial, // 商照阶段
}

impl TrainingLevel {
    pub fn to_db_str(&self) -> &'static str {
        match self {
            TrainingLevel::PreSolo => "PRE_SOLO",
            TrainingLevel::Solo => "SOLO",
            TrainingLevel::Private => "PRIVATE",
            TrainingLevel::Instrument => "INSTRUMENT",
            TrainingLevel::Commercial => "COMMERCIAL",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PRE_SOLO" => Some(TrainingLevel::PreSolo),
            "SOLO" => Some(TrainingLevel::Solo),
            "PRIVATE" => Some(TrainingLevel::Private),
            "INSTRUMENT" => Some(TrainingLevel::Instrument),
            "COMMERCIAL" => Some(TrainingLevel::Commercial),
            _ => None,
        }
    }
}

// ==========================================
// 课程类型 (Flight Type)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlightType {
    Dual,         // 带飞
    Solo,         // 单飞
    CrossCountry, // 转场
    Checkride,    // 考试飞行
}

impl FlightType {
    pub fn to_db_str(&self) -> &'static str {
        match self {
            FlightType::Dual => "DUAL",
            FlightType::Solo => "SOLO",
            FlightType::CrossCountry => "CROSS_COUNTRY",
            FlightType::Checkride => "CHECKRIDE",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "DUAL" => Some(FlightType::Dual),
            "SOLO" => Some(FlightType::Solo),
            "CROSS_COUNTRY" => Some(FlightType::CrossCountry),
            "CHECKRIDE" => Some(FlightType::Checkride),
            _ => None,
        }
    }
}

// ==========================================
// 后台任务类型 (Job Kind)
// ==========================================
// 依据: Dispatch_Engine_Specs_v0.2.md - 5. Job Pipeline
// 说明: 单一工作池 + 类型分发,保证优先级全局有序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    WeatherCheck,         // 天气安全检查
    RescheduleGeneration, // 改期建议生成
}

impl JobKind {
    pub fn to_db_str(&self) -> &'static str {
        match self {
            JobKind::WeatherCheck => "WEATHER_CHECK",
            JobKind::RescheduleGeneration => "RESCHEDULE_GENERATION",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "WEATHER_CHECK" => Some(JobKind::WeatherCheck),
            "RESCHEDULE_GENERATION" => Some(JobKind::RescheduleGeneration),
            _ => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_str())
    }
}

// ==========================================
// 后台任务状态 (Job Status)
// ==========================================
// 状态机: WAITING → ACTIVE → COMPLETED | FAILED
// FAILED 在重试次数内回到 WAITING
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Waiting,   // 等待执行
    Active,    // 执行中
    Completed, // 已完成
    Failed,    // 终态失败
}

impl JobStatus {
    pub fn to_db_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "WAITING",
            JobStatus::Active => "ACTIVE",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "WAITING" => Some(JobStatus::Waiting),
            "ACTIVE" => Some(JobStatus::Active),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// 按课程聚合状态查询时的汇报优先级
    /// 顺序: COMPLETED > ACTIVE > WAITING > FAILED
    pub fn report_rank(&self) -> i32 {
        match self {
            JobStatus::Completed => 4,
            JobStatus::Active => 3,
            JobStatus::Waiting => 2,
            JobStatus::Failed => 1,
        }
    }

    pub fn from_report_rank(rank: i32) -> Option<Self> {
        match rank {
            4 => Some(JobStatus::Completed),
            3 => Some(JobStatus::Active),
            2 => Some(JobStatus::Waiting),
            1 => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// 是否终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_str())
    }
}

// ==========================================
// 通知类型 (Notification Kind)
// ==========================================
// 说明: 通知投递是外部协作方,失败只记日志不传播
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    WeatherCancelled,           // 天气取消通知
    MaintenanceCancelled,       // 机务停飞取消通知
    RescheduleOptions,          // 改期备选方案通知(学员)
    InstructorConfirmRequested, // 待教员确认通知
    RescheduleAccepted,         // 改期成功通知
    RescheduleRejected,         // 改期被拒通知
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::WeatherCancelled => "WEATHER_CANCELLED",
            NotificationKind::MaintenanceCancelled => "MAINTENANCE_CANCELLED",
            NotificationKind::RescheduleOptions => "RESCHEDULE_OPTIONS",
            NotificationKind::InstructorConfirmRequested => "INSTRUCTOR_CONFIRM_REQUESTED",
            NotificationKind::RescheduleAccepted => "RESCHEDULE_ACCEPTED",
            NotificationKind::RescheduleRejected => "RESCHEDULE_REJECTED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flight_status_roundtrip() {
        let all = [
            FlightStatus::Pending,
            FlightStatus::Confirmed,
            FlightStatus::WeatherCancelled,
            FlightStatus::MaintenanceCancelled,
            FlightStatus::ReschedulePending,
            FlightStatus::Rescheduled,
            FlightStatus::RescheduleConfirmed,
            FlightStatus::Completed,
        ];
        for s in all {
            assert_eq!(FlightStatus::from_db_str(s.to_db_str()), Some(s));
        }
        assert_eq!(FlightStatus::from_db_str("BOGUS"), None);
    }

    #[test]
    fn test_reschedule_open_states() {
        assert!(RescheduleStatus::PendingStudent.is_open());
        assert!(RescheduleStatus::PendingInstructor.is_open());
        assert!(!RescheduleStatus::Accepted.is_open());
        assert!(!RescheduleStatus::Rejected.is_open());
        assert!(!RescheduleStatus::Expired.is_open());
    }

    #[test]
    fn test_job_status_report_rank_order() {
        // 汇报优先级: COMPLETED > ACTIVE > WAITING > FAILED
        assert!(JobStatus::Completed.report_rank() > JobStatus::Active.report_rank());
        assert!(JobStatus::Active.report_rank() > JobStatus::Waiting.report_rank());
        assert!(JobStatus::Waiting.report_rank() > JobStatus::Failed.report_rank());
    }

    #[test]
    fn test_cascade_eligible_excludes_terminal() {
        let eligible = FlightStatus::cascade_eligible();
        assert!(!eligible.contains(&FlightStatus::Completed));
        assert!(!eligible.contains(&FlightStatus::Rescheduled));
        assert!(!eligible.contains(&FlightStatus::MaintenanceCancelled));
        assert!(eligible.contains(&FlightStatus::RescheduleConfirmed));
    }
}
