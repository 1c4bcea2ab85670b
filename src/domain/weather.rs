// ==========================================
// 飞行训练排班系统 - 气象领域模型
// ==========================================
// 依据: Dispatch_Engine_Specs_v0.2.md - 2. Safety Evaluator
// 红线: WeatherCheck 为追加式证据记录,落库后不可变更
// ==========================================

use crate::domain::types::SafetyResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// WeatherReading - 归一化气象读数
// ==========================================
// 用途: 气象提供方(外部协作方)返回的标准化读数
// 说明: 维度缺失用 None 表达,评估器据此降低置信度而非臆造结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherReading {
    pub airport_code: String,              // 机场代码
    pub visibility_sm: Option<f64>,        // 能见度(法定英里)
    pub ceiling_ft: Option<f64>,           // 云底高(英尺)
    pub wind_speed_kt: Option<f64>,        // 风速(节)
    pub wind_gust_kt: Option<f64>,         // 阵风(节)
    pub wind_direction_deg: Option<f64>,   // 风向(度)
    pub temperature_c: Option<f64>,        // 气温(摄氏)
    pub condition_tags: Vec<String>,       // 天气现象标签(TS/FZRA/BR...)
    pub observed_at: DateTime<Utc>,        // 观测时刻
}

// ==========================================
// Minimums - 最低气象标准
// ==========================================
// 解析维度: 训练等级 × 机型 × 课程类型(由 MinimumsResolver 提供)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Minimums {
    pub min_visibility_sm: f64,            // 最低能见度(法定英里)
    pub min_ceiling_ft: f64,               // 最低云底高(英尺)
    pub max_wind_kt: f64,                  // 最大稳定风(节)
    pub max_gust_kt: f64,                  // 最大阵风(节)
    pub prohibited_conditions: Vec<String>, // 禁飞天气现象标签
}

// ==========================================
// SafetyMargins - 临界判定余量
// ==========================================
// 用途: 距阈值在余量带内的维度计为 MARGINAL 而非 SAFE
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SafetyMargins {
    pub visibility_sm: f64, // 能见度余量
    pub ceiling_ft: f64,    // 云底高余量
    pub wind_kt: f64,       // 风速/阵风余量
}

impl Default for SafetyMargins {
    fn default() -> Self {
        Self {
            visibility_sm: 1.0,
            ceiling_ft: 500.0,
            wind_kt: 5.0,
        }
    }
}

// ==========================================
// WeatherCheck - 安全评估记录(追加式)
// ==========================================
// 红线: 仅由 Safety Evaluator 路径创建,创建后不可变
// 对齐: weather_check 表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherCheck {
    // ===== 主键与关联 =====
    pub check_id: String,  // 评估记录 ID(UUID)
    pub flight_id: String, // 被评估课程

    // ===== 读数快照 =====
    pub airport_code: String,
    pub visibility_sm: Option<f64>,
    pub ceiling_ft: Option<f64>,
    pub wind_speed_kt: Option<f64>,
    pub wind_gust_kt: Option<f64>,
    pub wind_direction_deg: Option<f64>,
    pub temperature_c: Option<f64>,
    pub condition_tags: Vec<String>,

    // ===== 评估结论 =====
    pub result: SafetyResult,  // SAFE / MARGINAL / UNSAFE
    pub confidence: i32,       // 置信度(0-100)
    pub reasons: Vec<String>,  // 有序原因列表(可解释性)
    pub minimums: Minimums,    // 本次评估采用的最低标准快照

    // ===== 审计字段 =====
    pub checked_at: DateTime<Utc>, // 评估时刻
}
