// ==========================================
// 飞行训练排班系统 - 安全评估引擎
// ==========================================
// 依据: Dispatch_Engine_Specs_v0.2.md - 2. Safety Evaluator
// 红线: 纯函数,不写库、不发通知;读数缺维度降置信度,不臆造结果
// ==========================================
// 输入: 归一化气象读数 + 分级最低标准
// 输出: {result, confidence, reasons[]}
// ==========================================

use crate::domain::types::SafetyResult;
use crate::domain::weather::{Minimums, SafetyMargins, WeatherCheck, WeatherReading};
use chrono::Utc;

// ==========================================
// SafetyEvaluation - 评估结论
// ==========================================
#[derive(Debug, Clone)]
pub struct SafetyEvaluation {
    pub result: SafetyResult,
    pub confidence: i32,      // 0-100
    pub reasons: Vec<String>, // 有序: 能见度→云底高→风→阵风→天气现象
}

// 单维度判定结果
struct DimensionOutcome {
    violated: bool,
    marginal: bool,
    distance_ratio: f64, // 距阈值归一化距离(0=贴线, 1=余量带外), 用于置信度
    reason: Option<String>,
}

// ==========================================
// SafetyEvaluator - 安全评估器
// ==========================================
pub struct SafetyEvaluator {
    margins: SafetyMargins,
}

impl SafetyEvaluator {
    pub fn new(margins: SafetyMargins) -> Self {
        Self { margins }
    }

    /// 评估一次读数
    ///
    /// 判定规则:
    /// - 任一维度硬性违反 → UNSAFE
    /// - 无硬性违反但有维度落在余量带内 → MARGINAL
    /// - 否则 SAFE 且 reasons 为空
    pub fn evaluate(&self, reading: &WeatherReading, minimums: &Minimums) -> SafetyEvaluation {
        const TOTAL_DIMENSIONS: usize = 5;

        let mut outcomes: Vec<DimensionOutcome> = Vec::new();

        // 维度 1: 能见度(下限)
        if let Some(vis) = reading.visibility_sm {
            outcomes.push(check_floor(
                vis,
                minimums.min_visibility_sm,
                self.margins.visibility_sm,
                "能见度",
                "SM",
            ));
        }

        // 维度 2: 云底高(下限)
        if let Some(ceiling) = reading.ceiling_ft {
            outcomes.push(check_floor(
                ceiling,
                minimums.min_ceiling_ft,
                self.margins.ceiling_ft,
                "云底高",
                "ft",
            ));
        }

        // 维度 3: 稳定风(上限)
        if let Some(wind) = reading.wind_speed_kt {
            outcomes.push(check_cap(
                wind,
                minimums.max_wind_kt,
                self.margins.wind_kt,
                "稳定风",
                "kt",
            ));
        }

        // 维度 4: 阵风(上限)
        if let Some(gust) = reading.wind_gust_kt {
            outcomes.push(check_cap(
                gust,
                minimums.max_gust_kt,
                self.margins.wind_kt,
                "阵风",
                "kt",
            ));
        }

        // 维度 5: 天气现象(禁飞标签)
        let hits: Vec<&String> = reading
            .condition_tags
            .iter()
            .filter(|tag| minimums.prohibited_conditions.contains(tag))
            .collect();
        outcomes.push(if hits.is_empty() {
            DimensionOutcome {
                violated: false,
                marginal: false,
                distance_ratio: 1.0,
                reason: None,
            }
        } else {
            let tags = hits
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join("/");
            DimensionOutcome {
                violated: true,
                marginal: false,
                distance_ratio: 1.0,
                reason: Some(format!("存在禁飞天气现象: {}", tags)),
            }
        });

        let available = outcomes.len();
        let any_violated = outcomes.iter().any(|o| o.violated);
        let any_marginal = outcomes.iter().any(|o| o.marginal);
        let reasons: Vec<String> = outcomes.iter().filter_map(|o| o.reason.clone()).collect();

        let result = if any_violated {
            SafetyResult::Unsafe
        } else if any_marginal {
            SafetyResult::Marginal
        } else {
            SafetyResult::Safe
        };

        // 置信度: 数据可得率 × 最差维度距阈值距离
        // 缺维度只降置信度,不改判定结果
        let worst_ratio = outcomes
            .iter()
            .map(|o| o.distance_ratio)
            .fold(1.0_f64, f64::min);
        let base = 100.0 * (available as f64) / (TOTAL_DIMENSIONS as f64);
        let confidence = (base * (0.5 + 0.5 * worst_ratio)).round() as i32;
        let confidence = confidence.clamp(1, 100);

        SafetyEvaluation {
            result,
            confidence,
            reasons,
        }
    }

    /// 组装追加式评估记录
    pub fn to_check(
        flight_id: &str,
        reading: &WeatherReading,
        minimums: &Minimums,
        evaluation: &SafetyEvaluation,
    ) -> WeatherCheck {
        WeatherCheck {
            check_id: uuid::Uuid::new_v4().to_string(),
            flight_id: flight_id.to_string(),
            airport_code: reading.airport_code.clone(),
            visibility_sm: reading.visibility_sm,
            ceiling_ft: reading.ceiling_ft,
            wind_speed_kt: reading.wind_speed_kt,
            wind_gust_kt: reading.wind_gust_kt,
            wind_direction_deg: reading.wind_direction_deg,
            temperature_c: reading.temperature_c,
            condition_tags: reading.condition_tags.clone(),
            result: evaluation.result,
            confidence: evaluation.confidence,
            reasons: evaluation.reasons.clone(),
            minimums: minimums.clone(),
            checked_at: Utc::now(),
        }
    }
}

/// 下限维度判定(能见度/云底高): 实测值不得低于最低标准
fn check_floor(value: f64, min: f64, margin: f64, name: &str, unit: &str) -> DimensionOutcome {
    let ratio = ((value - min).abs() / margin.max(f64::EPSILON)).clamp(0.0, 1.0);
    if value < min {
        DimensionOutcome {
            violated: true,
            marginal: false,
            distance_ratio: ratio,
            reason: Some(format!(
                "{} {:.1}{} 低于最低标准 {:.1}{}",
                name, value, unit, min, unit
            )),
        }
    } else if value < min + margin {
        DimensionOutcome {
            violated: false,
            marginal: true,
            distance_ratio: ratio,
            reason: Some(format!(
                "{} {:.1}{} 接近最低标准 {:.1}{}",
                name, value, unit, min, unit
            )),
        }
    } else {
        DimensionOutcome {
            violated: false,
            marginal: false,
            distance_ratio: ratio,
            reason: None,
        }
    }
}

/// 上限维度判定(稳定风/阵风): 实测值不得高于上限
fn check_cap(value: f64, max: f64, margin: f64, name: &str, unit: &str) -> DimensionOutcome {
    let ratio = ((max - value).abs() / margin.max(f64::EPSILON)).clamp(0.0, 1.0);
    if value > max {
        DimensionOutcome {
            violated: true,
            marginal: false,
            distance_ratio: ratio,
            reason: Some(format!(
                "{} {:.1}{} 超过上限 {:.1}{}",
                name, value, unit, max, unit
            )),
        }
    } else if value > max - margin {
        DimensionOutcome {
            violated: false,
            marginal: true,
            distance_ratio: ratio,
            reason: Some(format!(
                "{} {:.1}{} 接近上限 {:.1}{}",
                name, value, unit, max, unit
            )),
        }
    } else {
        DimensionOutcome {
            violated: false,
            marginal: false,
            distance_ratio: ratio,
            reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimums() -> Minimums {
        Minimums {
            min_visibility_sm: 5.0,
            min_ceiling_ft: 3000.0,
            max_wind_kt: 12.0,
            max_gust_kt: 18.0,
            prohibited_conditions: vec!["TS".to_string(), "FZRA".to_string()],
        }
    }

    fn reading(
        vis: Option<f64>,
        ceiling: Option<f64>,
        wind: Option<f64>,
        gust: Option<f64>,
        tags: Vec<&str>,
    ) -> WeatherReading {
        WeatherReading {
            airport_code: "ZBAA".to_string(),
            visibility_sm: vis,
            ceiling_ft: ceiling,
            wind_speed_kt: wind,
            wind_gust_kt: gust,
            wind_direction_deg: Some(270.0),
            temperature_c: Some(15.0),
            condition_tags: tags.into_iter().map(String::from).collect(),
            observed_at: Utc::now(),
        }
    }

    fn evaluator() -> SafetyEvaluator {
        SafetyEvaluator::new(SafetyMargins::default())
    }

    #[test]
    fn test_all_dimensions_clear_is_safe_with_no_reasons() {
        let eval = evaluator().evaluate(
            &reading(Some(10.0), Some(6000.0), Some(5.0), Some(8.0), vec![]),
            &minimums(),
        );
        assert_eq!(eval.result, SafetyResult::Safe);
        assert!(eval.reasons.is_empty());
        assert_eq!(eval.confidence, 100);
    }

    #[test]
    fn test_single_violation_names_the_dimension() {
        // 仅稳定风超限
        let eval = evaluator().evaluate(
            &reading(Some(10.0), Some(6000.0), Some(20.0), Some(8.0), vec![]),
            &minimums(),
        );
        assert_eq!(eval.result, SafetyResult::Unsafe);
        assert!(!eval.reasons.is_empty());
        assert!(eval.reasons.iter().any(|r| r.contains("稳定风")));
    }

    #[test]
    fn test_low_visibility_and_ceiling_scenario() {
        // 能见度 1.0SM / 要求 5.0SM, 云底高 800ft / 要求 3000ft
        let eval = evaluator().evaluate(
            &reading(Some(1.0), Some(800.0), None, None, vec![]),
            &minimums(),
        );
        assert_eq!(eval.result, SafetyResult::Unsafe);
        assert!(eval.reasons.iter().any(|r| r.contains("能见度")));
        assert!(eval.reasons.iter().any(|r| r.contains("云底高")));
        assert!(eval.confidence > 0);
    }

    #[test]
    fn test_near_threshold_is_marginal_not_safe() {
        // 能见度 5.5SM, 距最低标准 5.0SM 不足 1.0SM 余量
        let eval = evaluator().evaluate(
            &reading(Some(5.5), Some(6000.0), Some(5.0), Some(8.0), vec![]),
            &minimums(),
        );
        assert_eq!(eval.result, SafetyResult::Marginal);
        assert!(eval.reasons.iter().any(|r| r.contains("能见度")));
    }

    #[test]
    fn test_missing_data_lowers_confidence_only() {
        let full = evaluator().evaluate(
            &reading(Some(10.0), Some(6000.0), Some(5.0), Some(8.0), vec![]),
            &minimums(),
        );
        let partial = evaluator().evaluate(
            &reading(Some(10.0), Some(6000.0), None, None, vec![]),
            &minimums(),
        );
        assert_eq!(partial.result, SafetyResult::Safe);
        assert!(partial.confidence < full.confidence);
        assert!(partial.reasons.is_empty());
    }

    #[test]
    fn test_prohibited_condition_is_hard_violation() {
        let eval = evaluator().evaluate(
            &reading(Some(10.0), Some(6000.0), Some(5.0), Some(8.0), vec!["TS"]),
            &minimums(),
        );
        assert_eq!(eval.result, SafetyResult::Unsafe);
        assert!(eval.reasons.iter().any(|r| r.contains("TS")));
    }
}
