// ==========================================
// 飞行训练排班系统 - 外部协作方接口
// ==========================================
// 职责: 定义气象/最低标准/建议生成/通知四个外部协作方 trait
// 说明: 引擎只依赖接口,实现由装配层注入,便于测试与替换
// ==========================================

use crate::domain::flight::Flight;
use crate::domain::reschedule::SuggestionBundle;
use crate::domain::types::{FlightType, NotificationKind, TrainingLevel};
use crate::domain::weather::{Minimums, WeatherReading};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

// ==========================================
// ProviderError - 外部协作方错误
// ==========================================
// 说明: Unavailable/Timeout 在任务层按可重试失败处理,
//       在级联层按"本课程不生成请求"软失败处理
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("上游服务不可用: {0}")]
    Unavailable(String),

    #[error("上游调用超时: {0}")]
    Timeout(String),

    #[error("上游调用失败: {0}")]
    Failed(String),
}

// ==========================================
// WeatherProvider - 气象提供方
// ==========================================
/// 返回归一化气象读数;读数不可得时返回 Unavailable,
/// 调用方记可重试失败,不得臆造读数。
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn fetch(&self, airport_code: &str) -> Result<WeatherReading, ProviderError>;
}

// ==========================================
// MinimumsResolver - 最低气象标准解析
// ==========================================
/// 解析维度: 训练等级 × 机型 × 课程类型
pub trait MinimumsResolver: Send + Sync {
    fn resolve(
        &self,
        training_level: TrainingLevel,
        aircraft_type: &str,
        flight_type: FlightType,
    ) -> Result<Minimums, ProviderError>;
}

// ==========================================
// SuggestionGenerator - 改期建议生成器
// ==========================================
/// 黑盒协作方: 返回按推荐度排序的 (教员, 飞机, 时段) 备选列表。
/// 调用方必须套硬超时,防止单次生成拖垮批处理。
#[async_trait]
pub trait SuggestionGenerator: Send + Sync {
    async fn generate(&self, flight: &Flight) -> Result<SuggestionBundle, ProviderError>;
}

// ==========================================
// Notifier - 通知投递
// ==========================================
/// 尽力而为: 失败只记日志,不向调用方传播
pub trait Notifier: Send + Sync {
    fn notify(
        &self,
        recipient_id: &str,
        kind: NotificationKind,
        payload: JsonValue,
    ) -> Result<(), ProviderError>;
}

/// 空操作通知器(单元测试/未接入通知渠道的场景)
#[derive(Debug, Clone, Default)]
pub struct NoOpNotifier;

impl Notifier for NoOpNotifier {
    fn notify(
        &self,
        recipient_id: &str,
        kind: NotificationKind,
        _payload: JsonValue,
    ) -> Result<(), ProviderError> {
        tracing::debug!(
            "NoOpNotifier: 跳过通知投递 - recipient={}, kind={}",
            recipient_id,
            kind.as_str()
        );
        Ok(())
    }
}

/// 通知投递的统一入口: 失败降级为告警日志
pub fn notify_best_effort(
    notifier: &dyn Notifier,
    recipient_id: &str,
    kind: NotificationKind,
    payload: JsonValue,
) {
    if let Err(e) = notifier.notify(recipient_id, kind, payload) {
        tracing::warn!(
            recipient = recipient_id,
            kind = kind.as_str(),
            "通知投递失败(不传播): {}",
            e
        );
    }
}

// ==========================================
// StaticMinimumsResolver - 内置分级标准表
// ==========================================
// 依据: Dispatch_Engine_Specs_v0.2.md - 2.3 分级最低标准
// 说明: 按训练等级查表;单飞课程取等级标准与单飞下限的严格侧
pub struct StaticMinimumsResolver;

impl StaticMinimumsResolver {
    pub fn new() -> Self {
        Self
    }

    fn level_minimums(level: TrainingLevel) -> Minimums {
        let prohibited = vec![
            "TS".to_string(),   // 雷暴
            "FZRA".to_string(), // 冻雨
            "FZDZ".to_string(), // 冻毛毛雨
            "GR".to_string(),   // 冰雹
        ];
        match level {
            TrainingLevel::PreSolo => Minimums {
                min_visibility_sm: 5.0,
                min_ceiling_ft: 3000.0,
                max_wind_kt: 12.0,
                max_gust_kt: 18.0,
                prohibited_conditions: prohibited,
            },
            TrainingLevel::Solo => Minimums {
                min_visibility_sm: 4.0,
                min_ceiling_ft: 2500.0,
                max_wind_kt: 15.0,
                max_gust_kt: 20.0,
                prohibited_conditions: prohibited,
            },
            TrainingLevel::Private => Minimums {
                min_visibility_sm: 3.0,
                min_ceiling_ft: 2000.0,
                max_wind_kt: 18.0,
                max_gust_kt: 25.0,
                prohibited_conditions: prohibited,
            },
            TrainingLevel::Instrument => Minimums {
                min_visibility_sm: 1.0,
                min_ceiling_ft: 500.0,
                max_wind_kt: 25.0,
                max_gust_kt: 35.0,
                prohibited_conditions: prohibited,
            },
            TrainingLevel::Commercial => Minimums {
                min_visibility_sm: 3.0,
                min_ceiling_ft: 1500.0,
                max_wind_kt: 20.0,
                max_gust_kt: 30.0,
                prohibited_conditions: prohibited,
            },
        }
    }
}

impl Default for StaticMinimumsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl MinimumsResolver for StaticMinimumsResolver {
    fn resolve(
        &self,
        training_level: TrainingLevel,
        _aircraft_type: &str,
        flight_type: FlightType,
    ) -> Result<Minimums, ProviderError> {
        let mut minimums = Self::level_minimums(training_level);

        // 单飞课程: 不得宽于单飞阶段标准
        if flight_type == FlightType::Solo {
            let solo_floor = Self::level_minimums(TrainingLevel::Solo);
            minimums.min_visibility_sm = minimums.min_visibility_sm.max(solo_floor.min_visibility_sm);
            minimums.min_ceiling_ft = minimums.min_ceiling_ft.max(solo_floor.min_ceiling_ft);
            minimums.max_wind_kt = minimums.max_wind_kt.min(solo_floor.max_wind_kt);
            minimums.max_gust_kt = minimums.max_gust_kt.min(solo_floor.max_gust_kt);
        }

        Ok(minimums)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_solo_stricter_than_private() {
        let resolver = StaticMinimumsResolver::new();
        let pre_solo = resolver
            .resolve(TrainingLevel::PreSolo, "C172", FlightType::Dual)
            .unwrap();
        let private = resolver
            .resolve(TrainingLevel::Private, "C172", FlightType::Dual)
            .unwrap();
        assert!(pre_solo.min_visibility_sm > private.min_visibility_sm);
        assert!(pre_solo.min_ceiling_ft > private.min_ceiling_ft);
        assert!(pre_solo.max_wind_kt < private.max_wind_kt);
    }

    #[test]
    fn test_solo_flight_clamps_to_solo_floor() {
        let resolver = StaticMinimumsResolver::new();
        // 商照学员单飞: 风限不得宽于单飞下限
        let m = resolver
            .resolve(TrainingLevel::Commercial, "C172", FlightType::Solo)
            .unwrap();
        assert_eq!(m.max_wind_kt, 15.0);
        assert_eq!(m.min_visibility_sm, 4.0);
    }
}
