use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::clinic::{ClinicSlug, Tier};

string_id!(ForecastId);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastMode {
    #[default]
    Tier,
    Package,
    Feature,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceClass {
    Low,
    Medium,
    High,
}

impl ConfidenceClass {
    /// 80 and above is high, 60 and above medium.
    pub fn from_score(score: u8) -> Self {
        if score >= 80 {
            Self::High
        } else if score >= 60 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// The nine signals behind an upgrade prediction, in their natural units.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForecastFactors {
    /// Relative session change between trailing and preceding window, -1..=1.
    pub traffic_trend: f64,
    /// 0..=100.
    pub engagement_score: f64,
    /// Percent change in revenue between windows, unbounded.
    pub revenue_growth: f64,
    /// 0..=100.
    pub competitor_activity: f64,
    /// -1..=1.
    pub seasonality: f64,
    /// Days since the last CRM touch; `None` when the clinic was never contacted.
    pub contact_frequency_days: Option<i64>,
    /// -1..=1.
    pub conversion_trend: f64,
    /// 0..=100.
    pub content_quality: f64,
    /// 0..=100.
    pub tier_position: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpgradeForecast {
    pub id: ForecastId,
    pub clinic_slug: ClinicSlug,
    pub forecast_date: DateTime<Utc>,
    pub mode: ForecastMode,
    pub current_tier: Tier,
    pub target_tier: Tier,
    pub prediction_score: u8,
    pub confidence: ConfidenceClass,
    pub factors: ForecastFactors,
    pub predicted_revenue: Decimal,
    pub timeframe_days: u32,
    pub recommended_actions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UpgradeForecast {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForecastOutcome {
    pub converted: bool,
    pub observed_tier: Option<Tier>,
    pub observed_at: DateTime<Utc>,
    pub accuracy: f64,
}

/// Append-only audit row pairing a forecast's inputs and outputs with what happened later.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForecastLog {
    pub forecast_id: ForecastId,
    pub clinic_slug: ClinicSlug,
    pub factors: ForecastFactors,
    pub prediction_score: u8,
    pub target_tier: Tier,
    pub logged_at: DateTime<Utc>,
    pub outcome: Option<ForecastOutcome>,
}

impl ForecastLog {
    pub fn from_forecast(forecast: &UpgradeForecast) -> Self {
        Self {
            forecast_id: forecast.id.clone(),
            clinic_slug: forecast.clinic_slug.clone(),
            factors: forecast.factors.clone(),
            prediction_score: forecast.prediction_score,
            target_tier: forecast.target_tier,
            logged_at: forecast.created_at,
            outcome: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ConfidenceClass;

    #[test]
    fn confidence_thresholds_sit_at_sixty_and_eighty() {
        assert_eq!(ConfidenceClass::from_score(100), ConfidenceClass::High);
        assert_eq!(ConfidenceClass::from_score(80), ConfidenceClass::High);
        assert_eq!(ConfidenceClass::from_score(79), ConfidenceClass::Medium);
        assert_eq!(ConfidenceClass::from_score(60), ConfidenceClass::Medium);
        assert_eq!(ConfidenceClass::from_score(59), ConfidenceClass::Low);
        assert_eq!(ConfidenceClass::from_score(0), ConfidenceClass::Low);
    }
}
