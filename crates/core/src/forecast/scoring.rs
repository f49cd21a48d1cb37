//! Weighted combination of forecast factors into a 0..=100 score.

use crate::domain::forecast::{ConfidenceClass, ForecastFactors};

/// Weight per factor. The defaults sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FactorWeights {
    pub traffic_trend: f64,
    pub engagement_score: f64,
    pub revenue_growth: f64,
    pub competitor_activity: f64,
    pub seasonality: f64,
    pub contact_frequency: f64,
    pub conversion_trend: f64,
    pub content_quality: f64,
    pub tier_position: f64,
}

impl FactorWeights {
    pub fn total(&self) -> f64 {
        self.traffic_trend
            + self.engagement_score
            + self.revenue_growth
            + self.competitor_activity
            + self.seasonality
            + self.contact_frequency
            + self.conversion_trend
            + self.content_quality
            + self.tier_position
    }
}

impl Default for FactorWeights {
    fn default() -> Self {
        super::DEFAULT_WEIGHTS
    }
}

/// Days after which a contact gap contributes nothing.
pub const CONTACT_DECAY_DAYS: f64 = 30.0;
/// Revenue growth beyond this percentage counts the same.
pub const REVENUE_GROWTH_CAP_PCT: f64 = 100.0;

/// Each factor mapped onto 0..=1 before weighting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedFactors {
    pub traffic_trend: f64,
    pub engagement_score: f64,
    pub revenue_growth: f64,
    pub competitor_activity: f64,
    pub seasonality: f64,
    pub contact_frequency: f64,
    pub conversion_trend: f64,
    pub content_quality: f64,
    pub tier_position: f64,
}

impl NormalizedFactors {
    pub fn from_factors(factors: &ForecastFactors) -> Self {
        Self {
            traffic_trend: signed_unit(factors.traffic_trend),
            engagement_score: percentage(factors.engagement_score),
            revenue_growth: signed_unit(
                finite_or_zero(factors.revenue_growth) / REVENUE_GROWTH_CAP_PCT,
            ),
            competitor_activity: percentage(factors.competitor_activity),
            seasonality: signed_unit(factors.seasonality),
            contact_frequency: contact_recency(factors.contact_frequency_days),
            conversion_trend: signed_unit(factors.conversion_trend),
            content_quality: percentage(factors.content_quality),
            tier_position: percentage(factors.tier_position),
        }
    }
}

/// -1..=1 onto 0..=1; out-of-range input is clamped first.
fn signed_unit(value: f64) -> f64 {
    (finite_or_zero(value).clamp(-1.0, 1.0) + 1.0) / 2.0
}

fn percentage(value: f64) -> f64 {
    finite_or_zero(value).clamp(0.0, 100.0) / 100.0
}

fn contact_recency(days: Option<i64>) -> f64 {
    match days {
        Some(days) => (1.0 - days.max(0) as f64 / CONTACT_DECAY_DAYS).max(0.0),
        None => 0.0,
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastScore {
    pub score: u8,
    pub confidence: ConfidenceClass,
}

#[derive(Debug, Clone, Default)]
pub struct ForecastScorer {
    weights: FactorWeights,
}

impl ForecastScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_weights(weights: FactorWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &FactorWeights {
        &self.weights
    }

    pub fn weighted_sum(&self, factors: &ForecastFactors) -> f64 {
        let n = NormalizedFactors::from_factors(factors);
        let w = &self.weights;
        n.traffic_trend * w.traffic_trend
            + n.engagement_score * w.engagement_score
            + n.revenue_growth * w.revenue_growth
            + n.competitor_activity * w.competitor_activity
            + n.seasonality * w.seasonality
            + n.contact_frequency * w.contact_frequency
            + n.conversion_trend * w.conversion_trend
            + n.content_quality * w.content_quality
            + n.tier_position * w.tier_position
    }

    pub fn score(&self, factors: &ForecastFactors) -> ForecastScore {
        let score = (self.weighted_sum(factors) * 100.0).round().clamp(0.0, 100.0) as u8;
        ForecastScore { score, confidence: ConfidenceClass::from_score(score) }
    }
}

/// Days until the predicted conversion: 30 at score 0, floored at 15.
pub fn timeframe_days(score: u8) -> u32 {
    let remaining = (1.0 - f64::from(score) / 100.0).max(0.5);
    (30.0 * remaining).round() as u32
}
