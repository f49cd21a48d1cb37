//! Upgrade likelihood forecasting.
//!
//! Nine signals are derived per clinic, normalised to 0..=1, weighted into a
//! 0..=100 score and turned into a target tier, timeframe and action list.

mod engine;
pub mod factors;
pub mod recommendations;
mod scoring;

pub use engine::{
    outcome_accuracy, ForecastSettings, ForecastSources, ForecastTables, UpgradeForecastEngine,
};
pub use recommendations::{recommend, RecommendationContext, MAX_RECOMMENDATIONS};
pub use scoring::{timeframe_days, FactorWeights, ForecastScore, ForecastScorer, NormalizedFactors};

/// Default factor weights
pub const DEFAULT_WEIGHTS: FactorWeights = FactorWeights {
    traffic_trend: 0.15,
    engagement_score: 0.12,
    revenue_growth: 0.18,
    competitor_activity: 0.08,
    seasonality: 0.05,
    contact_frequency: 0.10,
    conversion_trend: 0.15,
    content_quality: 0.10,
    tier_position: 0.07,
};
