use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::factors::{
    contact_gap_days, content_quality, engagement_score, relative_change, revenue_growth,
};
use super::recommendations::{recommend, RecommendationContext};
use super::scoring::{timeframe_days, ForecastScorer};
use crate::clock::Clock;
use crate::domain::clinic::{ClinicProfile, ClinicSlug, Tier};
use crate::domain::forecast::{
    ForecastFactors, ForecastId, ForecastLog, ForecastMode, ForecastOutcome, UpgradeForecast,
};
use crate::errors::{AppResult, DomainError};
use crate::store::{ClinicDirectory, ContactStore, ConversionEventStore, ForecastStore, SessionStore};
use crate::tables::{ContentChecklist, SeasonalityTable, TierTable};

/// Tunables for forecast generation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForecastSettings {
    pub ttl_days: u32,
    pub window_days: u32,
    pub contact_gap_days: u32,
    /// Placeholder until real competitive data exists.
    pub competitor_activity: f64,
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self { ttl_days: 7, window_days: 30, contact_gap_days: 14, competitor_activity: 50.0 }
    }
}

/// Stores the forecast engine reads from and writes to.
#[derive(Clone)]
pub struct ForecastSources {
    pub clinics: Arc<dyn ClinicDirectory>,
    pub contacts: Arc<dyn ContactStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub events: Arc<dyn ConversionEventStore>,
    pub forecasts: Arc<dyn ForecastStore>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ForecastTables {
    pub tiers: TierTable,
    pub seasonality: SeasonalityTable,
    pub checklist: ContentChecklist,
}

impl Default for ForecastTables {
    fn default() -> Self {
        Self {
            tiers: TierTable::default(),
            seasonality: SeasonalityTable::default(),
            checklist: ContentChecklist::default(),
        }
    }
}

pub struct UpgradeForecastEngine {
    sources: ForecastSources,
    clock: Arc<dyn Clock>,
    scorer: ForecastScorer,
    tables: ForecastTables,
    settings: ForecastSettings,
}

struct WindowActivity {
    sessions: usize,
    conversions: usize,
    revenue: Decimal,
}

impl UpgradeForecastEngine {
    pub fn new(sources: ForecastSources, clock: Arc<dyn Clock>) -> Self {
        Self {
            sources,
            clock,
            scorer: ForecastScorer::new(),
            tables: ForecastTables::default(),
            settings: ForecastSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ForecastSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_tables(mut self, tables: ForecastTables) -> Self {
        self.tables = tables;
        self
    }

    pub fn with_scorer(mut self, scorer: ForecastScorer) -> Self {
        self.scorer = scorer;
        self
    }

    /// Builds, persists and logs a fresh forecast.
    pub async fn generate_forecast(
        &self,
        slug: &ClinicSlug,
        mode: ForecastMode,
    ) -> AppResult<UpgradeForecast> {
        let clinic = self.load_clinic(slug).await?;
        let now = self.clock.now();
        let factors = self.collect_factors(&clinic, now).await?;

        let scored = self.scorer.score(&factors);
        let target_tier = self.tables.tiers.next_tier(clinic.tier);
        let at_top_tier = self.tables.tiers.is_top(clinic.tier);
        let recommended_actions = recommend(&RecommendationContext {
            factors: &factors,
            score: scored.score,
            target_tier,
            at_top_tier,
            contact_gap_days: i64::from(self.settings.contact_gap_days),
        });

        let forecast = UpgradeForecast {
            id: ForecastId(format!("F-{}", Uuid::new_v4().simple())),
            clinic_slug: clinic.slug.clone(),
            forecast_date: now,
            mode,
            current_tier: clinic.tier,
            target_tier,
            prediction_score: scored.score,
            confidence: scored.confidence,
            factors,
            predicted_revenue: self.tables.tiers.monthly_price(target_tier),
            timeframe_days: timeframe_days(scored.score),
            recommended_actions,
            created_at: now,
            expires_at: now + Duration::days(i64::from(self.settings.ttl_days)),
        };

        self.sources.forecasts.save_forecast(forecast.clone()).await?;
        self.sources.forecasts.append_log(ForecastLog::from_forecast(&forecast)).await?;

        info!(
            event_name = "forecast.generated",
            clinic_slug = %forecast.clinic_slug,
            forecast_id = %forecast.id,
            score = forecast.prediction_score,
            target_tier = forecast.target_tier.as_str(),
            "upgrade forecast generated"
        );
        Ok(forecast)
    }

    /// The latest unexpired forecast, or a newly generated one.
    pub async fn current_or_generate(
        &self,
        slug: &ClinicSlug,
        mode: ForecastMode,
    ) -> AppResult<UpgradeForecast> {
        if let Some(existing) = self.sources.forecasts.latest_forecast(slug).await? {
            if !existing.is_expired(self.clock.now()) && existing.mode == mode {
                return Ok(existing);
            }
        }
        self.generate_forecast(slug, mode).await
    }

    /// Fills in what actually happened for a logged forecast.
    pub async fn record_outcome(
        &self,
        slug: &ClinicSlug,
        forecast_id: &ForecastId,
        converted: bool,
        observed_tier: Option<Tier>,
    ) -> AppResult<ForecastOutcome> {
        let logs = self.sources.forecasts.list_logs(slug).await?;
        let log = logs
            .iter()
            .find(|log| log.forecast_id == *forecast_id)
            .ok_or_else(|| DomainError::not_found("forecast log", forecast_id.as_str()))?;

        let outcome = ForecastOutcome {
            converted,
            observed_tier,
            observed_at: self.clock.now(),
            accuracy: outcome_accuracy(log.prediction_score, converted),
        };
        if !self.sources.forecasts.record_outcome(forecast_id, outcome.clone()).await? {
            return Err(DomainError::not_found("forecast log", forecast_id.as_str()).into());
        }

        info!(
            event_name = "forecast.outcome_recorded",
            clinic_slug = %slug,
            forecast_id = %forecast_id,
            converted,
            accuracy = outcome.accuracy,
            "forecast outcome recorded"
        );
        Ok(outcome)
    }

    async fn load_clinic(&self, slug: &ClinicSlug) -> AppResult<ClinicProfile> {
        self.sources
            .clinics
            .find_clinic(slug)
            .await?
            .ok_or_else(|| DomainError::not_found("clinic", slug.as_str()).into())
    }

    async fn collect_factors(
        &self,
        clinic: &ClinicProfile,
        now: DateTime<Utc>,
    ) -> AppResult<ForecastFactors> {
        let window = Duration::days(i64::from(self.settings.window_days));
        let current_start = now - window;
        let previous_start = current_start - window;
        let previous_end = current_start - Duration::nanoseconds(1);

        let current_sessions =
            self.sources.sessions.list_sessions(&clinic.slug, current_start, now).await?;
        let current = self.activity(clinic, current_start, now, current_sessions.len()).await?;
        let previous_sessions = self
            .sources
            .sessions
            .list_sessions(&clinic.slug, previous_start, previous_end)
            .await?
            .len();
        let previous =
            self.activity(clinic, previous_start, previous_end, previous_sessions).await?;

        let last_contact = self.sources.contacts.last_contact_at(&clinic.slug).await?;

        Ok(ForecastFactors {
            traffic_trend: relative_change(current.sessions as f64, previous.sessions as f64),
            engagement_score: engagement_score(&current_sessions),
            revenue_growth: revenue_growth(current.revenue, previous.revenue),
            competitor_activity: self.settings.competitor_activity,
            seasonality: self.tables.seasonality.factor_for_month(now.month()),
            contact_frequency_days: contact_gap_days(last_contact, now),
            conversion_trend: relative_change(
                current.conversions as f64,
                previous.conversions as f64,
            ),
            content_quality: content_quality(clinic, &self.tables.checklist),
            tier_position: self.tables.tiers.position_score(clinic.tier),
        })
    }

    async fn activity(
        &self,
        clinic: &ClinicProfile,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sessions: usize,
    ) -> AppResult<WindowActivity> {
        let events = self.sources.events.list_between(&clinic.slug, start, end).await?;
        Ok(WindowActivity {
            sessions,
            conversions: events.len(),
            revenue: events.iter().map(|event| event.value).sum(),
        })
    }
}

/// `1 - |score/100 - actual|` with actual 1 for a conversion, else 0.
pub fn outcome_accuracy(prediction_score: u8, converted: bool) -> f64 {
    let predicted = f64::from(prediction_score) / 100.0;
    let actual = if converted { 1.0 } else { 0.0 };
    1.0 - (predicted - actual).abs()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::{outcome_accuracy, ForecastSettings, ForecastSources, UpgradeForecastEngine};
    use crate::clock::{Clock, FixedClock};
    use crate::domain::clinic::{ClinicProfile, ClinicSlug, SessionRecord, Tier};
    use crate::domain::conversion::{
        ConversionEvent, ConversionEventId, ConversionType, DeviceClass, EventMetadata,
        TrafficSource,
    };
    use crate::domain::forecast::{ConfidenceClass, ForecastMode};
    use crate::store::{
        ConversionEventStore, ForecastStore, InMemoryClinicDirectory, InMemoryContactStore,
        InMemoryConversionStore, InMemoryForecastStore, InMemorySessionStore, SessionStore,
    };

    struct Harness {
        engine: UpgradeForecastEngine,
        clinics: Arc<InMemoryClinicDirectory>,
        contacts: Arc<InMemoryContactStore>,
        sessions: Arc<InMemorySessionStore>,
        events: Arc<InMemoryConversionStore>,
        forecasts: Arc<InMemoryForecastStore>,
        clock: Arc<FixedClock>,
    }

    fn december_evening() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 12, 10, 17, 0, 0).single().expect("valid instant")
    }

    fn harness() -> Harness {
        let clinics = Arc::new(InMemoryClinicDirectory::default());
        let contacts = Arc::new(InMemoryContactStore::default());
        let sessions = Arc::new(InMemorySessionStore::default());
        let events = Arc::new(InMemoryConversionStore::default());
        let forecasts = Arc::new(InMemoryForecastStore::default());
        let clock = Arc::new(FixedClock::new(december_evening()));
        let engine = UpgradeForecastEngine::new(
            ForecastSources {
                clinics: clinics.clone(),
                contacts: contacts.clone(),
                sessions: sessions.clone(),
                events: events.clone(),
                forecasts: forecasts.clone(),
            },
            clock.clone(),
        );
        Harness { engine, clinics, contacts, sessions, events, forecasts, clock }
    }

    fn slug() -> ClinicSlug {
        ClinicSlug("granite-mens-clinic".to_string())
    }

    fn clinic(tier: Tier) -> ClinicProfile {
        let mut clinic = ClinicProfile::new("granite-mens-clinic", "Granite Men's Clinic", tier);
        clinic.description = Some("Testosterone and weight programs".to_string());
        clinic.services = vec!["trt".to_string(), "weight-loss".to_string()];
        clinic.photo_count = 6;
        clinic.has_hours = true;
        clinic.phone = Some("555-0199".to_string());
        clinic
    }

    fn event(id: &str, at: DateTime<Utc>, conversion_type: ConversionType, value: i64) -> ConversionEvent {
        ConversionEvent {
            id: ConversionEventId(id.to_string()),
            clinic_slug: slug(),
            conversion_type,
            occurred_at: at,
            referrer: None,
            page: "/".to_string(),
            test_id: None,
            variant_id: None,
            visitor_id: None,
            session_id: format!("S-{id}"),
            value: Decimal::from(value),
            metadata: EventMetadata::default(),
        }
    }

    fn session(id: &str, at: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            clinic_slug: slug(),
            visitor_id: None,
            started_at: at,
            page_views: 4,
            duration_secs: 150,
            device: DeviceClass::Mobile,
            browser: "safari".to_string(),
            source: TrafficSource::Organic,
            converted: false,
            conversion_value: Decimal::ZERO,
        }
    }

    #[tokio::test]
    async fn missing_clinic_is_not_found() {
        let harness = harness();
        let error = harness
            .engine
            .generate_forecast(&slug(), ForecastMode::Tier)
            .await
            .expect_err("no clinic");
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn enterprise_clinic_targets_enterprise() {
        let harness = harness();
        harness.clinics.insert(clinic(Tier::Enterprise));

        let forecast =
            harness.engine.generate_forecast(&slug(), ForecastMode::Tier).await.expect("forecast");

        assert_eq!(forecast.current_tier, Tier::Enterprise);
        assert_eq!(forecast.target_tier, Tier::Enterprise);
        assert_eq!(forecast.predicted_revenue, Decimal::from(499));
        assert!(forecast
            .recommended_actions
            .iter()
            .any(|action| action.starts_with("Focus on retention")));
    }

    #[tokio::test]
    async fn growing_clinic_gets_forecast_with_factors_and_log() {
        let harness = harness();
        harness.clinics.insert(clinic(Tier::Basic));
        harness.contacts.record_contact(&slug(), december_evening() - Duration::days(3));
        let now = december_evening();

        for day in 1..=4 {
            harness
                .sessions
                .save_session(session(&format!("S-now-{day}"), now - Duration::days(day)))
                .await
                .expect("session");
            harness
                .events
                .append(event(&format!("E-now-{day}"), now - Duration::days(day), ConversionType::Call, 150))
                .await
                .expect("event");
        }
        for day in [35, 40] {
            harness
                .sessions
                .save_session(session(&format!("S-prev-{day}"), now - Duration::days(day)))
                .await
                .expect("session");
            harness
                .events
                .append(event(&format!("E-prev-{day}"), now - Duration::days(day), ConversionType::Form, 100))
                .await
                .expect("event");
        }

        let forecast =
            harness.engine.generate_forecast(&slug(), ForecastMode::Tier).await.expect("forecast");

        assert_eq!(forecast.target_tier, Tier::Premium);
        assert_eq!(forecast.predicted_revenue, Decimal::from(249));
        assert_eq!(forecast.factors.traffic_trend, 1.0);
        assert_eq!(forecast.factors.conversion_trend, 1.0);
        assert_eq!(forecast.factors.revenue_growth, 200.0);
        assert_eq!(forecast.factors.contact_frequency_days, Some(3));
        assert_eq!(forecast.factors.competitor_activity, 50.0);
        assert_eq!(forecast.factors.seasonality, 1.0);
        assert_eq!(forecast.factors.tier_position, 50.0);
        assert_eq!(forecast.factors.content_quality, 70.0);
        assert!(forecast.prediction_score <= 100);
        assert_eq!(forecast.confidence, ConfidenceClass::from_score(forecast.prediction_score));
        assert!(forecast.recommended_actions.len() <= 4);
        assert_eq!(forecast.expires_at - forecast.created_at, Duration::days(7));
        assert!(forecast.timeframe_days >= 15 && forecast.timeframe_days <= 30);

        let logs = harness.forecasts.list_logs(&slug()).await.expect("logs");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].forecast_id, forecast.id);
        assert_eq!(logs[0].prediction_score, forecast.prediction_score);
    }

    #[tokio::test]
    async fn current_forecast_is_reused_until_expiry() {
        let harness = harness();
        harness.clinics.insert(clinic(Tier::Free));

        let first = harness
            .engine
            .current_or_generate(&slug(), ForecastMode::Tier)
            .await
            .expect("first");
        harness.clock.advance(Duration::days(6));
        let reused = harness
            .engine
            .current_or_generate(&slug(), ForecastMode::Tier)
            .await
            .expect("reused");
        assert_eq!(reused.id, first.id);

        harness.clock.advance(Duration::days(1));
        let regenerated = harness
            .engine
            .current_or_generate(&slug(), ForecastMode::Tier)
            .await
            .expect("regenerated");
        assert_ne!(regenerated.id, first.id);
        assert_eq!(regenerated.created_at, harness.clock.now());
        assert_eq!(first.expires_at, reused.expires_at);
    }

    #[tokio::test]
    async fn ttl_follows_settings() {
        let harness = harness();
        harness.clinics.insert(clinic(Tier::Premium));
        let engine = harness.engine.with_settings(ForecastSettings { ttl_days: 2, ..ForecastSettings::default() });

        let forecast = engine.generate_forecast(&slug(), ForecastMode::Package).await.expect("forecast");
        assert_eq!(forecast.expires_at - forecast.created_at, Duration::days(2));
        assert_eq!(forecast.mode, ForecastMode::Package);
    }

    #[tokio::test]
    async fn outcome_is_scored_against_prediction() {
        let harness = harness();
        harness.clinics.insert(clinic(Tier::Basic));
        let forecast =
            harness.engine.generate_forecast(&slug(), ForecastMode::Tier).await.expect("forecast");

        let outcome = harness
            .engine
            .record_outcome(&slug(), &forecast.id, true, Some(Tier::Premium))
            .await
            .expect("outcome");
        assert_eq!(outcome.accuracy, outcome_accuracy(forecast.prediction_score, true));

        let logs = harness.forecasts.list_logs(&slug()).await.expect("logs");
        assert_eq!(logs[0].outcome.as_ref().map(|outcome| outcome.converted), Some(true));

        let missing = harness
            .engine
            .record_outcome(&slug(), &crate::domain::forecast::ForecastId("F-none".to_string()), false, None)
            .await
            .expect_err("unknown forecast");
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn activity_just_before_the_window_split_counts_as_previous() {
        let harness = harness();
        harness.clinics.insert(clinic(Tier::Basic));
        let now = december_evening();
        let boundary = now - Duration::days(30) - Duration::nanoseconds(500);

        for record in
            [session("S-current", now - Duration::days(2)), session("S-boundary", boundary)]
        {
            harness.sessions.save_session(record).await.expect("session");
        }
        harness
            .events
            .append(event("E-current", now - Duration::days(2), ConversionType::Call, 150))
            .await
            .expect("event");
        harness
            .events
            .append(event("E-boundary", boundary, ConversionType::Call, 150))
            .await
            .expect("event");

        let forecast =
            harness.engine.generate_forecast(&slug(), ForecastMode::Tier).await.expect("forecast");

        assert_eq!(forecast.factors.traffic_trend, 0.0);
        assert_eq!(forecast.factors.conversion_trend, 0.0);
        assert_eq!(forecast.factors.revenue_growth, 0.0);
    }

    #[test]
    fn accuracy_rewards_confident_correct_predictions() {
        assert_eq!(outcome_accuracy(100, true), 1.0);
        assert_eq!(outcome_accuracy(100, false), 0.0);
        assert!((outcome_accuracy(30, false) - 0.7).abs() < 1e-9);
    }
}
