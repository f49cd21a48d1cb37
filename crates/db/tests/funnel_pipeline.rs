use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::json;

use funnel_core::clock::{Clock, FixedClock};
use funnel_core::domain::clinic::{ClinicProfile, ClinicSlug, SessionRecord, Tier};
use funnel_core::domain::conversion::{DeviceClass, TrafficSource};
use funnel_core::domain::experiment::{NewVariantTest, PrimaryMetric, Variant, VariantId};
use funnel_core::domain::forecast::ForecastMode;
use funnel_core::experiments::{ExperimentManager, SeededRandom, TestAction, VariantAssigner};
use funnel_core::forecast::{ForecastSources, UpgradeForecastEngine};
use funnel_core::store::{ConversionCounterStore, SessionStore, VariantTestStore};
use funnel_core::{
    ConversionRateCalculator, ConversionTracker, ConversionValueTable, TrackConversion,
};
use funnel_db::{
    connect_with_settings, migrations, DbPool, SqlAssignmentStore, SqlClinicDirectory,
    SqlContactStore, SqlConversionStore, SqlForecastStore, SqlSessionStore, SqlVariantTestStore,
};

fn parse_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
}

async fn setup_pool() -> DbPool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
    migrations::run_pending(&pool).await.expect("run migrations");
    pool
}

fn clinic() -> ClinicProfile {
    let mut clinic = ClinicProfile::new("harbor-dental", "Harbor Dental", Tier::Basic);
    clinic.description = Some("Family and cosmetic dentistry".to_string());
    clinic.services = vec!["cleaning".to_string(), "whitening".to_string()];
    clinic.photo_count = 6;
    clinic.review_count = 12;
    clinic.has_hours = true;
    clinic.phone = Some("555-0142".to_string());
    clinic
}

fn button_test() -> NewVariantTest {
    NewVariantTest {
        clinic_slug: ClinicSlug("harbor-dental".to_string()),
        name: "Call button copy".to_string(),
        description: None,
        variants: vec![
            Variant {
                id: VariantId("call-now".to_string()),
                name: "Call now".to_string(),
                content: json!({ "label": "Call now" }),
                weight: 50,
                is_control: true,
            },
            Variant {
                id: VariantId("talk-to-us".to_string()),
                name: "Talk to us".to_string(),
                content: json!({ "label": "Talk to us" }),
                weight: 50,
                is_control: false,
            },
        ],
        traffic_allocation: 100,
        target_sample_size: 200,
        confidence_level: 0.95,
        primary_metric: PrimaryMetric::Calls,
    }
}

#[tokio::test]
async fn tracked_conversion_flows_into_experiments_rates_and_forecasts() {
    let pool = setup_pool().await;
    let clock = Arc::new(FixedClock::new(parse_ts("2026-05-10T12:00:00Z")));

    let clinics = Arc::new(SqlClinicDirectory::new(pool.clone()));
    let contacts = Arc::new(SqlContactStore::new(pool.clone()));
    let sessions = Arc::new(SqlSessionStore::new(pool.clone()));
    let tests = Arc::new(SqlVariantTestStore::new(pool.clone()));
    let assignments = Arc::new(SqlAssignmentStore::new(pool.clone()));
    let conversions = Arc::new(SqlConversionStore::new(pool.clone()));
    let forecasts = Arc::new(SqlForecastStore::new(pool.clone()));

    clinics.upsert_clinic(&clinic()).await.expect("seed clinic");
    contacts
        .record_contact(
            &ClinicSlug("harbor-dental".to_string()),
            clock.now() - Duration::days(3),
            "call",
            None,
        )
        .await
        .expect("seed contact");

    let manager = ExperimentManager::new(tests.clone(), clock.clone());
    let created = manager.create_test(button_test()).await.expect("create test");
    manager.transition(&created.id, TestAction::Start).await.expect("start test");

    let assigner =
        VariantAssigner::new(tests.clone(), assignments.clone(), Arc::new(SeededRandom::new(7)));
    let slug = ClinicSlug("harbor-dental".to_string());
    let assignment = assigner
        .assign("visitor-1", &slug)
        .await
        .expect("assign")
        .expect("running test assigns visitor");
    assert!(assignment.included);
    assigner
        .record_exposure(&assignment.test_id, &assignment.variant_id)
        .await
        .expect("record exposure");

    let repeat = assigner.assign("visitor-1", &slug).await.expect("assign").expect("assignment");
    assert_eq!(repeat.variant_id, assignment.variant_id);
    assert!(!repeat.newly_assigned);

    sessions
        .save_session(SessionRecord {
            id: "S-1".to_string(),
            clinic_slug: slug.clone(),
            visitor_id: Some("visitor-1".to_string()),
            started_at: clock.now() - Duration::minutes(20),
            page_views: 3,
            duration_secs: 140,
            device: DeviceClass::Mobile,
            browser: "safari".to_string(),
            source: TrafficSource::Organic,
            converted: false,
            conversion_value: Decimal::ZERO,
        })
        .await
        .expect("save session");

    let tracker = ConversionTracker::new(
        conversions.clone(),
        conversions.clone(),
        tests.clone(),
        assignments.clone(),
        sessions.clone(),
        ConversionValueTable::default(),
        clock.clone(),
    );
    let tracked = tracker
        .track(TrackConversion {
            clinic_slug: Some("harbor-dental".to_string()),
            conversion_type: Some("call".to_string()),
            session_id: Some("S-1".to_string()),
            visitor_id: Some("visitor-1".to_string()),
            referrer: Some("https://www.google.com/search?q=dentist".to_string()),
            viewport_width: Some(390),
            ..TrackConversion::default()
        })
        .await
        .expect("track conversion");

    assert_eq!(tracked.value, Decimal::from(150));
    assert_eq!(tracked.variant_id.as_ref(), Some(&assignment.variant_id));

    let counters = conversions.counters(&slug).await.expect("counters");
    assert_eq!(counters.total, 1);
    assert_eq!(counters.total_value, Decimal::from(150));

    let variant_counters = tests.variant_counters(&created.id).await.expect("variant counters");
    let assigned = variant_counters
        .iter()
        .find(|counter| counter.variant_id == assignment.variant_id)
        .expect("assigned variant has counters");
    assert_eq!((assigned.views, assigned.conversions), (1, 1));

    let session = sessions.find_session("S-1").await.expect("find").expect("session");
    assert!(session.converted);
    assert_eq!(session.conversion_value, Decimal::from(150));

    let calculator =
        ConversionRateCalculator::new(clinics.clone(), conversions.clone(), clock.clone());
    let rate = calculator.trailing(&slug, 30).await.expect("trailing rate");
    assert_eq!(rate.total_conversions, 1);
    assert_eq!(rate.total_value, Decimal::from(150));
    assert!(rate.by_source.contains_key("organic"));

    let engine = UpgradeForecastEngine::new(
        ForecastSources {
            clinics: clinics.clone(),
            contacts: contacts.clone(),
            sessions: sessions.clone(),
            events: conversions.clone(),
            forecasts: forecasts.clone(),
        },
        clock.clone(),
    );
    let forecast = engine.generate_forecast(&slug, ForecastMode::Tier).await.expect("forecast");
    assert_eq!(forecast.current_tier, Tier::Basic);
    assert_eq!(forecast.target_tier, Tier::Premium);
    assert_eq!(forecast.predicted_revenue, Decimal::from(249));
    assert_eq!(forecast.factors.contact_frequency_days, Some(3));

    let reused = engine.current_or_generate(&slug, ForecastMode::Tier).await.expect("reuse");
    assert_eq!(reused.id, forecast.id);

    let outcome = engine
        .record_outcome(&slug, &forecast.id, true, Some(Tier::Premium))
        .await
        .expect("record outcome");
    assert!(outcome.converted);
}
