use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::{
    AssignmentStore, ClinicDirectory, ContactStore, ConversionCounterStore, ConversionEventStore,
    ForecastStore, SessionStore, StoreResult, VariantTestStore,
};
use crate::domain::clinic::{ClinicProfile, ClinicSlug, SessionRecord};
use crate::domain::conversion::{
    ConversionCounters, ConversionEvent, ConversionEventId, ConversionType,
};
use crate::domain::experiment::{
    TestStatus, VariantCounter, VariantCounters, VariantId, VariantTest, VariantTestId,
};
use crate::domain::forecast::{ForecastId, ForecastLog, ForecastOutcome, UpgradeForecast};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
pub struct InMemoryClinicDirectory {
    clinics: Mutex<HashMap<String, ClinicProfile>>,
}

impl InMemoryClinicDirectory {
    pub fn insert(&self, clinic: ClinicProfile) {
        lock(&self.clinics).insert(clinic.slug.0.clone(), clinic);
    }
}

#[async_trait]
impl ClinicDirectory for InMemoryClinicDirectory {
    async fn find_clinic(&self, slug: &ClinicSlug) -> StoreResult<Option<ClinicProfile>> {
        Ok(lock(&self.clinics).get(&slug.0).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryContactStore {
    contacts: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InMemoryContactStore {
    pub fn record_contact(&self, slug: &ClinicSlug, at: DateTime<Utc>) {
        let mut contacts = lock(&self.contacts);
        let latest = contacts.entry(slug.0.clone()).or_insert(at);
        if at > *latest {
            *latest = at;
        }
    }
}

#[async_trait]
impl ContactStore for InMemoryContactStore {
    async fn last_contact_at(&self, slug: &ClinicSlug) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(lock(&self.contacts).get(&slug.0).copied())
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save_session(&self, session: SessionRecord) -> StoreResult<()> {
        lock(&self.sessions).insert(session.id.clone(), session);
        Ok(())
    }

    async fn find_session(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        Ok(lock(&self.sessions).get(session_id).cloned())
    }

    async fn list_sessions(
        &self,
        slug: &ClinicSlug,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<SessionRecord>> {
        let mut sessions: Vec<SessionRecord> = lock(&self.sessions)
            .values()
            .filter(|session| {
                session.clinic_slug == *slug
                    && session.started_at >= start
                    && session.started_at <= end
            })
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    async fn mark_converted(&self, session_id: &str, value: Decimal) -> StoreResult<bool> {
        let mut sessions = lock(&self.sessions);
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.converted = true;
                session.conversion_value += value;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct InMemoryVariantTestStore {
    tests: Mutex<HashMap<String, VariantTest>>,
    counters: Mutex<HashMap<(String, String), VariantCounters>>,
}

#[async_trait]
impl VariantTestStore for InMemoryVariantTestStore {
    async fn save_test(&self, test: VariantTest) -> StoreResult<()> {
        lock(&self.tests).insert(test.id.0.clone(), test);
        Ok(())
    }

    async fn find_test(&self, id: &VariantTestId) -> StoreResult<Option<VariantTest>> {
        Ok(lock(&self.tests).get(&id.0).cloned())
    }

    async fn find_running_test(&self, slug: &ClinicSlug) -> StoreResult<Option<VariantTest>> {
        Ok(lock(&self.tests)
            .values()
            .filter(|test| test.clinic_slug == *slug && test.status == TestStatus::Running)
            .max_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)))
            .cloned())
    }

    async fn increment_variant_counter(
        &self,
        test_id: &VariantTestId,
        variant_id: &VariantId,
        counter: VariantCounter,
    ) -> StoreResult<()> {
        let mut counters = lock(&self.counters);
        let entry = counters.entry((test_id.0.clone(), variant_id.0.clone())).or_insert_with(|| {
            VariantCounters { variant_id: variant_id.clone(), views: 0, conversions: 0 }
        });
        match counter {
            VariantCounter::Views => entry.views += 1,
            VariantCounter::Conversions => entry.conversions += 1,
        }
        Ok(())
    }

    async fn variant_counters(&self, test_id: &VariantTestId) -> StoreResult<Vec<VariantCounters>> {
        let mut counters: Vec<VariantCounters> = lock(&self.counters)
            .iter()
            .filter(|((test, _), _)| *test == test_id.0)
            .map(|(_, counters)| counters.clone())
            .collect();
        counters.sort_by(|a, b| a.variant_id.cmp(&b.variant_id));
        Ok(counters)
    }
}

#[derive(Default)]
pub struct InMemoryAssignmentStore {
    assignments: Mutex<HashMap<(String, String), VariantId>>,
}

impl InMemoryAssignmentStore {
    pub fn len(&self) -> usize {
        lock(&self.assignments).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AssignmentStore for InMemoryAssignmentStore {
    async fn get_assignment(
        &self,
        test_id: &VariantTestId,
        visitor_id: &str,
    ) -> StoreResult<Option<VariantId>> {
        Ok(lock(&self.assignments).get(&(test_id.0.clone(), visitor_id.to_string())).cloned())
    }

    async fn save_assignment(
        &self,
        test_id: &VariantTestId,
        visitor_id: &str,
        variant_id: &VariantId,
    ) -> StoreResult<()> {
        lock(&self.assignments)
            .insert((test_id.0.clone(), visitor_id.to_string()), variant_id.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryConversionStore {
    events: Mutex<Vec<ConversionEvent>>,
    counters: Mutex<HashMap<String, ConversionCounters>>,
}

impl InMemoryConversionStore {
    pub fn event_count(&self) -> usize {
        lock(&self.events).len()
    }
}

#[async_trait]
impl ConversionEventStore for InMemoryConversionStore {
    async fn append(&self, event: ConversionEvent) -> StoreResult<()> {
        lock(&self.events).push(event);
        Ok(())
    }

    async fn find_event(&self, id: &ConversionEventId) -> StoreResult<Option<ConversionEvent>> {
        Ok(lock(&self.events).iter().find(|event| event.id == *id).cloned())
    }

    async fn list_between(
        &self,
        slug: &ClinicSlug,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<ConversionEvent>> {
        let mut events: Vec<ConversionEvent> = lock(&self.events)
            .iter()
            .filter(|event| {
                event.clinic_slug == *slug && event.occurred_at >= start && event.occurred_at <= end
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }

    async fn list_for_clinic(&self, slug: &ClinicSlug) -> StoreResult<Vec<ConversionEvent>> {
        let mut events: Vec<ConversionEvent> =
            lock(&self.events).iter().filter(|event| event.clinic_slug == *slug).cloned().collect();
        events.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }
}

#[async_trait]
impl ConversionCounterStore for InMemoryConversionStore {
    async fn increment(
        &self,
        slug: &ClinicSlug,
        conversion_type: ConversionType,
        value: Decimal,
    ) -> StoreResult<()> {
        lock(&self.counters).entry(slug.0.clone()).or_default().apply(conversion_type, value);
        Ok(())
    }

    async fn counters(&self, slug: &ClinicSlug) -> StoreResult<ConversionCounters> {
        Ok(lock(&self.counters).get(&slug.0).cloned().unwrap_or_default())
    }

    async fn rebuild_from(
        &self,
        slug: &ClinicSlug,
        events: &[ConversionEvent],
    ) -> StoreResult<()> {
        lock(&self.counters).insert(slug.0.clone(), ConversionCounters::replay(events));
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryForecastStore {
    forecasts: Mutex<Vec<UpgradeForecast>>,
    logs: Mutex<BTreeMap<String, ForecastLog>>,
}

#[async_trait]
impl ForecastStore for InMemoryForecastStore {
    async fn save_forecast(&self, forecast: UpgradeForecast) -> StoreResult<()> {
        lock(&self.forecasts).push(forecast);
        Ok(())
    }

    async fn latest_forecast(&self, slug: &ClinicSlug) -> StoreResult<Option<UpgradeForecast>> {
        Ok(lock(&self.forecasts)
            .iter()
            .filter(|forecast| forecast.clinic_slug == *slug)
            .max_by(|a, b| a.created_at.cmp(&b.created_at))
            .cloned())
    }

    async fn append_log(&self, log: ForecastLog) -> StoreResult<()> {
        lock(&self.logs).insert(log.forecast_id.0.clone(), log);
        Ok(())
    }

    async fn record_outcome(
        &self,
        forecast_id: &ForecastId,
        outcome: ForecastOutcome,
    ) -> StoreResult<bool> {
        match lock(&self.logs).get_mut(&forecast_id.0) {
            Some(log) => {
                log.outcome = Some(outcome);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_logs(&self, slug: &ClinicSlug) -> StoreResult<Vec<ForecastLog>> {
        let mut logs: Vec<ForecastLog> =
            lock(&self.logs).values().filter(|log| log.clinic_slug == *slug).cloned().collect();
        logs.sort_by(|a, b| a.logged_at.cmp(&b.logged_at));
        Ok(logs)
    }
}
