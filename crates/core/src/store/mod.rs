//! Persistence ports consumed by the engines.
//!
//! Each port needs only get-by-id, equality/range queries with ordering,
//! and atomic numeric increments, so any document or relational store can
//! back them. `memory` holds process-local adapters; SQL adapters live in
//! the `funnel-db` crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::clinic::{ClinicProfile, ClinicSlug, SessionRecord};
use crate::domain::conversion::{ConversionCounters, ConversionEvent, ConversionEventId, ConversionType};
use crate::domain::experiment::{
    VariantCounter, VariantCounters, VariantId, VariantTest, VariantTestId,
};
use crate::domain::forecast::{ForecastId, ForecastLog, ForecastOutcome, UpgradeForecast};
use crate::errors::StoreError;

pub mod memory;

pub use memory::{
    InMemoryAssignmentStore, InMemoryClinicDirectory, InMemoryContactStore,
    InMemoryConversionStore, InMemoryForecastStore, InMemorySessionStore,
    InMemoryVariantTestStore,
};

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ClinicDirectory: Send + Sync {
    async fn find_clinic(&self, slug: &ClinicSlug) -> StoreResult<Option<ClinicProfile>>;
}

#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn last_contact_at(&self, slug: &ClinicSlug) -> StoreResult<Option<DateTime<Utc>>>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save_session(&self, session: SessionRecord) -> StoreResult<()>;

    async fn find_session(&self, session_id: &str) -> StoreResult<Option<SessionRecord>>;

    /// Sessions whose `started_at` falls in `[start, end]`, oldest first.
    async fn list_sessions(
        &self,
        slug: &ClinicSlug,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<SessionRecord>>;

    /// Sets the converted flag and adds `value` to the session's cumulative value.
    /// Returns `false` when the session does not exist.
    async fn mark_converted(&self, session_id: &str, value: Decimal) -> StoreResult<bool>;
}

#[async_trait]
pub trait VariantTestStore: Send + Sync {
    async fn save_test(&self, test: VariantTest) -> StoreResult<()>;

    async fn find_test(&self, id: &VariantTestId) -> StoreResult<Option<VariantTest>>;

    /// The most recently started running test for the clinic.
    async fn find_running_test(&self, slug: &ClinicSlug) -> StoreResult<Option<VariantTest>>;

    async fn increment_variant_counter(
        &self,
        test_id: &VariantTestId,
        variant_id: &VariantId,
        counter: VariantCounter,
    ) -> StoreResult<()>;

    async fn variant_counters(&self, test_id: &VariantTestId) -> StoreResult<Vec<VariantCounters>>;
}

/// Sticky visitor-to-variant memory. Writes are last-write-wins.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn get_assignment(
        &self,
        test_id: &VariantTestId,
        visitor_id: &str,
    ) -> StoreResult<Option<VariantId>>;

    async fn save_assignment(
        &self,
        test_id: &VariantTestId,
        visitor_id: &str,
        variant_id: &VariantId,
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait ConversionEventStore: Send + Sync {
    async fn append(&self, event: ConversionEvent) -> StoreResult<()>;

    async fn find_event(&self, id: &ConversionEventId) -> StoreResult<Option<ConversionEvent>>;

    /// Events with `occurred_at` in `[start, end]`, oldest first.
    async fn list_between(
        &self,
        slug: &ClinicSlug,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<ConversionEvent>>;

    /// Every event recorded for the clinic, oldest first.
    async fn list_for_clinic(&self, slug: &ClinicSlug) -> StoreResult<Vec<ConversionEvent>>;
}

#[async_trait]
pub trait ConversionCounterStore: Send + Sync {
    async fn increment(
        &self,
        slug: &ClinicSlug,
        conversion_type: ConversionType,
        value: Decimal,
    ) -> StoreResult<()>;

    async fn counters(&self, slug: &ClinicSlug) -> StoreResult<ConversionCounters>;

    /// Replaces the clinic's counters with totals derived from `events`.
    async fn rebuild_from(&self, slug: &ClinicSlug, events: &[ConversionEvent]) -> StoreResult<()>;
}

#[async_trait]
pub trait ForecastStore: Send + Sync {
    async fn save_forecast(&self, forecast: UpgradeForecast) -> StoreResult<()>;

    async fn latest_forecast(&self, slug: &ClinicSlug) -> StoreResult<Option<UpgradeForecast>>;

    async fn append_log(&self, log: ForecastLog) -> StoreResult<()>;

    /// Returns `false` when no log exists for the forecast.
    async fn record_outcome(
        &self,
        forecast_id: &ForecastId,
        outcome: ForecastOutcome,
    ) -> StoreResult<bool>;

    async fn list_logs(&self, slug: &ClinicSlug) -> StoreResult<Vec<ForecastLog>>;
}
