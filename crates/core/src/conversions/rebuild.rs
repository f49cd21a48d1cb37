//! Recovery for the per-clinic counter projection.
//!
//! Counter increments are best effort, so the projection can fall behind the
//! event log. Replaying the log restores it.

use std::sync::Arc;

use tracing::info;

use crate::domain::clinic::ClinicSlug;
use crate::domain::conversion::ConversionCounters;
use crate::errors::{AppResult, DomainError};
use crate::store::{ClinicDirectory, ConversionCounterStore, ConversionEventStore};

pub struct CounterRebuilder {
    clinics: Arc<dyn ClinicDirectory>,
    events: Arc<dyn ConversionEventStore>,
    counters: Arc<dyn ConversionCounterStore>,
}

impl CounterRebuilder {
    pub fn new(
        clinics: Arc<dyn ClinicDirectory>,
        events: Arc<dyn ConversionEventStore>,
        counters: Arc<dyn ConversionCounterStore>,
    ) -> Self {
        Self { clinics, events, counters }
    }

    /// Replaces the clinic's counters with a replay of its event log and
    /// returns the rebuilt totals.
    pub async fn rebuild(&self, slug: &ClinicSlug) -> AppResult<ConversionCounters> {
        if self.clinics.find_clinic(slug).await?.is_none() {
            return Err(DomainError::not_found("clinic", slug.as_str()).into());
        }

        let previous = self.counters.counters(slug).await?;
        let events = self.events.list_for_clinic(slug).await?;
        self.counters.rebuild_from(slug, &events).await?;
        let rebuilt = ConversionCounters::replay(&events);

        info!(
            event_name = "conversion.counters_rebuilt",
            clinic_slug = %slug,
            events = events.len(),
            previous_total = previous.total,
            total = rebuilt.total,
            "clinic conversion counters rebuilt from event log"
        );
        Ok(rebuilt)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::CounterRebuilder;
    use crate::domain::clinic::{ClinicProfile, ClinicSlug, Tier};
    use crate::domain::conversion::{
        ConversionEvent, ConversionEventId, ConversionType, EventMetadata,
    };
    use crate::store::{
        ConversionCounterStore, ConversionEventStore, InMemoryClinicDirectory,
        InMemoryConversionStore,
    };

    fn slug() -> ClinicSlug {
        ClinicSlug("lakeside-ortho".to_string())
    }

    fn event(id: &str, conversion_type: ConversionType, value: i64) -> ConversionEvent {
        ConversionEvent {
            id: ConversionEventId(id.to_string()),
            clinic_slug: slug(),
            conversion_type,
            occurred_at: Utc.with_ymd_and_hms(2026, 4, 2, 10, 0, 0).single().expect("instant"),
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

    fn rebuilder() -> (CounterRebuilder, Arc<InMemoryConversionStore>) {
        let clinics = Arc::new(InMemoryClinicDirectory::default());
        clinics.insert(ClinicProfile::new("lakeside-ortho", "Lakeside Ortho", Tier::Premium));
        let store = Arc::new(InMemoryConversionStore::default());
        (CounterRebuilder::new(clinics, store.clone(), store.clone()), store)
    }

    #[tokio::test]
    async fn drifted_counters_are_restored_from_events() {
        let (rebuilder, store) = rebuilder();
        store.append(event("E-1", ConversionType::Booking, 300)).await.expect("append");
        store.append(event("E-2", ConversionType::Call, 150)).await.expect("append");
        store.increment(&slug(), ConversionType::Booking, Decimal::from(300)).await.expect("inc");
        store.increment(&slug(), ConversionType::Review, Decimal::from(75)).await.expect("inc");

        let rebuilt = rebuilder.rebuild(&slug()).await.expect("rebuild");

        assert_eq!(rebuilt.total, 2);
        assert_eq!(rebuilt.total_value, Decimal::from(450));
        assert_eq!(rebuilt.by_type.get(&ConversionType::Call), Some(&1));
        assert_eq!(rebuilt.by_type.get(&ConversionType::Review), None);
        assert_eq!(store.counters(&slug()).await.expect("counters"), rebuilt);
    }

    #[tokio::test]
    async fn unknown_clinic_is_not_found() {
        let (rebuilder, _) = rebuilder();
        let error = rebuilder
            .rebuild(&ClinicSlug("nowhere".to_string()))
            .await
            .expect_err("unknown clinic");
        assert!(error.is_not_found());
    }
}
