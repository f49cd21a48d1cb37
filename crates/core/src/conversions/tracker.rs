use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::classify::{classify_browser, classify_device, infer_source};
use crate::clock::Clock;
use crate::domain::clinic::ClinicSlug;
use crate::domain::conversion::{ConversionEvent, ConversionEventId, ConversionType, EventMetadata};
use crate::domain::experiment::{VariantCounter, VariantId, VariantTest, VariantTestId};
use crate::errors::{AppResult, DomainError};
use crate::store::{
    AssignmentStore, ConversionCounterStore, ConversionEventStore, SessionStore, VariantTestStore,
};
use crate::tables::ConversionValueTable;

const DEFAULT_PAGE: &str = "/";

/// Raw tracking payload as sent by the site. `value` is accepted on the wire
/// but never used: the value table is authoritative.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackConversion {
    pub clinic_slug: Option<String>,
    pub conversion_type: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub visitor_id: Option<String>,
    #[serde(default)]
    pub variant_id: Option<String>,
    #[serde(default)]
    pub page: Option<String>,
    #[serde(default)]
    pub page_url: Option<String>,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub viewport_width: Option<u32>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub campaign: Option<String>,
    #[serde(default)]
    pub form_type: Option<String>,
    #[serde(default)]
    pub value: Option<Decimal>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackedConversion {
    pub event_id: ConversionEventId,
    pub value: Decimal,
    pub test_id: Option<VariantTestId>,
    pub variant_id: Option<VariantId>,
}

struct ValidatedRequest {
    clinic_slug: ClinicSlug,
    conversion_type: ConversionType,
    session_id: String,
}

/// Records conversion events and maintains the counter projections derived
/// from them.
pub struct ConversionTracker {
    events: Arc<dyn ConversionEventStore>,
    counters: Arc<dyn ConversionCounterStore>,
    tests: Arc<dyn VariantTestStore>,
    assignments: Arc<dyn AssignmentStore>,
    sessions: Arc<dyn SessionStore>,
    values: ConversionValueTable,
    clock: Arc<dyn Clock>,
}

impl ConversionTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events: Arc<dyn ConversionEventStore>,
        counters: Arc<dyn ConversionCounterStore>,
        tests: Arc<dyn VariantTestStore>,
        assignments: Arc<dyn AssignmentStore>,
        sessions: Arc<dyn SessionStore>,
        values: ConversionValueTable,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { events, counters, tests, assignments, sessions, values, clock }
    }

    pub fn value_table(&self) -> &ConversionValueTable {
        &self.values
    }

    /// The event append is the only write whose failure reaches the caller.
    /// Counter, variant and session projections are best effort afterwards.
    pub async fn track(&self, request: TrackConversion) -> AppResult<TrackedConversion> {
        let validated = validate(&request)?;
        let value = self.values.value_of(validated.conversion_type);

        let (test_id, variant_id) = self
            .attribute(
                &validated.clinic_slug,
                request.variant_id.as_deref(),
                request.visitor_id.as_deref(),
            )
            .await?;

        let metadata = EventMetadata {
            device: classify_device(request.viewport_width),
            browser: classify_browser(request.user_agent.as_deref()),
            source: infer_source(request.referrer.as_deref(), request.page_url.as_deref()),
            campaign: non_empty(request.campaign),
            form_type: non_empty(request.form_type),
        };

        let event = ConversionEvent {
            id: ConversionEventId(format!("E-{}", Uuid::new_v4().simple())),
            clinic_slug: validated.clinic_slug.clone(),
            conversion_type: validated.conversion_type,
            occurred_at: self.clock.now(),
            referrer: non_empty(request.referrer),
            page: non_empty(request.page).unwrap_or_else(|| DEFAULT_PAGE.to_string()),
            test_id: test_id.clone(),
            variant_id: variant_id.clone(),
            visitor_id: non_empty(request.visitor_id),
            session_id: validated.session_id.clone(),
            value,
            metadata,
        };
        let event_id = event.id.clone();

        self.events.append(event).await?;
        info!(
            event_name = "conversion.tracked",
            clinic_slug = %validated.clinic_slug,
            event_id = %event_id,
            conversion_type = validated.conversion_type.as_str(),
            value = %value,
            "conversion event recorded"
        );

        self.project(&validated, &event_id, value, test_id.as_ref(), variant_id.as_ref()).await;

        Ok(TrackedConversion { event_id, value, test_id, variant_id })
    }

    async fn attribute(
        &self,
        slug: &ClinicSlug,
        explicit_variant: Option<&str>,
        visitor_id: Option<&str>,
    ) -> AppResult<(Option<VariantTestId>, Option<VariantId>)> {
        let Some(test) = self.tests.find_running_test(slug).await? else {
            return Ok((None, None));
        };

        if let Some(variant) = explicit_variant.and_then(|id| known_variant(&test, id)) {
            return Ok((Some(test.id.clone()), Some(variant)));
        }

        let Some(visitor_id) = visitor_id.map(str::trim).filter(|id| !id.is_empty()) else {
            return Ok((None, None));
        };
        let stored = self.assignments.get_assignment(&test.id, visitor_id).await?;
        Ok(match stored.and_then(|id| known_variant(&test, id.as_str())) {
            Some(variant) => (Some(test.id.clone()), Some(variant)),
            None => (None, None),
        })
    }

    async fn project(
        &self,
        request: &ValidatedRequest,
        event_id: &ConversionEventId,
        value: Decimal,
        test_id: Option<&VariantTestId>,
        variant_id: Option<&VariantId>,
    ) {
        if let Err(error) =
            self.counters.increment(&request.clinic_slug, request.conversion_type, value).await
        {
            warn!(
                event_name = "conversion.counter_update_failed",
                projection = "clinic_counters",
                clinic_slug = %request.clinic_slug,
                event_id = %event_id,
                error = %error,
                "clinic conversion counters not updated"
            );
        }

        if let (Some(test_id), Some(variant_id)) = (test_id, variant_id) {
            if let Err(error) = self
                .tests
                .increment_variant_counter(test_id, variant_id, VariantCounter::Conversions)
                .await
            {
                warn!(
                    event_name = "conversion.counter_update_failed",
                    projection = "variant_results",
                    test_id = %test_id,
                    variant_id = %variant_id,
                    event_id = %event_id,
                    error = %error,
                    "variant conversion counter not updated"
                );
            }
        }

        match self.sessions.mark_converted(&request.session_id, value).await {
            Ok(true) => {}
            Ok(false) => debug!(
                event_name = "conversion.session_missing",
                session_id = %request.session_id,
                event_id = %event_id,
                "no session record to mark converted"
            ),
            Err(error) => warn!(
                event_name = "conversion.counter_update_failed",
                projection = "session",
                session_id = %request.session_id,
                event_id = %event_id,
                error = %error,
                "session not marked converted"
            ),
        }
    }
}

fn validate(request: &TrackConversion) -> Result<ValidatedRequest, DomainError> {
    let clinic_slug = required(request.clinic_slug.as_deref(), "clinic_slug")?;
    let session_id = required(request.session_id.as_deref(), "session_id")?;
    let conversion_type = required(request.conversion_type.as_deref(), "conversion_type")?
        .parse::<ConversionType>()?;

    Ok(ValidatedRequest {
        clinic_slug: ClinicSlug(clinic_slug.to_string()),
        conversion_type,
        session_id: session_id.to_string(),
    })
}

fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, DomainError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| DomainError::validation(format!("`{field}` is required")))
}

fn known_variant(test: &VariantTest, id: &str) -> Option<VariantId> {
    test.variants.iter().find(|variant| variant.id.as_str() == id).map(|variant| variant.id.clone())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}
