use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use funnel_core::domain::clinic::ClinicSlug;
use funnel_core::domain::conversion::{
    ConversionCounters, ConversionEvent, ConversionEventId, ConversionType, EventMetadata,
};
use funnel_core::domain::experiment::{VariantId, VariantTestId};
use funnel_core::store::{ConversionCounterStore, ConversionEventStore, StoreResult};

use super::{
    format_timestamp, from_cents, parse_label, parse_timestamp, parse_u64, to_cents,
    RepositoryError,
};
use crate::DbPool;

const EVENT_COLUMNS: &str = "id,
                clinic_slug,
                conversion_type,
                occurred_at,
                referrer,
                page,
                test_id,
                variant_id,
                visitor_id,
                session_id,
                value_cents,
                device,
                browser,
                source,
                campaign,
                form_type";

/// Backs both the append-only event log and the per-clinic counter projection.
pub struct SqlConversionStore {
    pool: DbPool,
}

impl SqlConversionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversionEventStore for SqlConversionStore {
    async fn append(&self, event: ConversionEvent) -> StoreResult<()> {
        let value_cents = to_cents("value_cents", event.value)?;
        sqlx::query(
            "INSERT INTO conversion_events (
                id,
                clinic_slug,
                conversion_type,
                occurred_at,
                referrer,
                page,
                test_id,
                variant_id,
                visitor_id,
                session_id,
                value_cents,
                device,
                browser,
                source,
                campaign,
                form_type
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id.0)
        .bind(&event.clinic_slug.0)
        .bind(event.conversion_type.as_str())
        .bind(format_timestamp(event.occurred_at))
        .bind(event.referrer.as_deref())
        .bind(&event.page)
        .bind(event.test_id.as_ref().map(|id| id.0.as_str()))
        .bind(event.variant_id.as_ref().map(|id| id.0.as_str()))
        .bind(event.visitor_id.as_deref())
        .bind(&event.session_id)
        .bind(value_cents)
        .bind(event.metadata.device.as_str())
        .bind(&event.metadata.browser)
        .bind(event.metadata.source.as_str())
        .bind(event.metadata.campaign.as_deref())
        .bind(event.metadata.form_type.as_deref())
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(())
    }

    async fn find_event(&self, id: &ConversionEventId) -> StoreResult<Option<ConversionEvent>> {
        let row =
            sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM conversion_events WHERE id = ?"))
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(RepositoryError::from)?;

        Ok(row.map(event_from_row).transpose()?)
    }

    async fn list_between(
        &self,
        slug: &ClinicSlug,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<ConversionEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS}
             FROM conversion_events
             WHERE clinic_slug = ? AND occurred_at >= ? AND occurred_at <= ?
             ORDER BY occurred_at ASC, id ASC"
        ))
        .bind(&slug.0)
        .bind(format_timestamp(start))
        .bind(format_timestamp(end))
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.into_iter().map(event_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn list_for_clinic(&self, slug: &ClinicSlug) -> StoreResult<Vec<ConversionEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS}
             FROM conversion_events
             WHERE clinic_slug = ?
             ORDER BY occurred_at ASC, id ASC"
        ))
        .bind(&slug.0)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.into_iter().map(event_from_row).collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl ConversionCounterStore for SqlConversionStore {
    async fn increment(
        &self,
        slug: &ClinicSlug,
        conversion_type: ConversionType,
        value: Decimal,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO clinic_conversion_counters (
                clinic_slug,
                conversion_type,
                total,
                total_value_cents
             ) VALUES (?, ?, 1, ?)
             ON CONFLICT(clinic_slug, conversion_type) DO UPDATE SET
                total = total + 1,
                total_value_cents = total_value_cents + excluded.total_value_cents",
        )
        .bind(&slug.0)
        .bind(conversion_type.as_str())
        .bind(to_cents("total_value_cents", value)?)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(())
    }

    async fn counters(&self, slug: &ClinicSlug) -> StoreResult<ConversionCounters> {
        let rows = sqlx::query(
            "SELECT conversion_type, total, total_value_cents
             FROM clinic_conversion_counters
             WHERE clinic_slug = ?",
        )
        .bind(&slug.0)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        let mut counters = ConversionCounters::default();
        for row in rows {
            let conversion_type: ConversionType = parse_label(
                "conversion_type",
                &row.try_get::<String, _>("conversion_type").map_err(RepositoryError::from)?,
            )?;
            let total =
                parse_u64("total", row.try_get("total").map_err(RepositoryError::from)?)?;
            let value_cents: i64 =
                row.try_get("total_value_cents").map_err(RepositoryError::from)?;

            counters.total += total;
            counters.total_value += from_cents(value_cents);
            *counters.by_type.entry(conversion_type).or_insert(0) += total;
        }
        Ok(counters)
    }

    async fn rebuild_from(
        &self,
        slug: &ClinicSlug,
        events: &[ConversionEvent],
    ) -> StoreResult<()> {
        let mut per_type: BTreeMap<ConversionType, (i64, Decimal)> = BTreeMap::new();
        for event in events {
            let entry = per_type.entry(event.conversion_type).or_insert((0, Decimal::ZERO));
            entry.0 += 1;
            entry.1 += event.value;
        }

        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;

        sqlx::query("DELETE FROM clinic_conversion_counters WHERE clinic_slug = ?")
            .bind(&slug.0)
            .execute(&mut *tx)
            .await
            .map_err(RepositoryError::from)?;

        for (conversion_type, (total, value)) in per_type {
            sqlx::query(
                "INSERT INTO clinic_conversion_counters (
                    clinic_slug,
                    conversion_type,
                    total,
                    total_value_cents
                 ) VALUES (?, ?, ?, ?)",
            )
            .bind(&slug.0)
            .bind(conversion_type.as_str())
            .bind(total)
            .bind(to_cents("total_value_cents", value)?)
            .execute(&mut *tx)
            .await
            .map_err(RepositoryError::from)?;
        }

        tx.commit().await.map_err(RepositoryError::from)?;
        Ok(())
    }
}

fn event_from_row(row: SqliteRow) -> Result<ConversionEvent, RepositoryError> {
    let metadata = EventMetadata {
        device: parse_label("device", &row.try_get::<String, _>("device")?)?,
        browser: row.try_get("browser")?,
        source: parse_label("source", &row.try_get::<String, _>("source")?)?,
        campaign: row.try_get("campaign")?,
        form_type: row.try_get("form_type")?,
    };

    Ok(ConversionEvent {
        id: ConversionEventId(row.try_get("id")?),
        clinic_slug: ClinicSlug(row.try_get("clinic_slug")?),
        conversion_type: parse_label(
            "conversion_type",
            &row.try_get::<String, _>("conversion_type")?,
        )?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
        referrer: row.try_get("referrer")?,
        page: row.try_get("page")?,
        test_id: row.try_get::<Option<String>, _>("test_id")?.map(VariantTestId),
        variant_id: row.try_get::<Option<String>, _>("variant_id")?.map(VariantId),
        visitor_id: row.try_get("visitor_id")?,
        session_id: row.try_get("session_id")?,
        value: from_cents(row.try_get("value_cents")?),
        metadata,
    })
}
