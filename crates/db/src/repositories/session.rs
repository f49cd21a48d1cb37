use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use funnel_core::domain::clinic::{ClinicSlug, SessionRecord};
use funnel_core::store::{SessionStore, StoreResult};

use super::{
    format_timestamp, from_cents, parse_label, parse_timestamp, parse_u32, to_cents,
    RepositoryError,
};
use crate::DbPool;

const SESSION_COLUMNS: &str = "id,
                clinic_slug,
                visitor_id,
                started_at,
                page_views,
                duration_secs,
                device,
                browser,
                source,
                converted,
                conversion_value_cents";

pub struct SqlSessionStore {
    pool: DbPool,
}

impl SqlSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for SqlSessionStore {
    async fn save_session(&self, session: SessionRecord) -> StoreResult<()> {
        let value_cents = to_cents("conversion_value_cents", session.conversion_value)?;
        sqlx::query(
            "INSERT INTO sessions (
                id,
                clinic_slug,
                visitor_id,
                started_at,
                page_views,
                duration_secs,
                device,
                browser,
                source,
                converted,
                conversion_value_cents
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                visitor_id = excluded.visitor_id,
                page_views = excluded.page_views,
                duration_secs = excluded.duration_secs,
                device = excluded.device,
                browser = excluded.browser,
                source = excluded.source,
                converted = excluded.converted,
                conversion_value_cents = excluded.conversion_value_cents",
        )
        .bind(&session.id)
        .bind(&session.clinic_slug.0)
        .bind(session.visitor_id.as_deref())
        .bind(format_timestamp(session.started_at))
        .bind(i64::from(session.page_views))
        .bind(i64::from(session.duration_secs))
        .bind(session.device.as_str())
        .bind(&session.browser)
        .bind(session.source.as_str())
        .bind(session.converted)
        .bind(value_cents)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(())
    }

    async fn find_session(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        let row = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"))
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        Ok(row.map(session_from_row).transpose()?)
    }

    async fn list_sessions(
        &self,
        slug: &ClinicSlug,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<SessionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS}
             FROM sessions
             WHERE clinic_slug = ? AND started_at >= ? AND started_at <= ?
             ORDER BY started_at ASC, id ASC"
        ))
        .bind(&slug.0)
        .bind(format_timestamp(start))
        .bind(format_timestamp(end))
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.into_iter().map(session_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn mark_converted(&self, session_id: &str, value: Decimal) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE sessions
             SET converted = 1,
                 conversion_value_cents = conversion_value_cents + ?
             WHERE id = ?",
        )
        .bind(to_cents("conversion_value_cents", value)?)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(result.rows_affected() > 0)
    }
}

fn session_from_row(row: SqliteRow) -> Result<SessionRecord, RepositoryError> {
    Ok(SessionRecord {
        id: row.try_get("id")?,
        clinic_slug: ClinicSlug(row.try_get("clinic_slug")?),
        visitor_id: row.try_get("visitor_id")?,
        started_at: parse_timestamp("started_at", row.try_get("started_at")?)?,
        page_views: parse_u32("page_views", row.try_get("page_views")?)?,
        duration_secs: parse_u32("duration_secs", row.try_get("duration_secs")?)?,
        device: parse_label("device", &row.try_get::<String, _>("device")?)?,
        browser: row.try_get("browser")?,
        source: parse_label("source", &row.try_get::<String, _>("source")?)?,
        converted: row.try_get("converted")?,
        conversion_value: from_cents(row.try_get("conversion_value_cents")?),
    })
}
