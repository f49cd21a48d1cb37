use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, Row};

use funnel_core::domain::clinic::ClinicSlug;
use funnel_core::domain::forecast::{
    ForecastFactors, ForecastId, ForecastLog, ForecastOutcome, UpgradeForecast,
};
use funnel_core::store::{ForecastStore, StoreResult};

use super::{
    decode_json, encode_json, format_timestamp, from_cents, parse_label, parse_serde_label,
    parse_timestamp, parse_u32, parse_u8, serde_label, to_cents, RepositoryError,
};
use crate::DbPool;

pub struct SqlForecastStore {
    pool: DbPool,
}

impl SqlForecastStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ForecastStore for SqlForecastStore {
    async fn save_forecast(&self, forecast: UpgradeForecast) -> StoreResult<()> {
        let mode = serde_label("mode", &forecast.mode)?;
        let confidence = serde_label("confidence", &forecast.confidence)?;
        let factors_json = encode_json("factors_json", &forecast.factors)?;
        let actions_json =
            encode_json("recommended_actions_json", &forecast.recommended_actions)?;
        let revenue_cents = to_cents("predicted_revenue_cents", forecast.predicted_revenue)?;

        sqlx::query(
            "INSERT INTO upgrade_forecasts (
                id,
                clinic_slug,
                forecast_date,
                mode,
                current_tier,
                target_tier,
                prediction_score,
                confidence,
                factors_json,
                predicted_revenue_cents,
                timeframe_days,
                recommended_actions_json,
                created_at,
                expires_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&forecast.id.0)
        .bind(&forecast.clinic_slug.0)
        .bind(format_timestamp(forecast.forecast_date))
        .bind(mode)
        .bind(forecast.current_tier.as_str())
        .bind(forecast.target_tier.as_str())
        .bind(i64::from(forecast.prediction_score))
        .bind(confidence)
        .bind(factors_json)
        .bind(revenue_cents)
        .bind(i64::from(forecast.timeframe_days))
        .bind(actions_json)
        .bind(format_timestamp(forecast.created_at))
        .bind(format_timestamp(forecast.expires_at))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(())
    }

    async fn latest_forecast(&self, slug: &ClinicSlug) -> StoreResult<Option<UpgradeForecast>> {
        let row = sqlx::query(
            "SELECT
                id,
                clinic_slug,
                forecast_date,
                mode,
                current_tier,
                target_tier,
                prediction_score,
                confidence,
                factors_json,
                predicted_revenue_cents,
                timeframe_days,
                recommended_actions_json,
                created_at,
                expires_at
             FROM upgrade_forecasts
             WHERE clinic_slug = ?
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
        )
        .bind(&slug.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(row.map(forecast_from_row).transpose()?)
    }

    async fn append_log(&self, log: ForecastLog) -> StoreResult<()> {
        let factors_json = encode_json("factors_json", &log.factors)?;
        let outcome_json =
            log.outcome.as_ref().map(|outcome| encode_json("outcome_json", outcome)).transpose()?;

        sqlx::query(
            "INSERT INTO forecast_logs (
                forecast_id,
                clinic_slug,
                factors_json,
                prediction_score,
                target_tier,
                logged_at,
                outcome_json
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(forecast_id) DO UPDATE SET
                factors_json = excluded.factors_json,
                prediction_score = excluded.prediction_score,
                target_tier = excluded.target_tier,
                logged_at = excluded.logged_at,
                outcome_json = excluded.outcome_json",
        )
        .bind(&log.forecast_id.0)
        .bind(&log.clinic_slug.0)
        .bind(factors_json)
        .bind(i64::from(log.prediction_score))
        .bind(log.target_tier.as_str())
        .bind(format_timestamp(log.logged_at))
        .bind(outcome_json)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(())
    }

    async fn record_outcome(
        &self,
        forecast_id: &ForecastId,
        outcome: ForecastOutcome,
    ) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE forecast_logs SET outcome_json = ? WHERE forecast_id = ?")
            .bind(encode_json("outcome_json", &outcome)?)
            .bind(&forecast_id.0)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_logs(&self, slug: &ClinicSlug) -> StoreResult<Vec<ForecastLog>> {
        let rows = sqlx::query(
            "SELECT
                forecast_id,
                clinic_slug,
                factors_json,
                prediction_score,
                target_tier,
                logged_at,
                outcome_json
             FROM forecast_logs
             WHERE clinic_slug = ?
             ORDER BY logged_at ASC, forecast_id ASC",
        )
        .bind(&slug.0)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.into_iter().map(log_from_row).collect::<Result<Vec<_>, _>>()?)
    }
}

fn forecast_from_row(row: SqliteRow) -> Result<UpgradeForecast, RepositoryError> {
    let factors: ForecastFactors =
        decode_json("factors_json", &row.try_get::<String, _>("factors_json")?)?;
    let recommended_actions: Vec<String> = decode_json(
        "recommended_actions_json",
        &row.try_get::<String, _>("recommended_actions_json")?,
    )?;

    Ok(UpgradeForecast {
        id: ForecastId(row.try_get("id")?),
        clinic_slug: ClinicSlug(row.try_get("clinic_slug")?),
        forecast_date: parse_timestamp("forecast_date", row.try_get("forecast_date")?)?,
        mode: parse_serde_label("mode", row.try_get("mode")?)?,
        current_tier: parse_label("current_tier", &row.try_get::<String, _>("current_tier")?)?,
        target_tier: parse_label("target_tier", &row.try_get::<String, _>("target_tier")?)?,
        prediction_score: parse_u8("prediction_score", row.try_get("prediction_score")?)?,
        confidence: parse_serde_label("confidence", row.try_get("confidence")?)?,
        factors,
        predicted_revenue: from_cents(row.try_get("predicted_revenue_cents")?),
        timeframe_days: parse_u32("timeframe_days", row.try_get("timeframe_days")?)?,
        recommended_actions,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        expires_at: parse_timestamp("expires_at", row.try_get("expires_at")?)?,
    })
}

fn log_from_row(row: SqliteRow) -> Result<ForecastLog, RepositoryError> {
    let outcome: Option<ForecastOutcome> = row
        .try_get::<Option<String>, _>("outcome_json")?
        .map(|raw| decode_json("outcome_json", &raw))
        .transpose()?;

    Ok(ForecastLog {
        forecast_id: ForecastId(row.try_get("forecast_id")?),
        clinic_slug: ClinicSlug(row.try_get("clinic_slug")?),
        factors: decode_json("factors_json", &row.try_get::<String, _>("factors_json")?)?,
        prediction_score: parse_u8("prediction_score", row.try_get("prediction_score")?)?,
        target_tier: parse_label("target_tier", &row.try_get::<String, _>("target_tier")?)?,
        logged_at: parse_timestamp("logged_at", row.try_get("logged_at")?)?,
        outcome,
    })
}
