use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use funnel_core::errors::StoreError;

pub mod clinic;
pub mod conversion;
pub mod experiment;
pub mod forecast;
pub mod session;

pub use clinic::{SqlClinicDirectory, SqlContactStore};
pub use conversion::SqlConversionStore;
pub use experiment::{SqlAssignmentStore, SqlVariantTestStore};
pub use forecast::SqlForecastStore;
pub use session::SqlSessionStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
}

impl From<RepositoryError> for StoreError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Database(sqlx::Error::Database(error))
                if error.is_unique_violation() =>
            {
                StoreError::Conflict(error.to_string())
            }
            RepositoryError::Database(error) => StoreError::Unavailable(error.to_string()),
            RepositoryError::Decode(message) => StoreError::Decode(message),
            RepositoryError::Encode(message) => StoreError::Conflict(message),
        }
    }
}

/// Timestamps are written with a fixed nine-digit fraction and a `Z` suffix so
/// that text comparison in range queries matches chronological order.
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_timestamp(
    column: &str,
    value: String,
) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_u64(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative integer): {value}"
        ))
    })
}

pub(crate) fn parse_u8(column: &str, value: i64) -> Result<u8, RepositoryError> {
    u8::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!("invalid value for `{column}` (expected 0..=255): {value}"))
    })
}

/// Money is stored as integer cents so counters can be incremented in SQL.
pub(crate) fn to_cents(column: &str, value: Decimal) -> Result<i64, RepositoryError> {
    (value * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| {
            RepositoryError::Encode(format!("amount for `{column}` does not fit in cents: {value}"))
        })
}

pub(crate) fn from_cents(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

pub(crate) fn parse_label<T>(column: &str, value: &str) -> Result<T, RepositoryError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|error| RepositoryError::Decode(format!("invalid `{column}` value: {error}")))
}

/// Label for enums that only carry a serde representation.
pub(crate) fn serde_label<T: Serialize>(
    column: &str,
    value: &T,
) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(label)) => Ok(label),
        Ok(other) => Err(RepositoryError::Encode(format!(
            "`{column}` did not serialize to a string label: {other}"
        ))),
        Err(error) => Err(RepositoryError::Encode(format!("`{column}`: {error}"))),
    }
}

pub(crate) fn parse_serde_label<T: DeserializeOwned>(
    column: &str,
    value: String,
) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(value.clone())).map_err(|error| {
        RepositoryError::Decode(format!("unknown `{column}` value `{value}` ({error})"))
    })
}

pub(crate) fn encode_json<T: Serialize>(
    column: &str,
    value: &T,
) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Encode(format!("`{column}` to json: {error}")))
}

pub(crate) fn decode_json<T: DeserializeOwned>(
    column: &str,
    value: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(value)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}


#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use funnel_core::domain::experiment::PrimaryMetric;
    use funnel_core::errors::StoreError;

    use super::{
        format_timestamp, from_cents, parse_serde_label, serde_label, test_support::parse_ts,
        to_cents, RepositoryError,
    };

    #[test]
    fn cents_round_to_nearest() {
        assert_eq!(to_cents("value", Decimal::new(12345, 3)).expect("cents"), 1235);
        assert_eq!(from_cents(15000), Decimal::from(150));
    }

    #[test]
    fn formatted_timestamps_sort_lexicographically() {
        let earlier = format_timestamp(parse_ts("2026-05-01T09:00:00Z"));
        let later = format_timestamp(parse_ts("2026-05-01T09:00:00.5Z"));
        assert_eq!(earlier, "2026-05-01T09:00:00.000000000Z");
        assert!(earlier < later);
    }

    #[test]
    fn serde_labels_survive_the_column() {
        let label = serde_label("primary_metric", &PrimaryMetric::ConversionRate).expect("label");
        assert_eq!(label, "conversion_rate");
        let parsed: PrimaryMetric =
            parse_serde_label("primary_metric", label).expect("parse label");
        assert_eq!(parsed, PrimaryMetric::ConversionRate);
    }

    #[test]
    fn decode_failures_surface_as_store_decode_errors() {
        let error = StoreError::from(RepositoryError::Decode("bad row".to_string()));
        assert_eq!(error, StoreError::Decode("bad row".to_string()));
    }
}
