//! Conversion-rate reporting over time windows.
//!
//! Views are not measured: every window assumes a 5% baseline, so total views
//! are `max(conversions * 20, 100)`. Segment rates split that estimate evenly
//! across the segment's groups and are only comparable with each other.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::domain::clinic::ClinicSlug;
use crate::domain::conversion::ConversionEvent;
use crate::errors::{AppResult, DomainError};
use crate::store::{ClinicDirectory, ConversionEventStore};

pub const VIEWS_PER_CONVERSION: u64 = 20;
pub const MIN_ESTIMATED_VIEWS: u64 = 100;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentRate {
    pub conversions: u64,
    pub views: f64,
    pub conversion_rate: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversionRate {
    pub clinic_slug: ClinicSlug,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_conversions: u64,
    pub total_views: u64,
    /// Percent.
    pub conversion_rate: f64,
    pub total_value: Decimal,
    pub by_type: BTreeMap<String, SegmentRate>,
    pub by_source: BTreeMap<String, SegmentRate>,
    pub by_device: BTreeMap<String, SegmentRate>,
    pub by_variant: BTreeMap<String, SegmentRate>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendGranularity {
    Daily,
    Weekly,
}

impl std::str::FromStr for TrendGranularity {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "daily" | "day" => Ok(Self::Daily),
            "weekly" | "week" => Ok(Self::Weekly),
            other => Err(DomainError::validation(format!(
                "unknown trend granularity `{other}` (expected daily|weekly)"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_conversions: u64,
    pub total_views: u64,
    pub conversion_rate: f64,
    pub total_value: Decimal,
}

impl From<&ConversionRate> for TrendPoint {
    fn from(rate: &ConversionRate) -> Self {
        Self {
            period_start: rate.start,
            period_end: rate.end,
            total_conversions: rate.total_conversions,
            total_views: rate.total_views,
            conversion_rate: rate.conversion_rate,
            total_value: rate.total_value,
        }
    }
}

pub fn estimated_views(conversions: u64) -> u64 {
    conversions.saturating_mul(VIEWS_PER_CONVERSION).max(MIN_ESTIMATED_VIEWS)
}

/// Pure aggregation of already-fetched events into a rate report.
pub fn summarize(
    clinic_slug: ClinicSlug,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    events: &[ConversionEvent],
) -> ConversionRate {
    let total_conversions = events.len() as u64;
    let total_views = estimated_views(total_conversions);
    let total_value = events.iter().map(|event| event.value).sum();

    ConversionRate {
        clinic_slug,
        start,
        end,
        total_conversions,
        total_views,
        conversion_rate: percent(total_conversions as f64, total_views as f64),
        total_value,
        by_type: segment(events, total_views, |event| {
            Some(event.conversion_type.as_str().to_string())
        }),
        by_source: segment(events, total_views, |event| {
            Some(event.metadata.source.as_str().to_string())
        }),
        by_device: segment(events, total_views, |event| {
            Some(event.metadata.device.as_str().to_string())
        }),
        by_variant: segment(events, total_views, |event| {
            event.variant_id.as_ref().map(|variant| variant.as_str().to_string())
        }),
    }
}

fn segment(
    events: &[ConversionEvent],
    total_views: u64,
    key: impl Fn(&ConversionEvent) -> Option<String>,
) -> BTreeMap<String, SegmentRate> {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for event in events {
        if let Some(key) = key(event) {
            *counts.entry(key).or_default() += 1;
        }
    }

    let share = if counts.is_empty() { 0.0 } else { total_views as f64 / counts.len() as f64 };
    counts
        .into_iter()
        .map(|(key, conversions)| {
            let rate = SegmentRate {
                conversions,
                views: share,
                conversion_rate: percent(conversions as f64, share),
            };
            (key, rate)
        })
        .collect()
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole <= 0.0 {
        0.0
    } else {
        part / whole * 100.0
    }
}

pub struct ConversionRateCalculator {
    clinics: Arc<dyn ClinicDirectory>,
    events: Arc<dyn ConversionEventStore>,
    clock: Arc<dyn Clock>,
}

impl ConversionRateCalculator {
    pub fn new(
        clinics: Arc<dyn ClinicDirectory>,
        events: Arc<dyn ConversionEventStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { clinics, events, clock }
    }

    /// Rate over the inclusive window `[start, end]`.
    pub async fn calculate(
        &self,
        slug: &ClinicSlug,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<ConversionRate> {
        if start > end {
            return Err(DomainError::validation(format!(
                "window start {start} is after end {end}"
            ))
            .into());
        }
        if self.clinics.find_clinic(slug).await?.is_none() {
            return Err(DomainError::not_found("clinic", slug.as_str()).into());
        }

        let events = self.events.list_between(slug, start, end).await?;
        Ok(summarize(slug.clone(), start, end, &events))
    }

    /// Rate over the trailing `days` ending now.
    pub async fn trailing(&self, slug: &ClinicSlug, days: u32) -> AppResult<ConversionRate> {
        let end = self.clock.now();
        self.calculate(slug, end - Duration::days(i64::from(days)), end).await
    }

    /// One point per calendar day (UTC), oldest first, ending with today.
    pub async fn daily_trend(&self, slug: &ClinicSlug, days: u32) -> AppResult<Vec<TrendPoint>> {
        self.trend(slug, days, 1).await
    }

    /// One point per seven-day window, oldest first, the last ending today.
    pub async fn weekly_trend(&self, slug: &ClinicSlug, weeks: u32) -> AppResult<Vec<TrendPoint>> {
        self.trend(slug, weeks, 7).await
    }

    pub async fn trend_by(
        &self,
        slug: &ClinicSlug,
        granularity: TrendGranularity,
        periods: u32,
    ) -> AppResult<Vec<TrendPoint>> {
        match granularity {
            TrendGranularity::Daily => self.daily_trend(slug, periods).await,
            TrendGranularity::Weekly => self.weekly_trend(slug, periods).await,
        }
    }

    async fn trend(
        &self,
        slug: &ClinicSlug,
        periods: u32,
        days_per_period: i64,
    ) -> AppResult<Vec<TrendPoint>> {
        let tomorrow = start_of_day(self.clock.now()) + Duration::days(1);
        let mut points = Vec::with_capacity(periods as usize);

        for offset in (0..i64::from(periods)).rev() {
            let period_end = tomorrow - Duration::days(offset * days_per_period);
            let period_start = period_end - Duration::days(days_per_period);
            // Stores filter inclusively at nanosecond precision.
            let rate =
                self.calculate(slug, period_start, period_end - Duration::nanoseconds(1)).await?;
            points.push(TrendPoint::from(&rate));
        }

        Ok(points)
    }
}

fn start_of_day(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant.date_naive().and_time(NaiveTime::MIN).and_utc()
}
