use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::clinic::ClinicSlug;
use crate::domain::experiment::{VariantId, VariantTestId};
use crate::errors::DomainError;

string_id!(ConversionEventId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionType {
    Call,
    Form,
    CtaClick,
    Email,
    Booking,
    Review,
}

impl ConversionType {
    pub const ALL: [ConversionType; 6] =
        [Self::Call, Self::Form, Self::CtaClick, Self::Email, Self::Booking, Self::Review];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Form => "form",
            Self::CtaClick => "cta_click",
            Self::Email => "email",
            Self::Booking => "booking",
            Self::Review => "review",
        }
    }
}

impl fmt::Display for ConversionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversionType {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "call" => Ok(Self::Call),
            "form" => Ok(Self::Form),
            "cta_click" | "ctaClick" => Ok(Self::CtaClick),
            "email" => Ok(Self::Email),
            "booking" => Ok(Self::Booking),
            "review" => Ok(Self::Review),
            other => Err(DomainError::validation(format!(
                "unknown conversion type `{other}` (expected call|form|cta_click|email|booking|review)"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Mobile,
    Tablet,
    #[default]
    Desktop,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mobile => "mobile",
            Self::Tablet => "tablet",
            Self::Desktop => "desktop",
        }
    }
}

impl FromStr for DeviceClass {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "mobile" => Ok(Self::Mobile),
            "tablet" => Ok(Self::Tablet),
            "desktop" => Ok(Self::Desktop),
            other => Err(DomainError::validation(format!("unknown device class `{other}`"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficSource {
    Organic,
    Paid,
    Social,
    #[default]
    Direct,
    Referral,
}

impl TrafficSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Organic => "organic",
            Self::Paid => "paid",
            Self::Social => "social",
            Self::Direct => "direct",
            Self::Referral => "referral",
        }
    }
}

impl FromStr for TrafficSource {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "organic" => Ok(Self::Organic),
            "paid" => Ok(Self::Paid),
            "social" => Ok(Self::Social),
            "direct" => Ok(Self::Direct),
            "referral" => Ok(Self::Referral),
            other => Err(DomainError::validation(format!("unknown traffic source `{other}`"))),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub device: DeviceClass,
    pub browser: String,
    pub source: TrafficSource,
    pub campaign: Option<String>,
    pub form_type: Option<String>,
}

/// Immutable record of a single conversion action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionEvent {
    pub id: ConversionEventId,
    pub clinic_slug: ClinicSlug,
    pub conversion_type: ConversionType,
    pub occurred_at: DateTime<Utc>,
    pub referrer: Option<String>,
    pub page: String,
    pub test_id: Option<VariantTestId>,
    pub variant_id: Option<VariantId>,
    pub visitor_id: Option<String>,
    pub session_id: String,
    pub value: Decimal,
    pub metadata: EventMetadata,
}

/// Projection of a clinic's conversion totals, rebuilt from events if it drifts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionCounters {
    pub total: u64,
    pub total_value: Decimal,
    pub by_type: BTreeMap<ConversionType, u64>,
}

impl ConversionCounters {
    pub fn apply(&mut self, conversion_type: ConversionType, value: Decimal) {
        self.total += 1;
        self.total_value += value;
        *self.by_type.entry(conversion_type).or_insert(0) += 1;
    }

    pub fn replay<'a>(events: impl IntoIterator<Item = &'a ConversionEvent>) -> Self {
        let mut counters = Self::default();
        for event in events {
            counters.apply(event.conversion_type, event.value);
        }
        counters
    }
}
