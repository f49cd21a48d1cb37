use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::conversion::{DeviceClass, TrafficSource};
use crate::errors::DomainError;

string_id!(
    /// Owning-entity key for every experiment, event and forecast.
    ClinicSlug
);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Basic,
    Premium,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Basic => "basic",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "basic" => Ok(Self::Basic),
            "premium" => Ok(Self::Premium),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(DomainError::validation(format!(
                "unknown tier `{other}` (expected free|basic|premium|enterprise)"
            ))),
        }
    }
}

/// Directory record for a clinic, read-only from this crate's point of view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClinicProfile {
    pub slug: ClinicSlug,
    pub name: String,
    pub tier: Tier,
    pub description: Option<String>,
    pub services: Vec<String>,
    pub photo_count: u32,
    pub review_count: u32,
    pub has_hours: bool,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub seo_score: Option<u8>,
}

impl ClinicProfile {
    pub fn new(slug: impl Into<String>, name: impl Into<String>, tier: Tier) -> Self {
        Self {
            slug: ClinicSlug(slug.into()),
            name: name.into(),
            tier,
            description: None,
            services: Vec::new(),
            photo_count: 0,
            review_count: 0,
            has_hours: false,
            phone: None,
            website: None,
            seo_score: None,
        }
    }

    pub fn has_description(&self) -> bool {
        self.description.as_deref().map(|text| !text.trim().is_empty()).unwrap_or(false)
    }

    pub fn has_phone(&self) -> bool {
        self.phone.as_deref().map(|text| !text.trim().is_empty()).unwrap_or(false)
    }

    pub fn has_website(&self) -> bool {
        self.website.as_deref().map(|text| !text.trim().is_empty()).unwrap_or(false)
    }
}

/// A visitor session as recorded by the site's analytics layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub clinic_slug: ClinicSlug,
    pub visitor_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub page_views: u32,
    pub duration_secs: u32,
    pub device: DeviceClass,
    pub browser: String,
    pub source: TrafficSource,
    pub converted: bool,
    pub conversion_value: Decimal,
}

impl SessionRecord {
    pub fn is_bounce(&self) -> bool {
        self.page_views <= 1
    }
}
