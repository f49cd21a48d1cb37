use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::clinic::ClinicSlug;
use crate::errors::DomainError;

string_id!(VariantTestId);
string_id!(VariantId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Draft,
    Running,
    Paused,
    Completed,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value.trim() {
            "draft" => Ok(Self::Draft),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            other => Err(DomainError::validation(format!("unknown test status `{other}`"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryMetric {
    #[default]
    ConversionRate,
    Calls,
    Bookings,
    Revenue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub name: String,
    pub content: serde_json::Value,
    /// Relative share of included traffic, 0-100. Weights need not sum to 100.
    pub weight: u8,
    pub is_control: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariantResult {
    pub variant_id: VariantId,
    pub views: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
    pub confidence: f64,
    pub is_winner: bool,
}

/// Raw per-variant counters maintained by atomic increments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantCounters {
    pub variant_id: VariantId,
    pub views: u64,
    pub conversions: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantCounter {
    Views,
    Conversions,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewVariantTest {
    pub clinic_slug: ClinicSlug,
    pub name: String,
    pub description: Option<String>,
    pub variants: Vec<Variant>,
    pub traffic_allocation: u8,
    pub target_sample_size: u32,
    pub confidence_level: f64,
    #[serde(default)]
    pub primary_metric: PrimaryMetric,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariantTest {
    pub id: VariantTestId,
    pub clinic_slug: ClinicSlug,
    pub name: String,
    pub description: Option<String>,
    pub status: TestStatus,
    pub variants: Vec<Variant>,
    /// Percentage of visitors included in the experiment at all, 0-100.
    pub traffic_allocation: u8,
    pub target_sample_size: u32,
    pub confidence_level: f64,
    pub primary_metric: PrimaryMetric,
    pub results: Option<Vec<VariantResult>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl VariantTest {
    pub fn create(
        id: VariantTestId,
        input: NewVariantTest,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        validate_definition(&input)?;

        Ok(Self {
            id,
            clinic_slug: input.clinic_slug,
            name: input.name.trim().to_string(),
            description: input.description,
            status: TestStatus::Draft,
            variants: input.variants,
            traffic_allocation: input.traffic_allocation,
            target_sample_size: input.target_sample_size,
            confidence_level: input.confidence_level,
            primary_metric: input.primary_metric,
            results: None,
            created_at: now,
            started_at: None,
            ended_at: None,
        })
    }

    /// The variant shown to visitors outside the traffic allocation.
    pub fn control_variant(&self) -> Option<&Variant> {
        self.variants.iter().find(|variant| variant.is_control).or_else(|| self.variants.first())
    }

    pub fn variant(&self, id: &VariantId) -> Option<&Variant> {
        self.variants.iter().find(|variant| &variant.id == id)
    }

    pub fn is_running(&self) -> bool {
        self.status == TestStatus::Running
    }

    pub fn can_transition_to(&self, next: TestStatus) -> bool {
        matches!(
            (self.status, next),
            (TestStatus::Draft, TestStatus::Running)
                | (TestStatus::Running, TestStatus::Paused)
                | (TestStatus::Paused, TestStatus::Running)
                | (TestStatus::Running, TestStatus::Completed)
                | (TestStatus::Paused, TestStatus::Completed)
        )
    }

    fn transition_to(&mut self, next: TestStatus) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            self.status = next;
            return Ok(());
        }

        Err(DomainError::InvalidTestTransition { from: self.status, to: next })
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status != TestStatus::Draft {
            return Err(DomainError::InvalidTestTransition {
                from: self.status,
                to: TestStatus::Running,
            });
        }
        self.transition_to(TestStatus::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), DomainError> {
        self.transition_to(TestStatus::Paused)
    }

    pub fn resume(&mut self) -> Result<(), DomainError> {
        if self.status != TestStatus::Paused {
            return Err(DomainError::InvalidTestTransition {
                from: self.status,
                to: TestStatus::Running,
            });
        }
        self.transition_to(TestStatus::Running)
    }

    pub fn complete(
        &mut self,
        now: DateTime<Utc>,
        results: Vec<VariantResult>,
    ) -> Result<(), DomainError> {
        self.transition_to(TestStatus::Completed)?;
        self.ended_at = Some(now);
        self.results = Some(results);
        Ok(())
    }
}

fn validate_definition(input: &NewVariantTest) -> Result<(), DomainError> {
    if input.clinic_slug.0.trim().is_empty() {
        return Err(DomainError::validation("clinic_slug is required"));
    }
    if input.name.trim().is_empty() {
        return Err(DomainError::validation("test name is required"));
    }
    if input.variants.is_empty() {
        return Err(DomainError::validation("a test needs at least one variant"));
    }
    if input.traffic_allocation > 100 {
        return Err(DomainError::validation("traffic_allocation must be in range 0..=100"));
    }
    if !(input.confidence_level > 0.0 && input.confidence_level < 1.0) {
        return Err(DomainError::validation("confidence_level must be in range (0, 1)"));
    }

    let mut seen = BTreeSet::new();
    for variant in &input.variants {
        if variant.id.0.trim().is_empty() {
            return Err(DomainError::validation("variant id is required"));
        }
        if !seen.insert(variant.id.0.as_str()) {
            return Err(DomainError::validation(format!("duplicate variant id `{}`", variant.id)));
        }
        if variant.weight > 100 {
            return Err(DomainError::validation(format!(
                "variant `{}` weight must be in range 0..=100",
                variant.id
            )));
        }
    }

    if input.variants.iter().filter(|variant| variant.is_control).count() > 1 {
        return Err(DomainError::validation("at most one variant may be marked as control"));
    }

    Ok(())
}
