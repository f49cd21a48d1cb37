pub mod clock;
pub mod config;
pub mod conversions;
pub mod domain;
pub mod errors;
pub mod experiments;
pub mod forecast;
pub mod store;
pub mod tables;

pub use clock::{Clock, FixedClock, SystemClock};
pub use conversions::{
    ConversionRate, ConversionRateCalculator, ConversionTracker, CounterRebuilder,
    TrackConversion, TrackedConversion, TrendGranularity, TrendPoint,
};
pub use domain::clinic::{ClinicProfile, ClinicSlug, SessionRecord, Tier};
pub use domain::conversion::{ConversionEvent, ConversionEventId, ConversionType};
pub use domain::experiment::{
    NewVariantTest, TestStatus, Variant, VariantId, VariantResult, VariantTest, VariantTestId,
};
pub use domain::forecast::{ConfidenceClass, ForecastMode, UpgradeForecast};
pub use errors::{AppResult, ApplicationError, DomainError, InterfaceError, StoreError};
pub use experiments::{ExperimentManager, TestAction, VariantAssigner, VariantAssignment};
pub use forecast::{ForecastSettings, ForecastSources, UpgradeForecastEngine};
pub use tables::{ContentChecklist, ConversionValueTable, SeasonalityTable, TierTable};
