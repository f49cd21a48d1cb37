pub mod classify;
pub mod rates;
pub mod rebuild;
pub mod tracker;

pub use classify::{classify_browser, classify_device, infer_source};
pub use rates::{
    estimated_views, summarize, ConversionRate, ConversionRateCalculator, SegmentRate,
    TrendGranularity, TrendPoint,
};
pub use rebuild::CounterRebuilder;
pub use tracker::{ConversionTracker, TrackConversion, TrackedConversion};
