//! Variant tests: lifecycle, visitor assignment and result evaluation.

mod assignment;
mod manager;
mod results;

pub use assignment::{
    decide_inclusion, draw_variant, inclusion_bucket, stable_hash, RandomSource, SeededRandom,
    ThreadRandom, VariantAssigner, VariantAssignment,
};
pub use manager::{ExperimentManager, TestAction};
pub use results::evaluate_results;
