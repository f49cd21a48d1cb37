//! Per-variant outcome evaluation against the control.

use std::collections::HashMap;

use statrs::function::erf::erf;

use crate::domain::experiment::{VariantCounters, VariantResult, VariantTest};

/// Rates are percentages. Confidence is the two-sided two-proportion z-test
/// confidence that the variant differs from the control (0 for the control).
/// At most one non-control variant is marked winner: the best rate that beats
/// the control with confidence at or above the test's configured level.
pub fn evaluate_results(test: &VariantTest, counters: &[VariantCounters]) -> Vec<VariantResult> {
    let by_variant: HashMap<&str, &VariantCounters> =
        counters.iter().map(|counter| (counter.variant_id.as_str(), counter)).collect();
    let totals = |id: &str| -> (u64, u64) {
        by_variant.get(id).map(|counter| (counter.views, counter.conversions)).unwrap_or((0, 0))
    };

    let control_id = test.control_variant().map(|variant| variant.id.clone());
    let (control_views, control_conversions) =
        control_id.as_ref().map(|id| totals(id.as_str())).unwrap_or((0, 0));

    let mut results: Vec<VariantResult> = test
        .variants
        .iter()
        .map(|variant| {
            let (views, conversions) = totals(variant.id.as_str());
            let is_control = control_id.as_ref() == Some(&variant.id);
            let confidence = if is_control {
                0.0
            } else {
                two_proportion_confidence(control_conversions, control_views, conversions, views)
            };
            VariantResult {
                variant_id: variant.id.clone(),
                views,
                conversions,
                conversion_rate: rate_pct(conversions, views),
                confidence,
                is_winner: false,
            }
        })
        .collect();

    let control_rate = rate_pct(control_conversions, control_views);
    let winner = results
        .iter()
        .enumerate()
        .filter(|(_, result)| control_id.as_ref() != Some(&result.variant_id))
        .filter(|(_, result)| {
            result.conversion_rate > control_rate && result.confidence >= test.confidence_level
        })
        .max_by(|(_, a), (_, b)| {
            a.conversion_rate.partial_cmp(&b.conversion_rate).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(index, _)| index);

    if let Some(index) = winner {
        results[index].is_winner = true;
    }

    results
}

fn rate_pct(conversions: u64, views: u64) -> f64 {
    if views == 0 {
        0.0
    } else {
        conversions as f64 / views as f64 * 100.0
    }
}

fn two_proportion_confidence(
    control_conversions: u64,
    control_views: u64,
    conversions: u64,
    views: u64,
) -> f64 {
    if control_views == 0 || views == 0 {
        return 0.0;
    }

    let n1 = control_views as f64;
    let n2 = views as f64;
    let p1 = (control_conversions as f64 / n1).min(1.0);
    let p2 = (conversions as f64 / n2).min(1.0);
    let pooled = ((control_conversions + conversions) as f64 / (n1 + n2)).min(1.0);
    let standard_error = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if standard_error == 0.0 || !standard_error.is_finite() {
        return 0.0;
    }

    let z = ((p2 - p1) / standard_error).abs();
    (2.0 * standard_normal_cdf(z) - 1.0).clamp(0.0, 1.0)
}

fn standard_normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}
