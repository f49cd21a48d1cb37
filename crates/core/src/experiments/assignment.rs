//! Visitor bucketing for variant tests.
//!
//! Inclusion is a pure function of `visitor_id + test_id`, so it can be replayed
//! without storage. The weighted draw among variants is random and is memoized
//! through the [`AssignmentStore`]; the stored value always wins on later visits.
//!
//! Two first visits by the same visitor racing each other may both draw and the
//! later `save_assignment` wins. No lock is taken for this path.

use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::clinic::ClinicSlug;
use crate::domain::experiment::{
    TestStatus, Variant, VariantCounter, VariantId, VariantTest, VariantTestId,
};
use crate::errors::{AppResult, DomainError};
use crate::store::{AssignmentStore, VariantTestStore};

/// Uniform draws in `[0, 100)`.
pub trait RandomSource: Send + Sync {
    fn next_percent(&self) -> f64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_percent(&self) -> f64 {
        rand::thread_rng().gen_range(0.0..100.0)
    }
}

#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self { rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }
}

impl RandomSource for SeededRandom {
    fn next_percent(&self) -> f64 {
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0.0..100.0),
            Err(poisoned) => poisoned.into_inner().gen_range(0.0..100.0),
        }
    }
}

/// Polynomial rolling hash (`h = h * 31 + unit`) over UTF-16 code units,
/// wrapped to 32 bits and folded to a non-negative value.
pub fn stable_hash(input: &str) -> u32 {
    let mut hash: i32 = 0;
    for unit in input.encode_utf16() {
        hash = hash.wrapping_mul(31).wrapping_add(i32::from(unit));
    }
    hash.unsigned_abs()
}

pub fn inclusion_bucket(visitor_id: &str, test_id: &VariantTestId) -> u32 {
    let mut key = String::with_capacity(visitor_id.len() + test_id.0.len());
    key.push_str(visitor_id);
    key.push_str(&test_id.0);
    stable_hash(&key) % 100
}

/// Whether the visitor falls inside the test's traffic allocation.
pub fn decide_inclusion(visitor_id: &str, test_id: &VariantTestId, allocation: u8) -> bool {
    inclusion_bucket(visitor_id, test_id) < u32::from(allocation)
}

/// Walks variants accumulating relative weights and returns the first whose
/// cumulative weight reaches the draw. All-zero weights pick the first variant.
pub fn draw_variant<'a>(variants: &'a [Variant], random: &dyn RandomSource) -> Option<&'a VariantId> {
    let first = variants.first()?;
    let total: u32 = variants.iter().map(|variant| u32::from(variant.weight)).sum();
    if total == 0 {
        return Some(&first.id);
    }

    let target = random.next_percent().clamp(0.0, 100.0) / 100.0 * f64::from(total);
    let mut cumulative = 0u32;
    for variant in variants {
        if variant.weight == 0 {
            continue;
        }
        cumulative += u32::from(variant.weight);
        if f64::from(cumulative) >= target {
            return Some(&variant.id);
        }
    }

    Some(&first.id)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariantAssignment {
    pub test_id: VariantTestId,
    pub variant_id: VariantId,
    pub content: serde_json::Value,
    /// False when the visitor fell outside the traffic allocation and got the control.
    pub included: bool,
    /// True when this call performed the weighted draw.
    pub newly_assigned: bool,
}

pub struct VariantAssigner {
    tests: Arc<dyn VariantTestStore>,
    assignments: Arc<dyn AssignmentStore>,
    random: Arc<dyn RandomSource>,
}

impl VariantAssigner {
    pub fn new(
        tests: Arc<dyn VariantTestStore>,
        assignments: Arc<dyn AssignmentStore>,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self { tests, assignments, random }
    }

    /// Assigns the visitor within the clinic's running test, if there is one.
    pub async fn assign(
        &self,
        visitor_id: &str,
        clinic_slug: &ClinicSlug,
    ) -> AppResult<Option<VariantAssignment>> {
        if clinic_slug.0.trim().is_empty() {
            return Err(DomainError::validation("clinic_slug is required").into());
        }

        let Some(test) = self.tests.find_running_test(clinic_slug).await? else {
            debug!(
                event_name = "experiment.assignment.no_running_test",
                clinic_slug = %clinic_slug,
                "no running test; default content applies"
            );
            return Ok(None);
        };

        self.assign_for_test(visitor_id, &test).await.map(Some)
    }

    /// Get-or-create assignment for a specific test.
    pub async fn assign_for_test(
        &self,
        visitor_id: &str,
        test: &VariantTest,
    ) -> AppResult<VariantAssignment> {
        let visitor_id = visitor_id.trim();
        if visitor_id.is_empty() {
            return Err(DomainError::validation("visitor_id is required").into());
        }
        let control = test.control_variant().ok_or_else(|| {
            DomainError::validation(format!("test `{}` has no variants", test.id))
        })?;

        if let Some(stored) = self.assignments.get_assignment(&test.id, visitor_id).await? {
            if let Some(variant) = test.variant(&stored) {
                return Ok(assignment(test, variant, true, false));
            }
        }

        if !decide_inclusion(visitor_id, &test.id, test.traffic_allocation) {
            return Ok(assignment(test, control, false, false));
        }

        let variant_id = draw_variant(&test.variants, self.random.as_ref())
            .cloned()
            .unwrap_or_else(|| control.id.clone());
        self.assignments.save_assignment(&test.id, visitor_id, &variant_id).await?;

        let variant = test.variant(&variant_id).unwrap_or(control);
        info!(
            event_name = "experiment.assignment.created",
            clinic_slug = %test.clinic_slug,
            test_id = %test.id,
            variant_id = %variant.id,
            "visitor assigned to variant"
        );
        Ok(assignment(test, variant, true, true))
    }

    /// Counts one rendering of the variant toward its `views`. Only running
    /// tests count exposures, matching conversion attribution.
    pub async fn record_exposure(
        &self,
        test_id: &VariantTestId,
        variant_id: &VariantId,
    ) -> AppResult<()> {
        let test = self
            .tests
            .find_test(test_id)
            .await?
            .ok_or_else(|| DomainError::not_found("variant test", test_id.as_str()))?;
        if test.variant(variant_id).is_none() {
            return Err(DomainError::not_found("variant", variant_id.as_str()).into());
        }
        if test.status != TestStatus::Running {
            return Err(DomainError::validation(format!(
                "variant test {test_id} is {} and does not count exposures",
                test.status.as_str()
            ))
            .into());
        }

        self.tests.increment_variant_counter(test_id, variant_id, VariantCounter::Views).await?;
        Ok(())
    }
}

fn assignment(
    test: &VariantTest,
    variant: &Variant,
    included: bool,
    newly_assigned: bool,
) -> VariantAssignment {
    VariantAssignment {
        test_id: test.id.clone(),
        variant_id: variant.id.clone(),
        content: variant.content.clone(),
        included,
        newly_assigned,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use chrono::Utc;
    use proptest::prelude::*;
    use serde_json::json;

    use super::{
        decide_inclusion, draw_variant, stable_hash, RandomSource, SeededRandom, VariantAssigner,
    };
    use crate::domain::clinic::ClinicSlug;
    use crate::domain::experiment::{
        NewVariantTest, PrimaryMetric, Variant, VariantId, VariantTest, VariantTestId,
    };
    use crate::errors::{ApplicationError, DomainError};
    use crate::store::{
        AssignmentStore, InMemoryAssignmentStore, InMemoryVariantTestStore, VariantTestStore,
    };

    struct Scripted {
        draws: Vec<f64>,
        next: AtomicUsize,
    }

    impl Scripted {
        fn new(draws: Vec<f64>) -> Self {
            Self { draws, next: AtomicUsize::new(0) }
        }

        fn calls(&self) -> usize {
            self.next.load(Ordering::SeqCst)
        }
    }

    impl RandomSource for Scripted {
        fn next_percent(&self) -> f64 {
            let index = self.next.fetch_add(1, Ordering::SeqCst);
            self.draws[index % self.draws.len()]
        }
    }

    fn variant(id: &str, weight: u8, is_control: bool) -> Variant {
        Variant {
            id: VariantId(id.to_string()),
            name: id.to_string(),
            content: json!({ "cta": format!("Book now ({id})") }),
            weight,
            is_control,
        }
    }

    fn running_test(id: &str, allocation: u8, variants: Vec<Variant>) -> VariantTest {
        let mut test = VariantTest::create(
            VariantTestId(id.to_string()),
            NewVariantTest {
                clinic_slug: ClinicSlug("summit-mens-clinic".to_string()),
                name: "CTA copy".to_string(),
                description: None,
                variants,
                traffic_allocation: allocation,
                target_sample_size: 500,
                confidence_level: 0.95,
                primary_metric: PrimaryMetric::ConversionRate,
            },
            Utc::now(),
        )
        .expect("valid test");
        test.start(Utc::now()).expect("start");
        test
    }

    fn assigner(random: Arc<dyn RandomSource>) -> (VariantAssigner, Arc<InMemoryVariantTestStore>, Arc<InMemoryAssignmentStore>) {
        let tests = Arc::new(InMemoryVariantTestStore::default());
        let assignments = Arc::new(InMemoryAssignmentStore::default());
        (VariantAssigner::new(tests.clone(), assignments.clone(), random), tests, assignments)
    }

    #[test]
    fn stable_hash_matches_rolling_polynomial() {
        assert_eq!(stable_hash(""), 0);
        assert_eq!(stable_hash("a"), 97);
        assert_eq!(stable_hash("ab"), 97 * 31 + 98);
        // Wraps past i32::MAX instead of overflowing.
        let long = "visitor-0123456789-abcdefghijklmnopqrstuvwxyz";
        assert_eq!(stable_hash(long), stable_hash(long));
    }

    #[test]
    fn zero_allocation_never_includes() {
        let test_id = VariantTestId("t1".to_string());
        for index in 0..1_000 {
            assert!(!decide_inclusion(&format!("visitor-{index}"), &test_id, 0));
        }
        assert!(!decide_inclusion("v1", &test_id, 0));
    }

    #[test]
    fn full_allocation_always_includes() {
        let test_id = VariantTestId("t1".to_string());
        for index in 0..1_000 {
            assert!(decide_inclusion(&format!("visitor-{index}"), &test_id, 100));
        }
    }

    #[test]
    fn all_zero_weights_fall_back_to_first_variant() {
        let variants = vec![variant("a", 0, false), variant("b", 0, true)];
        let random = Scripted::new(vec![99.0]);
        assert_eq!(draw_variant(&variants, &random).map(|id| id.as_str()), Some("a"));
        assert_eq!(random.calls(), 0);
    }

    #[test]
    fn draw_walks_cumulative_weights() {
        let variants = vec![variant("a", 70, true), variant("b", 30, false)];
        assert_eq!(draw_variant(&variants, &Scripted::new(vec![0.0])).map(|id| id.as_str()), Some("a"));
        assert_eq!(draw_variant(&variants, &Scripted::new(vec![69.9])).map(|id| id.as_str()), Some("a"));
        assert_eq!(draw_variant(&variants, &Scripted::new(vec![70.1])).map(|id| id.as_str()), Some("b"));
        assert_eq!(draw_variant(&variants, &Scripted::new(vec![99.99])).map(|id| id.as_str()), Some("b"));
    }

    #[test]
    fn relative_weights_need_not_sum_to_one_hundred() {
        let variants = vec![variant("a", 10, true), variant("b", 10, false)];
        assert_eq!(draw_variant(&variants, &Scripted::new(vec![49.0])).map(|id| id.as_str()), Some("a"));
        assert_eq!(draw_variant(&variants, &Scripted::new(vec![51.0])).map(|id| id.as_str()), Some("b"));
    }

    #[test]
    fn weighted_split_approaches_seventy_thirty() {
        let variants = vec![variant("a", 70, true), variant("b", 30, false)];
        let random = SeededRandom::new(7);
        let samples = 100_000;
        let first = (0..samples)
            .filter(|_| draw_variant(&variants, &random).map(|id| id.as_str()) == Some("a"))
            .count();

        let share = first as f64 / samples as f64;
        assert!((share - 0.70).abs() < 0.02, "observed share {share}");
    }

    #[tokio::test]
    async fn excluded_visitors_get_control_and_are_not_persisted() {
        let (assigner, _, assignments) = assigner(Arc::new(Scripted::new(vec![99.0])));
        let test = running_test("t1", 0, vec![variant("control", 50, true), variant("b", 50, false)]);

        for _ in 0..3 {
            let result = assigner.assign_for_test("v1", &test).await.expect("assign");
            assert_eq!(result.variant_id.as_str(), "control");
            assert!(!result.included);
        }
        assert!(assignments.is_empty());
    }

    #[tokio::test]
    async fn excluded_visitors_get_first_variant_without_control() {
        let (assigner, _, _) = assigner(Arc::new(Scripted::new(vec![99.0])));
        let test = running_test("t1", 0, vec![variant("first", 50, false), variant("b", 50, false)]);

        let result = assigner.assign_for_test("v1", &test).await.expect("assign");
        assert_eq!(result.variant_id.as_str(), "first");
    }

    #[tokio::test]
    async fn assignments_are_sticky_after_weight_changes() {
        let random = Arc::new(Scripted::new(vec![95.0, 5.0]));
        let (assigner, _, _) = assigner(random.clone());
        let mut test = running_test("t1", 100, vec![variant("a", 50, true), variant("b", 50, false)]);

        let first = assigner.assign_for_test("returning-visitor", &test).await.expect("assign");
        assert_eq!(first.variant_id.as_str(), "b");
        assert!(first.newly_assigned);

        test.variants[0].weight = 100;
        test.variants[1].weight = 0;
        let second = assigner.assign_for_test("returning-visitor", &test).await.expect("assign");

        assert_eq!(second.variant_id.as_str(), "b");
        assert!(!second.newly_assigned);
        assert_eq!(random.calls(), 1);
    }

    #[tokio::test]
    async fn assign_returns_none_without_running_test() {
        let (assigner, tests, _) = assigner(Arc::new(Scripted::new(vec![10.0])));
        let mut draft = running_test("t-draft", 100, vec![variant("a", 100, true)]);
        draft.pause().expect("pause");
        tests.save_test(draft).await.expect("save");

        let result = assigner
            .assign("v1", &ClinicSlug("summit-mens-clinic".to_string()))
            .await
            .expect("assign");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn assign_uses_running_test_for_clinic() {
        let (assigner, tests, assignments) = assigner(Arc::new(Scripted::new(vec![10.0])));
        tests
            .save_test(running_test("t-live", 100, vec![variant("a", 50, true), variant("b", 50, false)]))
            .await
            .expect("save");

        let result = assigner
            .assign("v-42", &ClinicSlug("summit-mens-clinic".to_string()))
            .await
            .expect("assign")
            .expect("running test");

        assert_eq!(result.test_id.as_str(), "t-live");
        assert_eq!(result.variant_id.as_str(), "a");
        let stored = assignments
            .get_assignment(&VariantTestId("t-live".to_string()), "v-42")
            .await
            .expect("get");
        assert_eq!(stored, Some(VariantId("a".to_string())));
    }

    #[tokio::test]
    async fn blank_visitor_is_rejected() {
        let (assigner, _, _) = assigner(Arc::new(Scripted::new(vec![10.0])));
        let test = running_test("t1", 100, vec![variant("a", 100, true)]);
        assert!(assigner.assign_for_test("  ", &test).await.is_err());
    }

    #[tokio::test]
    async fn exposures_increment_views() {
        let (assigner, tests, _) = assigner(Arc::new(Scripted::new(vec![10.0])));
        let test_id = VariantTestId("t1".to_string());
        let variant_id = VariantId("a".to_string());
        tests
            .save_test(running_test("t1", 100, vec![variant("a", 100, true)]))
            .await
            .expect("save test");

        assigner.record_exposure(&test_id, &variant_id).await.expect("exposure");
        assigner.record_exposure(&test_id, &variant_id).await.expect("exposure");
        let unknown = assigner
            .record_exposure(&test_id, &VariantId("zz".to_string()))
            .await
            .expect_err("unknown variant");
        assert!(unknown.is_not_found());

        let counters = tests.variant_counters(&test_id).await.expect("counters");
        assert_eq!(counters.len(), 1);
        assert_eq!(counters[0].views, 2);
        assert_eq!(counters[0].conversions, 0);
    }

    #[tokio::test]
    async fn exposures_outside_a_running_test_are_rejected() {
        let (assigner, tests, _) = assigner(Arc::new(Scripted::new(vec![10.0])));
        let test_id = VariantTestId("t-paused".to_string());
        let mut paused = running_test("t-paused", 100, vec![variant("a", 100, true)]);
        paused.pause().expect("pause");
        tests.save_test(paused).await.expect("save test");

        let error = assigner
            .record_exposure(&test_id, &VariantId("a".to_string()))
            .await
            .expect_err("paused test");
        assert!(matches!(error, ApplicationError::Domain(DomainError::Validation(_))));

        let counters = tests.variant_counters(&test_id).await.expect("counters");
        assert!(counters.iter().all(|counter| counter.views == 0));
    }

    proptest! {
        #[test]
        fn inclusion_is_deterministic(visitor in "[a-zA-Z0-9-]{1,40}", test in "[a-z0-9]{1,12}", allocation in 0u8..=100) {
            let test_id = VariantTestId(test);
            let first = decide_inclusion(&visitor, &test_id, allocation);
            for _ in 0..5 {
                prop_assert_eq!(decide_inclusion(&visitor, &test_id, allocation), first);
            }
        }

        #[test]
        fn inclusion_is_monotonic_in_allocation(visitor in "[a-zA-Z0-9-]{1,40}", allocation in 0u8..100) {
            let test_id = VariantTestId("t-mono".to_string());
            if decide_inclusion(&visitor, &test_id, allocation) {
                prop_assert!(decide_inclusion(&visitor, &test_id, allocation + 1));
            }
        }
    }
}
