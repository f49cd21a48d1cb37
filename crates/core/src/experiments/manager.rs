use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::results::evaluate_results;
use crate::clock::Clock;
use crate::domain::experiment::{
    NewVariantTest, TestStatus, VariantResult, VariantTest, VariantTestId,
};
use crate::errors::{AppResult, DomainError};
use crate::store::VariantTestStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestAction {
    Start,
    Pause,
    Resume,
    Complete,
}

impl FromStr for TestAction {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "complete" => Ok(Self::Complete),
            other => Err(DomainError::validation(format!(
                "unknown test action `{other}` (expected start|pause|resume|complete)"
            ))),
        }
    }
}

/// Creates variant tests and applies lifecycle transitions.
pub struct ExperimentManager {
    tests: Arc<dyn VariantTestStore>,
    clock: Arc<dyn Clock>,
}

impl ExperimentManager {
    pub fn new(tests: Arc<dyn VariantTestStore>, clock: Arc<dyn Clock>) -> Self {
        Self { tests, clock }
    }

    pub async fn create_test(&self, input: NewVariantTest) -> AppResult<VariantTest> {
        let id = VariantTestId(format!("T-{}", Uuid::new_v4().simple()));
        let test = VariantTest::create(id, input, self.clock.now())?;
        self.tests.save_test(test.clone()).await?;

        info!(
            event_name = "experiment.test.created",
            clinic_slug = %test.clinic_slug,
            test_id = %test.id,
            variants = test.variants.len(),
            "variant test created in draft"
        );
        Ok(test)
    }

    pub async fn transition(
        &self,
        test_id: &VariantTestId,
        action: TestAction,
    ) -> AppResult<VariantTest> {
        let mut test = self.load(test_id).await?;
        let from = test.status;
        let now = self.clock.now();

        match action {
            TestAction::Start => test.start(now)?,
            TestAction::Pause => test.pause()?,
            TestAction::Resume => test.resume()?,
            TestAction::Complete => {
                let counters = self.tests.variant_counters(test_id).await?;
                let results = evaluate_results(&test, &counters);
                test.complete(now, results)?;
            }
        }

        self.tests.save_test(test.clone()).await?;
        info!(
            event_name = "experiment.test.transitioned",
            clinic_slug = %test.clinic_slug,
            test_id = %test.id,
            from = from.as_str(),
            to = test.status.as_str(),
            "variant test status changed"
        );
        Ok(test)
    }

    /// Live results for a test in any state.
    /// Live evaluation, or the snapshot stored when the test completed.
    pub async fn results(&self, test_id: &VariantTestId) -> AppResult<Vec<VariantResult>> {
        let test = self.load(test_id).await?;
        if let (TestStatus::Completed, Some(snapshot)) = (test.status, &test.results) {
            return Ok(snapshot.clone());
        }
        let counters = self.tests.variant_counters(test_id).await?;
        Ok(evaluate_results(&test, &counters))
    }

    async fn load(&self, test_id: &VariantTestId) -> AppResult<VariantTest> {
        self.tests
            .find_test(test_id)
            .await?
            .ok_or_else(|| DomainError::not_found("variant test", test_id.as_str()).into())
    }
}
