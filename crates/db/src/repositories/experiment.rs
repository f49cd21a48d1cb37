use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use funnel_core::domain::clinic::ClinicSlug;
use funnel_core::domain::experiment::{
    TestStatus, Variant, VariantCounter, VariantCounters, VariantId, VariantResult, VariantTest,
    VariantTestId,
};
use funnel_core::store::{AssignmentStore, StoreResult, VariantTestStore};

use super::{
    decode_json, encode_json, format_timestamp, parse_optional_timestamp, parse_serde_label,
    parse_timestamp, parse_u32, parse_u64, parse_u8, serde_label, RepositoryError,
};
use crate::DbPool;

const TEST_COLUMNS: &str = "id,
                clinic_slug,
                name,
                description,
                status,
                variants_json,
                traffic_allocation,
                target_sample_size,
                confidence_level,
                primary_metric,
                results_json,
                created_at,
                started_at,
                ended_at";

pub struct SqlVariantTestStore {
    pool: DbPool,
}

impl SqlVariantTestStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VariantTestStore for SqlVariantTestStore {
    async fn save_test(&self, test: VariantTest) -> StoreResult<()> {
        let variants_json = encode_json("variants_json", &test.variants)?;
        let results_json =
            test.results.as_ref().map(|results| encode_json("results_json", results)).transpose()?;
        let primary_metric = serde_label("primary_metric", &test.primary_metric)?;

        sqlx::query(
            "INSERT INTO variant_tests (
                id,
                clinic_slug,
                name,
                description,
                status,
                variants_json,
                traffic_allocation,
                target_sample_size,
                confidence_level,
                primary_metric,
                results_json,
                created_at,
                started_at,
                ended_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                status = excluded.status,
                variants_json = excluded.variants_json,
                traffic_allocation = excluded.traffic_allocation,
                target_sample_size = excluded.target_sample_size,
                confidence_level = excluded.confidence_level,
                primary_metric = excluded.primary_metric,
                results_json = excluded.results_json,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at",
        )
        .bind(&test.id.0)
        .bind(&test.clinic_slug.0)
        .bind(&test.name)
        .bind(test.description.as_deref())
        .bind(test.status.as_str())
        .bind(variants_json)
        .bind(i64::from(test.traffic_allocation))
        .bind(i64::from(test.target_sample_size))
        .bind(test.confidence_level)
        .bind(primary_metric)
        .bind(results_json)
        .bind(format_timestamp(test.created_at))
        .bind(test.started_at.map(format_timestamp))
        .bind(test.ended_at.map(format_timestamp))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(())
    }

    async fn find_test(&self, id: &VariantTestId) -> StoreResult<Option<VariantTest>> {
        let row = sqlx::query(&format!("SELECT {TEST_COLUMNS} FROM variant_tests WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        Ok(row.map(test_from_row).transpose()?)
    }

    async fn find_running_test(&self, slug: &ClinicSlug) -> StoreResult<Option<VariantTest>> {
        let row = sqlx::query(&format!(
            "SELECT {TEST_COLUMNS}
             FROM variant_tests
             WHERE clinic_slug = ? AND status = ?
             ORDER BY started_at DESC, id DESC
             LIMIT 1"
        ))
        .bind(&slug.0)
        .bind(TestStatus::Running.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(row.map(test_from_row).transpose()?)
    }

    async fn increment_variant_counter(
        &self,
        test_id: &VariantTestId,
        variant_id: &VariantId,
        counter: VariantCounter,
    ) -> StoreResult<()> {
        let (views, conversions) = match counter {
            VariantCounter::Views => (1_i64, 0_i64),
            VariantCounter::Conversions => (0, 1),
        };

        sqlx::query(
            "INSERT INTO variant_results (test_id, variant_id, views, conversions)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(test_id, variant_id) DO UPDATE SET
                views = views + excluded.views,
                conversions = conversions + excluded.conversions",
        )
        .bind(&test_id.0)
        .bind(&variant_id.0)
        .bind(views)
        .bind(conversions)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(())
    }

    async fn variant_counters(&self, test_id: &VariantTestId) -> StoreResult<Vec<VariantCounters>> {
        let rows = sqlx::query(
            "SELECT variant_id, views, conversions
             FROM variant_results
             WHERE test_id = ?
             ORDER BY variant_id ASC",
        )
        .bind(&test_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.into_iter().map(counters_from_row).collect::<Result<Vec<_>, _>>()?)
    }
}

fn test_from_row(row: SqliteRow) -> Result<VariantTest, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = TestStatus::parse(&status_raw).map_err(|error| {
        RepositoryError::Decode(format!("unknown variant test status `{status_raw}` ({error})"))
    })?;
    let variants: Vec<Variant> =
        decode_json("variants_json", &row.try_get::<String, _>("variants_json")?)?;
    let results: Option<Vec<VariantResult>> = row
        .try_get::<Option<String>, _>("results_json")?
        .map(|raw| decode_json("results_json", &raw))
        .transpose()?;

    Ok(VariantTest {
        id: VariantTestId(row.try_get("id")?),
        clinic_slug: ClinicSlug(row.try_get("clinic_slug")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        status,
        variants,
        traffic_allocation: parse_u8("traffic_allocation", row.try_get("traffic_allocation")?)?,
        target_sample_size: parse_u32("target_sample_size", row.try_get("target_sample_size")?)?,
        confidence_level: row.try_get("confidence_level")?,
        primary_metric: parse_serde_label("primary_metric", row.try_get("primary_metric")?)?,
        results,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        started_at: parse_optional_timestamp("started_at", row.try_get("started_at")?)?,
        ended_at: parse_optional_timestamp("ended_at", row.try_get("ended_at")?)?,
    })
}

fn counters_from_row(row: SqliteRow) -> Result<VariantCounters, RepositoryError> {
    Ok(VariantCounters {
        variant_id: VariantId(row.try_get("variant_id")?),
        views: parse_u64("views", row.try_get("views")?)?,
        conversions: parse_u64("conversions", row.try_get("conversions")?)?,
    })
}

pub struct SqlAssignmentStore {
    pool: DbPool,
}

impl SqlAssignmentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AssignmentStore for SqlAssignmentStore {
    async fn get_assignment(
        &self,
        test_id: &VariantTestId,
        visitor_id: &str,
    ) -> StoreResult<Option<VariantId>> {
        let variant = sqlx::query(
            "SELECT variant_id
             FROM variant_assignments
             WHERE test_id = ? AND visitor_id = ?",
        )
        .bind(&test_id.0)
        .bind(visitor_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?
        .map(|row| row.try_get::<String, _>("variant_id"))
        .transpose()
        .map_err(RepositoryError::from)?;

        Ok(variant.map(VariantId))
    }

    async fn save_assignment(
        &self,
        test_id: &VariantTestId,
        visitor_id: &str,
        variant_id: &VariantId,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO variant_assignments (test_id, visitor_id, variant_id, assigned_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(test_id, visitor_id) DO UPDATE SET
                variant_id = excluded.variant_id,
                assigned_at = excluded.assigned_at",
        )
        .bind(&test_id.0)
        .bind(visitor_id)
        .bind(&variant_id.0)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use funnel_core::domain::clinic::ClinicSlug;
    use funnel_core::domain::experiment::{
        NewVariantTest, PrimaryMetric, TestStatus, Variant, VariantCounter, VariantId,
        VariantResult, VariantTest, VariantTestId,
    };
    use funnel_core::store::{AssignmentStore, VariantTestStore};

    use super::{SqlAssignmentStore, SqlVariantTestStore};
    use crate::repositories::test_support::{parse_ts, setup_pool};

    fn draft(id: &str) -> VariantTest {
        let input = NewVariantTest {
            clinic_slug: ClinicSlug("harbor-dental".to_string()),
            name: "Booking button colour".to_string(),
            description: None,
            variants: vec![
                Variant {
                    id: VariantId("blue".to_string()),
                    name: "Blue".to_string(),
                    content: json!({ "color": "#1d4ed8" }),
                    weight: 50,
                    is_control: true,
                },
                Variant {
                    id: VariantId("green".to_string()),
                    name: "Green".to_string(),
                    content: json!({ "color": "#15803d" }),
                    weight: 50,
                    is_control: false,
                },
            ],
            traffic_allocation: 80,
            target_sample_size: 500,
            confidence_level: 0.95,
            primary_metric: PrimaryMetric::Bookings,
        };
        VariantTest::create(VariantTestId(id.to_string()), input, parse_ts("2026-03-01T09:00:00Z"))
            .expect("valid test definition")
    }

    #[tokio::test]
    async fn test_definition_and_results_round_trip() {
        let store = SqlVariantTestStore::new(setup_pool().await);
        let mut test = draft("T-1");
        store.save_test(test.clone()).await.expect("save draft");

        test.status = TestStatus::Completed;
        test.started_at = Some(parse_ts("2026-03-02T09:00:00Z"));
        test.ended_at = Some(parse_ts("2026-03-20T09:00:00Z"));
        test.results = Some(vec![VariantResult {
            variant_id: VariantId("green".to_string()),
            views: 250,
            conversions: 30,
            conversion_rate: 12.0,
            confidence: 0.97,
            is_winner: true,
        }]);
        store.save_test(test.clone()).await.expect("save completed");

        let loaded = store
            .find_test(&VariantTestId("T-1".to_string()))
            .await
            .expect("find test")
            .expect("test exists");
        assert_eq!(loaded, test);
    }

    #[tokio::test]
    async fn running_lookup_prefers_latest_start() {
        let store = SqlVariantTestStore::new(setup_pool().await);
        let slug = ClinicSlug("harbor-dental".to_string());
        assert!(store.find_running_test(&slug).await.expect("lookup").is_none());

        let mut older = draft("T-older");
        older.status = TestStatus::Running;
        older.started_at = Some(parse_ts("2026-03-02T09:00:00Z"));
        let mut newer = draft("T-newer");
        newer.status = TestStatus::Running;
        newer.started_at = Some(parse_ts("2026-03-05T09:00:00Z"));
        let mut paused = draft("T-paused");
        paused.status = TestStatus::Paused;
        paused.started_at = Some(parse_ts("2026-03-09T09:00:00Z"));

        for test in [older, newer, paused] {
            store.save_test(test).await.expect("save");
        }

        let running = store.find_running_test(&slug).await.expect("lookup").expect("running");
        assert_eq!(running.id.as_str(), "T-newer");
    }

    #[tokio::test]
    async fn counters_increment_per_variant() {
        let store = SqlVariantTestStore::new(setup_pool().await);
        store.save_test(draft("T-1")).await.expect("save");
        let test_id = VariantTestId("T-1".to_string());
        let blue = VariantId("blue".to_string());
        let green = VariantId("green".to_string());

        for _ in 0..3 {
            store
                .increment_variant_counter(&test_id, &blue, VariantCounter::Views)
                .await
                .expect("view");
        }
        store
            .increment_variant_counter(&test_id, &blue, VariantCounter::Conversions)
            .await
            .expect("conversion");
        store
            .increment_variant_counter(&test_id, &green, VariantCounter::Views)
            .await
            .expect("view");

        let counters = store.variant_counters(&test_id).await.expect("counters");
        assert_eq!(counters.len(), 2);
        let summary: Vec<_> = counters
            .iter()
            .map(|counter| (counter.variant_id.as_str(), counter.views, counter.conversions))
            .collect();
        assert_eq!(summary, vec![("blue", 3, 1), ("green", 1, 0)]);
    }

    #[tokio::test]
    async fn assignments_are_sticky_until_overwritten() {
        let pool = setup_pool().await;
        SqlVariantTestStore::new(pool.clone()).save_test(draft("T-1")).await.expect("save");
        let store = SqlAssignmentStore::new(pool);
        let test_id = VariantTestId("T-1".to_string());

        assert_eq!(store.get_assignment(&test_id, "visitor-7").await.expect("get"), None);
        for variant in ["blue", "green"] {
            store
                .save_assignment(&test_id, "visitor-7", &VariantId(variant.to_string()))
                .await
                .expect("save assignment");
        }

        assert_eq!(
            store.get_assignment(&test_id, "visitor-7").await.expect("get"),
            Some(VariantId("green".to_string()))
        );
    }
}
