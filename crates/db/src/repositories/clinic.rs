use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use funnel_core::domain::clinic::{ClinicProfile, ClinicSlug, Tier};
use funnel_core::store::{ClinicDirectory, ContactStore, StoreResult};

use super::{
    decode_json, encode_json, format_timestamp, parse_label, parse_optional_timestamp, parse_u32,
    parse_u8, RepositoryError,
};
use crate::DbPool;

pub struct SqlClinicDirectory {
    pool: DbPool,
}

impl SqlClinicDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Directory records are owned elsewhere; this is the sync and seeding path.
    pub async fn upsert_clinic(&self, clinic: &ClinicProfile) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO clinics (
                slug,
                name,
                tier,
                description,
                services_json,
                photo_count,
                review_count,
                has_hours,
                phone,
                website,
                seo_score
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(slug) DO UPDATE SET
                name = excluded.name,
                tier = excluded.tier,
                description = excluded.description,
                services_json = excluded.services_json,
                photo_count = excluded.photo_count,
                review_count = excluded.review_count,
                has_hours = excluded.has_hours,
                phone = excluded.phone,
                website = excluded.website,
                seo_score = excluded.seo_score",
        )
        .bind(&clinic.slug.0)
        .bind(&clinic.name)
        .bind(clinic.tier.as_str())
        .bind(clinic.description.as_deref())
        .bind(encode_json("services_json", &clinic.services)?)
        .bind(i64::from(clinic.photo_count))
        .bind(i64::from(clinic.review_count))
        .bind(clinic.has_hours)
        .bind(clinic.phone.as_deref())
        .bind(clinic.website.as_deref())
        .bind(clinic.seo_score.map(i64::from))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ClinicDirectory for SqlClinicDirectory {
    async fn find_clinic(&self, slug: &ClinicSlug) -> StoreResult<Option<ClinicProfile>> {
        let row = sqlx::query(
            "SELECT
                slug,
                name,
                tier,
                description,
                services_json,
                photo_count,
                review_count,
                has_hours,
                phone,
                website,
                seo_score
             FROM clinics
             WHERE slug = ?",
        )
        .bind(&slug.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(row.map(clinic_from_row).transpose()?)
    }
}

fn clinic_from_row(row: SqliteRow) -> Result<ClinicProfile, RepositoryError> {
    let tier: Tier = parse_label("tier", &row.try_get::<String, _>("tier")?)?;
    let services: Vec<String> =
        decode_json("services_json", &row.try_get::<String, _>("services_json")?)?;

    Ok(ClinicProfile {
        slug: ClinicSlug(row.try_get("slug")?),
        name: row.try_get("name")?,
        tier,
        description: row.try_get("description")?,
        services,
        photo_count: parse_u32("photo_count", row.try_get("photo_count")?)?,
        review_count: parse_u32("review_count", row.try_get("review_count")?)?,
        has_hours: row.try_get("has_hours")?,
        phone: row.try_get("phone")?,
        website: row.try_get("website")?,
        seo_score: row
            .try_get::<Option<i64>, _>("seo_score")?
            .map(|score| parse_u8("seo_score", score))
            .transpose()?,
    })
}

pub struct SqlContactStore {
    pool: DbPool,
}

impl SqlContactStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn record_contact(
        &self,
        slug: &ClinicSlug,
        contacted_at: DateTime<Utc>,
        channel: &str,
        notes: Option<&str>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO crm_contacts (clinic_slug, contacted_at, channel, notes)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&slug.0)
        .bind(format_timestamp(contacted_at))
        .bind(channel)
        .bind(notes)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ContactStore for SqlContactStore {
    async fn last_contact_at(&self, slug: &ClinicSlug) -> StoreResult<Option<DateTime<Utc>>> {
        let latest = sqlx::query(
            "SELECT MAX(contacted_at) AS last_contact_at
             FROM crm_contacts
             WHERE clinic_slug = ?",
        )
        .bind(&slug.0)
        .fetch_one(&self.pool)
        .await
        .map_err(RepositoryError::from)?
        .try_get::<Option<String>, _>("last_contact_at")
        .map_err(RepositoryError::from)?;

        Ok(parse_optional_timestamp("last_contact_at", latest)?)
    }
}

#[cfg(test)]
mod tests {
    use funnel_core::domain::clinic::{ClinicProfile, ClinicSlug, Tier};
    use funnel_core::store::{ClinicDirectory, ContactStore};

    use super::{SqlClinicDirectory, SqlContactStore};
    use crate::repositories::test_support::{parse_ts, setup_pool};

    fn clinic() -> ClinicProfile {
        let mut clinic = ClinicProfile::new("harbor-dental", "Harbor Dental", Tier::Basic);
        clinic.description = Some("Family dentistry".to_string());
        clinic.services = vec!["cleaning".to_string(), "implants".to_string()];
        clinic.photo_count = 4;
        clinic.has_hours = true;
        clinic.seo_score = Some(82);
        clinic
    }

    #[tokio::test]
    async fn clinic_round_trips_and_upserts() {
        let pool = setup_pool().await;
        let directory = SqlClinicDirectory::new(pool);
        let mut profile = clinic();

        directory.upsert_clinic(&profile).await.expect("insert clinic");
        profile.tier = Tier::Premium;
        profile.phone = Some("555-0101".to_string());
        directory.upsert_clinic(&profile).await.expect("update clinic");

        let loaded = directory
            .find_clinic(&ClinicSlug("harbor-dental".to_string()))
            .await
            .expect("find clinic")
            .expect("clinic exists");
        assert_eq!(loaded, profile);
    }

    #[tokio::test]
    async fn unknown_clinic_is_none() {
        let directory = SqlClinicDirectory::new(setup_pool().await);
        let loaded =
            directory.find_clinic(&ClinicSlug("nowhere".to_string())).await.expect("find clinic");
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn last_contact_is_the_most_recent_entry() {
        let contacts = SqlContactStore::new(setup_pool().await);
        let slug = ClinicSlug("harbor-dental".to_string());

        assert_eq!(contacts.last_contact_at(&slug).await.expect("no contacts"), None);

        contacts
            .record_contact(&slug, parse_ts("2026-04-02T10:00:00Z"), "call", None)
            .await
            .expect("record contact");
        contacts
            .record_contact(&slug, parse_ts("2026-04-20T15:30:00Z"), "email", Some("sent deck"))
            .await
            .expect("record contact");
        contacts
            .record_contact(&slug, parse_ts("2026-04-11T08:00:00Z"), "call", None)
            .await
            .expect("record contact");

        assert_eq!(
            contacts.last_contact_at(&slug).await.expect("latest contact"),
            Some(parse_ts("2026-04-20T15:30:00Z"))
        );
    }
}
