//! Derivation of individual forecast signals from raw activity.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::domain::clinic::{ClinicProfile, SessionRecord};
use crate::tables::ContentChecklist;

/// Engagement reported when no sessions exist in the window.
pub const NEUTRAL_ENGAGEMENT: f64 = 50.0;

const FULL_PAGES_PER_SESSION: f64 = 5.0;
const FULL_SESSION_SECS: f64 = 180.0;
const PAGES_POINTS: f64 = 40.0;
const DURATION_POINTS: f64 = 40.0;
const NON_BOUNCE_POINTS: f64 = 20.0;

/// Relative change from `previous` to `current`, clamped to -1..=1. An empty
/// previous window reads as full growth if anything happened since.
pub fn relative_change(current: f64, previous: f64) -> f64 {
    if previous <= 0.0 {
        return if current > 0.0 { 1.0 } else { 0.0 };
    }
    ((current - previous) / previous).clamp(-1.0, 1.0)
}

/// Percent change in revenue between windows. Unbounded above.
pub fn revenue_growth(current: Decimal, previous: Decimal) -> f64 {
    if previous <= Decimal::ZERO {
        return if current > Decimal::ZERO { 100.0 } else { 0.0 };
    }
    ((current - previous) / previous * Decimal::from(100)).to_f64().unwrap_or(0.0)
}

/// 0..=100 from pages per session, average duration and non-bounce share.
pub fn engagement_score(sessions: &[SessionRecord]) -> f64 {
    if sessions.is_empty() {
        return NEUTRAL_ENGAGEMENT;
    }

    let count = sessions.len() as f64;
    let pages = sessions.iter().map(|session| f64::from(session.page_views)).sum::<f64>() / count;
    let duration =
        sessions.iter().map(|session| f64::from(session.duration_secs)).sum::<f64>() / count;
    let engaged = sessions.iter().filter(|session| !session.is_bounce()).count() as f64 / count;

    (pages / FULL_PAGES_PER_SESSION).min(1.0) * PAGES_POINTS
        + (duration / FULL_SESSION_SECS).min(1.0) * DURATION_POINTS
        + engaged * NON_BOUNCE_POINTS
}

pub fn content_quality(clinic: &ClinicProfile, checklist: &ContentChecklist) -> f64 {
    let mut points = 0.0;
    if clinic.has_description() {
        points += checklist.description;
    }
    if !clinic.services.is_empty() {
        points += checklist.services;
    }
    if clinic.photo_count > 0 {
        points += checklist.photos;
    }
    if clinic.review_count > 0 {
        points += checklist.reviews;
    }
    if clinic.has_hours {
        points += checklist.hours;
    }
    if clinic.has_phone() {
        points += checklist.phone;
    }
    if clinic.has_website() {
        points += checklist.website;
    }
    if clinic.seo_score.map(|score| score > checklist.seo_threshold).unwrap_or(false) {
        points += checklist.seo;
    }
    points
}

/// Whole days since the last contact; `None` when never contacted.
pub fn contact_gap_days(last_contact: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
    last_contact.map(|at| (now - at).num_days().max(0))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::{contact_gap_days, content_quality, engagement_score, relative_change, revenue_growth};
    use crate::domain::clinic::{ClinicProfile, ClinicSlug, SessionRecord, Tier};
    use crate::domain::conversion::{DeviceClass, TrafficSource};
    use crate::tables::ContentChecklist;

    fn session(page_views: u32, duration_secs: u32) -> SessionRecord {
        SessionRecord {
            id: format!("S-{page_views}-{duration_secs}"),
            clinic_slug: ClinicSlug("ridge-clinic".to_string()),
            visitor_id: None,
            started_at: Utc::now(),
            page_views,
            duration_secs,
            device: DeviceClass::Desktop,
            browser: "chrome".to_string(),
            source: TrafficSource::Direct,
            converted: false,
            conversion_value: Decimal::ZERO,
        }
    }

    #[test]
    fn relative_change_handles_empty_baseline() {
        assert_eq!(relative_change(10.0, 0.0), 1.0);
        assert_eq!(relative_change(0.0, 0.0), 0.0);
        assert_eq!(relative_change(5.0, 10.0), -0.5);
        assert_eq!(relative_change(50.0, 10.0), 1.0);
        assert_eq!(relative_change(0.0, 10.0), -1.0);
    }

    #[test]
    fn revenue_growth_is_percent() {
        assert_eq!(revenue_growth(Decimal::from(150), Decimal::from(100)), 50.0);
        assert_eq!(revenue_growth(Decimal::from(50), Decimal::from(100)), -50.0);
        assert_eq!(revenue_growth(Decimal::from(75), Decimal::ZERO), 100.0);
        assert_eq!(revenue_growth(Decimal::ZERO, Decimal::ZERO), 0.0);
    }

    #[test]
    fn engagement_combines_three_sub_scores() {
        assert_eq!(engagement_score(&[]), 50.0);
        assert_eq!(engagement_score(&[session(5, 180), session(10, 600)]), 100.0);
        // 1 page, 90s, bounce: 8 + 20 + 0
        assert!((engagement_score(&[session(1, 90)]) - 28.0).abs() < 1e-9);
    }

    #[test]
    fn fully_populated_profile_scores_one_hundred() {
        let checklist = ContentChecklist::default();
        let mut clinic = ClinicProfile::new("ridge-clinic", "Ridge Clinic", Tier::Premium);
        assert_eq!(content_quality(&clinic, &checklist), 0.0);

        clinic.description = Some("Hormone and vitality care".to_string());
        clinic.services = vec!["trt".to_string()];
        clinic.photo_count = 4;
        clinic.review_count = 12;
        clinic.has_hours = true;
        clinic.phone = Some("555-0142".to_string());
        clinic.website = Some("https://ridge.example".to_string());
        clinic.seo_score = Some(70);
        assert_eq!(content_quality(&clinic, &checklist), 90.0);

        clinic.seo_score = Some(71);
        assert_eq!(content_quality(&clinic, &checklist), 100.0);
    }

    #[test]
    fn contact_gap_counts_whole_days() {
        let now = Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).single().expect("valid instant");
        assert_eq!(contact_gap_days(Some(now - Duration::hours(47)), now), Some(1));
        assert_eq!(contact_gap_days(None, now), None);
        assert_eq!(contact_gap_days(Some(now + Duration::days(2)), now), Some(0));
    }
}
