//! Ordered threshold rules that turn factors into recommended actions.
//!
//! Rules run in declaration order and the list is truncated after
//! de-duplication, so the order below is observable in reports.

use crate::domain::clinic::Tier;
use crate::domain::forecast::ForecastFactors;

pub const MAX_RECOMMENDATIONS: usize = 4;

pub struct RecommendationContext<'a> {
    pub factors: &'a ForecastFactors,
    pub score: u8,
    pub target_tier: Tier,
    pub at_top_tier: bool,
    pub contact_gap_days: i64,
}

struct Rule {
    applies: fn(&RecommendationContext<'_>) -> bool,
    action: fn(&RecommendationContext<'_>) -> String,
}

const RULES: &[Rule] = &[
    Rule {
        applies: |ctx| ctx.factors.traffic_trend < 0.0,
        action: |_| "Improve SEO: traffic is declining against the previous 30 days".to_string(),
    },
    Rule {
        applies: |ctx| ctx.factors.engagement_score < 50.0,
        action: |_| "Refresh listing content to lift visitor engagement".to_string(),
    },
    Rule {
        applies: |ctx| ctx.factors.revenue_growth < 0.0,
        action: |_| "Review lead value with the clinic: attributed revenue is down".to_string(),
    },
    Rule {
        applies: |ctx| match ctx.factors.contact_frequency_days {
            Some(days) => days > ctx.contact_gap_days,
            None => true,
        },
        action: |_| "Schedule a follow-up call with the clinic".to_string(),
    },
    Rule {
        applies: |ctx| ctx.factors.conversion_trend < 0.0,
        action: |_| "Run an A/B test on the listing's calls to action".to_string(),
    },
    Rule {
        applies: |ctx| ctx.factors.content_quality < 70.0,
        action: |_| "Complete the profile: photos, services, hours and contact details".to_string(),
    },
    Rule {
        applies: |ctx| ctx.factors.seasonality > 0.5,
        action: |_| "Time the offer for the current high-demand season".to_string(),
    },
    Rule { applies: |_| true, action: score_message },
];

fn score_message(ctx: &RecommendationContext<'_>) -> String {
    if ctx.at_top_tier {
        return "Focus on retention: secure the enterprise renewal".to_string();
    }
    let target = ctx.target_tier.as_str();
    if ctx.score >= 80 {
        format!("Present the {target} upgrade now")
    } else if ctx.score >= 60 {
        format!("Nurture toward {target} with a tailored demo")
    } else {
        format!("Build value before pitching {target}")
    }
}

pub fn recommend(ctx: &RecommendationContext<'_>) -> Vec<String> {
    let mut actions: Vec<String> = Vec::with_capacity(MAX_RECOMMENDATIONS);
    for rule in RULES {
        if actions.len() == MAX_RECOMMENDATIONS {
            break;
        }
        if (rule.applies)(ctx) {
            let action = (rule.action)(ctx);
            if !actions.contains(&action) {
                actions.push(action);
            }
        }
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::{recommend, RecommendationContext, MAX_RECOMMENDATIONS};
    use crate::domain::clinic::Tier;
    use crate::domain::forecast::ForecastFactors;

    fn healthy() -> ForecastFactors {
        ForecastFactors {
            traffic_trend: 0.2,
            engagement_score: 70.0,
            revenue_growth: 10.0,
            competitor_activity: 50.0,
            seasonality: 0.0,
            contact_frequency_days: Some(3),
            conversion_trend: 0.1,
            content_quality: 90.0,
            tier_position: 50.0,
        }
    }

    fn context(factors: &ForecastFactors, score: u8) -> RecommendationContext<'_> {
        RecommendationContext {
            factors,
            score,
            target_tier: Tier::Premium,
            at_top_tier: false,
            contact_gap_days: 14,
        }
    }

    #[test]
    fn healthy_clinic_only_gets_score_message() {
        let factors = healthy();
        assert_eq!(recommend(&context(&factors, 85)), vec!["Present the premium upgrade now"]);
        assert_eq!(
            recommend(&context(&factors, 65)),
            vec!["Nurture toward premium with a tailored demo"]
        );
    }

    #[test]
    fn rules_keep_declaration_order_and_cap_at_four() {
        let factors = ForecastFactors {
            traffic_trend: -0.3,
            engagement_score: 20.0,
            revenue_growth: -5.0,
            contact_frequency_days: None,
            conversion_trend: -0.2,
            content_quality: 40.0,
            seasonality: 0.8,
            ..healthy()
        };
        let actions = recommend(&context(&factors, 30));

        assert_eq!(actions.len(), MAX_RECOMMENDATIONS);
        assert!(actions[0].starts_with("Improve SEO"));
        assert!(actions[1].starts_with("Refresh listing content"));
        assert!(actions[2].starts_with("Review lead value"));
        assert_eq!(actions[3], "Schedule a follow-up call with the clinic");
    }

    #[test]
    fn contact_gap_threshold_is_exclusive() {
        let mut factors = healthy();
        factors.contact_frequency_days = Some(14);
        assert_eq!(recommend(&context(&factors, 50)).len(), 1);

        factors.contact_frequency_days = Some(15);
        let actions = recommend(&context(&factors, 50));
        assert_eq!(actions[0], "Schedule a follow-up call with the clinic");
    }

    #[test]
    fn top_tier_switches_to_retention_wording() {
        let factors = healthy();
        let ctx = RecommendationContext {
            target_tier: Tier::Enterprise,
            at_top_tier: true,
            ..context(&factors, 90)
        };
        assert_eq!(recommend(&ctx), vec!["Focus on retention: secure the enterprise renewal"]);
    }
}
