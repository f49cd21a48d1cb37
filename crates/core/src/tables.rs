//! Fixed lookup tables shared by the tracker and the forecast engine.
//!
//! Every table has a `Default` carrying the production values; tests and the
//! configuration layer build their own instances instead of patching literals.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::clinic::Tier;
use crate::domain::conversion::ConversionType;

/// Monetary value attributed to each conversion type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionValueTable {
    values: BTreeMap<ConversionType, Decimal>,
}

impl ConversionValueTable {
    pub fn new(values: BTreeMap<ConversionType, Decimal>) -> Self {
        Self { values }
    }

    pub fn value_of(&self, conversion_type: ConversionType) -> Decimal {
        self.values.get(&conversion_type).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn with_value(mut self, conversion_type: ConversionType, value: Decimal) -> Self {
        self.values.insert(conversion_type, value);
        self
    }
}

impl Default for ConversionValueTable {
    fn default() -> Self {
        Self::new(BTreeMap::from([
            (ConversionType::Call, Decimal::from(150)),
            (ConversionType::Form, Decimal::from(100)),
            (ConversionType::CtaClick, Decimal::from(25)),
            (ConversionType::Email, Decimal::from(50)),
            (ConversionType::Booking, Decimal::from(300)),
            (ConversionType::Review, Decimal::from(75)),
        ]))
    }
}

/// Listing tiers in upgrade order, with their position score and monthly price.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TierTable {
    ladder: Vec<Tier>,
    position_scores: BTreeMap<Tier, f64>,
    monthly_prices: BTreeMap<Tier, Decimal>,
}

impl TierTable {
    pub fn new(
        ladder: Vec<Tier>,
        position_scores: BTreeMap<Tier, f64>,
        monthly_prices: BTreeMap<Tier, Decimal>,
    ) -> Self {
        Self { ladder, position_scores, monthly_prices }
    }

    /// Next rung up the ladder. The top tier maps to itself.
    pub fn next_tier(&self, current: Tier) -> Tier {
        self.ladder
            .iter()
            .position(|tier| *tier == current)
            .and_then(|index| self.ladder.get(index + 1))
            .copied()
            .unwrap_or(current)
    }

    pub fn is_top(&self, tier: Tier) -> bool {
        self.ladder.last() == Some(&tier)
    }

    pub fn position_score(&self, tier: Tier) -> f64 {
        self.position_scores.get(&tier).copied().unwrap_or(0.0)
    }

    pub fn monthly_price(&self, tier: Tier) -> Decimal {
        self.monthly_prices.get(&tier).copied().unwrap_or(Decimal::ZERO)
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::new(
            vec![Tier::Free, Tier::Basic, Tier::Premium, Tier::Enterprise],
            BTreeMap::from([
                (Tier::Free, 25.0),
                (Tier::Basic, 50.0),
                (Tier::Premium, 75.0),
                (Tier::Enterprise, 100.0),
            ]),
            BTreeMap::from([
                (Tier::Free, Decimal::ZERO),
                (Tier::Basic, Decimal::from(99)),
                (Tier::Premium, Decimal::from(249)),
                (Tier::Enterprise, Decimal::from(499)),
            ]),
        )
    }
}

/// Assumed demand multiplier per calendar month, January first, each in 0..=1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeasonalityTable {
    multipliers: [f64; 12],
}

impl SeasonalityTable {
    pub fn new(multipliers: [f64; 12]) -> Self {
        Self { multipliers }
    }

    /// `month` is 1-based. Returns the multiplier remapped from 0..=1 to -1..=1.
    pub fn factor_for_month(&self, month: u32) -> f64 {
        let index = (month.clamp(1, 12) - 1) as usize;
        let multiplier = self.multipliers[index].clamp(0.0, 1.0);
        multiplier * 2.0 - 1.0
    }
}

impl Default for SeasonalityTable {
    fn default() -> Self {
        Self::new([0.9, 0.7, 0.6, 0.5, 0.4, 0.3, 0.3, 0.3, 0.5, 0.6, 0.9, 1.0])
    }
}

/// Points awarded per completed profile element; sums to 100.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentChecklist {
    pub description: f64,
    pub services: f64,
    pub photos: f64,
    pub reviews: f64,
    pub hours: f64,
    pub phone: f64,
    pub website: f64,
    pub seo: f64,
    pub seo_threshold: u8,
}

impl Default for ContentChecklist {
    fn default() -> Self {
        Self {
            description: 20.0,
            services: 15.0,
            photos: 15.0,
            reviews: 10.0,
            hours: 10.0,
            phone: 10.0,
            website: 10.0,
            seo: 10.0,
            seo_threshold: 70,
        }
    }
}
