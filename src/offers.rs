//! Rule-based offer recommendation and the campaign cost rollup

use crate::data::{f64_values, i64_values, str_values};
use crate::pipeline::ScoredCustomer;
use crate::rfm::Segment;
use crate::stats;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// Share of targeted customers assumed to convert
pub const CONVERSION_RATE: f64 = 0.10;

/// Unit cost for an offer missing from the cost table
pub const DEFAULT_UNIT_COST: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Offer {
    VipEarlyAccess,
    LoyaltyMultiplier,
    LoyalWinBack,
    ReferralBonus,
    HighValueWinBack,
    ReEngagement,
    WelcomeSecondPurchase,
    NextOrderDiscount,
    FlashSalePreview,
    Newsletter,
}

impl Offer {
    pub const ALL: [Offer; 10] = [
        Offer::VipEarlyAccess,
        Offer::LoyaltyMultiplier,
        Offer::LoyalWinBack,
        Offer::ReferralBonus,
        Offer::HighValueWinBack,
        Offer::ReEngagement,
        Offer::WelcomeSecondPurchase,
        Offer::NextOrderDiscount,
        Offer::FlashSalePreview,
        Offer::Newsletter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Offer::VipEarlyAccess => "VIP exclusive event invitation + early access to new products",
            Offer::LoyaltyMultiplier => "Loyalty points multiplier (2x for next month)",
            Offer::LoyalWinBack => "Personalized 'we miss you' discount (15% off)",
            Offer::ReferralBonus => "Referral bonus: give $10, get $10",
            Offer::HighValueWinBack => "High-value at-risk: 25% off next purchase + free shipping",
            Offer::ReEngagement => "Re-engagement email with 20% off",
            Offer::WelcomeSecondPurchase => "Welcome series: 10% off second purchase",
            Offer::NextOrderDiscount => "We miss you! 15% off your next order",
            Offer::FlashSalePreview => "Flash sale preview (24h early access)",
            Offer::Newsletter => "Standard monthly newsletter with personalized recommendations",
        }
    }

    /// Estimated cost per targeted customer
    pub fn unit_cost(&self) -> f64 {
        match self {
            Offer::VipEarlyAccess => 50.0,
            Offer::LoyaltyMultiplier => 5.0,
            Offer::LoyalWinBack => 8.0,
            Offer::ReferralBonus => 10.0,
            Offer::HighValueWinBack => 20.0,
            Offer::ReEngagement => 6.0,
            Offer::WelcomeSecondPurchase => 4.0,
            Offer::NextOrderDiscount => 7.0,
            Offer::FlashSalePreview => 2.0,
            Offer::Newsletter => 1.0,
        }
    }
}

impl fmt::Display for Offer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Offer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Offer::ALL
            .into_iter()
            .find(|o| o.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown offer: {}", s))
    }
}

/// Cost for an offer given by its text, `DEFAULT_UNIT_COST` when unknown
pub fn unit_cost(offer: &str) -> f64 {
    Offer::ALL
        .iter()
        .find(|o| o.as_str() == offer)
        .map_or(DEFAULT_UNIT_COST, Offer::unit_cost)
}

/// Dataset-wide HistoricalLTV cut points, computed once per run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LtvThresholds {
    pub p90: f64,
    pub median: f64,
}

impl LtvThresholds {
    pub fn from_historical(values: &[f64]) -> crate::Result<Self> {
        Ok(Self {
            p90: stats::quantile(values, 0.9)?.unwrap_or(0.0),
            median: stats::median(values)?.unwrap_or(0.0),
        })
    }
}

/// Inputs the offer rules look at for one customer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OfferContext {
    pub segment: Segment,
    pub churn_prob: f64,
    pub historical_ltv: f64,
    pub predicted_ltv: f64,
}

pub struct OfferRule {
    pub segment: Segment,
    pub condition: fn(&OfferContext, &LtvThresholds) -> bool,
    pub offer: Offer,
}

fn always(_: &OfferContext, _: &LtvThresholds) -> bool {
    true
}

fn above_p90(c: &OfferContext, t: &LtvThresholds) -> bool {
    c.historical_ltv > t.p90
}

fn above_median(c: &OfferContext, t: &LtvThresholds) -> bool {
    c.historical_ltv > t.median
}

fn likely_churn(c: &OfferContext, _: &LtvThresholds) -> bool {
    c.churn_prob > 0.5
}

fn very_likely_churn(c: &OfferContext, _: &LtvThresholds) -> bool {
    c.churn_prob > 0.7
}

/// Evaluated top to bottom; the first rule for the customer's segment whose
/// condition holds decides the offer
pub const OFFER_RULES: [OfferRule; 10] = [
    OfferRule {
        segment: Segment::Champions,
        condition: above_p90,
        offer: Offer::VipEarlyAccess,
    },
    OfferRule {
        segment: Segment::Champions,
        condition: always,
        offer: Offer::LoyaltyMultiplier,
    },
    OfferRule {
        segment: Segment::Loyal,
        condition: likely_churn,
        offer: Offer::LoyalWinBack,
    },
    OfferRule {
        segment: Segment::Loyal,
        condition: always,
        offer: Offer::ReferralBonus,
    },
    OfferRule {
        segment: Segment::AtRisk,
        condition: above_median,
        offer: Offer::HighValueWinBack,
    },
    OfferRule {
        segment: Segment::AtRisk,
        condition: always,
        offer: Offer::ReEngagement,
    },
    OfferRule {
        segment: Segment::New,
        condition: always,
        offer: Offer::WelcomeSecondPurchase,
    },
    OfferRule {
        segment: Segment::Others,
        condition: very_likely_churn,
        offer: Offer::NextOrderDiscount,
    },
    OfferRule {
        segment: Segment::Others,
        condition: above_median,
        offer: Offer::FlashSalePreview,
    },
    OfferRule {
        segment: Segment::Others,
        condition: always,
        offer: Offer::Newsletter,
    },
];

/// Pick the offer for one customer
pub fn recommend(context: &OfferContext, thresholds: &LtvThresholds) -> Offer {
    OFFER_RULES
        .iter()
        .find(|rule| rule.segment == context.segment && (rule.condition)(context, thresholds))
        .map_or(Offer::Newsletter, |rule| rule.offer)
}

/// One line of the campaign summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignRow {
    pub offer: Offer,
    pub customer_count: usize,
    pub avg_predicted_ltv: f64,
    pub total_historical_ltv: f64,
    pub cost_per_customer: f64,
    pub total_cost: f64,
    pub expected_revenue: f64,
}

/// Group customers by offer and attach cost and expected revenue
///
/// Expected revenue assumes `CONVERSION_RATE` of each group converts at its
/// mean predicted LTV. Rows follow the order in which offers first appear.
pub fn campaign_summary(customers: &[ScoredCustomer]) -> crate::Result<Vec<CampaignRow>> {
    let df = DataFrame::new(vec![
        Series::new(
            "RecommendedOffer",
            customers.iter().map(|c| c.offer.as_str()).collect::<Vec<_>>(),
        ),
        Series::new(
            "PredictedLTV",
            customers.iter().map(|c| c.predicted_ltv).collect::<Vec<_>>(),
        ),
        Series::new(
            "HistoricalLTV",
            customers.iter().map(|c| c.features.historical_ltv).collect::<Vec<_>>(),
        ),
    ])?;

    let summary = df
        .lazy()
        .group_by_stable([col("RecommendedOffer")])
        .agg([
            col("PredictedLTV").count().alias("CustomerCount"),
            col("PredictedLTV").mean().alias("AvgLTV"),
            col("HistoricalLTV").sum().alias("TotalHistoricalLTV"),
        ])
        .with_column(
            (col("CustomerCount").cast(DataType::Float64) * col("AvgLTV") * lit(CONVERSION_RATE))
                .alias("ExpectedRevenue"),
        )
        .collect()?;

    let offers = str_values(&summary, "RecommendedOffer")?;
    let counts = i64_values(&summary, "CustomerCount")?;
    let avg_ltv = f64_values(&summary, "AvgLTV")?;
    let historical = f64_values(&summary, "TotalHistoricalLTV")?;
    let revenue = f64_values(&summary, "ExpectedRevenue")?;

    let mut rows = Vec::with_capacity(offers.len());
    for (i, offer) in offers.iter().enumerate() {
        let cost_per_customer = unit_cost(offer);
        let customer_count = counts[i] as usize;
        rows.push(CampaignRow {
            offer: offer.parse()?,
            customer_count,
            avg_predicted_ltv: avg_ltv[i],
            total_historical_ltv: historical[i],
            cost_per_customer,
            total_cost: customer_count as f64 * cost_per_customer,
            expected_revenue: revenue[i],
        });
        info!(%offer, customers = customer_count, "Offer distribution");
    }
    Ok(rows)
}
