//! RFM computation, quintile scoring and segment assignment
//!
//! Recency, Frequency and Monetary are aggregated per customer against a single
//! reference date, which also drives tenure. Customers keep the order in which
//! they first appear in the transactions. Each measure is cut into quintiles;
//! when tied values make the quantile edges collapse, the cut is retried on
//! first-seen ranks, which always yields five distinct edges.

use crate::data::{
    days_between, f64_values, from_millis, i64_values, max_invoice_date, str_values,
    transactions_frame, Transaction, CUSTOMER_ID, INVOICE_MS, TOTAL_PRICE,
};
use crate::error::PipelineError;
use crate::stats;
use chrono::{Duration, NaiveDateTime};
use ndarray::Array2;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::info;

pub const N_BINS: usize = 5;

/// Which end of a measure earns the top score
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreDirection {
    /// Highest value scores 5 (Frequency, Monetary)
    HigherIsBetter,
    /// Lowest value scores 5 (Recency)
    LowerIsBetter,
}

/// How a column ended up being binned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinningStrategy {
    /// Quantile edges on the raw values were distinct
    Quantile,
    /// Raw edges collapsed; cut was made on first-seen ranks instead
    RankFallback,
    /// A single customer: nothing to separate, everything lands in the lowest bin
    SingleBin,
}

#[derive(Debug, Clone)]
pub struct ScoredColumn {
    pub scores: Vec<u8>,
    pub strategy: BinningStrategy,
}

/// Quantile edges at 0, 20, 40, 60, 80 and 100 percent, or `None` when any
/// two edges coincide
pub fn quintile_edges(values: &[f64]) -> crate::Result<Option<Vec<f64>>> {
    let probs: Vec<f64> = (0..=N_BINS).map(|i| i as f64 / N_BINS as f64).collect();
    let edges = stats::quantiles(values, &probs)?;
    Ok(edges.filter(|e| e.windows(2).all(|w| w[0] < w[1])))
}

fn cut_points() -> Vec<f64> {
    (1..N_BINS).map(|i| i as f64 / N_BINS as f64).collect()
}

/// Score a column 1..=5 by quintile, falling back to ranks on degenerate edges
pub fn score_quintiles(values: &[f64], direction: ScoreDirection) -> crate::Result<ScoredColumn> {
    let (bins, strategy) = if quintile_edges(values)?.is_some() {
        (stats::qcut_bins(values, &cut_points())?, BinningStrategy::Quantile)
    } else {
        let ranks = stats::rank_ordinal(values)?;
        if quintile_edges(&ranks)?.is_some() {
            (stats::qcut_bins(&ranks, &cut_points())?, BinningStrategy::RankFallback)
        } else {
            (vec![1; values.len()], BinningStrategy::SingleBin)
        }
    };

    let scores = bins
        .into_iter()
        .map(|bin| match direction {
            ScoreDirection::HigherIsBetter => bin as u8,
            ScoreDirection::LowerIsBetter => (N_BINS + 1 - bin) as u8,
        })
        .collect();

    Ok(ScoredColumn { scores, strategy })
}

/// The three component scores, each in 1..=5
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RfmScores {
    pub r: u8,
    pub f: u8,
    pub m: u8,
}

impl RfmScores {
    pub fn new(r: u8, f: u8, m: u8) -> Self {
        Self { r, f, m }
    }

    /// Concatenation in R, F, M order, e.g. "534"
    pub fn rfm_score(&self) -> String {
        format!("{}{}{}", self.r, self.f, self.m)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Segment {
    Champions,
    Loyal,
    AtRisk,
    New,
    Others,
}

impl Segment {
    pub const ALL: [Segment; 5] = [
        Segment::Champions,
        Segment::Loyal,
        Segment::AtRisk,
        Segment::New,
        Segment::Others,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::Champions => "Champions",
            Segment::Loyal => "Loyal",
            Segment::AtRisk => "At Risk",
            Segment::New => "New",
            Segment::Others => "Others",
        }
    }

    /// First matching rule in [`SEGMENT_RULES`], otherwise `Others`
    pub fn assign(scores: &RfmScores) -> Segment {
        SEGMENT_RULES
            .iter()
            .find(|rule| (rule.matches)(scores))
            .map(|rule| rule.segment)
            .unwrap_or(Segment::Others)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Segment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Segment::ALL
            .into_iter()
            .find(|seg| seg.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("unknown segment: {}", s))
    }
}

pub struct SegmentRule {
    pub segment: Segment,
    pub matches: fn(&RfmScores) -> bool,
}

fn is_champion(s: &RfmScores) -> bool {
    s.r >= 4 && s.f >= 4 && s.m >= 4
}

fn is_loyal(s: &RfmScores) -> bool {
    s.r >= 3 && s.f >= 3 && s.m >= 3
}

fn is_at_risk(s: &RfmScores) -> bool {
    s.r <= 2 && (s.f >= 4 || s.m >= 4)
}

fn is_new(s: &RfmScores) -> bool {
    s.r >= 4 && s.f <= 2 && s.m <= 2
}

/// Evaluated top to bottom; order is significant
pub const SEGMENT_RULES: [SegmentRule; 4] = [
    SegmentRule { segment: Segment::Champions, matches: is_champion },
    SegmentRule { segment: Segment::Loyal, matches: is_loyal },
    SegmentRule { segment: Segment::AtRisk, matches: is_at_risk },
    SegmentRule { segment: Segment::New, matches: is_new },
];

/// One row of the customer feature table
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerFeatures {
    pub customer_id: String,
    /// Days from last purchase to the reference date
    pub recency: i64,
    /// Transaction count
    pub frequency: u32,
    /// Sum of transaction amounts
    pub monetary: f64,
    pub scores: RfmScores,
    pub rfm_score: String,
    pub segment: Segment,
    pub first_purchase: NaiveDateTime,
    pub last_purchase: NaiveDateTime,
    /// Days from first purchase to the reference date
    pub tenure_days: i64,
    pub avg_order_value: f64,
    pub historical_ltv: f64,
}

/// Feature rows in first-appearance order, all measured against one reference date
#[derive(Debug, Clone)]
pub struct FeatureTable {
    pub reference_date: NaiveDateTime,
    pub customers: Vec<CustomerFeatures>,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.customers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.customers.is_empty()
    }

    pub fn customer_ids(&self) -> Vec<&str> {
        self.customers.iter().map(|c| c.customer_id.as_str()).collect()
    }

    pub fn get(&self, customer_id: &str) -> Option<&CustomerFeatures> {
        self.customers.iter().find(|c| c.customer_id == customer_id)
    }

    /// Numeric column by its table name
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let pick: fn(&CustomerFeatures) -> f64 = match name {
            "Recency" | "RecencyDays" => |c| c.recency as f64,
            "Frequency" => |c| c.frequency as f64,
            "Monetary" => |c| c.monetary,
            "TenureDays" => |c| c.tenure_days as f64,
            "AvgOrderValue" => |c| c.avg_order_value,
            "HistoricalLTV" => |c| c.historical_ltv,
            "R_Score" => |c| c.scores.r as f64,
            "F_Score" => |c| c.scores.f as f64,
            "M_Score" => |c| c.scores.m as f64,
            _ => return None,
        };
        Some(self.customers.iter().map(pick).collect())
    }

    /// Row-per-customer matrix of the requested columns, in the given order
    pub fn matrix(&self, columns: &[&str]) -> crate::Result<Array2<f64>> {
        let mut x = Array2::zeros((self.len(), columns.len()));
        for (j, name) in columns.iter().enumerate() {
            let values = self
                .column(name)
                .ok_or_else(|| PipelineError::missing_columns([*name]))?;
            for (i, v) in values.into_iter().enumerate() {
                x[[i, j]] = v;
            }
        }
        Ok(x)
    }

    pub fn segment_counts(&self) -> BTreeMap<Segment, usize> {
        let mut counts = BTreeMap::new();
        for c in &self.customers {
            *counts.entry(c.segment).or_insert(0) += 1;
        }
        counts
    }

    /// Replace HistoricalLTV; customers without an entry get 0
    pub fn set_historical_ltv(&mut self, ltv: &HashMap<String, f64>) {
        for c in &mut self.customers {
            c.historical_ltv = ltv.get(&c.customer_id).copied().unwrap_or(0.0);
        }
    }
}

/// Reference date for recency and tenure: the given one, or the latest
/// transaction plus one day
pub fn resolve_reference_date(
    transactions: &[Transaction],
    reference_date: Option<NaiveDateTime>,
) -> crate::Result<NaiveDateTime> {
    match reference_date {
        Some(date) => Ok(date),
        None => max_invoice_date(transactions)
            .map(|d| d + Duration::days(1))
            .ok_or_else(|| PipelineError::EmptyDataset { dropped: 0 }.into()),
    }
}

/// Build the customer feature table: RFM, scores, segment, tenure and order value
///
/// # Arguments
/// * `transactions` - Cleaned transactions
/// * `reference_date` - Date treated as "now"; defaults to max date + 1 day
///
/// # Returns
/// * `FeatureTable` with exactly one row per distinct customer id
pub fn compute_rfm(
    transactions: &[Transaction],
    reference_date: Option<NaiveDateTime>,
) -> crate::Result<FeatureTable> {
    let reference_date = resolve_reference_date(transactions, reference_date)?;
    info!(%reference_date, "Starting RFM calculation");

    // stable grouping keeps first-appearance order for the rank tie-break
    let rfm_df = transactions_frame(transactions)?
        .lazy()
        .group_by_stable([col(CUSTOMER_ID)])
        .agg([
            col(INVOICE_MS).min().alias("FirstPurchase"),
            col(INVOICE_MS).max().alias("LastPurchase"),
            col(TOTAL_PRICE).count().alias("Frequency"),
            col(TOTAL_PRICE).sum().alias("Monetary"),
            col(TOTAL_PRICE).mean().alias("AvgOrderValue"),
        ])
        .collect()?;

    let ids = str_values(&rfm_df, CUSTOMER_ID)?;
    let first: Vec<NaiveDateTime> = i64_values(&rfm_df, "FirstPurchase")?
        .into_iter()
        .map(from_millis)
        .collect::<crate::Result<_>>()?;
    let last: Vec<NaiveDateTime> = i64_values(&rfm_df, "LastPurchase")?
        .into_iter()
        .map(from_millis)
        .collect::<crate::Result<_>>()?;
    let frequency: Vec<u32> = i64_values(&rfm_df, "Frequency")?
        .into_iter()
        .map(|n| n as u32)
        .collect();
    let monetary = f64_values(&rfm_df, "Monetary")?;
    let avg_order_value = f64_values(&rfm_df, "AvgOrderValue")?;
    let recency: Vec<i64> = last.iter().map(|&d| days_between(reference_date, d)).collect();

    let recency_values: Vec<f64> = recency.iter().map(|&d| d as f64).collect();
    let frequency_values: Vec<f64> = frequency.iter().map(|&n| n as f64).collect();
    let r = score_quintiles(&recency_values, ScoreDirection::LowerIsBetter)?;
    let f = score_quintiles(&frequency_values, ScoreDirection::HigherIsBetter)?;
    let m = score_quintiles(&monetary, ScoreDirection::HigherIsBetter)?;
    for (name, column) in [("Recency", &r), ("Frequency", &f), ("Monetary", &m)] {
        if column.strategy != BinningStrategy::Quantile {
            info!(
                column = name,
                strategy = ?column.strategy,
                "Quantile edges not unique, used fallback binning"
            );
        }
    }

    let customers: Vec<CustomerFeatures> = ids
        .into_iter()
        .enumerate()
        .map(|(i, customer_id)| {
            let scores = RfmScores::new(r.scores[i], f.scores[i], m.scores[i]);
            CustomerFeatures {
                customer_id,
                recency: recency[i],
                frequency: frequency[i],
                monetary: monetary[i],
                scores,
                rfm_score: scores.rfm_score(),
                segment: Segment::assign(&scores),
                first_purchase: first[i],
                last_purchase: last[i],
                tenure_days: days_between(reference_date, first[i]),
                avg_order_value: avg_order_value[i],
                historical_ltv: monetary[i],
            }
        })
        .collect();

    let table = FeatureTable {
        reference_date,
        customers,
    };
    info!(
        customers = table.len(),
        segments = ?table.segment_counts(),
        "RFM calculation complete"
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn tx(id: &str, when: NaiveDateTime, amount: f64) -> Transaction {
        Transaction {
            customer_id: id.to_string(),
            invoice_date: when,
            total_price: amount,
        }
    }

    #[test]
    fn test_quintiles_on_distinct_values() {
        let values: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        let scored = score_quintiles(&values, ScoreDirection::HigherIsBetter).unwrap();
        assert_eq!(scored.strategy, BinningStrategy::Quantile);
        assert_eq!(scored.scores, vec![1, 1, 2, 2, 3, 3, 4, 4, 5, 5]);

        let inverted = score_quintiles(&values, ScoreDirection::LowerIsBetter).unwrap();
        assert_eq!(inverted.scores, vec![5, 5, 4, 4, 3, 3, 2, 2, 1, 1]);
    }

    #[test]
    fn test_degenerate_edges_fall_back_to_ranks() {
        // mostly single-purchase customers: raw edges collapse
        let values = [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 2.0, 5.0, 1.0, 1.0];
        assert!(quintile_edges(&values).unwrap().is_none());

        let scored = score_quintiles(&values, ScoreDirection::HigherIsBetter).unwrap();
        assert_eq!(scored.strategy, BinningStrategy::RankFallback);
        assert_eq!(scored.scores.len(), values.len());
        assert!(scored.scores.iter().all(|s| (1..=5).contains(s)));
        // first-seen tie break: the earliest 1.0 gets the lowest score
        assert_eq!(scored.scores[0], 1);
        assert_eq!(scored.scores[7], 5);
        for score in 1..=5u8 {
            assert_eq!(scored.scores.iter().filter(|&&s| s == score).count(), 2);
        }
    }

    #[test]
    fn test_tiny_inputs_still_score() {
        let two = score_quintiles(&[3.0, 3.0], ScoreDirection::HigherIsBetter).unwrap();
        assert_eq!(two.strategy, BinningStrategy::RankFallback);
        assert_eq!(two.scores, vec![1, 5]);

        let one = score_quintiles(&[42.0], ScoreDirection::LowerIsBetter).unwrap();
        assert_eq!(one.strategy, BinningStrategy::SingleBin);
        assert_eq!(one.scores, vec![5]);

        let none = score_quintiles(&[], ScoreDirection::HigherIsBetter).unwrap();
        assert!(none.scores.is_empty());
    }

    #[test]
    fn test_segment_rules_priority() {
        assert_eq!(Segment::assign(&RfmScores::new(5, 5, 5)), Segment::Champions);
        assert_eq!(Segment::assign(&RfmScores::new(4, 4, 4)), Segment::Champions);
        assert_eq!(Segment::assign(&RfmScores::new(3, 4, 5)), Segment::Loyal);
        assert_eq!(Segment::assign(&RfmScores::new(2, 5, 1)), Segment::AtRisk);
        assert_eq!(Segment::assign(&RfmScores::new(1, 1, 4)), Segment::AtRisk);
        assert_eq!(Segment::assign(&RfmScores::new(5, 1, 2)), Segment::New);
        assert_eq!(Segment::assign(&RfmScores::new(2, 2, 2)), Segment::Others);
        assert_eq!(Segment::assign(&RfmScores::new(4, 3, 1)), Segment::Others);
    }

    #[test]
    fn test_segment_assignment_is_total_and_idempotent() {
        for r in 1..=5 {
            for f in 1..=5 {
                for m in 1..=5 {
                    let scores = RfmScores::new(r, f, m);
                    let first = Segment::assign(&scores);
                    assert_eq!(first, Segment::assign(&scores));
                    let label = scores.rfm_score();
                    assert_eq!(label.len(), 3);
                    assert_eq!(label, format!("{}{}{}", r, f, m));
                }
            }
        }
    }

    #[test]
    fn test_segment_round_trips_through_str() {
        for seg in Segment::ALL {
            assert_eq!(seg.as_str().parse::<Segment>().unwrap(), seg);
        }
        assert!("Whales".parse::<Segment>().is_err());
    }

    #[test]
    fn test_compute_rfm_one_row_per_customer() {
        let reference = date(2011, 12, 10);
        let transactions = vec![
            tx("123", date(2011, 11, 1), 100.0),
            tx("123", date(2011, 11, 20), 120.0),
            tx("123", date(2011, 11, 30), 80.0),
            tx("456", date(2011, 6, 1), 40.0),
            tx("789", date(2011, 12, 9), 15.0),
            tx("789", date(2011, 12, 1), 25.0),
        ];

        let table = compute_rfm(&transactions, Some(reference)).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.customer_ids(), vec!["123", "456", "789"]);

        let c = table.get("123").unwrap();
        assert_eq!(c.recency, 10);
        assert_eq!(c.frequency, 3);
        assert!((c.monetary - 300.0).abs() < 1e-9);
        assert!((c.avg_order_value - 100.0).abs() < 1e-9);
        assert_eq!(c.tenure_days, 39);
        assert_eq!(c.rfm_score, c.scores.rfm_score());

        for c in &table.customers {
            assert!(c.recency >= 0);
            assert!(c.tenure_days >= c.recency);
            for s in [c.scores.r, c.scores.f, c.scores.m] {
                assert!((1..=5).contains(&s));
            }
        }
    }

    #[test]
    fn test_customers_keep_first_appearance_order() {
        // "10" sorts before "9" as a string; the table must not reorder them
        let when = date(2011, 12, 1);
        let transactions = vec![tx("9", when, 25.0), tx("10", when, 25.0)];
        let table = compute_rfm(&transactions, Some(date(2011, 12, 10))).unwrap();
        assert_eq!(table.customer_ids(), vec!["9", "10"]);

        // every measure ties, so ranks decide: the customer seen first ranks lowest
        assert_eq!(table.get("9").unwrap().scores, RfmScores::new(5, 1, 1));
        assert_eq!(table.get("10").unwrap().scores, RfmScores::new(1, 5, 5));
    }

    #[test]
    fn test_default_reference_date_is_day_after_last_purchase() {
        let transactions = vec![tx("1", date(2011, 12, 9), 10.0), tx("2", date(2011, 12, 1), 5.0)];
        let table = compute_rfm(&transactions, None).unwrap();
        assert_eq!(table.reference_date, date(2011, 12, 10));
        assert_eq!(table.get("1").unwrap().recency, 1);
        assert_eq!(table.get("2").unwrap().recency, 9);
    }

    #[test]
    fn test_matrix_follows_requested_order() {
        let transactions = vec![tx("a", date(2011, 1, 1), 10.0), tx("b", date(2011, 1, 5), 30.0)];
        let table = compute_rfm(&transactions, Some(date(2011, 1, 11))).unwrap();

        let x = table.matrix(&["Monetary", "Recency"]).unwrap();
        assert_eq!(x.shape(), &[2, 2]);
        assert_eq!(x[[0, 0]], 10.0);
        assert_eq!(x[[0, 1]], 10.0);
        assert_eq!(x[[1, 1]], 6.0);

        assert!(table.matrix(&["Nope"]).is_err());
    }
}
