//! Churn labels from an inactivity window
//!
//! These are training labels only; inference-time churn probability comes from
//! the fitted classifier in [`crate::model`].

use crate::data::{
    days_between, from_millis, max_invoice_date, transactions_frame, Transaction, CUSTOMER_ID,
    INVOICE_MS,
};
use crate::error::PipelineError;
use crate::rfm::FeatureTable;
use chrono::NaiveDateTime;
use polars::prelude::*;
use tracing::info;

pub const DEFAULT_CHURN_WINDOW_DAYS: i64 = 90;

/// Labels aligned with a feature table's customer order
#[derive(Debug, Clone, PartialEq)]
pub struct ChurnLabels {
    pub reference_date: NaiveDateTime,
    pub window_days: i64,
    /// Days since last purchase per customer, sentinel `window_days + 1` when unseen
    pub days_since_last: Vec<i64>,
    /// 1 = churned, 0 = active
    pub labels: Vec<u8>,
}

impl ChurnLabels {
    pub fn churned_count(&self) -> usize {
        self.labels.iter().filter(|&&l| l == 1).count()
    }

    pub fn active_count(&self) -> usize {
        self.labels.len() - self.churned_count()
    }
}

/// Label each customer of `features` as churned when inactive longer than `window_days`
///
/// # Arguments
/// * `transactions` - Transactions used to find each customer's last purchase
/// * `features` - Defines the customer universe and row order
/// * `window_days` - Inactivity threshold
/// * `reference_date` - Date treated as "now"; defaults to the latest transaction date
pub fn label_churn(
    transactions: &[Transaction],
    features: &FeatureTable,
    window_days: i64,
    reference_date: Option<NaiveDateTime>,
) -> crate::Result<ChurnLabels> {
    let reference_date = match reference_date {
        Some(date) => date,
        None => max_invoice_date(transactions)
            .ok_or(PipelineError::EmptyDataset { dropped: 0 })?,
    };

    let last_purchase = transactions_frame(transactions)?
        .lazy()
        .group_by([col(CUSTOMER_ID)])
        .agg([col(INVOICE_MS).max().alias("LastPurchase")]);

    // left join keeps the feature table's row order; unseen customers get null
    let universe = DataFrame::new(vec![Series::new(CUSTOMER_ID, features.customer_ids())])?;
    let joined = universe
        .lazy()
        .left_join(last_purchase, col(CUSTOMER_ID), col(CUSTOMER_ID))
        .collect()?;

    let days_since_last: Vec<i64> = joined
        .column("LastPurchase")?
        .cast(&DataType::Int64)?
        .i64()?
        .into_iter()
        .map(|last| -> crate::Result<i64> {
            match last {
                Some(millis) => Ok(days_between(reference_date, from_millis(millis)?)),
                None => Ok(window_days + 1),
            }
        })
        .collect::<crate::Result<_>>()?;

    let labels = days_since_last
        .iter()
        .map(|&days| is_churned(days, window_days) as u8)
        .collect();

    let result = ChurnLabels {
        reference_date,
        window_days,
        days_since_last,
        labels,
    };
    info!(
        churned = result.churned_count(),
        active = result.active_count(),
        window_days,
        "Churn label distribution"
    );
    Ok(result)
}

pub fn is_churned(days_since_last: i64, window_days: i64) -> bool {
    days_since_last > window_days
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfm::compute_rfm;
    use chrono::{Duration, NaiveDate};

    fn date(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn tx(id: &str, when: NaiveDateTime) -> Transaction {
        Transaction {
            customer_id: id.to_string(),
            invoice_date: when,
            total_price: 10.0,
        }
    }

    #[test]
    fn test_window_threshold() {
        assert!(is_churned(200, 90));
        assert!(is_churned(91, 90));
        assert!(!is_churned(90, 90));
        assert!(!is_churned(0, 90));
    }

    #[test]
    fn test_labels_align_with_feature_table() {
        let reference = date(2011, 12, 9);
        let transactions = vec![
            tx("a", reference - Duration::days(200)),
            tx("b", reference - Duration::days(10)),
            tx("b", reference - Duration::days(300)),
            tx("c", reference),
        ];
        let features = compute_rfm(&transactions, None).unwrap();

        let labels = label_churn(&transactions, &features, 90, None).unwrap();
        assert_eq!(labels.reference_date, reference);
        assert_eq!(labels.days_since_last, vec![200, 10, 0]);
        assert_eq!(labels.labels, vec![1, 0, 0]);
        assert_eq!(labels.churned_count(), 1);
    }

    #[test]
    fn test_customer_without_transactions_is_churned() {
        let reference = date(2011, 12, 9);
        let all = vec![tx("a", reference), tx("ghost", reference - Duration::days(5))];
        let features = compute_rfm(&all, None).unwrap();

        // the ghost customer stays in the universe but has no history in this window
        let recent_only = vec![tx("a", reference)];
        let labels = label_churn(&recent_only, &features, 90, Some(reference)).unwrap();
        assert_eq!(labels.days_since_last, vec![0, 91]);
        assert_eq!(labels.labels, vec![0, 1]);
    }
}
