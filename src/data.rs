//! Transaction loading, cleaning and table output using Polars

use crate::error::PipelineError;
use crate::offers::CampaignRow;
use crate::pipeline::ScoredCustomer;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use tracing::{info, warn};

pub const CUSTOMER_ID: &str = "CustomerID";
pub const INVOICE_DATE: &str = "InvoiceDate";
pub const TOTAL_PRICE: &str = "TotalPrice";
pub const QUANTITY: &str = "Quantity";
pub const UNIT_PRICE: &str = "UnitPrice";
/// Invoice time as epoch milliseconds, the form aggregations work on
pub const INVOICE_MS: &str = "InvoiceMs";

const DATE_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %H:%M:%S",
];

/// A cleaned transaction: known customer, parsed date, positive amount
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub customer_id: String,
    pub invoice_date: NaiveDateTime,
    pub total_price: f64,
}

/// Where the per-row amount comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountSource {
    TotalPrice,
    QuantityTimesUnitPrice,
}

/// Verify the recognized columns are present before any row is touched
pub fn check_schema<S: AsRef<str>>(columns: &[S]) -> crate::Result<AmountSource> {
    let has = |name: &str| columns.iter().any(|c| c.as_ref() == name);

    let mut missing: Vec<&str> = [CUSTOMER_ID, INVOICE_DATE]
        .into_iter()
        .filter(|c| !has(c))
        .collect();

    let source = if has(TOTAL_PRICE) {
        AmountSource::TotalPrice
    } else {
        missing.extend([QUANTITY, UNIT_PRICE].into_iter().filter(|c| !has(c)));
        AmountSource::QuantityTimesUnitPrice
    };

    if !missing.is_empty() {
        return Err(PipelineError::missing_columns(missing).into());
    }
    Ok(source)
}

/// Load a transaction CSV and return cleaned transactions
///
/// # Arguments
/// * `file_path` - Path to the CSV file
///
/// # Returns
/// * Transactions with a customer id, parsed date and positive total price
pub fn load_transactions<P: AsRef<Path>>(file_path: P) -> crate::Result<Vec<Transaction>> {
    let df = read_csv(file_path.as_ref())?;
    let source = check_schema(&df.get_column_names())?;

    info!(rows = df.height(), path = %file_path.as_ref().display(), "Loaded transaction table");
    clean_transactions(df, source)
}

/// Drop rows that cannot take part in aggregation
///
/// Missing ids or dates and non-positive amounts are filtered in the lazy
/// frame; ids and dates that fail to parse are dropped afterwards.
pub fn clean_transactions(df: DataFrame, source: AmountSource) -> crate::Result<Vec<Transaction>> {
    let total = df.height();
    let names = df.get_column_names();
    let has_line_amounts = names.contains(&QUANTITY) && names.contains(&UNIT_PRICE);

    let amount = match source {
        AmountSource::TotalPrice => col(TOTAL_PRICE).cast(DataType::Float64),
        AmountSource::QuantityTimesUnitPrice => {
            col(QUANTITY).cast(DataType::Float64) * col(UNIT_PRICE).cast(DataType::Float64)
        }
    };
    let mut valid = col(CUSTOMER_ID)
        .is_not_null()
        .and(col(INVOICE_DATE).is_not_null())
        .and(col(TOTAL_PRICE).is_not_nan())
        .and(col(TOTAL_PRICE).gt(lit(0.0)));
    if has_line_amounts {
        valid = valid
            .and(col(QUANTITY).cast(DataType::Float64).gt(lit(0.0)))
            .and(col(UNIT_PRICE).cast(DataType::Float64).gt(lit(0.0)));
    }

    let filtered = df
        .lazy()
        .with_column(amount.alias(TOTAL_PRICE))
        .filter(valid)
        .select([
            col(CUSTOMER_ID).cast(DataType::String),
            col(INVOICE_DATE).cast(DataType::String),
            col(TOTAL_PRICE),
        ])
        .collect()?;

    let ids = filtered.column(CUSTOMER_ID)?.str()?;
    let dates = filtered.column(INVOICE_DATE)?.str()?;
    let amounts = filtered.column(TOTAL_PRICE)?.f64()?;
    let transactions: Vec<Transaction> = ids
        .into_iter()
        .zip(dates)
        .zip(amounts)
        .filter_map(|((id, date), amount)| {
            Some(Transaction {
                customer_id: normalize_customer_id(id?)?,
                invoice_date: parse_invoice_date(date?)?,
                total_price: amount?,
            })
        })
        .collect();

    let dropped = total - transactions.len();
    if dropped > 0 {
        warn!(dropped, kept = transactions.len(), "Dropped invalid transaction rows");
    }
    if transactions.is_empty() {
        return Err(PipelineError::EmptyDataset { dropped }.into());
    }
    Ok(transactions)
}

/// Cleaned transactions as a frame of `CustomerID`, `InvoiceMs`, `TotalPrice`,
/// in input order
pub fn transactions_frame(transactions: &[Transaction]) -> crate::Result<DataFrame> {
    let df = DataFrame::new(vec![
        Series::new(
            CUSTOMER_ID,
            transactions.iter().map(|t| t.customer_id.as_str()).collect::<Vec<_>>(),
        ),
        Series::new(
            INVOICE_MS,
            transactions.iter().map(|t| to_millis(t.invoice_date)).collect::<Vec<_>>(),
        ),
        Series::new(
            TOTAL_PRICE,
            transactions.iter().map(|t| t.total_price).collect::<Vec<_>>(),
        ),
    ])?;
    Ok(df)
}

pub fn to_millis(date: NaiveDateTime) -> i64 {
    date.and_utc().timestamp_millis()
}

pub fn from_millis(millis: i64) -> crate::Result<NaiveDateTime> {
    DateTime::from_timestamp_millis(millis)
        .map(|d| d.naive_utc())
        .ok_or_else(|| anyhow::anyhow!("timestamp out of range: {}", millis))
}

/// Trim an identifier and collapse float renderings like `17850.0` to `17850`
pub fn normalize_customer_id(raw: &str) -> Option<String> {
    let id = raw.trim();
    if id.is_empty() || id.eq_ignore_ascii_case("nan") || id.eq_ignore_ascii_case("null") {
        return None;
    }
    match id.strip_suffix(".0") {
        Some(int) if !int.is_empty() && int.chars().all(|c| c.is_ascii_digit()) => {
            Some(int.to_string())
        }
        _ => Some(id.to_string()),
    }
}

pub fn parse_invoice_date(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    let s = s.trim_end_matches('Z');
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Parse a reference date given on the command line or in config
pub fn parse_reference_date(raw: &str) -> crate::Result<NaiveDateTime> {
    parse_invoice_date(raw).ok_or_else(|| PipelineError::InvalidDate(raw.to_string()).into())
}

pub fn max_invoice_date(transactions: &[Transaction]) -> Option<NaiveDateTime> {
    transactions.iter().map(|t| t.invoice_date).max()
}

/// Whole days from `earlier` to `later`, floored like a calendar-day delta
pub fn days_between(later: NaiveDateTime, earlier: NaiveDateTime) -> i64 {
    (later - earlier).num_seconds().div_euclid(Duration::days(1).num_seconds())
}

/// Load an externally computed future-LTV target keyed by customer id
pub fn load_ltv_targets<P: AsRef<Path>>(
    file_path: P,
    target_column: &str,
) -> crate::Result<HashMap<String, f64>> {
    let df = read_csv(file_path.as_ref())?;
    let names = df.get_column_names();
    let missing: Vec<&str> = [CUSTOMER_ID, target_column]
        .into_iter()
        .filter(|c| !names.contains(c))
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::missing_columns(missing).into());
    }

    let ids = string_column(&df, CUSTOMER_ID)?;
    let values = float_column(&df, target_column)?;
    let targets: HashMap<String, f64> = ids
        .into_iter()
        .zip(values)
        .filter_map(|(id, v)| Some((normalize_customer_id(id.as_deref()?)?, v?)))
        .collect();

    info!(customers = targets.len(), "Loaded LTV targets");
    Ok(targets)
}

/// Write the final customer table consumed by the dashboard
pub fn write_customer_table<P: AsRef<Path>>(
    file_path: P,
    customers: &[ScoredCustomer],
) -> crate::Result<()> {
    let fmt_date = |d: NaiveDateTime| d.format("%Y-%m-%d %H:%M:%S").to_string();

    let mut df = DataFrame::new(vec![
        Series::new(
            CUSTOMER_ID,
            customers.iter().map(|c| c.features.customer_id.as_str()).collect::<Vec<_>>(),
        ),
        Series::new("Recency", customers.iter().map(|c| c.features.recency).collect::<Vec<_>>()),
        Series::new(
            "Frequency",
            customers.iter().map(|c| c.features.frequency as i64).collect::<Vec<_>>(),
        ),
        Series::new("Monetary", customers.iter().map(|c| c.features.monetary).collect::<Vec<_>>()),
        Series::new(
            "R_Score",
            customers.iter().map(|c| c.features.scores.r as i64).collect::<Vec<_>>(),
        ),
        Series::new(
            "F_Score",
            customers.iter().map(|c| c.features.scores.f as i64).collect::<Vec<_>>(),
        ),
        Series::new(
            "M_Score",
            customers.iter().map(|c| c.features.scores.m as i64).collect::<Vec<_>>(),
        ),
        Series::new(
            "RFM_Score",
            customers.iter().map(|c| c.features.rfm_score.as_str()).collect::<Vec<_>>(),
        ),
        Series::new(
            "Segment",
            customers.iter().map(|c| c.features.segment.as_str()).collect::<Vec<_>>(),
        ),
        Series::new(
            "FirstPurchase",
            customers.iter().map(|c| fmt_date(c.features.first_purchase)).collect::<Vec<_>>(),
        ),
        Series::new(
            "LastPurchase",
            customers.iter().map(|c| fmt_date(c.features.last_purchase)).collect::<Vec<_>>(),
        ),
        Series::new(
            "TenureDays",
            customers.iter().map(|c| c.features.tenure_days).collect::<Vec<_>>(),
        ),
        Series::new(
            "AvgOrderValue",
            customers.iter().map(|c| c.features.avg_order_value).collect::<Vec<_>>(),
        ),
        Series::new(
            "HistoricalLTV",
            customers.iter().map(|c| c.features.historical_ltv).collect::<Vec<_>>(),
        ),
        Series::new(
            "Churn",
            customers.iter().map(|c| c.churn_label as i64).collect::<Vec<_>>(),
        ),
        Series::new("ChurnProb", customers.iter().map(|c| c.churn_prob).collect::<Vec<_>>()),
        Series::new(
            "PredictedLTV_Next6Months",
            customers.iter().map(|c| c.predicted_ltv).collect::<Vec<_>>(),
        ),
        Series::new(
            "RecommendedOffer",
            customers.iter().map(|c| c.offer.as_str()).collect::<Vec<_>>(),
        ),
    ])?;

    let mut file = File::create(file_path.as_ref())?;
    CsvWriter::new(&mut file).include_header(true).finish(&mut df)?;
    info!(rows = customers.len(), path = %file_path.as_ref().display(), "Wrote customer table");
    Ok(())
}

/// Write the per-offer campaign rollup
pub fn write_campaign_summary<P: AsRef<Path>>(
    file_path: P,
    rows: &[CampaignRow],
) -> crate::Result<()> {
    let mut df = DataFrame::new(vec![
        Series::new(
            "RecommendedOffer",
            rows.iter().map(|r| r.offer.as_str()).collect::<Vec<_>>(),
        ),
        Series::new(
            "CustomerCount",
            rows.iter().map(|r| r.customer_count as i64).collect::<Vec<_>>(),
        ),
        Series::new("AvgLTV", rows.iter().map(|r| r.avg_predicted_ltv).collect::<Vec<_>>()),
        Series::new(
            "TotalHistoricalLTV",
            rows.iter().map(|r| r.total_historical_ltv).collect::<Vec<_>>(),
        ),
        Series::new(
            "EstimatedCostPerCustomer",
            rows.iter().map(|r| r.cost_per_customer).collect::<Vec<_>>(),
        ),
        Series::new("TotalCost", rows.iter().map(|r| r.total_cost).collect::<Vec<_>>()),
        Series::new(
            "ExpectedRevenue",
            rows.iter().map(|r| r.expected_revenue).collect::<Vec<_>>(),
        ),
    ])?;

    let mut file = File::create(file_path.as_ref())?;
    CsvWriter::new(&mut file).include_header(true).finish(&mut df)?;
    Ok(())
}

fn read_csv(path: &Path) -> crate::Result<DataFrame> {
    let df = LazyCsvReader::new(path)
        .with_has_header(true)
        .with_infer_schema_length(Some(10_000))
        .finish()?
        .collect()?;
    Ok(df)
}

fn string_column(df: &DataFrame, name: &str) -> crate::Result<Vec<Option<String>>> {
    let series = df.column(name)?.cast(&DataType::String)?;
    let values = series
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_owned))
        .collect();
    Ok(values)
}

fn float_column(df: &DataFrame, name: &str) -> crate::Result<Vec<Option<f64>>> {
    let series = df.column(name)?.cast(&DataType::Float64)?;
    let values = series.f64()?.into_iter().collect();
    Ok(values)
}

/// Non-null values of an aggregated column
pub(crate) fn str_values(df: &DataFrame, name: &str) -> crate::Result<Vec<String>> {
    let values = df
        .column(name)?
        .str()?
        .into_no_null_iter()
        .map(str::to_owned)
        .collect();
    Ok(values)
}

pub(crate) fn i64_values(df: &DataFrame, name: &str) -> crate::Result<Vec<i64>> {
    let series = df.column(name)?.cast(&DataType::Int64)?;
    let values = series.i64()?.into_no_null_iter().collect();
    Ok(values)
}

pub(crate) fn f64_values(df: &DataFrame, name: &str) -> crate::Result<Vec<f64>> {
    let series = df.column(name)?.cast(&DataType::Float64)?;
    let values = series.f64()?.into_no_null_iter().collect();
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_csv() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "InvoiceNo,StockCode,Description,Quantity,InvoiceDate,UnitPrice,CustomerID,Country").unwrap();
        writeln!(file, "536365,85123A,WHITE HANGING HEART T-LIGHT HOLDER,6,2010-12-01T08:26:00Z,2.55,17850,United Kingdom").unwrap();
        writeln!(file, "536365,71053,WHITE METAL LANTERN,6,2010-12-01T08:26:00Z,3.39,17850,United Kingdom").unwrap();
        writeln!(file, "536366,22633,HAND WARMER UNION JACK,6,2010-12-01T08:28:00Z,1.85,17850,United Kingdom").unwrap();
        writeln!(file, "536367,84406B,CREAM CUPID HEARTS COAT HANGER,8,2010-12-01T08:34:00Z,2.75,13047,United Kingdom").unwrap();
        writeln!(file, "C536379,D,Discount,-1,2010-12-01T09:41:00Z,27.50,14527,United Kingdom").unwrap();
        writeln!(file, "536380,22961,JAM MAKING SET PRINTED,24,2010-12-01T09:41:00Z,1.45,,United Kingdom").unwrap();
        writeln!(file, "536381,22139,RETROSPOT TEA SET,3,not-a-date,4.95,15311,United Kingdom").unwrap();
        file
    }

    #[test]
    fn test_load_transactions() {
        let test_file = create_test_csv();
        let transactions = load_transactions(test_file.path()).unwrap();

        assert_eq!(transactions.len(), 4);
        assert!(transactions.iter().all(|t| t.total_price > 0.0));
        assert_eq!(transactions[0].customer_id, "17850");
        assert!((transactions[0].total_price - 6.0 * 2.55).abs() < 1e-9);
    }

    #[test]
    fn test_missing_columns_fail_fast() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "CustomerID,Quantity").unwrap();
        writeln!(file, "17850,6").unwrap();

        let err = load_transactions(file.path()).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::MissingColumns(cols)) => {
                assert!(cols.iter().any(|c| c == INVOICE_DATE));
                assert!(cols.iter().any(|c| c == UNIT_PRICE));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_check_schema_prefers_total_price() {
        assert_eq!(
            check_schema(&["CustomerID", "InvoiceDate", "TotalPrice"]).unwrap(),
            AmountSource::TotalPrice
        );
        assert_eq!(
            check_schema(&["CustomerID", "InvoiceDate", "Quantity", "UnitPrice"]).unwrap(),
            AmountSource::QuantityTimesUnitPrice
        );
        assert!(check_schema(&["CustomerID", "InvoiceDate"]).is_err());
    }

    #[test]
    fn test_clean_transactions_drops_invalid_rows() {
        let df = df!(
            CUSTOMER_ID => &[Some("1"), None, Some("2"), Some("3"), Some("4.0")],
            INVOICE_DATE => &["2011-01-01", "2011-01-01", "2011-01-01", "yesterday", "2011-01-02"],
            TOTAL_PRICE => &[10.0, 10.0, 0.0, 5.0, 2.5]
        )
        .unwrap();
        let cleaned = clean_transactions(df, AmountSource::TotalPrice).unwrap();
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[0].customer_id, "1");
        assert_eq!(cleaned[1].customer_id, "4");

        let df = df!(
            CUSTOMER_ID => &[None::<&str>],
            INVOICE_DATE => &["2011-01-01"],
            TOTAL_PRICE => &[1.0]
        )
        .unwrap();
        let err = clean_transactions(df, AmountSource::TotalPrice).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::EmptyDataset { dropped: 1 })
        ));
    }

    #[test]
    fn test_clean_transactions_computes_line_amounts() {
        let df = df!(
            CUSTOMER_ID => &[17850i64, 17850, 13047],
            INVOICE_DATE => &["2010-12-01 08:26:00", "2010-12-01 08:28:00", "2010-12-01 08:34:00"],
            QUANTITY => &[6i64, -2, 8],
            UNIT_PRICE => &[2.55, 3.39, 2.75]
        )
        .unwrap();
        let cleaned = clean_transactions(df, AmountSource::QuantityTimesUnitPrice).unwrap();
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[1].customer_id, "13047");
        assert!((cleaned[1].total_price - 22.0).abs() < 1e-9);
    }

    #[test]
    fn test_transactions_frame_keeps_input_order() {
        let when = parse_invoice_date("2011-03-04 05:06:07").unwrap();
        let transactions = vec![
            Transaction { customer_id: "9".to_string(), invoice_date: when, total_price: 1.5 },
            Transaction { customer_id: "10".to_string(), invoice_date: when, total_price: 2.5 },
        ];
        let df = transactions_frame(&transactions).unwrap();
        assert_eq!(str_values(&df, CUSTOMER_ID).unwrap(), vec!["9", "10"]);
        assert_eq!(f64_values(&df, TOTAL_PRICE).unwrap(), vec![1.5, 2.5]);
        let millis = i64_values(&df, INVOICE_MS).unwrap();
        assert_eq!(from_millis(millis[0]).unwrap(), when);
    }

    #[test]
    fn test_parse_invoice_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2010, 12, 1)
            .unwrap()
            .and_hms_opt(8, 26, 0)
            .unwrap();
        assert_eq!(parse_invoice_date("2010-12-01T08:26:00Z"), Some(expected));
        assert_eq!(parse_invoice_date("2010-12-01 08:26:00"), Some(expected));
        assert_eq!(parse_invoice_date("12/01/2010 08:26"), Some(expected));
        assert!(parse_invoice_date("2010-12-01").is_some());
        assert!(parse_invoice_date("garbage").is_none());
    }

    #[test]
    fn test_normalize_customer_id() {
        assert_eq!(normalize_customer_id(" 17850.0 "), Some("17850".to_string()));
        assert_eq!(normalize_customer_id("A-17"), Some("A-17".to_string()));
        assert_eq!(normalize_customer_id("NaN"), None);
        assert_eq!(normalize_customer_id(""), None);
    }

    #[test]
    fn test_days_between_floors() {
        let d = |s: &str| parse_invoice_date(s).unwrap();
        assert_eq!(days_between(d("2011-01-11 00:00"), d("2011-01-01 12:00")), 9);
        assert_eq!(days_between(d("2011-01-01 00:00"), d("2011-01-01 12:00")), -1);
    }

    #[test]
    fn test_load_ltv_targets() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "CustomerID,FutureLTV").unwrap();
        writeln!(file, "17850,120.5").unwrap();
        writeln!(file, "13047,").unwrap();

        let targets = load_ltv_targets(file.path(), "FutureLTV").unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets.get("17850"), Some(&120.5));
    }
}
