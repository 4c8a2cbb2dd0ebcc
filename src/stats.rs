//! Order statistics on a polars column: quantiles, ordinal ranks and quantile cuts
//!
//! Shared by RFM binning, median imputation and offer thresholds. NaN entries
//! become nulls, so every aggregate skips them.

use polars::prelude::*;

const VALUE: &str = "value";

fn value_frame(values: &[f64]) -> crate::Result<LazyFrame> {
    let column: Vec<Option<f64>> = values.iter().map(|&v| (!v.is_nan()).then_some(v)).collect();
    Ok(DataFrame::new(vec![Series::new(VALUE, column)])?.lazy())
}

/// Linear-interpolated quantiles of `values`, one per entry of `probs`
///
/// Returns `None` when no non-NaN value remains.
pub fn quantiles(values: &[f64], probs: &[f64]) -> crate::Result<Option<Vec<f64>>> {
    let exprs: Vec<Expr> = probs
        .iter()
        .enumerate()
        .map(|(i, &q)| {
            col(VALUE)
                .quantile(lit(q), QuantileInterpolOptions::Linear)
                .alias(&format!("q{}", i))
        })
        .collect();
    if exprs.is_empty() {
        return Ok(Some(Vec::new()));
    }

    let row = value_frame(values)?.select(exprs).collect()?;
    row.get_columns()
        .iter()
        .map(|c| Ok(c.cast(&DataType::Float64)?.f64()?.get(0)))
        .collect()
}

pub fn quantile(values: &[f64], q: f64) -> crate::Result<Option<f64>> {
    Ok(quantiles(values, &[q])?.map(|v| v[0]))
}

pub fn median(values: &[f64]) -> crate::Result<Option<f64>> {
    quantile(values, 0.5)
}

/// Ordinal ranks starting at 1, ties broken by first appearance
pub fn rank_ordinal(values: &[f64]) -> crate::Result<Vec<f64>> {
    let options = RankOptions {
        method: RankMethod::Ordinal,
        descending: false,
    };
    let ranked = value_frame(values)?
        .select([col(VALUE).rank(options, None).cast(DataType::Float64)])
        .collect()?;
    Ok(ranked.column(VALUE)?.f64()?.into_no_null_iter().collect())
}

/// One-based equal-frequency bin of every value, cut at the `probs` quantiles
///
/// Bins are right-closed; the first also holds everything below its edge.
/// Fails when two cut points coincide.
pub fn qcut_bins(values: &[f64], probs: &[f64]) -> crate::Result<Vec<usize>> {
    let labels: Vec<String> = (1..=probs.len() + 1).map(|b| b.to_string()).collect();
    let binned = value_frame(values)?
        .select([col(VALUE)
            .qcut(probs.to_vec(), Some(labels), false, false, false)
            .cast(DataType::String)])
        .collect()?;

    binned
        .column(VALUE)?
        .str()?
        .into_iter()
        .map(|label| {
            label
                .and_then(|l| l.parse().ok())
                .ok_or_else(|| anyhow::anyhow!("value fell outside every quantile bin"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantile_interpolates() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&values, 0.0).unwrap(), Some(1.0));
        assert_eq!(quantile(&values, 1.0).unwrap(), Some(4.0));
        assert_eq!(quantile(&values, 0.5).unwrap(), Some(2.5));
        assert!((quantile(&values, 0.9).unwrap().unwrap() - 3.7).abs() < 1e-12);

        let edges = quantiles(&values, &[0.25, 0.75]).unwrap().unwrap();
        assert!((edges[0] - 1.75).abs() < 1e-12);
        assert!((edges[1] - 3.25).abs() < 1e-12);
    }

    #[test]
    fn test_quantile_skips_nan() {
        assert_eq!(median(&[f64::NAN, 5.0, 1.0]).unwrap(), Some(3.0));
        assert_eq!(median(&[f64::NAN]).unwrap(), None);
        assert_eq!(median(&[]).unwrap(), None);
    }

    #[test]
    fn test_rank_ordinal_keeps_first_seen_order() {
        let ranks = rank_ordinal(&[3.0, 1.0, 3.0, 2.0]).unwrap();
        assert_eq!(ranks, vec![3.0, 1.0, 4.0, 2.0]);
    }

    #[test]
    fn test_qcut_bins_right_closed() {
        let values: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        let bins = qcut_bins(&values, &[0.2, 0.4, 0.6, 0.8]).unwrap();
        assert_eq!(bins, vec![1, 1, 2, 2, 3, 3, 4, 4, 5, 5]);

        // collapsed cut points are an error, not silently merged bins
        assert!(qcut_bins(&[1.0, 1.0, 1.0, 1.0, 2.0], &[0.2, 0.4, 0.6, 0.8]).is_err());
    }
}
