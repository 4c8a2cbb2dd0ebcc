//! Typed failure conditions raised through `anyhow`
//!
//! Callers that need to react to a specific condition (for example a missing
//! model artifact) can recover it with `err.downcast_ref::<PipelineError>()`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Input table lacks columns the pipeline needs
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    /// Nothing left to aggregate after cleaning
    #[error("no valid transactions after cleaning ({dropped} rows dropped)")]
    EmptyDataset { dropped: usize },

    #[error("unknown {kind} model type '{value}' (expected one of: {expected})")]
    UnknownModelType {
        kind: &'static str,
        value: String,
        expected: &'static str,
    },

    /// A feature column has no observed value at all, so it cannot be imputed
    #[error("feature column '{0}' is entirely missing")]
    AllMissingFeature(String),

    #[error(
        "feature schema mismatch: model expects [{}], got [{}]",
        expected.join(", "),
        actual.join(", ")
    )]
    SchemaMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("model artifact unavailable at {}", .0.display())]
    ModelUnavailable(PathBuf),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("invalid date '{0}'")]
    InvalidDate(String),
}

impl PipelineError {
    pub fn missing_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::MissingColumns(columns.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_problem() {
        let err = PipelineError::missing_columns(["CustomerID", "InvoiceDate"]);
        assert_eq!(
            err.to_string(),
            "missing required columns: CustomerID, InvoiceDate"
        );

        let err = PipelineError::ModelUnavailable(PathBuf::from("models/churn.json"));
        assert!(err.to_string().contains("models/churn.json"));
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = PipelineError::AllMissingFeature("Recency".into()).into();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::AllMissingFeature(col)) if col == "Recency"
        ));
    }
}
