//! Evaluation metrics for the churn classifier and the LTV regressor

use linfa::dataset::Pr;
use linfa::prelude::{BinaryClassification, SingleTargetRegression, ToConfusionMatrix};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Per-class precision/recall/F1 plus accuracy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub negative: ClassMetrics,
    pub positive: ClassMetrics,
    pub accuracy: f64,
}

// undefined ratios (no predictions of a class) report as 0
fn or_zero(value: f32) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value as f64
    }
}

/// Metrics for `class`, scored one-vs-rest with `class` as the `true` label,
/// plus the overall accuracy
fn class_metrics(truth: &[u8], predicted: &[u8], class: u8) -> crate::Result<(ClassMetrics, f64)> {
    let truth: Array1<bool> = truth.iter().map(|&t| t == class).collect();
    let predicted: Array1<bool> = predicted.iter().map(|&p| p == class).collect();
    let cm = predicted.confusion_matrix(&truth)?;

    let metrics = ClassMetrics {
        precision: or_zero(cm.precision()),
        recall: or_zero(cm.recall()),
        f1: or_zero(cm.f1_score()),
        support: truth.iter().filter(|&&t| t).count(),
    };
    Ok((metrics, or_zero(cm.accuracy())))
}

impl ClassificationReport {
    pub fn new(truth: &[u8], predicted: &[u8]) -> crate::Result<Self> {
        if truth.len() != predicted.len() {
            anyhow::bail!("{} labels but {} predictions", truth.len(), predicted.len());
        }
        let (negative, _) = class_metrics(truth, predicted, 0)?;
        let (positive, accuracy) = class_metrics(truth, predicted, 1)?;
        Ok(Self {
            negative,
            positive,
            accuracy,
        })
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>10} {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        for (label, m) in [("0", &self.negative), ("1", &self.positive)] {
            writeln!(
                f,
                "{:>10} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                label, m.precision, m.recall, m.f1, m.support
            )?;
        }
        write!(
            f,
            "{:>10} {:>29.2} {:>9}",
            "accuracy",
            self.accuracy,
            self.negative.support + self.positive.support
        )
    }
}

/// Area under the ROC curve of `scores` against labels 1 = positive
///
/// `None` when either class is absent.
pub fn roc_auc(truth: &[u8], scores: &[f64]) -> crate::Result<Option<f64>> {
    let labels: Vec<bool> = truth.iter().map(|&t| t == 1).collect();
    let positives = labels.iter().filter(|&&l| l).count();
    if positives == 0 || positives == labels.len() {
        return Ok(None);
    }

    let probabilities: Array1<Pr> = scores.iter().map(|&p| Pr::new(p as f32)).collect();
    let roc = probabilities.roc(labels.as_slice())?;
    Ok(Some(roc.area_under_curve() as f64))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub mae: f64,
    pub rmse: f64,
    pub r2: f64,
}

impl RegressionMetrics {
    pub fn new(truth: &Array1<f64>, predicted: &Array1<f64>) -> crate::Result<Self> {
        let mae = predicted.mean_absolute_error(truth)?;
        let mse = predicted.mean_squared_error(truth)?;
        let r2 = predicted.r2(truth)?;
        Ok(Self {
            mae,
            rmse: mse.sqrt(),
            r2,
        })
    }
}

impl fmt::Display for RegressionMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MAE: {:.2}, RMSE: {:.2}, R2: {:.4}", self.mae, self.rmse, self.r2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_classification_report() {
        let truth = [0, 0, 0, 1, 1, 1];
        let predicted = [0, 0, 1, 1, 1, 0];
        let report = ClassificationReport::new(&truth, &predicted).unwrap();

        assert!((report.positive.precision - 2.0 / 3.0).abs() < 1e-6);
        assert!((report.positive.recall - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(report.negative.support, 3);
        assert_eq!(report.positive.support, 3);
        assert!((report.accuracy - 4.0 / 6.0).abs() < 1e-6);
        assert!(report.to_string().contains("accuracy"));
    }

    #[test]
    fn test_classification_report_uneven_classes() {
        // 4 negatives, 2 positives; one positive missed, no false alarms
        let truth = [0, 0, 0, 0, 1, 1];
        let predicted = [0, 0, 0, 0, 1, 0];
        let report = ClassificationReport::new(&truth, &predicted).unwrap();

        assert!((report.positive.precision - 1.0).abs() < 1e-6);
        assert!((report.positive.recall - 0.5).abs() < 1e-6);
        assert!((report.negative.precision - 0.8).abs() < 1e-6);
        assert!((report.negative.recall - 1.0).abs() < 1e-6);
        assert_eq!(report.negative.support, 4);
        assert!(ClassificationReport::new(&truth, &predicted[..3]).is_err());
    }

    #[test]
    fn test_roc_auc() {
        let auc = |truth: &[u8], scores: &[f64]| roc_auc(truth, scores).unwrap();
        assert!((auc(&[0, 0, 1, 1], &[0.1, 0.2, 0.8, 0.9]).unwrap() - 1.0).abs() < 1e-6);
        assert!(auc(&[0, 0, 1, 1], &[0.9, 0.8, 0.2, 0.1]).unwrap().abs() < 1e-6);
        assert!((auc(&[0, 1, 1, 0], &[0.1, 0.4, 0.35, 0.8]).unwrap() - 0.5).abs() < 1e-6);
        assert_eq!(auc(&[1, 1], &[0.1, 0.2]), None);
    }

    #[test]
    fn test_regression_metrics() {
        let truth = array![3.0, -0.5, 2.0, 7.0];
        let predicted = array![2.5, 0.0, 2.0, 8.0];
        let m = RegressionMetrics::new(&truth, &predicted).unwrap();
        assert!((m.mae - 0.5).abs() < 1e-9);
        assert!((m.rmse - 0.375f64.sqrt()).abs() < 1e-9);
        assert!((m.r2 - 0.948_608_137).abs() < 1e-6);
    }
}
