//! Tree learners over ndarray: weighted CART, bagged random forest and
//! Newton gradient boosting with log-loss
//!
//! One regression tree serves every model here. For 0/1 targets the weighted
//! variance reduction it optimizes is proportional to the Gini decrease, and the
//! leaf mean is the positive-class probability. Boosting fits the same tree to
//! Newton steps by weighting each sample with its hessian.

use crate::error::PipelineError;
use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

const MIN_GAIN: f64 = 1e-12;
const MIN_HESSIAN: f64 = 1e-6;
const PROB_CLIP: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TreeParams {
    /// `None` grows until leaves are pure or too small
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Features drawn per split; `None` uses all of them
    pub max_features: Option<usize>,
    /// L2 penalty added to each leaf's weight sum
    pub lambda: f64,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
            lambda: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct NodeStats {
    count: usize,
    sum_w: f64,
    sum_wy: f64,
    sum_wy2: f64,
}

impl NodeStats {
    fn push(&mut self, y: f64, w: f64) {
        self.count += 1;
        self.sum_w += w;
        self.sum_wy += w * y;
        self.sum_wy2 += w * y * y;
    }

    fn minus(&self, other: &NodeStats) -> NodeStats {
        NodeStats {
            count: self.count - other.count,
            sum_w: self.sum_w - other.sum_w,
            sum_wy: self.sum_wy - other.sum_wy,
            sum_wy2: self.sum_wy2 - other.sum_wy2,
        }
    }

    fn score(&self, lambda: f64) -> f64 {
        let denom = self.sum_w + lambda;
        if denom > 0.0 {
            self.sum_wy * self.sum_wy / denom
        } else {
            0.0
        }
    }

    fn leaf_value(&self, lambda: f64) -> f64 {
        let denom = self.sum_w + lambda;
        if denom > 0.0 {
            self.sum_wy / denom
        } else {
            0.0
        }
    }

    fn is_pure(&self) -> bool {
        if self.sum_w <= 0.0 {
            return true;
        }
        let sse = self.sum_wy2 - self.sum_wy * self.sum_wy / self.sum_w;
        sse <= MIN_GAIN * self.sum_w.max(1.0)
    }
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

/// Binary regression tree with weighted squared-error splits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
    n_features: usize,
}

struct TreeBuilder<'a> {
    x: ArrayView2<'a, f64>,
    y: &'a [f64],
    weights: &'a [f64],
    params: &'a TreeParams,
    nodes: Vec<Node>,
    importances: Vec<f64>,
}

impl<'a> TreeBuilder<'a> {
    fn build(&mut self, samples: Vec<usize>, depth: usize, rng: &mut StdRng) -> usize {
        let mut stats = NodeStats::default();
        for &s in &samples {
            stats.push(self.y[s], self.weights[s]);
        }

        let index = self.nodes.len();
        self.nodes.push(Node::Leaf {
            value: stats.leaf_value(self.params.lambda),
        });

        let depth_reached = self.params.max_depth.is_some_and(|d| depth >= d);
        if depth_reached
            || samples.len() < self.params.min_samples_split
            || samples.len() < 2 * self.params.min_samples_leaf
            || stats.is_pure()
        {
            return index;
        }

        let Some(split) = self.best_split(&samples, &stats, rng) else {
            return index;
        };

        self.importances[split.feature] += split.gain;
        let (left_samples, right_samples): (Vec<usize>, Vec<usize>) = samples
            .into_iter()
            .partition(|&s| self.x[[s, split.feature]] <= split.threshold);

        let left = self.build(left_samples, depth + 1, rng);
        let right = self.build(right_samples, depth + 1, rng);
        self.nodes[index] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        index
    }

    fn best_split(
        &self,
        samples: &[usize],
        parent: &NodeStats,
        rng: &mut StdRng,
    ) -> Option<SplitCandidate> {
        let n_features = self.x.ncols();
        let mut features: Vec<usize> = (0..n_features).collect();
        if let Some(k) = self.params.max_features.filter(|&k| k < n_features) {
            features.shuffle(rng);
            features.truncate(k.max(1));
            features.sort_unstable();
        }

        let lambda = self.params.lambda;
        let min_leaf = self.params.min_samples_leaf.max(1);
        let parent_score = parent.score(lambda);
        let mut best: Option<SplitCandidate> = None;

        for feature in features {
            let mut order = samples.to_vec();
            order.sort_by(|&a, &b| {
                self.x[[a, feature]]
                    .partial_cmp(&self.x[[b, feature]])
                    .unwrap_or(Ordering::Equal)
            });

            let mut left = NodeStats::default();
            for k in 0..order.len() - 1 {
                let s = order[k];
                left.push(self.y[s], self.weights[s]);

                let here = self.x[[s, feature]];
                let next = self.x[[order[k + 1], feature]];
                if here >= next {
                    continue;
                }
                let right = parent.minus(&left);
                if left.count < min_leaf || right.count < min_leaf {
                    continue;
                }

                let gain = left.score(lambda) + right.score(lambda) - parent_score;
                if gain > MIN_GAIN && best.as_ref().map_or(true, |b| gain > b.gain) {
                    let mid = here + (next - here) / 2.0;
                    let threshold = if mid >= next { here } else { mid };
                    best = Some(SplitCandidate {
                        feature,
                        threshold,
                        gain,
                    });
                }
            }
        }
        best
    }
}

impl RegressionTree {
    /// Grow a tree on `samples` (row indices into `x`, repeats allowed)
    ///
    /// Returns the tree and its unnormalized per-feature gain.
    pub fn fit(
        x: ArrayView2<f64>,
        y: &[f64],
        weights: &[f64],
        samples: Vec<usize>,
        params: &TreeParams,
        rng: &mut StdRng,
    ) -> (Self, Vec<f64>) {
        let mut builder = TreeBuilder {
            x: x.view(),
            y,
            weights,
            params,
            nodes: Vec::new(),
            importances: vec![0.0; x.ncols()],
        };
        builder.build(samples, 0, rng);

        let tree = RegressionTree {
            nodes: builder.nodes,
            n_features: x.ncols(),
        };
        (tree, builder.importances)
    }

    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }
}

fn normalize(values: &mut [f64]) {
    let total: f64 = values.iter().sum();
    if total > 0.0 {
        values.iter_mut().for_each(|v| *v /= total);
    }
}

fn check_inputs(x: ArrayView2<f64>, y: &[f64], weights: &[f64]) -> crate::Result<()> {
    if x.nrows() == 0 || x.ncols() == 0 {
        return Err(PipelineError::InsufficientData("empty feature matrix".into()).into());
    }
    if y.len() != x.nrows() || weights.len() != x.nrows() {
        anyhow::bail!(
            "row count mismatch: {} feature rows, {} targets, {} weights",
            x.nrows(),
            y.len(),
            weights.len()
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub tree: TreeParams,
    pub bootstrap: bool,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            tree: TreeParams::default(),
            bootstrap: true,
            seed: 42,
        }
    }
}

/// Bagged ensemble of regression trees; prediction is the mean over trees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    trees: Vec<RegressionTree>,
    feature_importances: Vec<f64>,
}

impl RandomForest {
    pub fn fit(
        x: ArrayView2<f64>,
        y: &[f64],
        weights: &[f64],
        params: &ForestParams,
    ) -> crate::Result<Self> {
        check_inputs(x, y, weights)?;
        let n = x.nrows();
        let n_trees = params.n_estimators.max(1);

        let mut trees = Vec::with_capacity(n_trees);
        let mut importances = vec![0.0; x.ncols()];
        for t in 0..n_trees {
            let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(t as u64));
            let samples: Vec<usize> = if params.bootstrap {
                (0..n).map(|_| rng.gen_range(0..n)).collect()
            } else {
                (0..n).collect()
            };

            let (tree, mut gains) =
                RegressionTree::fit(x, y, weights, samples, &params.tree, &mut rng);
            normalize(&mut gains);
            importances.iter_mut().zip(&gains).for_each(|(acc, g)| *acc += g);
            trees.push(tree);
        }
        normalize(&mut importances);

        Ok(Self {
            trees,
            feature_importances: importances,
        })
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Array1<f64> {
        let n_trees = self.trees.len() as f64;
        x.outer_iter()
            .map(|row| self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>() / n_trees)
            .collect()
    }

    /// Mean normalized gain per feature, summing to 1 when any split was made
    pub fn feature_importances(&self) -> &[f64] {
        &self.feature_importances
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoostingParams {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    /// Weight applied to positive samples to offset class imbalance
    pub scale_pos_weight: f64,
    pub lambda: f64,
    pub seed: u64,
}

impl Default for BoostingParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            learning_rate: 0.3,
            max_depth: 6,
            scale_pos_weight: 1.0,
            lambda: 1.0,
            seed: 42,
        }
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Binary classifier boosted on log-loss with second-order (Newton) leaf values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostedTrees {
    base_margin: f64,
    learning_rate: f64,
    trees: Vec<RegressionTree>,
    feature_importances: Vec<f64>,
}

impl GradientBoostedTrees {
    /// Fit on 0/1 targets
    pub fn fit(x: ArrayView2<f64>, y: &[f64], params: &BoostingParams) -> crate::Result<Self> {
        let sample_weights: Vec<f64> = y
            .iter()
            .map(|&label| if label > 0.5 { params.scale_pos_weight } else { 1.0 })
            .collect();
        check_inputs(x, y, &sample_weights)?;
        let n = x.nrows();

        let total_w: f64 = sample_weights.iter().sum();
        let pos_w: f64 = y.iter().zip(&sample_weights).map(|(y, w)| y * w).sum();
        let base_rate = (pos_w / total_w).clamp(PROB_CLIP, 1.0 - PROB_CLIP);
        let base_margin = (base_rate / (1.0 - base_rate)).ln();

        let tree_params = TreeParams {
            max_depth: Some(params.max_depth),
            lambda: params.lambda,
            ..TreeParams::default()
        };
        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut margin = vec![base_margin; n];
        let mut trees = Vec::with_capacity(params.n_estimators);
        let mut importances = vec![0.0; x.ncols()];
        let mut targets = vec![0.0; n];
        let mut hess_weights = vec![0.0; n];

        for _ in 0..params.n_estimators {
            for i in 0..n {
                let p = sigmoid(margin[i]);
                let grad = p - y[i];
                let hess = (p * (1.0 - p)).max(MIN_HESSIAN);
                targets[i] = -grad / hess;
                hess_weights[i] = sample_weights[i] * hess;
            }

            let (tree, gains) = RegressionTree::fit(
                x,
                &targets,
                &hess_weights,
                (0..n).collect(),
                &tree_params,
                &mut rng,
            );
            importances.iter_mut().zip(&gains).for_each(|(acc, g)| *acc += g);
            for (i, row) in x.outer_iter().enumerate() {
                margin[i] += params.learning_rate * tree.predict_row(row);
            }
            trees.push(tree);
        }
        normalize(&mut importances);

        Ok(Self {
            base_margin,
            learning_rate: params.learning_rate,
            trees,
            feature_importances: importances,
        })
    }

    /// Positive-class probability per row
    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Array1<f64> {
        x.outer_iter()
            .map(|row| {
                let boost: f64 = self.trees.iter().map(|t| t.predict_row(row)).sum();
                sigmoid(self.base_margin + self.learning_rate * boost)
            })
            .collect()
    }

    /// Total gain per feature, normalized to sum to 1
    pub fn feature_importances(&self) -> &[f64] {
        &self.feature_importances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn step_data() -> (Array2<f64>, Vec<f64>) {
        // label depends only on the first feature; the second is noise
        let x = array![
            [1.0, 7.0],
            [2.0, 3.0],
            [3.0, 9.0],
            [4.0, 1.0],
            [10.0, 8.0],
            [11.0, 2.0],
            [12.0, 6.0],
            [13.0, 4.0],
        ];
        let y = vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0];
        (x, y)
    }

    #[test]
    fn test_tree_separates_step() {
        let (x, y) = step_data();
        let weights = vec![1.0; y.len()];
        let mut rng = StdRng::seed_from_u64(0);
        let (tree, gains) = RegressionTree::fit(
            x.view(),
            &y,
            &weights,
            (0..y.len()).collect(),
            &TreeParams::default(),
            &mut rng,
        );

        assert_eq!(tree.n_leaves(), 2);
        assert_eq!(tree.predict_row(array![2.5, 100.0].view()), 0.0);
        assert_eq!(tree.predict_row(array![12.0, -5.0].view()), 1.0);
        assert!(gains[0] > 0.0);
        assert_eq!(gains[1], 0.0);
    }

    #[test]
    fn test_tree_respects_max_depth() {
        let x = array![[1.0], [2.0], [3.0], [4.0]];
        let y = vec![1.0, 2.0, 3.0, 4.0];
        let params = TreeParams {
            max_depth: Some(1),
            ..TreeParams::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let (tree, _) = RegressionTree::fit(x.view(), &y, &[1.0; 4], (0..4).collect(), &params, &mut rng);
        assert_eq!(tree.n_leaves(), 2);
        assert_eq!(tree.predict_row(array![1.0].view()), 1.5);
        assert_eq!(tree.predict_row(array![4.0].view()), 3.5);
    }

    #[test]
    fn test_weights_shift_leaf_probability() {
        let x = array![[1.0], [1.0], [1.0]];
        let y = vec![1.0, 0.0, 0.0];
        let mut rng = StdRng::seed_from_u64(0);
        let (tree, _) = RegressionTree::fit(
            x.view(),
            &y,
            &[2.0, 1.0, 1.0],
            (0..3).collect(),
            &TreeParams::default(),
            &mut rng,
        );
        assert_eq!(tree.predict_row(array![1.0].view()), 0.5);
    }

    #[test]
    fn test_forest_probabilities_and_importances() {
        let (x, y) = step_data();
        let params = ForestParams {
            n_estimators: 25,
            ..ForestParams::default()
        };
        let forest = RandomForest::fit(x.view(), &y, &vec![1.0; y.len()], &params).unwrap();
        assert_eq!(forest.n_trees(), 25);

        let probs = forest.predict(x.view());
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
        assert!(probs[0] < 0.5 && probs[7] > 0.5);

        let imp = forest.feature_importances();
        assert!((imp.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(imp[0] > imp[1]);
    }

    #[test]
    fn test_forest_is_reproducible_with_seed() {
        let (x, y) = step_data();
        let params = ForestParams {
            n_estimators: 10,
            tree: TreeParams {
                max_features: Some(1),
                ..TreeParams::default()
            },
            ..ForestParams::default()
        };
        let a = RandomForest::fit(x.view(), &y, &vec![1.0; y.len()], &params).unwrap();
        let b = RandomForest::fit(x.view(), &y, &vec![1.0; y.len()], &params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_boosting_learns_step() {
        let (x, y) = step_data();
        let params = BoostingParams {
            n_estimators: 20,
            max_depth: 2,
            learning_rate: 0.3,
            ..BoostingParams::default()
        };
        let model = GradientBoostedTrees::fit(x.view(), &y, &params).unwrap();
        let probs = model.predict_proba(x.view());
        for (p, label) in probs.iter().zip(&y) {
            if *label > 0.5 {
                assert!(*p > 0.8, "positive scored {}", p);
            } else {
                assert!(*p < 0.2, "negative scored {}", p);
            }
        }
        assert!(model.feature_importances()[0] > 0.99);
    }

    #[test]
    fn test_rejects_empty_input() {
        let x = Array2::<f64>::zeros((0, 3));
        let err = RandomForest::fit(x.view(), &[], &[], &ForestParams::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InsufficientData(_))
        ));
    }
}
