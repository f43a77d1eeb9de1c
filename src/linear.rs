use crate::data::dot_count;
use crate::{Feature, FeatureVec};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

/// Map a raw score to a binary class: positive scores are the positive
/// (right) class.
pub fn classify_to_binary(z: f32) -> bool {
    z > 0.0
}

/// A linear binary classifier: an entry `x` is classified as positive if
/// `dot(weights, x) + bias > 0`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BinaryClassifier {
    pub bias: f32,
    /// Nonzero weights, sorted by feature id.
    pub weights: FeatureVec,
}

/// Confusion counts of a predicted assignment against a reference one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SplitStats {
    pub true_neg: u64,
    pub false_neg: u64,
    pub false_pos: u64,
    pub true_pos: u64,
}

impl BinaryClassifier {
    /// The predicted score `dot(weights, x) + bias`.
    pub fn predict(&self, x: &[(Feature, f32)]) -> f32 {
        let (d, _) = dot_count(x, &self.weights);
        self.bias + d
    }

    /// The predicted score along with the number of weight features also
    /// present in `x`.
    pub fn predict_and_count(&self, x: &[(Feature, f32)]) -> (f32, u32) {
        let (d, count) = dot_count(x, &self.weights);
        (self.bias + d, count)
    }

    pub fn predict_all(&self, xs: &[&FeatureVec]) -> Vec<f32> {
        xs.iter().map(|x| self.predict(x)).collect()
    }

    /// Score every entry and compare the implied classes against a reference
    /// assignment, returning the confusion counts, the raw scores, and the
    /// predicted classes.
    pub fn report_performance(
        &self,
        xs: &[&FeatureVec],
        reference: &[bool],
    ) -> (SplitStats, Vec<f32>, Vec<bool>) {
        let scores = self.predict_all(xs);
        let predicted: Vec<bool> = scores.iter().map(|&z| classify_to_binary(z)).collect();
        let mut stats = SplitStats::default();
        for (&hat, &truth) in predicted.iter().zip(reference) {
            match (hat, truth) {
                (true, true) => stats.true_pos += 1,
                (true, false) => stats.false_pos += 1,
                (false, true) => stats.false_neg += 1,
                (false, false) => stats.true_neg += 1,
            }
        }
        (stats, scores, predicted)
    }
}

/// A freshly trained classifier. Dual solvers also expose their per-entry
/// coefficients, which callers may summarize and must then drop.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainedClassifier {
    pub classifier: BinaryClassifier,
    pub dual_coefs: Option<Vec<f32>>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClassifierError {
    #[error("cannot fit a hyperplane on an empty sub-dataset")]
    EmptyTrainingSet,
}

/// A binary classifier trainer: fits one hyperplane on the given feature
/// rows and boolean assignment. `c` is the inverse penalty parameter and
/// `epsilon` the convergence tolerance.
pub type ClassifierTrainer =
    fn(&[&FeatureVec], &[bool], f32, f32) -> Result<TrainedClassifier, ClassifierError>;

/// Look up a classifier trainer by its registry name.
pub fn classifier_trainer(name: &str) -> Option<ClassifierTrainer> {
    match name {
        "l1logistic_primal_sgd" => Some(train_l1logistic_primal_sgd),
        "l1svc_dual_cd" => Some(train_l1svc_dual_cd),
        "l1svc_primal_sgd" => Some(train_l1svc_primal_sgd),
        _ => None,
    }
}

fn feature_dim(xs: &[&FeatureVec]) -> usize {
    xs.iter()
        .flat_map(|x| x.iter())
        .map(|&(feature, _)| feature as usize + 1)
        .max()
        .unwrap_or(0)
}

fn sparsify(dense: &[f32]) -> FeatureVec {
    dense
        .iter()
        .enumerate()
        .filter(|&(_, &v)| v != 0.0)
        .map(|(i, &v)| (i as Feature, v))
        .collect()
}

/// Train an L1-Support Vector Classifier with primal stochastic gradient
/// descent, using passive-aggressive updates with a learning rate decaying as
/// `1/t`. The update is safe even with a large initial rate, so `eta0` stays
/// fixed at 1.
fn train_l1svc_primal_sgd(
    xs: &[&FeatureVec],
    ys: &[bool],
    c: f32,
    epsilon: f32,
) -> Result<TrainedClassifier, ClassifierError> {
    if xs.is_empty() {
        return Err(ClassifierError::EmptyTrainingSet);
    }
    let mut rng = StdRng::seed_from_u64(0);
    let (n, d) = (xs.len(), feature_dim(xs));
    let mut b = 0f32;
    let mut w = vec![0f32; d];
    // q_diag holds the squared L2-norm of each entry, bias term included.
    let mut q_diag = vec![0f32; n];
    let mut pi: Vec<usize> = (0..n).collect();
    for (i, xi) in xs.iter().enumerate() {
        let mut q = 1.0f32;
        for &(_, v) in xi.iter() {
            q += v * v;
        }
        q_diag[i] = q;
    }
    let eta0 = 1.0f32;
    let mut t = 1usize;
    for epoch in 0..1000 {
        for i in 0..n.saturating_sub(1) {
            let j = i + rng.gen_range(0..n - i);
            pi.swap(i, j);
        }
        let mut max_g_l1 = 0f32;
        for &i in &pi {
            let (xi, yi) = (xs[i], if ys[i] { 1.0f32 } else { -1.0 });
            let mut zi = b;
            for &(feature, v) in xi.iter() {
                zi += w[feature as usize] * v;
            }
            // loss: l_i = C max{0, 1 - y_i z_i}
            let loss_i = c * (1.0 - yi * zi);
            if loss_i > 0.0 {
                // step size: s_i = y_i min{eta0/t, l_i / (t(x_i) x_i)}
                let mut si = loss_i / q_diag[i];
                let lambda_i = eta0 / t as f32;
                if si > lambda_i {
                    si = lambda_i;
                }
                si *= yi;
                let gib = si;
                b += gib;
                let mut g_l1 = gib.abs();
                for &(feature, v) in xi.iter() {
                    let gij = si * v;
                    w[feature as usize] += gij;
                    g_l1 += gij.abs();
                }
                if max_g_l1 < g_l1 {
                    max_g_l1 = g_l1;
                }
            }
            t += 1;
        }
        debug!(
            "l1svc_primal_sgd: epoch={}: max||g||_1={}",
            epoch, max_g_l1
        );
        if max_g_l1 <= epsilon {
            break;
        }
    }
    Ok(TrainedClassifier {
        classifier: BinaryClassifier {
            bias: b,
            weights: sparsify(&w),
        },
        dual_coefs: None,
    })
}

/// Train an L1-penalized logistic regression with the FTRL-Proximal method.
/// Estimates the probability of the positive class and tends to produce a
/// smaller model than the hinge-loss trainers.
fn train_l1logistic_primal_sgd(
    xs: &[&FeatureVec],
    ys: &[bool],
    c: f32,
    epsilon: f32,
) -> Result<TrainedClassifier, ClassifierError> {
    if xs.is_empty() {
        return Err(ClassifierError::EmptyTrainingSet);
    }
    let mut rng = StdRng::seed_from_u64(0);
    let lambda = 1.0 / c;
    let (n, d) = (xs.len(), feature_dim(xs));
    let (alpha, beta) = (1.0f32, 1.0f32);
    let mut bias = 0f32;
    let mut weight = vec![0f32; d];
    // The first d elements are for the weights, the last one for the bias.
    let mut m = vec![0f32; d + 1];
    let mut g_sq_sum = vec![0f32; d + 1];
    let mut perm: Vec<usize> = (0..n).collect();
    let mut loss_penalty0 = f32::INFINITY;
    for epoch in 0..100 {
        for i in 0..n.saturating_sub(1) {
            let j = i + rng.gen_range(0..n - i);
            perm.swap(i, j);
        }
        let mut loss = 0f32;
        for &i in &perm {
            let xi = xs[i];
            let mut zi = bias;
            for &(feature, v) in xi.iter() {
                let feature = feature as usize;
                let mj = m[feature];
                if mj.abs() > lambda {
                    let sign_mj = if mj > 0.0 { 1.0f32 } else { -1.0 };
                    let wj = (alpha / (beta + g_sq_sum[feature].sqrt())) * (mj - sign_mj * lambda);
                    weight[feature] = wj;
                    zi += wj * v;
                } else {
                    weight[feature] = 0.0;
                }
            }
            // p_i = 1/(1 + exp(-z_i)) is the predicted positive probability.
            let pi = 1.0 / (1.0 + (-zi).exp());
            let yi = if ys[i] { 1.0f32 } else { 0.0 };
            // l_i = -y_i log(p_i) - (1 - y_i) log(1 - p_i), computed stably.
            if ys[i] {
                let x = 0f32.max(-zi);
                loss += x + ((0.0 - x).exp() + (-zi - x).exp()).ln();
            } else {
                let x = 0f32.max(zi);
                loss += x + ((0.0 - x).exp() + (zi - x).exp()).ln();
            }
            let g_bias = -(yi - pi);
            bias -= (alpha / (beta + g_sq_sum[d].sqrt())) * g_bias;
            g_sq_sum[d] += g_bias * g_bias;
            for &(feature, v) in xi.iter() {
                let feature = feature as usize;
                let gj = -(yi - pi) * v;
                let g_sq_sum_j = g_sq_sum[feature] + gj * gj;
                let sigma_j = (g_sq_sum_j.sqrt() - g_sq_sum[feature].sqrt()) / alpha;
                m[feature] += sigma_j * weight[feature] - gj;
                g_sq_sum[feature] = g_sq_sum_j;
            }
        }
        let penalty = lambda * weight.iter().map(|w| w.abs()).sum::<f32>();
        let loss_penalty = loss + penalty;
        debug!(
            "l1logistic_primal_sgd: epoch={}: penalty={}, loss={}, penalty+loss={}",
            epoch, penalty, loss, loss_penalty
        );
        if !loss_penalty0.is_infinite() && (loss_penalty0 - loss_penalty) / loss_penalty0 < epsilon
        {
            break;
        }
        loss_penalty0 = loss_penalty;
    }
    Ok(TrainedClassifier {
        classifier: BinaryClassifier {
            bias,
            weights: sparsify(&weight),
        },
        dual_coefs: None,
    })
}

/// Train an L1-Support Vector Classifier with dual coordinate descent and
/// shrinking of the active set. The only trainer exposing dual coefficients.
fn train_l1svc_dual_cd(
    xs: &[&FeatureVec],
    ys: &[bool],
    c: f32,
    epsilon: f32,
) -> Result<TrainedClassifier, ClassifierError> {
    if xs.is_empty() {
        return Err(ClassifierError::EmptyTrainingSet);
    }
    let mut rng = StdRng::seed_from_u64(0);
    let (n, d) = (xs.len(), feature_dim(xs));
    let mut b = 0f32;
    let mut w = vec![0f32; d];
    let mut q_diag = vec![0f32; n];
    let mut dual_coefs = vec![0f32; n];
    let mut pi: Vec<usize> = (0..n).collect();
    for (i, xi) in xs.iter().enumerate() {
        let mut q = 1.0f32;
        for &(_, v) in xi.iter() {
            q += v * v;
        }
        q_diag[i] = q;
    }
    let mut n_actives = n;
    let (mut max_g, mut min_g) = (f32::INFINITY, f32::NEG_INFINITY);
    for t in 0..1000 {
        let (mut max_pg, mut min_pg) = (f32::NEG_INFINITY, f32::INFINITY);
        // Shuffle the active entries.
        for i in 0..n_actives.saturating_sub(1) {
            let j = i + rng.gen_range(0..n - i);
            pi.swap(i, j);
        }
        let mut i_ = 0;
        while i_ < n_actives {
            let i = pi[i_];
            let (xi, yi, coef_i) = (xs[i], ys[i], dual_coefs[i]);
            // g: the gradient of the unconstrained case,
            //   g = y_i t(w) x_i - 1
            let mut g = b;
            for &(feature, v) in xi.iter() {
                g += w[feature as usize] * v;
            }
            if !yi {
                g = -g;
            }
            g -= 1.0;
            // Shrink the active entries if possible.
            if (coef_i == 0.0 && max_g < g) || (coef_i == c && g < min_g) {
                n_actives -= 1;
                pi.swap(i_, n_actives);
                continue;
            }
            // pg: the projected gradient, clipped to 0 where the optimum
            // leaves the constraint region.
            let mut pg = g;
            if coef_i == 0.0 {
                pg = pg.min(0.0);
            } else if coef_i == c {
                pg = pg.max(0.0);
            }
            if max_pg < pg {
                max_pg = pg;
            }
            if min_pg > pg {
                min_pg = pg;
            }
            if pg.abs() > 1.0e-6 {
                let new_coef_i = (coef_i - g / q_diag[i]).clamp(0.0, c);
                dual_coefs[i] = new_coef_i;
                // Update w = sum_i coef_i y_i x_i.
                let mut delta = new_coef_i - coef_i;
                if !yi {
                    delta = -delta;
                }
                b += delta;
                for &(feature, v) in xi.iter() {
                    w[feature as usize] += delta * v;
                }
            }
            i_ += 1;
        }
        if max_pg - min_pg <= epsilon {
            if n_actives == n {
                break;
            }
            // Check all entries at the next round.
            debug!(
                "l1svc_dual_cd: t={}: maxPG-minPG={}: rechecking all entries",
                t,
                max_pg - min_pg
            );
            n_actives = n;
            max_g = f32::INFINITY;
            min_g = f32::NEG_INFINITY;
        } else {
            max_g = if max_pg > 0.0 { max_pg } else { f32::INFINITY };
            min_g = if min_pg < 0.0 { min_pg } else { f32::NEG_INFINITY };
        }
    }
    Ok(TrainedClassifier {
        classifier: BinaryClassifier {
            bias: b,
            weights: sparsify(&w),
        },
        dual_coefs: Some(dual_coefs),
    })
}
