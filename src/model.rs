//! Price model capability and the ridge regressor behind it.
//!
//! The regressor keeps its sufficient statistics (XᵀX, Xᵀy, column sums), so
//! continuing from a checkpoint folds a new batch into everything seen before
//! and re-solves the normal equations.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::features::{feature_column_names, feature_fingerprint, FeatureMatrix};

pub const MODEL_FORMAT_VERSION: u32 = 1;

const PIVOT_EPSILON: f64 = 1e-12;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model artifact could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unsupported model format version {found}, expected {expected}")]
    FormatVersion { expected: u32, found: u32 },
    #[error("model feature fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },
    #[error("feature columns {actual:?} do not match model columns {expected:?}")]
    ColumnMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },
    #[error("row {row} has {found} values, expected {expected}")]
    RowWidth {
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error("{features} feature rows but {targets} targets")]
    TargetLength { features: usize, targets: usize },
    #[error("no complete training rows")]
    EmptyTrainingSet,
    #[error("model has not been fitted")]
    NotFitted,
}

pub trait PriceModel: Send + Sync {
    fn feature_columns(&self) -> &[String];
    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<f64>, ModelError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub rows_used: u64,
    pub rows_skipped: u64,
    pub total_rows_seen: u64,
    pub warm_start: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub rmse: f64,
    pub mae: f64,
    pub r2: f64,
    pub mse: f64,
}

impl EvaluationMetrics {
    pub fn rounded(self, decimals: i32) -> Self {
        let factor = 10f64.powi(decimals);
        let round = |v: f64| (v * factor).round() / factor;
        Self {
            rmse: round(self.rmse),
            mae: round(self.mae),
            r2: round(self.r2),
            mse: round(self.mse),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SufficientStats {
    rows: u64,
    xtx: Vec<Vec<f64>>,
    xty: Vec<f64>,
}

impl SufficientStats {
    fn new(width: usize) -> Self {
        let dim = width + 1;
        Self {
            rows: 0,
            xtx: vec![vec![0.0; dim]; dim],
            xty: vec![0.0; dim],
        }
    }

    fn add(&mut self, x: &[f64], y: f64) {
        let dim = self.xty.len();
        let augmented = |i: usize| if i == 0 { 1.0 } else { x[i - 1] };
        for a in 0..dim {
            let xa = augmented(a);
            self.xty[a] += xa * y;
            for b in 0..dim {
                self.xtx[a][b] += xa * augmented(b);
            }
        }
        self.rows += 1;
    }

    fn column_means(&self) -> Vec<f64> {
        if self.rows == 0 {
            return vec![0.0; self.xty.len() - 1];
        }
        let n = self.rows as f64;
        // Row 0 of XᵀX holds the column sums.
        self.xtx[0][1..].iter().map(|sum| sum / n).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidgeModel {
    format_version: u32,
    feature_columns: Vec<String>,
    feature_fingerprint: String,
    lambda: f64,
    stats: SufficientStats,
    intercept: f64,
    coefficients: Vec<f64>,
    column_means: Vec<f64>,
    training_rounds: u32,
}

impl RidgeModel {
    pub fn new(lambda: f64) -> Self {
        let feature_columns = feature_column_names();
        let width = feature_columns.len();
        Self {
            format_version: MODEL_FORMAT_VERSION,
            feature_fingerprint: feature_fingerprint(&feature_columns),
            feature_columns,
            lambda,
            stats: SufficientStats::new(width),
            intercept: 0.0,
            coefficients: vec![0.0; width],
            column_means: vec![0.0; width],
            training_rounds: 0,
        }
    }

    pub fn load(bytes: &[u8]) -> Result<Self, ModelError> {
        let model: RidgeModel = serde_json::from_slice(bytes)?;
        if model.format_version != MODEL_FORMAT_VERSION {
            return Err(ModelError::FormatVersion {
                expected: MODEL_FORMAT_VERSION,
                found: model.format_version,
            });
        }
        let expected = feature_fingerprint(&feature_column_names());
        if model.feature_fingerprint != expected {
            return Err(ModelError::FingerprintMismatch {
                expected,
                actual: model.feature_fingerprint,
            });
        }
        Ok(model)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ModelError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn training_rounds(&self) -> u32 {
        self.training_rounds
    }

    pub fn rows_seen(&self) -> u64 {
        self.stats.rows
    }

    pub fn is_fitted(&self) -> bool {
        self.training_rounds > 0
    }

    // Rows with any null feature or a non-finite target are skipped.
    pub fn fit(&mut self, features: &FeatureMatrix, targets: &[f64]) -> Result<FitReport, ModelError> {
        self.check_columns(features)?;
        if features.len() != targets.len() {
            return Err(ModelError::TargetLength {
                features: features.len(),
                targets: targets.len(),
            });
        }

        let warm_start = self.is_fitted();
        let width = self.feature_columns.len();
        let mut batch = SufficientStats::new(width);
        let mut skipped = 0u64;
        for (idx, (row, target)) in features.rows.iter().zip(targets).enumerate() {
            if row.len() != width {
                return Err(ModelError::RowWidth {
                    row: idx,
                    found: row.len(),
                    expected: width,
                });
            }
            let complete: Option<Vec<f64>> = row.iter().copied().collect();
            match complete {
                Some(x) if target.is_finite() => batch.add(&x, *target),
                _ => skipped += 1,
            }
        }

        if batch.rows == 0 {
            return Err(ModelError::EmptyTrainingSet);
        }

        let rows_used = batch.rows;
        self.merge(batch);
        self.solve();
        self.training_rounds = self.training_rounds.saturating_add(1);

        info!(
            component = "model",
            event = "model.fit.finish",
            warm_start,
            rows_used,
            rows_skipped = skipped,
            total_rows_seen = self.stats.rows,
            training_rounds = self.training_rounds
        );

        Ok(FitReport {
            rows_used,
            rows_skipped: skipped,
            total_rows_seen: self.stats.rows,
            warm_start,
        })
    }

    fn merge(&mut self, batch: SufficientStats) {
        for (a, row) in batch.xtx.iter().enumerate() {
            for (b, value) in row.iter().enumerate() {
                self.stats.xtx[a][b] += value;
            }
        }
        for (a, value) in batch.xty.iter().enumerate() {
            self.stats.xty[a] += value;
        }
        self.stats.rows += batch.rows;
    }

    fn solve(&mut self) {
        let mut a = self.stats.xtx.clone();
        // Intercept is not penalised.
        for (d, row) in a.iter_mut().enumerate().skip(1) {
            row[d] += self.lambda * self.stats.rows as f64;
        }
        let beta = gaussian_solve(a, self.stats.xty.clone());
        self.intercept = beta[0];
        self.coefficients = beta[1..].to_vec();
        self.column_means = self.stats.column_means();

        debug!(
            component = "model",
            event = "model.solve",
            intercept = self.intercept,
            coefficients = ?self.coefficients
        );
    }

    fn check_columns(&self, features: &FeatureMatrix) -> Result<(), ModelError> {
        if features.columns != self.feature_columns {
            return Err(ModelError::ColumnMismatch {
                expected: self.feature_columns.clone(),
                actual: features.columns.clone(),
            });
        }
        Ok(())
    }
}

impl PriceModel for RidgeModel {
    fn feature_columns(&self) -> &[String] {
        &self.feature_columns
    }

    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<f64>, ModelError> {
        if !self.is_fitted() {
            return Err(ModelError::NotFitted);
        }
        self.check_columns(features)?;

        let width = self.feature_columns.len();
        let mut out = Vec::with_capacity(features.len());
        for (idx, row) in features.rows.iter().enumerate() {
            if row.len() != width {
                return Err(ModelError::RowWidth {
                    row: idx,
                    found: row.len(),
                    expected: width,
                });
            }
            let value = row
                .iter()
                .zip(&self.coefficients)
                .zip(&self.column_means)
                .fold(self.intercept, |acc, ((cell, coef), mean)| {
                    acc + coef * cell.unwrap_or(*mean)
                });
            out.push(value);
        }
        Ok(out)
    }
}

pub fn evaluate(predicted: &[f64], actual: &[f64]) -> EvaluationMetrics {
    let n = predicted.len().min(actual.len());
    if n == 0 {
        return EvaluationMetrics {
            rmse: 0.0,
            mae: 0.0,
            r2: 0.0,
            mse: 0.0,
        };
    }

    let nf = n as f64;
    let mean = actual[..n].iter().sum::<f64>() / nf;
    let mut ss_res = 0.0;
    let mut abs_sum = 0.0;
    let mut ss_tot = 0.0;
    for (p, y) in predicted[..n].iter().zip(&actual[..n]) {
        let err = y - p;
        ss_res += err * err;
        abs_sum += err.abs();
        ss_tot += (y - mean) * (y - mean);
    }

    let mse = ss_res / nf;
    let r2 = if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else if ss_res == 0.0 {
        1.0
    } else {
        0.0
    };

    EvaluationMetrics {
        rmse: mse.sqrt(),
        mae: abs_sum / nf,
        r2,
        mse,
    }
}

// A column with no usable pivot gets a zero coefficient.
fn gaussian_solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Vec<f64> {
    let p = b.len();
    let mut usable = vec![true; p];
    for i in 0..p {
        let mut max_r = i;
        let mut max_v = a[i][i].abs();
        for (r, row) in a.iter().enumerate().skip(i + 1) {
            if row[i].abs() > max_v {
                max_v = row[i].abs();
                max_r = r;
            }
        }
        if max_r != i {
            a.swap(i, max_r);
            b.swap(i, max_r);
        }
        let piv = a[i][i];
        if piv.abs() < PIVOT_EPSILON {
            usable[i] = false;
            continue;
        }
        let inv_piv = 1.0 / piv;
        for value in a[i].iter_mut().skip(i) {
            *value *= inv_piv;
        }
        b[i] *= inv_piv;
        for r in 0..p {
            if r == i {
                continue;
            }
            let factor = a[r][i];
            if factor == 0.0 {
                continue;
            }
            for j in i..p {
                a[r][j] -= factor * a[i][j];
            }
            b[r] -= factor * b[i];
        }
    }
    for (i, ok) in usable.iter().enumerate() {
        if !ok {
            b[i] = 0.0;
        }
    }
    b
}
