//! Small numeric primitives needed by the multivariate conjugate samplers:
//! Cholesky factorisation of a precision matrix, and the two operations
//! built on top of it (density evaluation, correlated sampling).

use ndarray::{Array1, Array2};

use crate::error::{EngineError, Result};
use crate::graph::NodeId;

/// Lower Cholesky factor `L` of a symmetric positive-definite matrix, such
/// that `L * L^T == mat`. Returns a numeric error (tagged with `node`, the
/// node whose local posterior precision failed to factorise) if `mat` is
/// not positive-definite.
pub fn cholesky_lower(mat: &Array2<f64>, node: NodeId) -> Result<Array2<f64>> {
    let n = mat.nrows();
    if mat.ncols() != n {
        return Err(EngineError::Dimension(
            "cholesky_lower: matrix must be square".to_string(),
        ));
    }
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = mat[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 {
                    return Err(EngineError::numeric(
                        node,
                        "combined precision matrix is not positive-definite",
                    ));
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Ok(l)
}

/// log|mat| recovered from its Cholesky factor: `2 * sum(log(diag(L)))`.
pub fn log_det_from_chol(l: &Array2<f64>) -> f64 {
    (0..l.nrows()).map(|i| l[[i, i]].ln()).sum::<f64>() * 2.0
}

/// Log density of `N(0, Prec^-1)` at `diff = x - mean`, given the lower
/// Cholesky factor of the precision matrix `Prec`.
pub fn mvnormal_log_density_centered(diff: &Array1<f64>, prec_chol_lower: &Array2<f64>) -> f64 {
    let n = diff.len();
    let y = prec_chol_lower.t().dot(diff);
    let quad: f64 = y.dot(&y);
    let logdet = log_det_from_chol(prec_chol_lower);
    -0.5 * (n as f64 * (2.0 * std::f64::consts::PI).ln() - logdet + quad)
}

/// Solves `L^T y = z` by back substitution, where `l` is lower-triangular.
/// Used to turn an iid-normal draw `z` into a correlated draw with
/// covariance `(L L^T)^-1`.
pub fn solve_upper_transpose(l: &Array2<f64>, z: &Array1<f64>) -> Array1<f64> {
    let n = z.len();
    let mut y = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = z[i];
        for k in (i + 1)..n {
            sum -= l[[k, i]] * y[k];
        }
        y[i] = sum / l[[i, i]];
    }
    y
}
