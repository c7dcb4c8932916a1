//! Checked linear algebra helpers.
//!
//! Every inversion in the optimizer goes through [`checked_inverse`], which
//! refuses near-singular input instead of handing back a matrix full of
//! huge or NaN entries.

use crate::domain::error::QuantlabError;
use nalgebra::{DMatrix, SymmetricEigen};

/// Largest 2-norm condition number accepted for an inversion.
pub const MAX_CONDITION: f64 = 1e12;

/// 2-norm condition number (ratio of extreme singular values).
pub fn condition_number(m: &DMatrix<f64>) -> f64 {
    if m.is_empty() {
        return 1.0;
    }
    let sv = m.singular_values();
    let max = sv.max();
    let min = sv.min();
    if min <= 0.0 {
        f64::INFINITY
    } else {
        max / min
    }
}

/// Invert a square matrix after checking it is finite and well-conditioned.
///
/// `label` names the matrix in the error so callers can tell which step of
/// the pipeline failed.
pub fn checked_inverse(m: &DMatrix<f64>, label: &str) -> Result<DMatrix<f64>, QuantlabError> {
    if !m.is_square() {
        return Err(QuantlabError::Optimization {
            matrix: label.to_string(),
            reason: format!("matrix is {}x{}, not square", m.nrows(), m.ncols()),
            condition: f64::NAN,
        });
    }
    if m.iter().any(|v| !v.is_finite()) {
        return Err(QuantlabError::Optimization {
            matrix: label.to_string(),
            reason: "matrix contains non-finite entries".to_string(),
            condition: f64::NAN,
        });
    }

    let condition = condition_number(m);
    if !condition.is_finite() || condition > MAX_CONDITION {
        return Err(QuantlabError::Optimization {
            matrix: label.to_string(),
            reason: "matrix is singular or ill-conditioned".to_string(),
            condition,
        });
    }

    let inverse = m.clone().try_inverse().ok_or_else(|| QuantlabError::Optimization {
        matrix: label.to_string(),
        reason: "inversion failed".to_string(),
        condition,
    })?;

    if inverse.iter().any(|v| !v.is_finite()) {
        return Err(QuantlabError::Optimization {
            matrix: label.to_string(),
            reason: "inverse contains non-finite entries".to_string(),
            condition,
        });
    }
    Ok(inverse)
}

/// Strict positive-definiteness via Cholesky.
pub fn is_positive_definite(m: &DMatrix<f64>) -> bool {
    m.is_square() && m.iter().all(|v| v.is_finite()) && m.clone().cholesky().is_some()
}

/// (M + Mᵀ) / 2
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    (m + m.transpose()) * 0.5
}

/// Eigenvalues of a symmetric matrix, ascending.
pub fn symmetric_eigenvalues(m: &DMatrix<f64>) -> Vec<f64> {
    if m.is_empty() {
        return Vec::new();
    }
    let mut values: Vec<f64> = SymmetricEigen::new(symmetrize(m))
        .eigenvalues
        .iter()
        .copied()
        .collect();
    values.sort_by(f64::total_cmp);
    values
}
