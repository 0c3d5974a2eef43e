//! Linear algebra helpers for covariance square roots.
//!
//! Public API:
//!     pub fn matrix_square_root(matrix: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn robust_spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Option<DMatrix<f64>>
//!     pub fn triangular_square_root(augmented: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn combine_square_roots(a: &DMatrix<f64>, b: &DMatrix<f64>) -> DMatrix<f64>
//!
//! Full-covariance square root strategy (used by the generic UKF):
//! 1) Symmetrize P ← 0.5 (P + Pᵀ)
//! 2) Cholesky
//! 3) Jittered Cholesky (geometric ramp)
//! 4) Symmetric EVD with eigenvalue floor → S = U * sqrt(Λ⁺) * Uᵀ
//!
//! Square-root filters never form P at all. Given an augmented factor
//! `A = [A₁ | A₂ | ...]` they need a square factor `L` with `L Lᵀ = A Aᵀ`. With the
//! QR decomposition `Aᵀ = Q R` we have `A Aᵀ = Rᵀ Qᵀ Q R = Rᵀ R`, so `L = Rᵀ` is lower
//! triangular and the orthogonal factor is never needed.

use nalgebra::{DMatrix, Dyn};
use nalgebra::linalg::{Cholesky, SymmetricEigen};

/// Diagonal jitter schedule for Cholesky retries on nearly singular matrices.
///
/// The jitter starts at `initial_jitter` and grows tenfold per attempt until it would exceed
/// `max_jitter` or `max_tries` attempts have been made.
#[derive(Debug, Clone, Copy)]
pub struct JitterSchedule {
    pub initial_jitter: f64,
    pub max_jitter: f64,
    pub max_tries: usize,
}

impl Default for JitterSchedule {
    fn default() -> Self {
        JitterSchedule {
            initial_jitter: 1e-12,
            max_jitter: 1e-6,
            max_tries: 6,
        }
    }
}

/// Eigenvalue floor for the last-resort square root.
const EIGEN_FLOOR: f64 = 1e-12;

/// Compute a robust square root `S` such that approximately `matrix ≈ S * Sᵀ`.
///
/// Tries a (jittered) Cholesky decomposition first and falls back to an eigenvalue
/// decomposition with the negative eigenvalues floored.
///
/// # Arguments
/// * `matrix` - The DMatrix<f64> to find the square root of. It's assumed to be symmetric and square.
///
/// # Returns
/// A matrix square root. The result from Cholesky is lower triangular, the result from
/// eigenvalue decomposition is symmetric. In both cases `matrix ≈ M * M.transpose()`.
pub fn matrix_square_root(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    assert!(
        matrix.is_square(),
        "matrix_square_root: matrix must be square"
    );
    let p = symmetrize(matrix);
    match jittered_cholesky(&p, JitterSchedule::default()) {
        Some(ch) => ch.l(),
        None => evd_symmetric_sqrt_with_floor(&p, EIGEN_FLOOR),
    }
}

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

/// Cholesky factorisation of a symmetric matrix, retried with growing diagonal jitter.
/// Returns None if every attempt fails.
fn jittered_cholesky(p: &DMatrix<f64>, schedule: JitterSchedule) -> Option<Cholesky<f64, Dyn>> {
    if let Some(ch) = Cholesky::new(p.clone()) {
        return Some(ch);
    }
    let mut jitter = schedule.initial_jitter;
    for _ in 0..schedule.max_tries {
        if jitter > schedule.max_jitter {
            break;
        }
        let shifted = p + DMatrix::<f64>::from_diagonal_element(p.nrows(), p.ncols(), jitter);
        if let Some(ch) = Cholesky::new(shifted) {
            return Some(ch);
        }
        jitter *= 10.0;
    }
    None
}

/// Symmetric EVD square root with eigenvalue flooring:
/// S = U * sqrt(max(λ, floor)) * Uᵀ
fn evd_symmetric_sqrt_with_floor(p: &DMatrix<f64>, floor: f64) -> DMatrix<f64> {
    let se = SymmetricEigen::new(p.clone());
    let lambdas = se.eigenvalues.map(|l| l.max(floor).sqrt());
    let u = se.eigenvectors;
    &u * DMatrix::<f64>::from_diagonal(&lambdas) * u.transpose()
}

/// Solve A X = B for SPD-ish A via Cholesky, with jitter retries.
/// Returns None if all attempts fail.
pub fn chol_solve_spd(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    schedule: JitterSchedule,
) -> Option<DMatrix<f64>> {
    assert!(a.is_square(), "chol_solve_spd: A must be square");
    assert_eq!(a.nrows(), b.nrows(), "chol_solve_spd: A and B incompatible");
    jittered_cholesky(&symmetrize(a), schedule).map(|ch| ch.solve(b))
}

/// Robust SPD solve with sane defaults:
/// - Cholesky + jitter (preferred)
/// - Last resort: explicit inverse
///
/// Returns None when A is singular even after jitter.
pub fn robust_spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if let Some(x) = chol_solve_spd(a, b, JitterSchedule::default()) {
        return Some(x);
    }
    symmetrize(a).try_inverse().map(|inv| &inv * b)
}

/// Horizontally concatenate two matrices with the same number of rows: `[a | b]`.
pub fn horzcat(a: &DMatrix<f64>, b: &DMatrix<f64>) -> DMatrix<f64> {
    assert_eq!(a.nrows(), b.nrows(), "horzcat: row counts differ");
    let mut out = DMatrix::<f64>::zeros(a.nrows(), a.ncols() + b.ncols());
    out.view_mut((0, 0), (a.nrows(), a.ncols())).copy_from(a);
    out.view_mut((0, a.ncols()), (b.nrows(), b.ncols()))
        .copy_from(b);
    out
}

/// Square lower-triangular factor `L` (n×n) of a wide n×m matrix `A` such that
/// `L Lᵀ = A Aᵀ`.
///
/// This is the orthogonal-transform step of every square-root filter update: the
/// columns of `A` are contributions to the covariance (propagated factor, noise
/// factors, correction terms) and `L` is their compact equivalent. Inputs with fewer
/// columns than rows are padded with zero columns.
pub fn triangular_square_root(augmented: &DMatrix<f64>) -> DMatrix<f64> {
    let rows = augmented.nrows();
    let wide = if augmented.ncols() < rows {
        horzcat(
            augmented,
            &DMatrix::zeros(rows, rows - augmented.ncols()),
        )
    } else {
        augmented.clone()
    };
    wide.transpose().qr().r().transpose()
}

/// `L` with `L Lᵀ = A Aᵀ + B Bᵀ`, computed without forming either product.
pub fn combine_square_roots(a: &DMatrix<f64>, b: &DMatrix<f64>) -> DMatrix<f64> {
    triangular_square_root(&horzcat(a, b))
}

/// True when every entry is finite.
#[inline]
pub fn all_finite(m: &DMatrix<f64>) -> bool {
    m.iter().all(|v| v.is_finite())
}

/* =============================== Tests ==================================== */
