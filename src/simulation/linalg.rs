//! Small dense linear algebra used by the solvers.

use nalgebra::{DMatrix, DVector};
use ndarray::Array1;

use crate::Float;

/// Solve a tridiagonal system with the Thomas algorithm.
///
/// `lower[0]` and `upper[n-1]` are ignored. Elimination runs in double
/// precision; the result is cast back to the array scalar. Returns `None` on
/// a vanishing pivot or any non-finite input, leaving the failure decision to
/// the caller.
pub fn solve_tridiagonal(
    lower: &Array1<Float>,
    diag: &Array1<Float>,
    upper: &Array1<Float>,
    rhs: &Array1<Float>,
) -> Option<Array1<Float>> {
    let n = diag.len();
    assert_eq!(lower.len(), n);
    assert_eq!(upper.len(), n);
    assert_eq!(rhs.len(), n);

    let mut c = vec![0f64; n];
    let mut d = vec![0f64; n];

    let mut pivot = diag[0] as f64;
    if !pivot.is_finite() || pivot.abs() < f64::MIN_POSITIVE {
        return None;
    }
    c[0] = upper[0] as f64 / pivot;
    d[0] = rhs[0] as f64 / pivot;
    for i in 1..n {
        pivot = diag[i] as f64 - lower[i] as f64 * c[i - 1];
        if !pivot.is_finite() || pivot.abs() < f64::MIN_POSITIVE {
            return None;
        }
        if i + 1 < n {
            c[i] = upper[i] as f64 / pivot;
        }
        d[i] = (rhs[i] as f64 - lower[i] as f64 * d[i - 1]) / pivot;
    }

    let mut x = vec![0f64; n];
    x[n - 1] = d[n - 1];
    for i in (0..n - 1).rev() {
        x[i] = d[i] - c[i] * x[i + 1];
    }

    if x.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(Array1::from_iter(x.into_iter().map(|v| v as Float)))
}

/// Dense LU solve of `A x = b`, used for the Newton step. Returns `None`
/// when the factorization fails or the solution is not finite.
pub fn solve_dense(a: &DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    let x = a.clone().lu().solve(b)?;
    if x.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    #[test]
    fn solves_a_known_system() {
        // [2 1 0; 1 3 1; 0 1 2] x = [3; 10; 9]
        let lower = Array1::from_vec(vec![0., 1., 1.]);
        let diag = Array1::from_vec(vec![2., 3., 2.]);
        let upper = Array1::from_vec(vec![1., 1., 0.]);
        let rhs = Array1::from_vec(vec![3., 10., 9.]);
        let x = solve_tridiagonal(&lower, &diag, &upper, &rhs).unwrap();
        // Verify by substitution.
        let mut check = vec![0f32; 3];
        check[0] = diag[0] * x[0] + upper[0] * x[1];
        check[1] = lower[1] * x[0] + diag[1] * x[1] + upper[1] * x[2];
        check[2] = lower[2] * x[1] + diag[2] * x[2];
        for (c, r) in check.iter().zip(rhs.iter()) {
            assert!((c - r).abs() < 1e-4, "{} vs {}", c, r);
        }
    }

    #[test]
    fn diagonal_system_is_elementwise_division() {
        let n = 16;
        let lower = Array1::zeros(n);
        let upper = Array1::zeros(n);
        let diag = Array1::from_elem(n, 4.0f32);
        let rhs = Array1::from_elem(n, 2.0f32);
        let x = solve_tridiagonal(&lower, &diag, &upper, &rhs).unwrap();
        for &v in x.iter() {
            assert_eq!(v, 0.5);
        }
    }

    #[test]
    fn singular_and_non_finite_systems_are_rejected() {
        let n = 4;
        let lower = Array1::zeros(n);
        let upper = Array1::zeros(n);
        let mut diag = Array1::from_elem(n, 1.0f32);
        let rhs = Array1::from_elem(n, 1.0f32);
        diag[2] = 0.;
        assert!(solve_tridiagonal(&lower, &diag, &upper, &rhs).is_none());
        diag[2] = f32::NAN;
        assert!(solve_tridiagonal(&lower, &diag, &upper, &rhs).is_none());
    }

    #[test]
    fn dense_solve_recovers_a_known_solution() {
        let a = DMatrix::from_row_slice(2, 2, &[3., 1., 1., 2.]);
        let b = DVector::from_vec(vec![5., 5.]);
        let x = solve_dense(&a, &b).unwrap();
        assert!((x[0] - 1.).abs() < 1e-12 && (x[1] - 2.).abs() < 1e-12);
    }

    #[test]
    fn dense_solve_rejects_singular_matrices() {
        let a = DMatrix::from_row_slice(2, 2, &[1., 2., 2., 4.]);
        let b = DVector::from_vec(vec![1., 1.]);
        assert!(solve_dense(&a, &b).is_none());
    }
}
