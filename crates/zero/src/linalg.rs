//! Small dense linear algebra kernels used by the factorization models
//!
//! Matrices here are at most `nb_components x nb_components` for the solvers,
//! so plain loops over ndarray are enough.

use crate::error::{Error, Result};
use ndarray::{s, Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::Rng;

const EPSILON: f64 = 1e-12;
const JACOBI_MAX_SWEEPS: usize = 100;
const SVD_OVERSAMPLING: usize = 5;

/// Solve `A * x = b` for symmetric positive definite `A` with a Cholesky
/// decomposition `A = L * L^T`
///
/// # Errors
///
/// `NumericalFailure` if `A` is not positive definite, `DimensionMismatch` if
/// the shapes disagree.
pub fn solve_cholesky(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>> {
    let n = a.nrows();
    if a.ncols() != n || b.len() != n {
        return Err(Error::DimensionMismatch {
            expected: format!("{n}x{n} system"),
            actual: format!("{}x{} matrix, {} rhs", a.nrows(), a.ncols(), b.len()),
        });
    }

    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0.0;
            for k in 0..j {
                sum += l[[i, k]] * l[[j, k]];
            }

            if i == j {
                let diag = a[[i, i]] - sum;
                if diag <= 0.0 || !diag.is_finite() {
                    return Err(Error::NumericalFailure(
                        "matrix is not positive definite".to_string(),
                    ));
                }
                l[[i, j]] = diag.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }

    // Forward substitution: L * y = b
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = 0.0;
        for j in 0..i {
            sum += l[[i, j]] * y[j];
        }
        y[i] = (b[i] - sum) / l[[i, i]];
    }

    // Backward substitution: L^T * x = y
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = 0.0;
        for j in (i + 1)..n {
            sum += l[[j, i]] * x[j];
        }
        x[i] = (y[i] - sum) / l[[i, i]];
    }

    Ok(x)
}

/// Regularized least squares: `(F^T F + reg * I) x = F^T r`
///
/// `factors` holds one row per observation.
pub fn ridge_solve(factors: &Array2<f64>, targets: &Array1<f64>, reg: f64) -> Result<Array1<f64>> {
    let k = factors.ncols();
    let mut a = factors.t().dot(factors);
    for i in 0..k {
        a[[i, i]] += reg;
    }
    let b = factors.t().dot(targets);
    solve_cholesky(&a, &b)
}

/// Modified Gram-Schmidt on the columns of `m`, in place
///
/// Columns that are numerically dependent on earlier ones are zeroed.
pub fn orthonormalize_columns(m: &mut Array2<f64>) {
    let ncols = m.ncols();
    for j in 0..ncols {
        for i in 0..j {
            let proj = m.column(i).dot(&m.column(j));
            let prev = m.column(i).to_owned();
            m.column_mut(j).scaled_add(-proj, &prev);
        }
        let norm = m.column(j).dot(&m.column(j)).sqrt();
        if norm > EPSILON {
            m.column_mut(j).mapv_inplace(|v| v / norm);
        } else {
            m.column_mut(j).fill(0.0);
        }
    }
}

/// Eigendecomposition of a symmetric matrix by cyclic Jacobi rotations
///
/// Returns eigenvalues in decreasing order and the matching eigenvectors as
/// columns.
pub fn symmetric_eigen(a: &Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let n = a.nrows();
    let mut a = a.clone();
    let mut v = Array2::<f64>::eye(n);
    let scale: f64 = a.iter().map(|x| x * x).sum::<f64>().max(EPSILON);

    for _ in 0..JACOBI_MAX_SWEEPS {
        let mut off = 0.0;
        for p in 0..n {
            for q in (p + 1)..n {
                off += a[[p, q]] * a[[p, q]];
            }
        }
        if off <= 1e-24 * scale {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[[p, q]];
                if apq.abs() < f64::MIN_POSITIVE {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[[k, p]];
                    let akq = a[[k, q]];
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[[p, k]];
                    let aqk = a[[q, k]];
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| a[[j, j]].total_cmp(&a[[i, i]]));

    let values = Array1::from_iter(order.iter().map(|&i| a[[i, i]]));
    let vectors = v.select(Axis(1), &order);
    (values, vectors)
}

/// Truncated singular value decomposition `M ~ U diag(sigma) VT`
pub struct TruncatedSvd {
    /// `rows x k`
    pub u: Array2<f64>,
    /// `k`, decreasing
    pub sigma: Array1<f64>,
    /// `k x cols`
    pub vt: Array2<f64>,
}

/// Randomized subspace iteration for the `k` leading singular triplets
///
/// `k` is clamped to `min(rows, cols)`.
pub fn truncated_svd(
    m: &Array2<f64>,
    k: usize,
    nb_iterations: usize,
    rng: &mut StdRng,
) -> Result<TruncatedSvd> {
    let (rows, cols) = m.dim();
    let rank = rows.min(cols);
    if rank == 0 {
        return Err(Error::EmptyInput("cannot factorize an empty matrix".to_string()));
    }
    let k = k.min(rank);
    let width = (k + SVD_OVERSAMPLING).min(rank);

    let mut q = Array2::<f64>::zeros((cols, width));
    q.mapv_inplace(|_| rng.gen_range(-1.0..1.0));

    let mut z = m.dot(&q);
    orthonormalize_columns(&mut z);
    for _ in 0..nb_iterations {
        q = m.t().dot(&z);
        orthonormalize_columns(&mut q);
        z = m.dot(&q);
        orthonormalize_columns(&mut z);
    }

    // Project onto the captured range and solve the small problem exactly.
    let b = z.t().dot(m);
    let gram = b.dot(&b.t());
    let (eigenvalues, w) = symmetric_eigen(&gram);

    let w = w.slice(s![.., ..k]).to_owned();
    let sigma = eigenvalues.slice(s![..k]).mapv(|l| l.max(0.0).sqrt());
    let u = z.dot(&w);
    let mut vt = w.t().dot(&b);
    for (i, mut row) in vt.axis_iter_mut(Axis(0)).enumerate() {
        if sigma[i] > EPSILON {
            row.mapv_inplace(|v| v / sigma[i]);
        } else {
            row.fill(0.0);
        }
    }

    Ok(TruncatedSvd { u, sigma, vt })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn test_solve_cholesky() {
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        let b = array![2.0, 1.0];
        let x = solve_cholesky(&a, &b).unwrap();
        let residual = a.dot(&x) - &b;
        assert!(residual.iter().all(|r| r.abs() < 1e-12));
    }

    #[test]
    fn test_solve_cholesky_not_positive_definite() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        let b = array![1.0, 1.0];
        assert!(matches!(
            solve_cholesky(&a, &b),
            Err(Error::NumericalFailure(_))
        ));
    }

    #[test]
    fn test_orthonormalize_columns() {
        let mut m = array![[1.0, 1.0, 2.0], [0.0, 1.0, 2.0], [1.0, 0.0, 2.0]];
        orthonormalize_columns(&mut m);
        let gram = m.t().dot(&m);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((gram[[i, j]] - expected).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn test_symmetric_eigen() {
        let a = array![[2.0, 1.0], [1.0, 2.0]];
        let (values, vectors) = symmetric_eigen(&a);
        assert!((values[0] - 3.0).abs() < 1e-10);
        assert!((values[1] - 1.0).abs() < 1e-10);

        let reconstructed = vectors.dot(&Array2::from_diag(&values)).dot(&vectors.t());
        for (x, y) in reconstructed.iter().zip(a.iter()) {
            assert!((x - y).abs() < 1e-10);
        }
    }

    #[test]
    fn test_truncated_svd_recovers_low_rank_matrix() {
        let u = array![[1.0, 0.0], [0.5, 1.0], [0.0, 2.0], [1.0, 1.0]];
        let vt = array![[1.0, 2.0, 0.0, 1.0, 0.5], [0.0, 1.0, 1.0, 0.0, 2.0]];
        let m = u.dot(&vt);

        let mut rng = StdRng::seed_from_u64(42);
        let svd = truncated_svd(&m, 2, 10, &mut rng).unwrap();
        assert_eq!(svd.u.dim(), (4, 2));
        assert_eq!(svd.vt.dim(), (2, 5));
        assert!(svd.sigma[0] >= svd.sigma[1]);

        let approx = svd.u.dot(&Array2::from_diag(&svd.sigma)).dot(&svd.vt);
        for (x, y) in approx.iter().zip(m.iter()) {
            assert!((x - y).abs() < 1e-8);
        }
    }

    #[test]
    fn test_truncated_svd_clamps_rank() {
        let m = array![[1.0, 2.0, 3.0], [2.0, 4.0, 6.5]];
        let mut rng = StdRng::seed_from_u64(1);
        let svd = truncated_svd(&m, 10, 5, &mut rng).unwrap();
        assert_eq!(svd.sigma.len(), 2);
    }
}
