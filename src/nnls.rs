//! Non-negative least squares.
//!
//! Lawson-Hanson active set iteration. Each sub-problem is solved on the
//! normal equations of the passive columns only, so the full `AᵀA` is never
//! formed.
use crate::error::NnlsError;
use crate::sparse::CscMatrix;
use faer::linalg::solvers::Solve;
use faer::{Col, Side};

/// Stopping rules for [`nnls`].
#[derive(Clone, Copy, Debug, PartialEq, bon::Builder)]
pub struct NnlsOptions {
    /// Iteration stops once no active gradient component exceeds this value.
    #[builder(default = 0.0)]
    pub tolerance: f64,
    #[builder(default = 0)]
    pub min_iterations: usize,
    #[builder(default = 1000)]
    pub max_iterations: usize,
}

impl Default for NnlsOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Solves `min ‖A x - y‖²` subject to `x ≥ 0`.
///
/// # Examples
///
/// ```
/// use trigsim::nnls::{nnls, NnlsOptions};
/// use trigsim::sparse::{CscMatrix, TripletMatrix};
///
/// let mut triplets = TripletMatrix::new(2, 2);
/// triplets.push(0, 0, 1.0);
/// triplets.push(1, 1, 1.0);
/// let a = CscMatrix::from(triplets);
///
/// let x = nnls(&a, &[2.0, -3.0], &NnlsOptions::default())?;
/// assert_eq!(x, vec![2.0, 0.0]);
/// # Ok::<(), trigsim::error::NnlsError>(())
/// ```
pub fn nnls(a: &CscMatrix<f64>, y: &[f64], options: &NnlsOptions) -> Result<Vec<f64>, NnlsError> {
    if y.len() != a.nrows() {
        return Err(NnlsError::DimensionMismatch {
            expected: a.nrows(),
            got: y.len(),
        });
    }

    let n = a.ncols();
    let mut x = vec![0.0; n];
    let mut passive = vec![false; n];
    // Columns that cannot enter the passive set without making it singular.
    let mut excluded = vec![false; n];
    let mut iterations = 0;

    loop {
        let w = gradient(a, y, &x);
        let candidate = (0..n)
            .filter(|&j| !passive[j] && !excluded[j])
            .max_by(|&i, &j| w[i].total_cmp(&w[j]));
        let Some(t) = candidate else {
            break;
        };
        if w[t] <= 0.0 || (w[t] <= options.tolerance && iterations >= options.min_iterations) {
            break;
        }

        iterations += 1;
        if iterations > options.max_iterations {
            return Err(NnlsError::IterationLimit(options.max_iterations));
        }

        passive[t] = true;
        let mut first = true;
        loop {
            let set: Vec<usize> = (0..n).filter(|&j| passive[j]).collect();
            let z = solve_passive(a, y, &set);
            let Some(z) = z else {
                passive[t] = false;
                excluded[t] = true;
                break;
            };

            if z.iter().all(|&zj| zj > 0.0) {
                for (&j, &zj) in set.iter().zip(&z) {
                    x[j] = zj;
                }
                break;
            }
            if first {
                if let Some(k) = set.iter().position(|&j| j == t) {
                    if z[k] <= 0.0 {
                        // Rounding left the entering column with no descent.
                        passive[t] = false;
                        excluded[t] = true;
                        break;
                    }
                }
            }
            first = false;

            let alpha = set
                .iter()
                .zip(&z)
                .filter(|(_, &zj)| zj <= 0.0)
                .map(|(&j, &zj)| x[j] / (x[j] - zj))
                .fold(f64::INFINITY, f64::min);
            for (&j, &zj) in set.iter().zip(&z) {
                x[j] += alpha * (zj - x[j]);
                if x[j] <= f64::EPSILON * zj.abs().max(1.0) {
                    x[j] = 0.0;
                    passive[j] = false;
                }
            }
        }
        // A new passive set changes which columns are independent of it.
        if !excluded[t] {
            excluded.iter_mut().for_each(|e| *e = false);
        }
    }

    Ok(x)
}

fn gradient(a: &CscMatrix<f64>, y: &[f64], x: &[f64]) -> Vec<f64> {
    let ax = a.mul_vec(x);
    let residual: Vec<f64> = y.iter().zip(&ax).map(|(yi, axi)| yi - axi).collect();
    a.transpose_mul_vec(&residual)
}

// `None` if the passive columns are numerically dependent.
fn solve_passive(a: &CscMatrix<f64>, y: &[f64], set: &[usize]) -> Option<Vec<f64>> {
    let gram = a.gram(set);
    let rhs = Col::from_fn(set.len(), |i| a.column_dot_dense(set[i], y));
    let llt = gram.llt(Side::Lower).ok()?;
    let l = llt.L();
    if (0..set.len()).any(|j| !(l[(j, j)] * l[(j, j)] > f64::EPSILON * gram[(j, j)].abs())) {
        return None;
    }
    let z = llt.solve(&rhs);
    Some(z.iter().copied().collect())
}
