use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::errors::{Result, TuneError};

const JITTER_START: f64 = 1e-9;
const JITTER_MAX: f64 = 1e-2;

#[derive(Clone, Debug)]
pub(crate) struct Cholesky {
    lower: Array2<f64>,
}

impl Cholesky {
    pub fn factor(matrix: ArrayView2<f64>) -> Result<Self> {
        let n = matrix.nrows();
        if n != matrix.ncols() {
            return Err(TuneError::Numerical(format!(
                "cannot factor a non-square {}x{} matrix",
                n,
                matrix.ncols()
            )));
        }
        let mut lower = Array2::<f64>::zeros((n, n));
        for j in 0..n {
            let mut diagonal = matrix[[j, j]];
            for k in 0..j {
                diagonal -= lower[[j, k]] * lower[[j, k]];
            }
            if !(diagonal > 0.) || !diagonal.is_finite() {
                return Err(TuneError::Numerical(format!(
                    "matrix is not positive definite (pivot {} = {})",
                    j, diagonal
                )));
            }
            let pivot = diagonal.sqrt();
            lower[[j, j]] = pivot;
            for i in (j + 1)..n {
                let mut value = matrix[[i, j]];
                for k in 0..j {
                    value -= lower[[i, k]] * lower[[j, k]];
                }
                lower[[i, j]] = value / pivot;
            }
        }
        Ok(Self { lower })
    }

    pub fn factor_with_jitter(matrix: ArrayView2<f64>) -> Result<(Self, f64)> {
        if let Ok(factor) = Self::factor(matrix) {
            return Ok((factor, 0.));
        }
        let scale = matrix.diag().mean().unwrap_or(1.).abs().max(1e-12);
        let mut jitter = JITTER_START * scale;
        while jitter <= JITTER_MAX * scale {
            let mut jittered = matrix.to_owned();
            jittered.diag_mut().mapv_inplace(|v| v + jitter);
            if let Ok(factor) = Self::factor(jittered.view()) {
                log::debug!("Cholesky factorization needed jitter {:e}", jitter);
                return Ok((factor, jitter));
            }
            jitter *= 10.;
        }
        Err(TuneError::Numerical(format!(
            "Cholesky factorization failed even with jitter {:e}",
            JITTER_MAX * scale
        )))
    }

    pub fn lower(&self) -> &Array2<f64> {
        &self.lower
    }

    pub fn size(&self) -> usize {
        self.lower.nrows()
    }

    pub fn solve_lower(&self, rhs: ArrayView2<f64>) -> Array2<f64> {
        let n = self.size();
        let mut x = rhs.to_owned();
        for col in 0..x.ncols() {
            for i in 0..n {
                let mut value = x[[i, col]];
                for k in 0..i {
                    value -= self.lower[[i, k]] * x[[k, col]];
                }
                x[[i, col]] = value / self.lower[[i, i]];
            }
        }
        x
    }

    pub fn solve_upper(&self, rhs: ArrayView2<f64>) -> Array2<f64> {
        let n = self.size();
        let mut x = rhs.to_owned();
        for col in 0..x.ncols() {
            for i in (0..n).rev() {
                let mut value = x[[i, col]];
                for k in (i + 1)..n {
                    value -= self.lower[[k, i]] * x[[k, col]];
                }
                x[[i, col]] = value / self.lower[[i, i]];
            }
        }
        x
    }

    pub fn solve(&self, rhs: ArrayView2<f64>) -> Array2<f64> {
        let half = self.solve_lower(rhs);
        self.solve_upper(half.view())
    }

    pub fn solve_vector(&self, rhs: ArrayView1<f64>) -> Array1<f64> {
        let column = rhs.to_owned().insert_axis(ndarray::Axis(1));
        self.solve(column.view()).column(0).to_owned()
    }

    pub fn log_det(&self) -> f64 {
        2. * self.lower.diag().iter().map(|v| v.ln()).sum::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn spd() -> Array2<f64> {
        array![[4., 2., 0.4], [2., 3., 0.5], [0.4, 0.5, 2.]]
    }

    #[test]
    fn factor_reconstructs_matrix() {
        let a = spd();
        let chol = Cholesky::factor(a.view()).unwrap();
        let rebuilt = chol.lower().dot(&chol.lower().t());
        for (x, y) in rebuilt.iter().zip(a.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn solve_inverts_matrix() {
        let a = spd();
        let b = array![[1., 0.], [2., 1.], [3., -1.]];
        let chol = Cholesky::factor(a.view()).unwrap();
        let x = chol.solve(b.view());
        let back = a.dot(&x);
        for (x, y) in back.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-10);
        }
        let v = chol.solve_vector(b.column(0));
        assert!((v[0] - x[[0, 0]]).abs() < 1e-12);
    }

    #[test]
    fn log_det_matches_direct_computation() {
        let a = array![[2., 0.], [0., 8.]];
        let chol = Cholesky::factor(a.view()).unwrap();
        assert!((chol.log_det() - 16f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn singular_matrix_needs_jitter() {
        let a = array![[1., 1.], [1., 1.]];
        assert!(Cholesky::factor(a.view()).is_err());
        let (_, jitter) = Cholesky::factor_with_jitter(a.view()).unwrap();
        assert!(jitter > 0.);
    }

    #[test]
    fn indefinite_matrix_fails() {
        let a = array![[1., 0.], [0., -5.]];
        assert!(matches!(
            Cholesky::factor_with_jitter(a.view()),
            Err(TuneError::Numerical(_))
        ));
    }
}
