use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use rand_distr::StandardNormal;

use super::kernel::Kernel;
use super::linalg::Cholesky;
use super::{HeadGradients, Prediction};
use crate::errors::{Result, TuneError};

pub(crate) const MIN_POSTERIOR_VARIANCE: f64 = 1e-9;

#[derive(Clone, Debug)]
pub struct GaussProcPosterior<K: Kernel> {
    features: Array2<f64>,
    kernel: K,
    mean: f64,
    noise_variance: f64,
    chol: Cholesky,
    pred_mat: Array2<f64>,
    centered_targets: Array2<f64>,
}

impl<K: Kernel> GaussProcPosterior<K> {
    pub fn new(
        features: Array2<f64>,
        targets: Array2<f64>,
        kernel: K,
        mean: f64,
        noise_variance: f64,
    ) -> Result<Self> {
        if features.nrows() == 0 {
            return Err(TuneError::Numerical(
                "cannot condition a posterior on zero data points".to_string(),
            ));
        }
        if features.nrows() != targets.nrows() || targets.ncols() == 0 {
            return Err(TuneError::Numerical(format!(
                "features have {} rows but targets have shape {:?}",
                features.nrows(),
                targets.shape()
            )));
        }
        let mut covariance = kernel.matrix(features.view(), features.view());
        covariance
            .diag_mut()
            .mapv_inplace(|v| v + noise_variance);
        let (chol, _) = Cholesky::factor_with_jitter(covariance.view())?;
        let centered_targets = targets.mapv(|y| y - mean);
        let pred_mat = chol.solve(centered_targets.view());
        Ok(Self {
            features,
            kernel,
            mean,
            noise_variance,
            chol,
            pred_mat,
            centered_targets,
        })
    }

    pub fn num_data(&self) -> usize {
        self.features.nrows()
    }

    pub fn num_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn num_fantasies(&self) -> usize {
        self.pred_mat.ncols()
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn predict(&self, test_features: ArrayView2<f64>) -> Prediction {
        let cross = self.kernel.matrix(self.features.view(), test_features);
        let means = cross.t().dot(&self.pred_mat).mapv(|v| v + self.mean);
        let half = self.chol.solve_lower(cross.view());
        let explained = half.mapv(|v| v * v).sum_axis(Axis(0));
        let variances = (self.kernel.diagonal(test_features) - explained)
            .mapv(|v| v.max(MIN_POSTERIOR_VARIANCE));
        Prediction { means, variances }
    }

    pub fn neg_log_likelihood(&self) -> f64 {
        let n = self.num_data() as f64;
        let m = self.num_fantasies() as f64;
        let quadratic = (&self.centered_targets * &self.pred_mat).sum() / m;
        0.5 * (quadratic + self.chol.log_det() + n * (2. * std::f64::consts::PI).ln())
    }

    pub fn sample_marginals<R: Rng + ?Sized>(
        &self,
        test_features: ArrayView2<f64>,
        num_samples: usize,
        rng: &mut R,
    ) -> Array3<f64> {
        let prediction = self.predict(test_features);
        let stds = prediction
            .variances
            .mapv(|v| (v + self.noise_variance).sqrt());
        Array3::from_shape_fn(
            (test_features.nrows(), self.num_fantasies(), num_samples),
            |(i, j, _)| {
                let z: f64 = rng.sample(StandardNormal);
                prediction.means[[i, j]] + stds[i] * z
            },
        )
    }

    pub fn sample_joint<R: Rng + ?Sized>(
        &self,
        test_features: ArrayView2<f64>,
        num_samples: usize,
        rng: &mut R,
    ) -> Result<Array3<f64>> {
        let num_test = test_features.nrows();
        let cross = self.kernel.matrix(self.features.view(), test_features);
        let means = cross.t().dot(&self.pred_mat).mapv(|v| v + self.mean);
        let half = self.chol.solve_lower(cross.view());
        let mut covariance = self.kernel.matrix(test_features, test_features) - half.t().dot(&half);
        covariance
            .diag_mut()
            .mapv_inplace(|v| v.max(MIN_POSTERIOR_VARIANCE) + self.noise_variance);
        let (chol, _) = Cholesky::factor_with_jitter(covariance.view())?;
        let mut samples = Array3::zeros((num_test, self.num_fantasies(), num_samples));
        for j in 0..self.num_fantasies() {
            for s in 0..num_samples {
                let z: Array1<f64> = (0..num_test).map(|_| rng.sample(StandardNormal)).collect();
                let draw = chol.lower().dot(&z);
                for i in 0..num_test {
                    samples[[i, j, s]] = means[[i, j]] + draw[i];
                }
            }
        }
        Ok(samples)
    }

    pub fn backward_gradient(
        &self,
        input: ArrayView1<f64>,
        head_gradients: &HeadGradients,
        _mean_data: f64,
        std_data: f64,
    ) -> Array1<f64> {
        let n = self.num_data();
        let dim = input.len();
        let mut kernel_gradients = Array2::<f64>::zeros((dim, n));
        let mut cross = Array1::<f64>::zeros(n);
        for (i, row) in self.features.rows().into_iter().enumerate() {
            kernel_gradients
                .column_mut(i)
                .assign(&self.kernel.gradient_first(input, row));
            cross[i] = self.kernel.eval(input, row);
        }

        let mut gradient = Array1::<f64>::zeros(dim);
        for (j, head_mean) in head_gradients.mean.iter().enumerate() {
            gradient.scaled_add(*head_mean, &kernel_gradients.dot(&self.pred_mat.column(j)));
        }

        let head_std: f64 = head_gradients.std.iter().sum();
        if head_std != 0. {
            let solved = self.chol.solve_vector(cross.view());
            let variance = (self.kernel.eval(input, input) - cross.dot(&solved))
                .max(MIN_POSTERIOR_VARIANCE);
            let d_variance = kernel_gradients.dot(&solved) * -2.;
            gradient.scaled_add(head_std / (2. * variance.sqrt()), &d_variance);
        }
        gradient * std_data
    }
}
