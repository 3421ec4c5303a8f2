use ndarray::{Array1, Array3, ArrayView1, ArrayView2};
use rand::Rng;

use super::gp::GaussProcPosterior;
use super::kernel::Kernel;
use super::{HeadGradients, Prediction};
use crate::codec::FeatureCodec;
use crate::errors::Result;

#[derive(Clone, Debug)]
pub struct JointPosterior<K: Kernel> {
    gp: GaussProcPosterior<K>,
    codec: FeatureCodec,
}

impl<K: Kernel> JointPosterior<K> {
    pub fn new(
        features: ArrayView2<f64>,
        targets: ArrayView2<f64>,
        kernel: K,
        mean: f64,
        noise_variance: f64,
        codec: FeatureCodec,
    ) -> Result<Self> {
        codec.decode_batch(features)?;
        let gp = GaussProcPosterior::new(
            features.to_owned(),
            targets.to_owned(),
            kernel,
            mean,
            noise_variance,
        )?;
        Ok(Self { gp, codec })
    }

    pub fn num_data(&self) -> usize {
        self.gp.num_data()
    }

    pub fn num_features(&self) -> usize {
        self.gp.num_features()
    }

    pub fn num_fantasies(&self) -> usize {
        self.gp.num_fantasies()
    }

    pub fn neg_log_likelihood(&self) -> f64 {
        self.gp.neg_log_likelihood()
    }

    fn checked(&self, test_features: ArrayView2<f64>) -> Result<()> {
        self.codec.decode_batch(test_features).map(|_| ())
    }

    pub fn predict(&self, test_features: ArrayView2<f64>) -> Result<Prediction> {
        self.checked(test_features)?;
        Ok(self.gp.predict(test_features))
    }

    pub fn sample_marginals<R: Rng + ?Sized>(
        &self,
        test_features: ArrayView2<f64>,
        num_samples: usize,
        rng: &mut R,
    ) -> Result<Array3<f64>> {
        self.checked(test_features)?;
        Ok(self.gp.sample_marginals(test_features, num_samples, rng))
    }

    pub fn sample_joint<R: Rng + ?Sized>(
        &self,
        test_features: ArrayView2<f64>,
        num_samples: usize,
        rng: &mut R,
    ) -> Result<Array3<f64>> {
        self.checked(test_features)?;
        self.gp.sample_joint(test_features, num_samples, rng)
    }

    pub fn backward_gradient(
        &self,
        input: ArrayView1<f64>,
        head_gradients: &HeadGradients,
        mean_data: f64,
        std_data: f64,
    ) -> Result<Array1<f64>> {
        self.codec.decode(&input.to_vec())?;
        let mut gradient = self
            .gp
            .backward_gradient(input, head_gradients, mean_data, std_data);
        let n = gradient.len();
        if n > 0 {
            gradient[n - 1] = 0.;
        }
        Ok(gradient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ResourceRange;
    use crate::model::kernel::{AdditiveKernel, CurveKernel, MultiTaskKernel, SquaredExp};
    use crate::TuneError;
    use ndarray::array;
    use rand::{rngs::StdRng, SeedableRng};

    fn range() -> ResourceRange {
        ResourceRange::new(1, 9).unwrap()
    }

    fn multitask() -> JointPosterior<MultiTaskKernel> {
        let features = array![[0.2, 1.], [0.2, 3.], [0.7, 1.], [0.7, 9.]];
        let targets = array![[0.9], [0.5], [0.1], [-0.4]];
        let kernel = MultiTaskKernel {
            base: SquaredExp::new(0.5, 1.),
            resource_lengthscale: 0.6,
            range: range(),
        };
        JointPosterior::new(
            features.view(),
            targets.view(),
            kernel,
            0.,
            1e-3,
            FeatureCodec::new(range()),
        )
        .unwrap()
    }

    #[test]
    fn multitask_predicts_unseen_resource_levels() {
        let posterior = multitask();
        let prediction = posterior.predict(array![[0.2, 9.], [0.7, 3.]].view()).unwrap();
        assert_eq!(prediction.means.shape(), &[2, 1]);
        assert!(prediction.variances.iter().all(|v| *v > 0. && *v < 1.));
    }

    #[test]
    fn out_of_range_resource_is_rejected() {
        let posterior = multitask();
        assert!(matches!(
            posterior.predict(array![[0.2, 10.]].view()),
            Err(TuneError::Range { .. })
        ));
        let mut rng = StdRng::seed_from_u64(1);
        assert!(posterior
            .sample_joint(array![[0.2, 0.]].view(), 1, &mut rng)
            .is_err());
    }

    #[test]
    fn resource_coordinate_has_zero_gradient() {
        let posterior = multitask();
        let head = HeadGradients {
            mean: vec![1.],
            std: vec![-1.],
        };
        let gradient = posterior
            .backward_gradient(array![0.4, 3.].view(), &head, 0., 1.)
            .unwrap();
        assert_eq!(gradient.len(), 2);
        assert_eq!(gradient[1], 0.);
    }

    #[test]
    fn additive_curve_ties_observations_of_one_configuration() {
        let features = array![[0.3, 1.], [0.3, 2.], [0.3, 3.], [0.8, 1.]];
        let targets = array![[1.], [0.7], [0.5], [0.9]];
        let kernel = AdditiveKernel {
            base: SquaredExp::new(0.2, 0.5),
            curve: CurveKernel::ExpDecay {
                alpha: 1.,
                beta: 1.,
                amplitude: 1.,
            },
        };
        let posterior = JointPosterior::new(
            features.view(),
            targets.view(),
            kernel,
            0.,
            1e-3,
            FeatureCodec::new(range()),
        )
        .unwrap();
        let prediction = posterior
            .predict(array![[0.3, 4.], [0.8, 4.]].view())
            .unwrap();
        assert!(prediction.variances[0] < prediction.variances[1]);
    }
}
