pub mod factory;
pub mod gp;
pub mod independent;
pub mod joint;
pub mod kernel;
pub(crate) mod linalg;

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

pub use factory::{CachedFit, FittedModel, Hyperparameters, ModelFactory, TrainingData};
pub use gp::GaussProcPosterior;
pub use independent::IndependentGpPosterior;
pub use joint::JointPosterior;
pub use kernel::{AdditiveKernel, CurveKernel, Kernel, MultiTaskKernel, SquaredExp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "gp_multitask")]
    MultiTask,
    #[serde(rename = "gp_independent")]
    Independent,
    #[serde(rename = "gp_issm")]
    Issm,
    #[serde(rename = "gp_expdecay")]
    ExpDecay,
}

impl ModelKind {
    pub fn is_additive(&self) -> bool {
        matches!(self, ModelKind::Issm | ModelKind::ExpDecay)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub means: Array2<f64>,
    pub variances: Array1<f64>,
}

impl Prediction {
    pub fn stds(&self) -> Array1<f64> {
        self.variances.mapv(f64::sqrt)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeadGradients {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

#[derive(Clone, Debug)]
pub enum PosteriorState {
    MultiTask(JointPosterior<MultiTaskKernel>),
    Independent(IndependentGpPosterior),
    Additive(JointPosterior<AdditiveKernel>),
}

impl PosteriorState {
    /// Resource `predict` can serve in place of `target`. Independent GPs
    /// only predict at levels with data; the largest such level is used.
    pub fn supported_resource(&self, target: u32) -> Option<u32> {
        match self {
            Self::Independent(state) => {
                if state.resources().any(|r| r == target) {
                    Some(target)
                } else {
                    state.resources().last()
                }
            }
            _ => Some(target),
        }
    }

    pub fn num_data(&self) -> usize {
        match self {
            Self::MultiTask(state) => state.num_data(),
            Self::Independent(state) => state.num_data(),
            Self::Additive(state) => state.num_data(),
        }
    }

    pub fn num_features(&self) -> usize {
        match self {
            Self::MultiTask(state) => state.num_features(),
            Self::Independent(state) => state.num_features(),
            Self::Additive(state) => state.num_features(),
        }
    }

    pub fn num_fantasies(&self) -> usize {
        match self {
            Self::MultiTask(state) => state.num_fantasies(),
            Self::Independent(state) => state.num_fantasies(),
            Self::Additive(state) => state.num_fantasies(),
        }
    }

    pub fn predict(&self, test_features: ArrayView2<f64>) -> Result<Prediction> {
        match self {
            Self::MultiTask(state) => state.predict(test_features),
            Self::Independent(state) => state.predict(test_features),
            Self::Additive(state) => state.predict(test_features),
        }
    }

    pub fn sample_marginals<R: Rng + ?Sized>(
        &self,
        test_features: ArrayView2<f64>,
        num_samples: usize,
        rng: &mut R,
    ) -> Result<Array3<f64>> {
        match self {
            Self::MultiTask(state) => state.sample_marginals(test_features, num_samples, rng),
            Self::Independent(state) => state.sample_marginals(test_features, num_samples, rng),
            Self::Additive(state) => state.sample_marginals(test_features, num_samples, rng),
        }
    }

    pub fn sample_joint<R: Rng + ?Sized>(
        &self,
        test_features: ArrayView2<f64>,
        num_samples: usize,
        rng: &mut R,
    ) -> Result<Array3<f64>> {
        match self {
            Self::MultiTask(state) => state.sample_joint(test_features, num_samples, rng),
            Self::Independent(state) => state.sample_joint(test_features, num_samples, rng),
            Self::Additive(state) => state.sample_joint(test_features, num_samples, rng),
        }
    }

    pub fn neg_log_likelihood(&self) -> f64 {
        match self {
            Self::MultiTask(state) => state.neg_log_likelihood(),
            Self::Independent(state) => state.neg_log_likelihood(),
            Self::Additive(state) => state.neg_log_likelihood(),
        }
    }

    pub fn backward_gradient(
        &self,
        input: ArrayView1<f64>,
        head_gradients: &HeadGradients,
        mean_data: f64,
        std_data: f64,
    ) -> Result<Array1<f64>> {
        match self {
            Self::MultiTask(state) => {
                state.backward_gradient(input, head_gradients, mean_data, std_data)
            }
            Self::Independent(state) => {
                state.backward_gradient(input, head_gradients, mean_data, std_data)
            }
            Self::Additive(state) => {
                state.backward_gradient(input, head_gradients, mean_data, std_data)
            }
        }
    }
}
