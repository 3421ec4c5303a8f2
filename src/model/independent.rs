use std::collections::BTreeMap;

use itertools::Itertools;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rand::Rng;

use super::gp::GaussProcPosterior;
use super::kernel::SquaredExp;
use super::{HeadGradients, Prediction};
use crate::codec::FeatureCodec;
use crate::errors::{Result, TuneError};

/// Posterior for f(x, r) where each f(., r) is an independent GP.
///
/// The GPs share the kernel over x but each resource level r has its own
/// constant mean mu_r and covariance scale c_r. There is a posterior only for
/// levels with at least one training row, so `predict` and
/// `sample_marginals` fail at any other level. `sample_joint` falls back to
/// mu_r there instead.
#[derive(Clone, Debug)]
pub struct IndependentGpPosterior {
    states: BTreeMap<u32, GaussProcPosterior<SquaredExp>>,
    means: BTreeMap<u32, f64>,
    codec: FeatureCodec,
    num_data: usize,
    num_features: usize,
    num_fantasies: usize,
}

impl IndependentGpPosterior {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        features: ArrayView2<f64>,
        targets: ArrayView2<f64>,
        kernel: SquaredExp,
        means: &BTreeMap<u32, f64>,
        covariance_scales: &BTreeMap<u32, f64>,
        noise_variance: f64,
        codec: FeatureCodec,
    ) -> Result<Self> {
        if !means.keys().eq(covariance_scales.keys()) {
            return Err(TuneError::InvalidConfiguration(
                "means and covariance scales must cover the same resource levels".to_string(),
            ));
        }
        let (configs, resources) = codec.decode_batch(features)?;
        if let Some(r) = resources.iter().find(|r| !means.contains_key(r)) {
            return Err(TuneError::UnsupportedResource(*r));
        }

        let mut states = BTreeMap::new();
        for (&resource, &mean) in means {
            let rows = resources
                .iter()
                .positions(|r| *r == resource)
                .collect::<Vec<_>>();
            if rows.is_empty() {
                continue;
            }
            let state = GaussProcPosterior::new(
                configs.select(Axis(0), &rows),
                targets.select(Axis(0), &rows),
                kernel.scaled(covariance_scales[&resource]),
                mean,
                noise_variance,
            )?;
            states.insert(resource, state);
        }

        Ok(Self {
            states,
            means: means.clone(),
            codec,
            num_data: features.nrows(),
            num_features: features.ncols(),
            num_fantasies: targets.ncols(),
        })
    }

    pub fn num_data(&self) -> usize {
        self.num_data
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn num_fantasies(&self) -> usize {
        self.num_fantasies
    }

    pub fn resources(&self) -> impl Iterator<Item = u32> + '_ {
        self.states.keys().copied()
    }

    fn state(&self, resource: u32) -> Result<&GaussProcPosterior<SquaredExp>> {
        self.states
            .get(&resource)
            .ok_or(TuneError::UnsupportedResource(resource))
    }

    pub fn neg_log_likelihood(&self) -> f64 {
        self.states.values().map(|s| s.neg_log_likelihood()).sum()
    }

    pub fn predict(&self, test_features: ArrayView2<f64>) -> Result<Prediction> {
        let (configs, resources) = self.codec.decode_batch(test_features)?;
        if let Some(&first) = resources.first() {
            if resources.iter().all(|r| *r == first) {
                return Ok(self.state(first)?.predict(configs.view()));
            }
        }

        let num_rows = resources.len();
        let mut means = Array2::zeros((num_rows, self.num_fantasies));
        let mut variances = Array1::zeros(num_rows);
        // Rows are grouped by resource so each GP sees one batch; results are
        // written back at the caller's row positions.
        let order = (0..num_rows).sorted_by_key(|&i| resources[i]);
        for (resource, group) in &order.group_by(|&i| resources[i]) {
            let rows = group.collect::<Vec<_>>();
            let prediction = self
                .state(resource)?
                .predict(configs.select(Axis(0), &rows).view());
            for (k, &row) in rows.iter().enumerate() {
                means.row_mut(row).assign(&prediction.means.row(k));
                variances[row] = prediction.variances[k];
            }
        }
        Ok(Prediction { means, variances })
    }

    fn split_features(
        &self,
        test_features: ArrayView2<f64>,
    ) -> Result<(Array2<f64>, BTreeMap<u32, Vec<usize>>)> {
        let (configs, resources) = self.codec.decode_batch(test_features)?;
        let mut groups: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (row, resource) in resources.into_iter().enumerate() {
            groups.entry(resource).or_default().push(row);
        }
        Ok((configs, groups))
    }

    pub fn sample_marginals<R: Rng + ?Sized>(
        &self,
        test_features: ArrayView2<f64>,
        num_samples: usize,
        rng: &mut R,
    ) -> Result<Array3<f64>> {
        let (configs, groups) = self.split_features(test_features)?;
        let mut samples = Array3::zeros((configs.nrows(), self.num_fantasies, num_samples));
        for (resource, rows) in groups {
            let drawn =
                self.state(resource)?
                    .sample_marginals(configs.select(Axis(0), &rows).view(), num_samples, rng);
            for (k, &row) in rows.iter().enumerate() {
                samples
                    .index_axis_mut(Axis(0), row)
                    .assign(&drawn.index_axis(Axis(0), k));
            }
        }
        Ok(samples)
    }

    pub fn sample_joint<R: Rng + ?Sized>(
        &self,
        test_features: ArrayView2<f64>,
        num_samples: usize,
        rng: &mut R,
    ) -> Result<Array3<f64>> {
        let (configs, groups) = self.split_features(test_features)?;
        let mut samples = Array3::zeros((configs.nrows(), self.num_fantasies, num_samples));
        for (resource, rows) in groups {
            match self.states.get(&resource) {
                Some(state) => {
                    let drawn =
                        state.sample_joint(configs.select(Axis(0), &rows).view(), num_samples, rng)?;
                    for (k, &row) in rows.iter().enumerate() {
                        samples
                            .index_axis_mut(Axis(0), row)
                            .assign(&drawn.index_axis(Axis(0), k));
                    }
                }
                None => {
                    let prior_mean = *self
                        .means
                        .get(&resource)
                        .ok_or(TuneError::UnsupportedResource(resource))?;
                    for &row in &rows {
                        samples.index_axis_mut(Axis(0), row).fill(prior_mean);
                    }
                }
            }
        }
        Ok(samples)
    }

    pub fn backward_gradient(
        &self,
        input: ArrayView1<f64>,
        head_gradients: &HeadGradients,
        mean_data: f64,
        std_data: f64,
    ) -> Result<Array1<f64>> {
        let (config, resource) = self.codec.decode(&input.to_vec())?;
        let inner = self.state(resource)?.backward_gradient(
            ArrayView1::from(&config),
            head_gradients,
            mean_data,
            std_data,
        );
        Ok(inner.into_iter().chain(std::iter::once(0.)).collect())
    }
}
