use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use friedrich::gaussian_process::GaussianProcessBuilder;
use friedrich::kernel::SquaredExp as FriedrichSquaredExp;
use friedrich::prior::ConstantPrior;
use ndarray::{concatenate, Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::kernel::{AdditiveKernel, CurveKernel, MultiTaskKernel, SquaredExp};
use super::{IndependentGpPosterior, JointPosterior, ModelKind, PosteriorState};
use crate::codec::FeatureCodec;
use crate::config::{Mode, ModelConfig, SearcherConfig, SearcherData};
use crate::errors::{Result, TuneError};
use crate::ledger::LedgerState;
use crate::library::ConfigSpace;
use crate::rungs::RungLevels;

const MIN_NOISE_VARIANCE: f64 = 1e-6;
const MAX_NOISE_VARIANCE: f64 = 1.;
const INVALID_LIKELIHOOD: f64 = 1e10;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KindParameters {
    MultiTask {
        resource_lengthscale: f64,
    },
    Independent {
        means: BTreeMap<u32, f64>,
        covariance_scales: BTreeMap<u32, f64>,
    },
    Curve(CurveKernel),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hyperparameters {
    pub base: SquaredExp,
    pub noise_variance: f64,
    pub specific: KindParameters,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedFit {
    pub kind: ModelKind,
    pub hyperparameters: Hyperparameters,
    pub num_at_max: usize,
}

#[derive(Clone, Debug)]
pub struct TrainingData {
    pub features: Array2<f64>,
    pub targets: Array1<f64>,
    pub pending: Array2<f64>,
    pub mean_data: f64,
    pub std_data: f64,
    pub num_at_max: usize,
}

impl TrainingData {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn resources(&self) -> impl Iterator<Item = u32> + '_ {
        self.features
            .column(self.features.ncols() - 1)
            .into_iter()
            .map(|r| *r as u32)
    }

    pub fn incumbent(&self, resource: u32) -> Option<f64> {
        let at_resource = self
            .resources()
            .zip(self.targets.iter())
            .filter(|(r, _)| *r == resource)
            .map(|(_, t)| *t)
            .min_by(f64::total_cmp);
        at_resource.or_else(|| self.targets.iter().copied().min_by(f64::total_cmp))
    }

    pub fn to_data_scale(&self, normalized: f64) -> f64 {
        normalized * self.std_data + self.mean_data
    }
}

pub struct FittedModel {
    pub state: PosteriorState,
    pub hyperparameters: Hyperparameters,
    pub data: TrainingData,
    pub refitted: bool,
}

#[derive(Debug)]
pub struct ModelFactory {
    config: ModelConfig,
    space: ConfigSpace,
    codec: FeatureCodec,
    rungs: RungLevels,
    searcher_data: SearcherData,
    mode: Mode,
    cache: Option<CachedFit>,
    fresh_fit_requested: bool,
}

impl ModelFactory {
    pub fn new(space: ConfigSpace, rungs: RungLevels, config: &SearcherConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: config.model.clone(),
            space,
            codec: FeatureCodec::new(rungs.range()),
            rungs,
            searcher_data: config.searcher_data,
            mode: config.mode,
            cache: None,
            fresh_fit_requested: false,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&CachedFit> {
        self.cache.as_ref()
    }

    pub fn restore(&mut self, cache: Option<CachedFit>) {
        self.cache = cache;
        self.fresh_fit_requested = true;
    }

    pub fn request_fresh_fit(&mut self) {
        self.fresh_fit_requested = true;
    }

    /// Resource levels the model can be conditioned on.
    pub fn supported_resources(&self) -> Vec<u32> {
        match self.searcher_data {
            SearcherData::Rungs => self.rungs.levels().to_vec(),
            SearcherData::All => (self.rungs.range().min..=self.rungs.max()).collect(),
        }
    }

    fn is_training_resource(&self, resource: u32) -> bool {
        match self.searcher_data {
            SearcherData::Rungs => self.rungs.contains(resource),
            SearcherData::All => self.rungs.range().contains(resource),
        }
    }

    pub fn training_data(&self, snapshot: &LedgerState) -> Result<TrainingData> {
        let width = self.space.encoded_dim() + 1;
        let mut rows = Vec::new();
        let mut metrics = Vec::new();
        for (trial, observation) in snapshot.training_observations() {
            if !self.is_training_resource(observation.resource) {
                continue;
            }
            let x = self.space.encode(&trial.config)?;
            rows.extend(self.codec.encode(&x, observation.resource)?);
            metrics.push(self.mode.to_minimization(observation.metric));
        }
        let mut pending = Vec::new();
        for (trial, evaluation) in snapshot.training_pending() {
            if !self.is_training_resource(evaluation.resource) {
                continue;
            }
            let x = self.space.encode(&trial.config)?;
            pending.extend(self.codec.encode(&x, evaluation.resource)?);
        }

        let (mean_data, std_data) = standardization(&metrics);
        let targets = metrics
            .iter()
            .map(|m| (m - mean_data) / std_data)
            .collect::<Array1<f64>>();
        Ok(TrainingData {
            features: to_matrix(rows, width)?,
            targets,
            pending: to_matrix(pending, width)?,
            mean_data,
            std_data,
            num_at_max: snapshot.num_training_observations_at(self.rungs.max()),
        })
    }

    /// Posterior for the current snapshot, or `None` when there is no
    /// training data yet.
    pub fn get_posterior_state<R: Rng + ?Sized>(
        &mut self,
        snapshot: &LedgerState,
        kind: ModelKind,
        rng: &mut R,
    ) -> Result<Option<FittedModel>> {
        if kind.is_additive() && self.searcher_data != SearcherData::All {
            return Err(TuneError::InvalidConfiguration(format!(
                "model {:?} requires searcher_data = all",
                kind
            )));
        }
        let data = self.training_data(snapshot)?;
        if data.is_empty() {
            return Ok(None);
        }

        let (mut hyperparameters, refitted) = match self.reusable_fit(kind, &data) {
            Some(cached) => {
                log::debug!(
                    "Reusing hyperparameters, {} observations at resource {}",
                    data.num_at_max,
                    self.rungs.max()
                );
                (cached.clone(), false)
            }
            None => match self.fit(kind, &data) {
                Ok(fitted) => {
                    self.cache = Some(CachedFit {
                        kind,
                        hyperparameters: fitted.clone(),
                        num_at_max: data.num_at_max,
                    });
                    self.fresh_fit_requested = false;
                    (fitted, true)
                }
                Err(e) => {
                    log::warn!("Fitting {:?} failed: {}. Using the last good fit", kind, e);
                    (self.fallback(kind, &data), false)
                }
            },
        };

        let targets = data.targets.view().insert_axis(Axis(1));
        let state = match self.build(kind, &hyperparameters, data.features.view(), targets) {
            Ok(state) => state,
            Err(e) => {
                log::warn!("Posterior with fitted hyperparameters failed: {}", e);
                hyperparameters = self.defaults(kind, &data);
                self.build(kind, &hyperparameters, data.features.view(), targets)?
            }
        };
        let state = self.fantasize(state, kind, &hyperparameters, &data, rng)?;
        Ok(Some(FittedModel {
            state,
            hyperparameters,
            data,
            refitted,
        }))
    }

    fn reusable_fit(&self, kind: ModelKind, data: &TrainingData) -> Option<&Hyperparameters> {
        let cached = self.cache.as_ref()?;
        if self.fresh_fit_requested || cached.kind != kind {
            return None;
        }
        if data.len() <= self.config.opt_skip_init_length || data.num_at_max > cached.num_at_max {
            return None;
        }
        Some(&cached.hyperparameters)
    }

    fn fallback(&self, kind: ModelKind, data: &TrainingData) -> Hyperparameters {
        match &self.cache {
            Some(cached) if cached.kind == kind => cached.hyperparameters.clone(),
            _ => self.defaults(kind, data),
        }
    }

    fn defaults(&self, kind: ModelKind, data: &TrainingData) -> Hyperparameters {
        let noise = self.config.initial_noise;
        self.with_specific(
            kind,
            SquaredExp::default(),
            (noise * noise).clamp(MIN_NOISE_VARIANCE, MAX_NOISE_VARIANCE),
            data,
        )
    }

    fn with_specific(
        &self,
        kind: ModelKind,
        base: SquaredExp,
        noise_variance: f64,
        data: &TrainingData,
    ) -> Hyperparameters {
        let specific = match kind {
            ModelKind::MultiTask => KindParameters::MultiTask {
                resource_lengthscale: 0.5,
            },
            ModelKind::Independent => {
                let (means, covariance_scales) = self.independent_levels(data);
                KindParameters::Independent {
                    means,
                    covariance_scales,
                }
            }
            ModelKind::Issm => KindParameters::Curve(CurveKernel::Issm {
                level_variance: 0.5,
                max_resource: self.rungs.max(),
            }),
            ModelKind::ExpDecay => KindParameters::Curve(CurveKernel::ExpDecay {
                alpha: 1.,
                beta: (self.rungs.max() as f64 / 10.).max(1.),
                amplitude: base.amplitude,
            }),
        };
        Hyperparameters {
            base,
            noise_variance,
            specific,
        }
    }

    fn independent_levels(&self, data: &TrainingData) -> (BTreeMap<u32, f64>, BTreeMap<u32, f64>) {
        let mut grouped: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
        for (resource, target) in data.resources().zip(data.targets.iter()) {
            grouped.entry(resource).or_default().push(*target);
        }
        let pooled = variance(data.targets.as_slice().unwrap_or(&[]));
        let pooled = if pooled > 1e-12 { pooled } else { 1. };

        let mut means = BTreeMap::new();
        let mut scales = BTreeMap::new();
        for resource in self.supported_resources() {
            let (mean, scale) = match grouped.get(&resource) {
                Some(values) if values.len() >= 2 => (
                    values.iter().sum::<f64>() / values.len() as f64,
                    (variance(values) / pooled).clamp(0.1, 10.),
                ),
                Some(values) => (values.iter().sum::<f64>() / values.len() as f64, 1.),
                None => (0., 1.),
            };
            means.insert(resource, mean);
            scales.insert(resource, scale);
        }
        (means, scales)
    }

    fn build(
        &self,
        kind: ModelKind,
        hyperparameters: &Hyperparameters,
        features: ArrayView2<f64>,
        targets: ArrayView2<f64>,
    ) -> Result<PosteriorState> {
        let Hyperparameters {
            base,
            noise_variance,
            specific,
        } = hyperparameters;
        match (kind, specific) {
            (ModelKind::MultiTask, KindParameters::MultiTask { resource_lengthscale }) => {
                let kernel = MultiTaskKernel {
                    base: *base,
                    resource_lengthscale: *resource_lengthscale,
                    range: self.codec.range(),
                };
                JointPosterior::new(features, targets, kernel, 0., *noise_variance, self.codec)
                    .map(PosteriorState::MultiTask)
            }
            (
                ModelKind::Independent,
                KindParameters::Independent {
                    means,
                    covariance_scales,
                },
            ) => IndependentGpPosterior::new(
                features,
                targets,
                *base,
                means,
                covariance_scales,
                *noise_variance,
                self.codec,
            )
            .map(PosteriorState::Independent),
            (ModelKind::Issm, KindParameters::Curve(curve @ CurveKernel::Issm { .. }))
            | (ModelKind::ExpDecay, KindParameters::Curve(curve @ CurveKernel::ExpDecay { .. })) => {
                let kernel = AdditiveKernel {
                    base: *base,
                    curve: *curve,
                };
                JointPosterior::new(features, targets, kernel, 0., *noise_variance, self.codec)
                    .map(PosteriorState::Additive)
            }
            _ => Err(TuneError::InvalidConfiguration(format!(
                "hyperparameters {:?} do not belong to model {:?}",
                specific, kind
            ))),
        }
    }

    fn fit(&self, kind: ModelKind, data: &TrainingData) -> Result<Hyperparameters> {
        let (base, noise_variance) = self.fit_base_kernel(data)?;
        let mut hyperparameters = self.with_specific(kind, base, noise_variance, data);
        self.refine(kind, &mut hyperparameters, data);
        Ok(hyperparameters)
    }

    fn fit_base_kernel(&self, data: &TrainingData) -> Result<(SquaredExp, f64)> {
        let dim = data.features.ncols() - 1;
        let inputs = data
            .features
            .rows()
            .into_iter()
            .map(|row| row.iter().take(dim).copied().collect::<Vec<_>>())
            .collect::<Vec<_>>();
        let outputs = data.targets.to_vec();
        let noise = self.config.initial_noise;
        let epsilon = self.config.cholesky_epsilon;
        if !(noise > 0. && noise.is_finite()) {
            return Err(TuneError::Numerical(format!(
                "initial noise must be positive, received {}",
                noise
            )));
        }

        let (lengthscale, amplitude, noise) = catch_unwind(AssertUnwindSafe(move || {
            let gp = GaussianProcessBuilder::<FriedrichSquaredExp, ConstantPrior>::new(
                inputs, outputs,
            )
            .set_noise(noise)
            .set_cholesky_epsilon(Some(epsilon))
            .fit_kernel()
            .fit_prior()
            .train();
            (gp.kernel.ls, gp.kernel.ampl, gp.noise)
        }))
        .map_err(|_| TuneError::Numerical("kernel fit panicked".to_string()))?;

        let valid = [lengthscale, amplitude, noise]
            .iter()
            .all(|v| v.is_finite() && *v > 0.);
        if !valid {
            return Err(TuneError::Numerical(format!(
                "kernel fit returned lengthscale={} amplitude={} noise={}",
                lengthscale, amplitude, noise
            )));
        }
        // friedrich reports the noise as a standard deviation
        Ok((
            SquaredExp::new(lengthscale.clamp(1e-2, 1e2), amplitude.clamp(1e-3, 1e3)),
            (noise * noise).clamp(MIN_NOISE_VARIANCE, MAX_NOISE_VARIANCE),
        ))
    }

    fn refine(&self, kind: ModelKind, hyperparameters: &mut Hyperparameters, data: &TrainingData) {
        if self.config.refine_iterations == 0 {
            return;
        }
        let lengthscale = hyperparameters.base.lengthscale;
        let r_min = self.rungs.range().min as f64;
        let r_max = self.rungs.max() as f64;
        let (intervals, apply): (Vec<(f64, f64)>, fn(&mut Hyperparameters, &[f64])) = match kind {
            ModelKind::Independent => (
                vec![((lengthscale / 4.).ln(), (lengthscale * 4.).ln())],
                |h, p| h.base.lengthscale = p[0].exp(),
            ),
            ModelKind::MultiTask => (vec![(0.05f64.ln(), 5f64.ln())], |h, p| {
                if let KindParameters::MultiTask {
                    resource_lengthscale,
                } = &mut h.specific
                {
                    *resource_lengthscale = p[0].exp();
                }
            }),
            ModelKind::ExpDecay => (
                vec![(0.1f64.ln(), 5f64.ln()), ((0.1 * r_min).ln(), (10. * r_max).ln())],
                |h, p| {
                    if let KindParameters::Curve(CurveKernel::ExpDecay { alpha, beta, .. }) =
                        &mut h.specific
                    {
                        *alpha = p[0].exp();
                        *beta = p[1].exp();
                    }
                },
            ),
            ModelKind::Issm => (vec![(1e-3f64.ln(), 10f64.ln())], |h, p| {
                if let KindParameters::Curve(CurveKernel::Issm { level_variance, .. }) =
                    &mut h.specific
                {
                    *level_variance = p[0].exp();
                }
            }),
        };

        let targets = data.targets.view().insert_axis(Axis(1));
        let likelihood = |candidate: &Hyperparameters| {
            self.build(kind, candidate, data.features.view(), targets)
                .map(|state| state.neg_log_likelihood())
                .ok()
                .filter(|v| v.is_finite())
                .unwrap_or(INVALID_LIKELIHOOD)
        };
        let current = likelihood(hyperparameters);
        let objective = |point: &[f64]| {
            let mut candidate = hyperparameters.clone();
            apply(&mut candidate, point);
            likelihood(&candidate)
        };
        let (best, point) = simplers_optimization::Optimizer::minimize(
            &objective,
            &intervals,
            self.config.refine_iterations,
        );
        if best < current {
            log::debug!("{:?} likelihood improved from {} to {}", kind, current, best);
            apply(hyperparameters, &point);
        }
    }

    fn fantasize<R: Rng + ?Sized>(
        &self,
        state: PosteriorState,
        kind: ModelKind,
        hyperparameters: &Hyperparameters,
        data: &TrainingData,
        rng: &mut R,
    ) -> Result<PosteriorState> {
        if data.pending.nrows() == 0 {
            return Ok(state);
        }
        let num_samples = self.config.num_fantasy_samples;
        let samples = match state.sample_joint(data.pending.view(), num_samples, rng) {
            Ok(samples) => samples,
            Err(e) => {
                log::warn!("Could not fantasize {} pending evaluations: {}", data.pending.nrows(), e);
                return Ok(state);
            }
        };
        let observed = Array2::from_shape_fn((data.len(), num_samples), |(i, _)| data.targets[i]);
        let fantasies = samples.index_axis(Axis(1), 0);
        let features = concatenate(Axis(0), &[data.features.view(), data.pending.view()])
            .map_err(|e| TuneError::Numerical(e.to_string()))?;
        let targets = concatenate(Axis(0), &[observed.view(), fantasies])
            .map_err(|e| TuneError::Numerical(e.to_string()))?;
        self.build(kind, hyperparameters, features.view(), targets.view())
    }
}

fn to_matrix(flat: Vec<f64>, width: usize) -> Result<Array2<f64>> {
    let rows = flat.len() / width;
    Array2::from_shape_vec((rows, width), flat).map_err(|e| TuneError::Numerical(e.to_string()))
}

fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

fn standardization(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0., 1.);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let std = variance(values).sqrt();
    (mean, if std > 1e-9 { std } else { 1. })
}
