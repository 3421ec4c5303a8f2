use std::collections::VecDeque;

use ndarray::{Array1, Axis};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    acquisition::{acquisition_function, AcquisitionFunction, AcquisitionOptimizer, SimplersOptimizer},
    codec::FeatureCodec,
    config::{Mode, SearcherConfig},
    errors::{Result, TuneError},
    ledger::{Ledger, LedgerState},
    library::{ConfigSpace, Configuration},
    model::{FittedModel, ModelFactory},
    output::SearcherState,
    rungs::RungLevels,
};

use super::{draw_new_configuration, Searcher};

const INVALID_SCORE: f64 = 1e10;
const INITIAL_GRADIENT_STEP: f64 = 0.05;

pub struct MultiFidelitySearcher {
    space: ConfigSpace,
    rungs: RungLevels,
    codec: FeatureCodec,
    config: SearcherConfig,
    ledger: Ledger,
    factory: Mutex<ModelFactory>,
    rng: Mutex<StdRng>,
    points_to_evaluate: Mutex<VecDeque<Configuration>>,
    optimizer: Box<dyn AcquisitionOptimizer>,
}

impl MultiFidelitySearcher {
    pub fn new(space: ConfigSpace, rungs: RungLevels, config: SearcherConfig) -> Result<Self> {
        if space.is_empty() {
            return Err(TuneError::InvalidConfiguration(
                "the configuration space has no parameters".to_string(),
            ));
        }
        space.validate_domains()?;
        for point in &config.points_to_evaluate {
            space.validate(point)?;
        }
        let factory = ModelFactory::new(space.clone(), rungs.clone(), &config)?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            codec: FeatureCodec::new(rungs.range()),
            points_to_evaluate: Mutex::new(config.points_to_evaluate.iter().cloned().collect()),
            optimizer: Box::new(SimplersOptimizer {
                iterations: config.optimizer_iterations,
            }),
            factory: Mutex::new(factory),
            rng: Mutex::new(rng),
            ledger: Ledger::new(),
            space,
            rungs,
            config,
        })
    }

    pub fn with_optimizer(mut self, optimizer: impl AcquisitionOptimizer + 'static) -> Self {
        self.optimizer = Box::new(optimizer);
        self
    }

    pub fn space(&self) -> &ConfigSpace {
        &self.space
    }

    pub fn rungs(&self) -> &RungLevels {
        &self.rungs
    }

    pub fn config(&self) -> &SearcherConfig {
        &self.config
    }

    pub fn target_resource(&self, snapshot: &LedgerState) -> u32 {
        self.config
            .resource_acquisition
            .target_resource(snapshot, &self.rungs, self.space.encoded_dim())
    }

    /// Searcher with the same configuration continuing from `state`.
    ///
    /// Consumes `self`; ledger handles cloned from it are left empty and
    /// reject writes. The
    /// restored hyperparameters are only a fallback, the next suggestion
    /// fits afresh.
    pub fn clone_from_state(self, state: SearcherState) -> Result<Self> {
        for trial in state.ledger.trials() {
            self.space.validate(&trial.config)?;
        }
        for point in &state.points_to_evaluate {
            self.space.validate(point)?;
        }
        self.ledger.retire();

        let mut factory = self.factory.into_inner();
        factory.restore(state.model_cache);
        let seed = self.rng.lock().gen();
        Ok(Self {
            ledger: Ledger::from_state(state.ledger),
            factory: Mutex::new(factory),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            points_to_evaluate: Mutex::new(state.points_to_evaluate.into()),
            space: self.space,
            rungs: self.rungs,
            codec: self.codec,
            config: self.config,
            optimizer: self.optimizer,
        })
    }

    fn next_point_to_evaluate(&self) -> Option<Configuration> {
        let mut points = self.points_to_evaluate.lock();
        while let Some(point) = points.pop_front() {
            if self.ledger.read(|state| state.contains_configuration(&point)) {
                log::debug!("Skipping initial point already in the ledger: {:?}", point);
                continue;
            }
            return Some(point);
        }
        None
    }

    fn random_configuration(&self) -> Result<Configuration> {
        let mut rng = self.rng.lock();
        self.ledger
            .read(|state| draw_new_configuration(&self.space, state, &mut *rng))
    }

    fn suggest(&self, snapshot: &LedgerState) -> Result<Option<Configuration>> {
        let fitted = {
            let mut factory = self.factory.lock();
            let mut rng = self.rng.lock();
            factory.get_posterior_state(snapshot, self.config.model.kind, &mut *rng)?
        };
        let fitted = match fitted {
            Some(fitted) => fitted,
            None => return Ok(None),
        };

        let target = self.target_resource(snapshot);
        let resource = match fitted.state.supported_resource(target) {
            Some(resource) => resource,
            None => return Ok(None),
        };
        if resource != target {
            log::debug!(
                "No posterior at resource {}, optimizing at {} instead",
                target,
                resource
            );
        }
        let incumbent = fitted
            .data
            .to_data_scale(fitted.data.incumbent(resource).unwrap_or(0.));
        log::debug!(
            "Optimizing acquisition at resource {} over {} observations (incumbent {:.4})",
            resource,
            fitted.data.len(),
            incumbent
        );

        let mut exploration = 1.;
        for attempt in 0..=self.config.max_duplicate_retries {
            let acquisition =
                acquisition_function(&self.config.acquisition, incumbent, exploration);
            let candidate = self.optimize_acquisition(&fitted, acquisition.as_ref(), resource)?;
            let config = self.space.decode(&candidate)?;
            if !self.ledger.read(|state| state.contains_configuration(&config)) {
                return Ok(Some(config));
            }
            log::warn!(
                "Suggested configuration was already evaluated. Making exploration larger by 1.5 (attempt {})",
                attempt + 1
            );
            exploration *= 1.5;
        }
        log::warn!(
            "Retried {} times. Falling back to a random configuration",
            self.config.max_duplicate_retries + 1
        );
        self.random_configuration().map(Some)
    }

    fn score(
        &self,
        fitted: &FittedModel,
        acquisition: &dyn AcquisitionFunction,
        encoded: &[f64],
        resource: u32,
    ) -> Result<f64> {
        let features = Array1::from(self.codec.encode(encoded, resource)?);
        let prediction = fitted.state.predict(features.view().insert_axis(Axis(0)))?;
        let means = prediction.means.row(0).mapv(|m| fitted.data.to_data_scale(m));
        let std = prediction.variances[0].sqrt() * fitted.data.std_data;
        Ok(acquisition.value(means.view(), std))
    }

    fn score_gradient(
        &self,
        fitted: &FittedModel,
        acquisition: &dyn AcquisitionFunction,
        encoded: &[f64],
        resource: u32,
    ) -> Result<Array1<f64>> {
        let features = Array1::from(self.codec.encode(encoded, resource)?);
        let prediction = fitted.state.predict(features.view().insert_axis(Axis(0)))?;
        let means = prediction.means.row(0).mapv(|m| fitted.data.to_data_scale(m));
        let std = prediction.variances[0].sqrt() * fitted.data.std_data;
        let head = acquisition.head_gradients(means.view(), std);
        let gradient = fitted.state.backward_gradient(
            features.view(),
            &head,
            fitted.data.mean_data,
            fitted.data.std_data,
        )?;
        Ok(gradient.slice(ndarray::s![..encoded.len()]).to_owned())
    }

    fn optimize_acquisition(
        &self,
        fitted: &FittedModel,
        acquisition: &dyn AcquisitionFunction,
        resource: u32,
    ) -> Result<Vec<f64>> {
        let bounds = self.space.encoded_bounds();
        let objective = |encoded: &[f64]| match self.score(fitted, acquisition, encoded, resource) {
            Ok(value) if value.is_finite() => value,
            _ => INVALID_SCORE,
        };

        let (mut best_value, mut best) = self.optimizer.minimize(&objective, &bounds);
        let mut step = INITIAL_GRADIENT_STEP;
        for _ in 0..self.config.gradient_steps {
            let gradient = match self.score_gradient(fitted, acquisition, &best, resource) {
                Ok(gradient) => gradient,
                Err(e) => {
                    log::warn!("Stopping gradient refinement: {}", e);
                    break;
                }
            };
            let norm = gradient.dot(&gradient).sqrt();
            if !(norm > 1e-12) {
                break;
            }
            let candidate = best
                .iter()
                .zip(gradient.iter())
                .zip(bounds.iter())
                .map(|((x, g), (low, high))| (x - step * g / norm).clamp(*low, *high))
                .collect::<Vec<_>>();
            let value = objective(&candidate);
            if value < best_value {
                best_value = value;
                best = candidate;
            } else {
                step *= 0.5;
            }
        }
        log::trace!("Acquisition minimum {} at {:?}", best_value, best);
        Ok(best)
    }
}

impl Searcher for MultiFidelitySearcher {
    fn get_config(&self) -> Result<Configuration> {
        if let Some(point) = self.next_point_to_evaluate() {
            return Ok(point);
        }
        let snapshot = self.ledger.snapshot();
        let num_trials = snapshot.trials().count();
        if num_trials < self.config.num_init_random {
            log::debug!(
                "Random configuration ({} of {} initial)",
                num_trials + 1,
                self.config.num_init_random
            );
            return self.random_configuration();
        }
        match self.suggest(&snapshot)? {
            Some(config) => Ok(config),
            None => self.random_configuration(),
        }
    }

    fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn mode(&self) -> Mode {
        self.config.mode
    }

    fn get_state(&self) -> SearcherState {
        SearcherState {
            ledger: self.ledger.snapshot(),
            model_cache: self.factory.lock().cache().cloned(),
            points_to_evaluate: self.points_to_evaluate.lock().iter().cloned().collect(),
        }
    }
}
