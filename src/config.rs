use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::ResourceRange;
use crate::errors::{Result, TuneError};
use crate::library::Configuration;
use crate::model::ModelKind;
use crate::rungs::RungLevels;
use crate::scheduler::DebugLogSink;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Min,
    Max,
}

impl Mode {
    pub fn to_minimization(&self, metric: f64) -> f64 {
        match self {
            Mode::Min => metric,
            Mode::Max => -metric,
        }
    }

    pub fn is_better(&self, candidate: f64, incumbent: f64) -> bool {
        self.to_minimization(candidate) < self.to_minimization(incumbent)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceAcquisition {
    #[default]
    Bohb,
    First,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearcherData {
    #[default]
    Rungs,
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum AcquisitionKind {
    LowerConfidenceBound { kappa: f64 },
    ExpectedImprovement { jitter: f64 },
}

impl Default for AcquisitionKind {
    fn default() -> Self {
        AcquisitionKind::LowerConfidenceBound { kappa: 2. }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelConfig {
    pub kind: ModelKind,
    pub opt_skip_init_length: usize,
    pub initial_noise: f64,
    pub cholesky_epsilon: f64,
    pub refine_iterations: usize,
    pub num_fantasy_samples: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kind: ModelKind::MultiTask,
            opt_skip_init_length: 150,
            initial_noise: 0.01,
            cholesky_epsilon: 0.01f64.powi(2),
            refine_iterations: 20,
            num_fantasy_samples: 20,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearcherConfig {
    pub mode: Mode,
    pub resource_acquisition: ResourceAcquisition,
    pub searcher_data: SearcherData,
    pub acquisition: AcquisitionKind,
    pub model: ModelConfig,
    pub points_to_evaluate: Vec<Configuration>,
    pub num_init_random: usize,
    pub optimizer_iterations: usize,
    pub gradient_steps: usize,
    pub max_duplicate_retries: usize,
    pub seed: Option<u64>,
}

impl Default for SearcherConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Min,
            resource_acquisition: ResourceAcquisition::Bohb,
            searcher_data: SearcherData::Rungs,
            acquisition: AcquisitionKind::default(),
            model: ModelConfig::default(),
            points_to_evaluate: Vec::new(),
            num_init_random: 5,
            optimizer_iterations: 100,
            gradient_steps: 10,
            max_duplicate_retries: 3,
            seed: None,
        }
    }
}

impl SearcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.kind.is_additive() && self.searcher_data != SearcherData::All {
            return Err(TuneError::InvalidConfiguration(format!(
                "model {:?} is trained on whole learning curves and requires searcher_data = all",
                self.model.kind
            )));
        }
        if self.model.num_fantasy_samples == 0 {
            return Err(TuneError::InvalidConfiguration(
                "num_fantasy_samples must be at least 1".to_string(),
            ));
        }
        if self.optimizer_iterations == 0 {
            return Err(TuneError::InvalidConfiguration(
                "optimizer_iterations must be at least 1".to_string(),
            ));
        }
        match self.acquisition {
            AcquisitionKind::LowerConfidenceBound { kappa } if !(kappa >= 0.) => {
                Err(TuneError::InvalidConfiguration(format!(
                    "kappa must be non-negative, received {}",
                    kappa
                )))
            }
            AcquisitionKind::ExpectedImprovement { jitter } if !(jitter >= 0.) => {
                Err(TuneError::InvalidConfiguration(format!(
                    "jitter must be non-negative, received {}",
                    jitter
                )))
            }
            _ => Ok(()),
        }
    }
}

pub struct SearcherConfigBuilder {
    config: SearcherConfig,
    read_from: Option<String>,
}

impl Default for SearcherConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SearcherConfigBuilder {
    pub fn new() -> Self {
        SearcherConfigBuilder {
            config: SearcherConfig::default(),
            read_from: None,
        }
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn model(mut self, kind: ModelKind) -> Self {
        self.config.model.kind = kind;
        self
    }

    pub fn resource_acquisition(mut self, policy: ResourceAcquisition) -> Self {
        self.config.resource_acquisition = policy;
        self
    }

    pub fn searcher_data(mut self, searcher_data: SearcherData) -> Self {
        self.config.searcher_data = searcher_data;
        self
    }

    pub fn acquisition(mut self, acquisition: AcquisitionKind) -> Self {
        self.config.acquisition = acquisition;
        self
    }

    pub fn points_to_evaluate(mut self, points: Vec<Configuration>) -> Self {
        self.config.points_to_evaluate = points;
        self
    }

    pub fn num_init_random(mut self, num_init_random: usize) -> Self {
        self.config.num_init_random = num_init_random;
        self
    }

    pub fn num_fantasy_samples(mut self, num_fantasy_samples: usize) -> Self {
        self.config.model.num_fantasy_samples = num_fantasy_samples;
        self
    }

    pub fn opt_skip_init_length(mut self, length: usize) -> Self {
        self.config.model.opt_skip_init_length = length;
        self
    }

    pub fn optimizer_iterations(mut self, iterations: usize) -> Self {
        self.config.optimizer_iterations = iterations;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Starts from a JSON file instead of the defaults; setters called on
    /// this builder are ignored in that case.
    pub fn read_from_file(mut self, path: String) -> Self {
        self.read_from = Some(path);
        self
    }

    pub fn build(self) -> Result<SearcherConfig> {
        let config = match self.read_from {
            Some(path) => read_json(path)?,
            None => self.config,
        };
        config.validate()?;
        Ok(config)
    }
}

fn read_json<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> Result<T> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(file)?)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerType {
    #[default]
    Stopping,
    Promotion,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Debug,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    pub resource: ResourceRange,
    #[serde(default = "default_reduction_factor")]
    pub reduction_factor: f64,
    #[serde(default)]
    pub rung_levels: Vec<u32>,
    #[serde(default = "default_brackets")]
    pub brackets: usize,
    #[serde(default)]
    pub scheduler_type: SchedulerType,
    #[serde(default)]
    pub verbosity: Verbosity,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(skip)]
    pub debug_log: Option<Arc<dyn DebugLogSink>>,
}

fn default_reduction_factor() -> f64 {
    3.
}

fn default_brackets() -> usize {
    1
}

impl SchedulerConfig {
    pub fn new(resource: ResourceRange) -> Self {
        Self {
            resource,
            reduction_factor: default_reduction_factor(),
            rung_levels: Vec::new(),
            brackets: default_brackets(),
            scheduler_type: SchedulerType::default(),
            verbosity: Verbosity::default(),
            seed: None,
            debug_log: None,
        }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        read_json(path)
    }

    pub fn reduction_factor(mut self, reduction_factor: f64) -> Self {
        self.reduction_factor = reduction_factor;
        self
    }

    pub fn rung_levels(mut self, levels: Vec<u32>) -> Self {
        self.rung_levels = levels;
        self
    }

    pub fn brackets(mut self, brackets: usize) -> Self {
        self.brackets = brackets;
        self
    }

    pub fn scheduler_type(mut self, scheduler_type: SchedulerType) -> Self {
        self.scheduler_type = scheduler_type;
        self
    }

    pub fn verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn debug_log(mut self, sink: Arc<dyn DebugLogSink>) -> Self {
        self.debug_log = Some(sink);
        self
    }

    pub fn build_rungs(&self) -> Result<RungLevels> {
        if self.rung_levels.is_empty() {
            RungLevels::geometric(self.resource, self.reduction_factor)
        } else {
            RungLevels::from_levels(self.resource, self.rung_levels.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn additive_models_require_all_data() {
        let result = SearcherConfigBuilder::new()
            .model(ModelKind::ExpDecay)
            .build();
        assert!(matches!(result, Err(TuneError::InvalidConfiguration(_))));
        let result = SearcherConfigBuilder::new()
            .model(ModelKind::Issm)
            .searcher_data(SearcherData::All)
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn searcher_config_from_partial_json() {
        let config: SearcherConfig = serde_json::from_str(
            r#"{"mode": "max", "resourceAcquisition": "first", "model": {"kind": "gp_independent"}}"#,
        )
        .unwrap();
        assert_eq!(config.mode, Mode::Max);
        assert_eq!(config.resource_acquisition, ResourceAcquisition::First);
        assert_eq!(config.model.kind, ModelKind::Independent);
        assert_eq!(config.model.num_fantasy_samples, 20);
        assert_eq!(config.num_init_random, 5);
    }

    #[test]
    fn scheduler_config_from_json_uses_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"resource": {"min": 1, "max": 27}, "schedulerType": "promotion"}"#)
                .unwrap();
        assert_eq!(config.scheduler_type, SchedulerType::Promotion);
        assert_eq!(config.reduction_factor, 3.);
        assert_eq!(config.build_rungs().unwrap().levels(), &[1, 3, 9, 27]);
        assert!(config.debug_log.is_none());
    }

    #[test]
    fn mode_orders_metrics() {
        assert!(Mode::Min.is_better(0.1, 0.2));
        assert!(Mode::Max.is_better(0.2, 0.1));
        assert_eq!(Mode::Max.to_minimization(3.), -3.);
    }
}
