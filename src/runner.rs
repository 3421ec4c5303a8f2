use std::collections::BTreeSet;

use anyhow::{bail, Context};

use crate::{
    ledger::TrialId,
    library::Configuration,
    output::SearcherState,
    scheduler::{Decision, Scheduler, TrialAction, TrialState},
    searchers::Searcher,
};

/// Where trials actually run.
pub trait ExecutionBackend {
    fn num_workers(&self) -> usize;

    fn dispatch(&mut self, trial_id: TrialId, config: &Configuration, up_to: u32) -> anyhow::Result<()>;

    fn continue_trial(&mut self, trial_id: TrialId, up_to: u32) -> anyhow::Result<()>;

    fn stop(&mut self, trial_id: TrialId) -> anyhow::Result<()>;

    /// Blocks until at least one event is available, unless nothing runs.
    fn poll(&mut self) -> anyhow::Result<Vec<BackendEvent>>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum BackendEvent {
    Report {
        trial_id: TrialId,
        resource: u32,
        metric: f64,
        elapsed_time: f64,
    },
    Failed {
        trial_id: TrialId,
    },
}

pub struct TunerConfig {
    pub(crate) max_trials: usize,
    pub(crate) save_interval: Option<u32>,
    pub(crate) path: Option<String>,
}

pub struct TunerConfigBuilder {
    max_trials: usize,
    save_interval: Option<u32>,
    output_path: Option<String>,
}

impl TunerConfigBuilder {
    pub fn new(max_trials: usize) -> Self {
        TunerConfigBuilder {
            max_trials,
            save_interval: None,
            output_path: None,
        }
    }

    pub fn save_interval(mut self, interval: u32) -> Self {
        self.save_interval = Some(interval);
        self
    }

    pub fn output(mut self, path: String) -> Self {
        self.output_path = Some(path);
        self
    }

    pub fn build(self) -> TunerConfig {
        TunerConfig {
            max_trials: self.max_trials,
            save_interval: self.save_interval,
            path: self.output_path,
        }
    }
}

pub struct TuningResult {
    pub best_config: Configuration,
    pub best_metric: f64,
    pub best_resource: u32,
    pub num_trials: usize,
    pub state: SearcherState,
}

pub struct Tuner<S: Searcher> {
    scheduler: Scheduler<S>,
}

impl<S: Searcher> Tuner<S> {
    pub fn new(scheduler: Scheduler<S>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler<S> {
        &self.scheduler
    }

    pub fn into_scheduler(self) -> Scheduler<S> {
        self.scheduler
    }

    pub fn optimize<B: ExecutionBackend>(
        &self,
        config: TunerConfig,
        backend: &mut B,
    ) -> anyhow::Result<TuningResult> {
        if backend.num_workers() == 0 {
            bail!("the backend has no workers");
        }
        let mut running = BTreeSet::new();
        let mut started = 0;
        let mut reports = 0u32;

        loop {
            while running.len() < backend.num_workers() {
                let allow_new = started < config.max_trials;
                match self.scheduler.on_free_worker(allow_new)? {
                    Some(Decision::Start {
                        trial_id,
                        config: trial_config,
                        up_to,
                    }) => {
                        backend.dispatch(trial_id, &trial_config, up_to)?;
                        log::debug!("Trial {} started {}/{}", trial_id, started + 1, config.max_trials);
                        started += 1;
                        running.insert(trial_id);
                    }
                    Some(Decision::Resume { trial_id, up_to }) => {
                        backend.continue_trial(trial_id, up_to)?;
                        running.insert(trial_id);
                    }
                    None => break,
                }
            }
            if running.is_empty() {
                break;
            }

            let events = backend.poll()?;
            if events.is_empty() {
                bail!("backend returned no events while {} trials are running", running.len());
            }
            for event in events {
                match event {
                    BackendEvent::Report {
                        trial_id,
                        resource,
                        metric,
                        elapsed_time,
                    } => {
                        let action = self
                            .scheduler
                            .report(trial_id, resource, metric, elapsed_time)
                            .with_context(|| format!("report of trial {}", trial_id))?;
                        match action {
                            TrialAction::Continue { .. } => {}
                            TrialAction::Stop => {
                                backend.stop(trial_id)?;
                                running.remove(&trial_id);
                            }
                            TrialAction::Pause | TrialAction::Complete => {
                                running.remove(&trial_id);
                            }
                        }
                        reports += 1;
                        if config
                            .save_interval
                            .map(|interval| interval > 0 && reports % interval == 0)
                            .unwrap_or(false)
                        {
                            self.save(&config)?;
                        }
                    }
                    BackendEvent::Failed { trial_id } => {
                        let finished = matches!(
                            self.scheduler.trial_state(trial_id),
                            Some(TrialState::Stopped | TrialState::Completed | TrialState::Failed)
                        );
                        if finished {
                            log::debug!("Ignoring failure of finished trial {}", trial_id);
                            continue;
                        }
                        self.scheduler.report_failure(trial_id)?;
                        running.remove(&trial_id);
                    }
                }
            }
        }

        let state = self.save(&config)?;
        let (best_config, best) = self
            .scheduler
            .best()
            .context("no trial reported a result")?;
        Ok(TuningResult {
            best_config,
            best_metric: best.metric,
            best_resource: best.resource,
            num_trials: started,
            state,
        })
    }

    fn save(&self, config: &TunerConfig) -> anyhow::Result<SearcherState> {
        let state = self.scheduler.searcher().get_state();
        if let Some(path) = &config.path {
            state
                .write_to_file(path)
                .with_context(|| format!("saving searcher state to {}", path))?;
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::codec::ResourceRange;
    use crate::config::{Mode, SchedulerConfig};
    use crate::library::ConfigSpace;
    use crate::searchers::RandomSearcher;

    #[derive(Default)]
    struct SerialBackend {
        queue: VecDeque<BackendEvent>,
        configs: Vec<(TrialId, f64)>,
        fail: Option<TrialId>,
        trailing_failures: bool,
        stopped: Vec<TrialId>,
    }

    impl SerialBackend {
        fn run(&mut self, trial_id: TrialId, from: u32, up_to: u32) {
            if self.fail == Some(trial_id) {
                self.queue.push_back(BackendEvent::Failed { trial_id });
                return;
            }
            let x = self
                .configs
                .iter()
                .find(|(id, _)| *id == trial_id)
                .map_or(0., |(_, x)| *x);
            for resource in from..=up_to {
                self.queue.push_back(BackendEvent::Report {
                    trial_id,
                    resource,
                    metric: x / resource as f64,
                    elapsed_time: resource as f64,
                });
            }
            if self.trailing_failures {
                self.queue.push_back(BackendEvent::Failed { trial_id });
            }
        }
    }

    impl ExecutionBackend for SerialBackend {
        fn num_workers(&self) -> usize {
            1
        }

        fn dispatch(&mut self, trial_id: TrialId, config: &Configuration, up_to: u32) -> anyhow::Result<()> {
            let x = config["x"].to_f64().context("x is numeric")?;
            self.configs.push((trial_id, x));
            self.run(trial_id, 1, up_to);
            Ok(())
        }

        fn continue_trial(&mut self, _trial_id: TrialId, _up_to: u32) -> anyhow::Result<()> {
            bail!("the stopping scheduler never resumes trials")
        }

        fn stop(&mut self, trial_id: TrialId) -> anyhow::Result<()> {
            self.queue.retain(|event| match event {
                BackendEvent::Report { trial_id: id, .. } | BackendEvent::Failed { trial_id: id } => {
                    *id != trial_id
                }
            });
            self.stopped.push(trial_id);
            if self.trailing_failures {
                self.queue.push_back(BackendEvent::Failed { trial_id });
            }
            Ok(())
        }

        fn poll(&mut self) -> anyhow::Result<Vec<BackendEvent>> {
            Ok(self.queue.pop_front().into_iter().collect())
        }
    }

    fn tuner() -> Tuner<RandomSearcher> {
        let searcher = RandomSearcher::with_seed(ConfigSpace::new().add_f64_range(0.0..1.0, "x"), Mode::Min, 8);
        let config = SchedulerConfig::new(ResourceRange::new(1, 9).unwrap()).seed(1);
        Tuner::new(Scheduler::new(config, searcher).unwrap())
    }

    #[test]
    fn runs_the_budget_and_returns_the_best() {
        let tuner = tuner();
        let mut backend = SerialBackend::default();
        let result = tuner.optimize(TunerConfigBuilder::new(6).build(), &mut backend).unwrap();
        assert_eq!(result.num_trials, 6);
        assert_eq!(result.state.ledger.trials().count(), 6);
        assert_eq!(result.best_resource, 9);
        let x = result.best_config["x"].to_f64().unwrap();
        assert!((result.best_metric - x / 9.).abs() < 1e-12);
    }

    #[test]
    fn failed_trials_free_their_worker() {
        let tuner = tuner();
        let mut backend = SerialBackend {
            fail: Some(0),
            ..Default::default()
        };
        let result = tuner.optimize(TunerConfigBuilder::new(3).build(), &mut backend).unwrap();
        assert_eq!(result.num_trials, 3);
        let failed = result.state.ledger.trial(0).map(|t| t.status);
        assert_eq!(failed, Some(crate::ledger::TrialStatus::Failed));
    }

    #[test]
    fn failures_of_finished_trials_are_ignored() {
        let tuner = tuner();
        let mut backend = SerialBackend {
            trailing_failures: true,
            ..Default::default()
        };
        let result = tuner.optimize(TunerConfigBuilder::new(8).build(), &mut backend).unwrap();
        assert_eq!(result.num_trials, 8);
        assert_eq!(tuner.scheduler().trial_state(0), Some(TrialState::Completed));
        for trial_id in &backend.stopped {
            assert_eq!(tuner.scheduler().trial_state(*trial_id), Some(TrialState::Stopped));
        }
        assert!(result
            .state
            .ledger
            .trials()
            .all(|t| t.status != crate::ledger::TrialStatus::Failed));
    }

    #[test]
    fn saves_state_to_the_output_path() {
        let path = std::env::temp_dir().join(format!("mf-tuner-{}.json", std::process::id()));
        let config = TunerConfigBuilder::new(2)
            .save_interval(3)
            .output(path.to_string_lossy().into_owned())
            .build();
        let result = tuner().optimize(config, &mut SerialBackend::default()).unwrap();
        let saved = SearcherState::read_from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(saved.ledger.trials().count(), 2);
        assert_eq!(
            saved.ledger.observations().count(),
            result.state.ledger.observations().count()
        );
    }
}
