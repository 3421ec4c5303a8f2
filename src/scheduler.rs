use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use parking_lot::Mutex;
use rand::{
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
    SeedableRng,
};
use serde::{Deserialize, Serialize};

use crate::{
    config::{SchedulerConfig, SchedulerType, Verbosity},
    errors::{Result, TuneError},
    ledger::{Observation, TrialId, TrialStatus},
    library::Configuration,
    output::best_observation,
    rungs::RungLevels,
    searchers::Searcher,
};

pub trait DebugLogSink: Send + Sync + Debug {
    fn record(&self, record: &DecisionRecord);
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DecisionEvent {
    Started,
    Resumed,
    Continued,
    Paused,
    Stopped,
    Completed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub trial_id: TrialId,
    pub event: DecisionEvent,
    pub resource: u32,
    pub metric: Option<f64>,
    pub bracket: usize,
}

#[derive(Debug, Default)]
pub struct MemoryLogSink {
    records: Mutex<Vec<DecisionRecord>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DecisionRecord> {
        self.records.lock().clone()
    }
}

impl DebugLogSink for MemoryLogSink {
    fn record(&self, record: &DecisionRecord) {
        self.records.lock().push(record.clone());
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    Start {
        trial_id: TrialId,
        config: Configuration,
        up_to: u32,
    },
    Resume { trial_id: TrialId, up_to: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrialAction {
    Continue { up_to: u32 },
    Pause,
    Stop,
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrialState {
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

#[derive(Clone, Debug)]
struct TrialRecord {
    bracket: usize,
    milestone: u32,
    state: TrialState,
}

#[derive(Clone, Debug, Default)]
struct Rung {
    recorded: BTreeMap<TrialId, f64>,
    promoted: BTreeSet<TrialId>,
}

impl Rung {
    fn quota(&self, reduction_factor: f64) -> usize {
        (self.recorded.len() as f64 / reduction_factor).floor() as usize
    }

    fn top(&self, quota: usize) -> Vec<TrialId> {
        let mut ranked = self.recorded.iter().collect::<Vec<_>>();
        ranked.sort_by(|(a_id, a), (b_id, b)| a.total_cmp(b).then(a_id.cmp(b_id)));
        ranked.into_iter().take(quota).map(|(id, _)| *id).collect()
    }
}

#[derive(Debug)]
struct SchedulerState {
    trials: BTreeMap<TrialId, TrialRecord>,
    rungs: Vec<BTreeMap<u32, Rung>>,
    next_trial_id: TrialId,
    rng: StdRng,
}

pub struct Scheduler<S: Searcher> {
    config: SchedulerConfig,
    rungs: RungLevels,
    bracket_weights: WeightedIndex<f64>,
    searcher: S,
    state: Mutex<SchedulerState>,
    suggestion: Mutex<()>,
}

impl<S: Searcher> Scheduler<S> {
    pub fn new(config: SchedulerConfig, searcher: S) -> Result<Self> {
        let rungs = config.build_rungs()?;
        if config.brackets == 0 {
            return Err(TuneError::InvalidConfiguration(
                "at least one bracket is needed".to_string(),
            ));
        }
        let num_brackets = config.brackets.min(rungs.len());
        let bracket_weights = WeightedIndex::new(hyperband_weights(
            &rungs,
            num_brackets,
            config.reduction_factor,
        ))
        .map_err(|e| TuneError::InvalidConfiguration(format!("bracket weights: {}", e)))?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let next_trial_id = searcher.ledger().read(|state| state.next_trial_id());

        if config.verbosity >= Verbosity::Normal {
            log::info!(
                "{:?} scheduler over rung levels {:?}, {} brackets, reduction factor {}",
                config.scheduler_type,
                rungs.levels(),
                num_brackets,
                config.reduction_factor
            );
        }
        Ok(Self {
            state: Mutex::new(SchedulerState {
                trials: BTreeMap::new(),
                rungs: vec![BTreeMap::new(); num_brackets],
                next_trial_id,
                rng,
            }),
            suggestion: Mutex::new(()),
            bracket_weights,
            rungs,
            searcher,
            config,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn rungs(&self) -> &RungLevels {
        &self.rungs
    }

    pub fn searcher(&self) -> &S {
        &self.searcher
    }

    pub fn into_searcher(self) -> S {
        self.searcher
    }

    pub fn trial_state(&self, trial_id: TrialId) -> Option<TrialState> {
        self.state.lock().trials.get(&trial_id).map(|t| t.state)
    }

    pub fn num_trials(&self) -> usize {
        self.state.lock().trials.len()
    }

    pub fn best(&self) -> Option<(Configuration, Observation)> {
        let mode = self.searcher.mode();
        self.searcher.ledger().read(|state| {
            best_observation(state, mode).map(|(trial, observation)| (trial.config.clone(), *observation))
        })
    }

    pub fn on_free_worker(&self, allow_new: bool) -> Result<Option<Decision>> {
        if self.config.scheduler_type == SchedulerType::Promotion {
            if let Some(decision) = self.promote()? {
                return Ok(Some(decision));
            }
        }
        if !allow_new {
            return Ok(None);
        }

        let _suggestion = self.suggestion.lock();
        let config = self.searcher.get_config()?;
        let mut state = self.state.lock();
        let trial_id = state.next_trial_id;
        let bracket = self.bracket_weights.sample(&mut state.rng);
        let milestone = self.rungs.bracket(bracket)[0];
        self.searcher
            .register_pending(trial_id, Some(&config), milestone)?;
        state.next_trial_id += 1;
        state.trials.insert(
            trial_id,
            TrialRecord {
                bracket,
                milestone,
                state: TrialState::Running,
            },
        );
        drop(state);

        self.log_decision(DecisionRecord {
            trial_id,
            event: DecisionEvent::Started,
            resource: milestone,
            metric: None,
            bracket,
        });
        Ok(Some(Decision::Start {
            trial_id,
            config,
            up_to: self.run_until(milestone),
        }))
    }

    pub fn report(
        &self,
        trial_id: TrialId,
        resource: u32,
        metric: f64,
        elapsed_time: f64,
    ) -> Result<TrialAction> {
        let resource = self.rungs.range().check(resource as f64)?;
        let mut state = self.state.lock();
        let record = state
            .trials
            .get(&trial_id)
            .cloned()
            .ok_or(TuneError::UnknownTrial(trial_id))?;
        if record.state == TrialState::Failed {
            return Err(TuneError::InvalidTransition {
                trial_id,
                from: TrialStatus::Failed,
                to: TrialStatus::Running,
            });
        }

        self.searcher.on_trial_result(Observation {
            trial_id,
            resource,
            metric,
            elapsed_time,
        })?;

        match record.state {
            TrialState::Stopped => return Ok(TrialAction::Stop),
            TrialState::Completed => return Ok(TrialAction::Complete),
            TrialState::Paused => return Ok(TrialAction::Pause),
            _ => {}
        }
        if resource < record.milestone {
            if self.config.verbosity >= Verbosity::Debug {
                self.log_decision(DecisionRecord {
                    trial_id,
                    event: DecisionEvent::Continued,
                    resource,
                    metric: Some(metric),
                    bracket: record.bracket,
                });
            }
            return Ok(TrialAction::Continue {
                up_to: self.run_until(record.milestone),
            });
        }
        if resource != record.milestone {
            // Skipped past the milestone: decide on this report instead.
            self.searcher.ledger().remove_pending(trial_id, record.milestone);
        }

        let (event, action) = if record.milestone >= self.rungs.max() {
            self.searcher
                .trial_finished(trial_id, TrialStatus::Completed)?;
            set_state(&mut state, trial_id, TrialState::Completed);
            (DecisionEvent::Completed, TrialAction::Complete)
        } else {
            let minimized = self.searcher.mode().to_minimization(metric);
            let rung = state.rungs[record.bracket]
                .entry(record.milestone)
                .or_default();
            rung.recorded.insert(trial_id, minimized);
            match self.config.scheduler_type {
                SchedulerType::Promotion => {
                    set_state(&mut state, trial_id, TrialState::Paused);
                    (DecisionEvent::Paused, TrialAction::Pause)
                }
                SchedulerType::Stopping => {
                    let quota = rung.quota(self.config.reduction_factor);
                    let within_quota = quota == 0 || rung.top(quota).contains(&trial_id);
                    if within_quota {
                        rung.promoted.insert(trial_id);
                        let next = self.next_milestone(record.milestone)?;
                        self.searcher.register_pending(trial_id, None, next)?;
                        if let Some(trial) = state.trials.get_mut(&trial_id) {
                            trial.milestone = next;
                        }
                        (
                            DecisionEvent::Continued,
                            TrialAction::Continue {
                                up_to: self.run_until(next),
                            },
                        )
                    } else {
                        self.searcher
                            .trial_finished(trial_id, TrialStatus::Stopped)?;
                        set_state(&mut state, trial_id, TrialState::Stopped);
                        (DecisionEvent::Stopped, TrialAction::Stop)
                    }
                }
            }
        };
        drop(state);

        self.log_decision(DecisionRecord {
            trial_id,
            event,
            resource,
            metric: Some(metric),
            bracket: record.bracket,
        });
        Ok(action)
    }

    pub fn report_failure(&self, trial_id: TrialId) -> Result<()> {
        let mut state = self.state.lock();
        let record = state
            .trials
            .get(&trial_id)
            .cloned()
            .ok_or(TuneError::UnknownTrial(trial_id))?;
        self.searcher.evaluation_failed(trial_id)?;
        set_state(&mut state, trial_id, TrialState::Failed);
        drop(state);

        self.log_decision(DecisionRecord {
            trial_id,
            event: DecisionEvent::Failed,
            resource: record.milestone,
            metric: None,
            bracket: record.bracket,
        });
        Ok(())
    }

    fn promote(&self) -> Result<Option<Decision>> {
        let mut state = self.state.lock();
        let mut candidate = None;
        'brackets: for (bracket, rungs) in state.rungs.iter().enumerate() {
            for (level, rung) in rungs.iter().rev() {
                let quota = rung.quota(self.config.reduction_factor);
                let promotable = rung.top(quota).into_iter().find(|id| {
                    !rung.promoted.contains(id)
                        && state
                            .trials
                            .get(id)
                            .map_or(false, |t| t.state == TrialState::Paused)
                });
                if let Some(trial_id) = promotable {
                    candidate = Some((bracket, *level, trial_id));
                    break 'brackets;
                }
            }
        }
        let (bracket, level, trial_id) = match candidate {
            Some(candidate) => candidate,
            None => return Ok(None),
        };

        let next = self.next_milestone(level)?;
        self.searcher.register_pending(trial_id, None, next)?;
        if let Some(rung) = state.rungs[bracket].get_mut(&level) {
            rung.promoted.insert(trial_id);
        }
        if let Some(trial) = state.trials.get_mut(&trial_id) {
            trial.milestone = next;
            trial.state = TrialState::Running;
        }
        drop(state);

        self.log_decision(DecisionRecord {
            trial_id,
            event: DecisionEvent::Resumed,
            resource: next,
            metric: None,
            bracket,
        });
        Ok(Some(Decision::Resume {
            trial_id,
            up_to: next,
        }))
    }

    fn next_milestone(&self, level: u32) -> Result<u32> {
        self.rungs
            .next_after(level)
            .ok_or(TuneError::UnsupportedResource(level))
    }

    fn run_until(&self, milestone: u32) -> u32 {
        match self.config.scheduler_type {
            SchedulerType::Stopping => self.rungs.max(),
            SchedulerType::Promotion => milestone,
        }
    }

    fn log_decision(&self, record: DecisionRecord) {
        match (self.config.verbosity, record.event) {
            (Verbosity::Quiet, _) => {}
            (Verbosity::Normal, DecisionEvent::Continued) => {}
            (Verbosity::Normal, DecisionEvent::Failed) => log::warn!(
                "Trial {} failed (bracket {}, milestone {})",
                record.trial_id,
                record.bracket,
                record.resource
            ),
            (Verbosity::Normal, _) => log::info!(
                "Trial {} {:?} at resource {} (bracket {}, metric {:?})",
                record.trial_id,
                record.event,
                record.resource,
                record.bracket,
                record.metric
            ),
            (Verbosity::Debug, _) => log::debug!("{:?}", record),
        }
        if let Some(sink) = &self.config.debug_log {
            sink.record(&record);
        }
    }
}

fn set_state(state: &mut SchedulerState, trial_id: TrialId, next: TrialState) {
    if let Some(trial) = state.trials.get_mut(&trial_id) {
        trial.state = next;
    }
}

fn hyperband_weights(rungs: &RungLevels, num_brackets: usize, reduction_factor: f64) -> Vec<f64> {
    let s_max = rungs.len() - 1;
    (0..num_brackets)
        .map(|bracket| {
            let s = rungs.bracket(bracket).len() - 1;
            (s_max + 1) as f64 / (s + 1) as f64 * reduction_factor.powi(s as i32)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::codec::ResourceRange;
    use crate::config::Mode;
    use crate::library::ConfigSpace;
    use crate::searchers::RandomSearcher;

    fn searcher(mode: Mode) -> RandomSearcher {
        let space = ConfigSpace::new().add_f64_range(0.0..1.0, "x");
        RandomSearcher::with_seed(space, mode, 4)
    }

    fn config(scheduler_type: SchedulerType) -> SchedulerConfig {
        SchedulerConfig::new(ResourceRange::new(1, 9).unwrap())
            .scheduler_type(scheduler_type)
            .seed(0)
    }

    fn start(scheduler: &Scheduler<RandomSearcher>) -> TrialId {
        match scheduler.on_free_worker(true).unwrap() {
            Some(Decision::Start { trial_id, .. }) => trial_id,
            other => panic!("expected a new trial, got {:?}", other),
        }
    }

    #[test]
    fn first_trial_at_a_rung_continues() {
        let scheduler = Scheduler::new(config(SchedulerType::Stopping), searcher(Mode::Min)).unwrap();
        let trial = start(&scheduler);
        assert_eq!(
            scheduler.report(trial, 1, 0.5, 1.).unwrap(),
            TrialAction::Continue { up_to: 9 }
        );
        assert!(scheduler
            .searcher()
            .ledger()
            .read(|s| s.is_pending(trial, 3)));
    }

    #[test]
    fn stopping_keeps_the_top_third() {
        let scheduler = Scheduler::new(config(SchedulerType::Stopping), searcher(Mode::Min)).unwrap();
        let trials = (0..3).map(|_| start(&scheduler)).collect::<Vec<_>>();
        assert!(matches!(
            scheduler.report(trials[0], 1, 0.3, 1.).unwrap(),
            TrialAction::Continue { .. }
        ));
        assert!(matches!(
            scheduler.report(trials[1], 1, 0.5, 1.).unwrap(),
            TrialAction::Continue { .. }
        ));
        // Three recorded, quota one, 0.3 is better.
        assert_eq!(scheduler.report(trials[2], 1, 0.4, 1.).unwrap(), TrialAction::Stop);
        assert_eq!(scheduler.trial_state(trials[2]), Some(TrialState::Stopped));
        let status = scheduler
            .searcher()
            .ledger()
            .read(|s| s.trial(trials[2]).map(|t| t.status));
        assert_eq!(status, Some(TrialStatus::Stopped));
    }

    #[test]
    fn maximization_flips_the_ranking() {
        let scheduler = Scheduler::new(config(SchedulerType::Stopping), searcher(Mode::Max)).unwrap();
        let trials = (0..3).map(|_| start(&scheduler)).collect::<Vec<_>>();
        scheduler.report(trials[0], 1, 0.3, 1.).unwrap();
        scheduler.report(trials[1], 1, 0.5, 1.).unwrap();
        assert!(matches!(
            scheduler.report(trials[2], 1, 0.9, 1.).unwrap(),
            TrialAction::Continue { .. }
        ));
    }

    #[test]
    fn intermediate_reports_continue_and_max_completes() {
        let scheduler = Scheduler::new(config(SchedulerType::Stopping), searcher(Mode::Min)).unwrap();
        let trial = start(&scheduler);
        scheduler.report(trial, 1, 0.5, 1.).unwrap();
        assert_eq!(
            scheduler.report(trial, 2, 0.45, 2.).unwrap(),
            TrialAction::Continue { up_to: 9 }
        );
        scheduler.report(trial, 3, 0.4, 3.).unwrap();
        assert_eq!(scheduler.report(trial, 9, 0.3, 9.).unwrap(), TrialAction::Complete);
        assert_eq!(scheduler.trial_state(trial), Some(TrialState::Completed));
        let (_, best) = scheduler.best().unwrap();
        assert_eq!((best.resource, best.metric), (9, 0.3));
    }

    #[test]
    fn reports_outside_the_range_are_rejected() {
        let scheduler = Scheduler::new(config(SchedulerType::Stopping), searcher(Mode::Min)).unwrap();
        let trial = start(&scheduler);
        assert!(matches!(
            scheduler.report(trial, 10, 0.5, 1.),
            Err(TuneError::Range { .. })
        ));
        assert!(matches!(
            scheduler.report(trial + 1, 1, 0.5, 1.),
            Err(TuneError::UnknownTrial(_))
        ));
    }

    #[test]
    fn promotion_pauses_then_resumes_the_best() {
        let scheduler = Scheduler::new(config(SchedulerType::Promotion), searcher(Mode::Min)).unwrap();
        let trials = (0..3).map(|_| start(&scheduler)).collect::<Vec<_>>();
        for (trial, metric) in trials.iter().zip([0.6, 0.2, 0.4]) {
            assert_eq!(scheduler.report(*trial, 1, metric, 1.).unwrap(), TrialAction::Pause);
        }
        assert_eq!(
            scheduler.on_free_worker(false).unwrap(),
            Some(Decision::Resume {
                trial_id: trials[1],
                up_to: 3
            })
        );
        assert_eq!(scheduler.trial_state(trials[1]), Some(TrialState::Running));
        assert_eq!(scheduler.on_free_worker(false).unwrap(), None);
    }

    #[test]
    fn promotion_with_empty_quota_pauses() {
        let scheduler = Scheduler::new(config(SchedulerType::Promotion), searcher(Mode::Min)).unwrap();
        let trial = start(&scheduler);
        assert_eq!(scheduler.report(trial, 1, 0.1, 1.).unwrap(), TrialAction::Pause);
        assert_eq!(scheduler.on_free_worker(false).unwrap(), None);
        assert_eq!(scheduler.trial_state(trial), Some(TrialState::Paused));
    }

    #[test]
    fn failures_free_the_trial_and_reach_the_searcher() {
        let sink = Arc::new(MemoryLogSink::new());
        let config = config(SchedulerType::Stopping).debug_log(sink.clone());
        let scheduler = Scheduler::new(config, searcher(Mode::Min)).unwrap();
        let trial = start(&scheduler);
        scheduler.report_failure(trial).unwrap();
        assert_eq!(scheduler.trial_state(trial), Some(TrialState::Failed));
        assert!(scheduler.report(trial, 1, 0.5, 1.).is_err());
        let events = sink.records().into_iter().map(|r| r.event).collect::<Vec<_>>();
        assert_eq!(events, vec![DecisionEvent::Started, DecisionEvent::Failed]);
    }

    #[test]
    fn brackets_follow_hyperband_proportions() {
        let rungs = RungLevels::geometric(ResourceRange::new(1, 27).unwrap(), 3.).unwrap();
        let weights = hyperband_weights(&rungs, 4, 3.);
        assert_eq!(weights, vec![27., 4. / 3. * 9., 2. * 3., 4.]);

        let config = SchedulerConfig::new(ResourceRange::new(1, 27).unwrap())
            .brackets(4)
            .seed(9);
        let scheduler = Scheduler::new(config, searcher(Mode::Min)).unwrap();
        let milestones = (0..40)
            .map(|_| match scheduler.on_free_worker(true).unwrap() {
                Some(Decision::Start { trial_id, .. }) => scheduler
                    .searcher()
                    .ledger()
                    .read(|s| s.pending().find(|p| p.trial_id == trial_id).map(|p| p.resource)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert!(milestones.iter().all(|m| m.is_some()));
        assert!(milestones.contains(&Some(1)));
    }

    #[test]
    fn zero_brackets_are_rejected() {
        let config = config(SchedulerType::Stopping).brackets(0);
        assert!(Scheduler::new(config, searcher(Mode::Min)).is_err());
    }
}
