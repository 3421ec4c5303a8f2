use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TuneError};
use crate::library::Configuration;

pub type TrialId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrialStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl TrialStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    fn can_move_to(&self, next: TrialStatus) -> bool {
        use TrialStatus::*;
        match (*self, next) {
            (from, to) if from == to => true,
            (Pending, Running | Failed | Stopped) => true,
            (Running, Completed | Failed | Stopped) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    pub config: Configuration,
    pub status: TrialStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub trial_id: TrialId,
    pub resource: u32,
    pub metric: f64,
    pub elapsed_time: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEvaluation {
    pub trial_id: TrialId,
    pub resource: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    trials: BTreeMap<TrialId, Trial>,
    observations: BTreeMap<TrialId, BTreeMap<u32, Observation>>,
    pending: BTreeSet<PendingEvaluation>,
}

impl LedgerState {
    pub fn trial(&self, trial_id: TrialId) -> Option<&Trial> {
        self.trials.get(&trial_id)
    }

    pub fn trials(&self) -> impl Iterator<Item = &Trial> {
        self.trials.values()
    }

    pub fn next_trial_id(&self) -> TrialId {
        self.trials.keys().next_back().map_or(0, |id| id + 1)
    }

    pub fn observation(&self, trial_id: TrialId, resource: u32) -> Option<&Observation> {
        self.observations.get(&trial_id)?.get(&resource)
    }

    pub fn observations(&self) -> impl Iterator<Item = &Observation> {
        self.observations.values().flat_map(|o| o.values())
    }

    pub fn observations_of(&self, trial_id: TrialId) -> impl Iterator<Item = &Observation> {
        self.observations
            .get(&trial_id)
            .into_iter()
            .flat_map(|o| o.values())
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingEvaluation> {
        self.pending.iter()
    }

    pub fn is_pending(&self, trial_id: TrialId, resource: u32) -> bool {
        self.pending.contains(&PendingEvaluation { trial_id, resource })
    }

    pub fn is_observed(&self, trial_id: TrialId, resource: u32) -> bool {
        self.observation(trial_id, resource).is_some()
    }

    fn is_failed(&self, trial_id: TrialId) -> bool {
        self.trials
            .get(&trial_id)
            .map_or(true, |t| t.status == TrialStatus::Failed)
    }

    pub fn training_observations(&self) -> impl Iterator<Item = (&Trial, &Observation)> {
        self.observations()
            .filter(|o| !self.is_failed(o.trial_id))
            .filter_map(|o| self.trials.get(&o.trial_id).map(|t| (t, o)))
    }

    pub fn training_pending(&self) -> impl Iterator<Item = (&Trial, &PendingEvaluation)> {
        self.pending
            .iter()
            .filter(|p| !self.is_failed(p.trial_id))
            .filter_map(|p| self.trials.get(&p.trial_id).map(|t| (t, p)))
    }

    pub fn num_training_observations_at(&self, resource: u32) -> usize {
        self.training_observations()
            .filter(|(_, o)| o.resource == resource)
            .count()
    }

    pub fn contains_configuration(&self, config: &Configuration) -> bool {
        self.trials.values().any(|t| &t.config == config)
    }

    fn ensure_trial(&mut self, trial_id: TrialId, config: Option<&Configuration>) -> Result<()> {
        match (self.trials.get(&trial_id), config) {
            (Some(trial), Some(config)) if &trial.config != config => {
                Err(TuneError::InvalidConfiguration(format!(
                    "configuration of trial {} cannot change once it has started",
                    trial_id
                )))
            }
            (Some(_), _) => Ok(()),
            (None, Some(config)) => {
                self.trials.insert(
                    trial_id,
                    Trial {
                        id: trial_id,
                        config: config.clone(),
                        status: TrialStatus::Pending,
                    },
                );
                Ok(())
            }
            (None, None) => Err(TuneError::UnknownTrial(trial_id)),
        }
    }

    fn register_pending(
        &mut self,
        trial_id: TrialId,
        config: Option<&Configuration>,
        resource: u32,
    ) -> Result<bool> {
        if self.is_observed(trial_id, resource) {
            return Err(TuneError::StateConflict { trial_id, resource });
        }
        self.ensure_trial(trial_id, config)?;
        let status = self.trials[&trial_id].status;
        if status.is_terminal() {
            return Err(TuneError::InvalidTransition {
                trial_id,
                from: status,
                to: TrialStatus::Pending,
            });
        }
        Ok(self.pending.insert(PendingEvaluation { trial_id, resource }))
    }

    fn record_observation(&mut self, observation: Observation) -> Result<()> {
        let Observation {
            trial_id,
            resource,
            metric,
            elapsed_time,
        } = observation;
        if !self.trials.contains_key(&trial_id) {
            return Err(TuneError::UnknownTrial(trial_id));
        }
        if !metric.is_finite() || !(elapsed_time >= 0.) {
            return Err(TuneError::InvalidObservation(format!(
                "trial {} reported metric={} elapsed_time={}",
                trial_id, metric, elapsed_time
            )));
        }
        if self.is_observed(trial_id, resource) {
            return Err(TuneError::StateConflict { trial_id, resource });
        }
        self.pending.remove(&PendingEvaluation { trial_id, resource });
        self.observations
            .entry(trial_id)
            .or_default()
            .insert(resource, observation);
        if let Some(trial) = self.trials.get_mut(&trial_id) {
            if trial.status == TrialStatus::Pending {
                trial.status = TrialStatus::Running;
            }
        }
        Ok(())
    }

    fn remove_pending_of(&mut self, trial_id: TrialId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|p| p.trial_id != trial_id);
        before - self.pending.len()
    }

    fn set_status(&mut self, trial_id: TrialId, status: TrialStatus) -> Result<()> {
        let trial = self
            .trials
            .get_mut(&trial_id)
            .ok_or(TuneError::UnknownTrial(trial_id))?;
        if !trial.status.can_move_to(status) {
            return Err(TuneError::InvalidTransition {
                trial_id,
                from: trial.status,
                to: status,
            });
        }
        trial.status = status;
        Ok(())
    }

    fn remove_observation(&mut self, trial_id: TrialId, resource: u32) -> Result<Observation> {
        let per_trial = self
            .observations
            .get_mut(&trial_id)
            .ok_or(TuneError::UnknownObservation { trial_id, resource })?;
        let removed = per_trial
            .remove(&resource)
            .ok_or(TuneError::UnknownObservation { trial_id, resource })?;
        if per_trial.is_empty() {
            self.observations.remove(&trial_id);
        }
        Ok(removed)
    }
}

#[derive(Debug, Default)]
struct Slot {
    state: LedgerState,
    retired: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Ledger {
    inner: Arc<Mutex<Slot>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: LedgerState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slot {
                state,
                retired: false,
            })),
        }
    }

    fn state(&self) -> MappedMutexGuard<'_, LedgerState> {
        MutexGuard::map(self.inner.lock(), |slot| &mut slot.state)
    }

    fn state_mut(&self) -> Result<MappedMutexGuard<'_, LedgerState>> {
        let slot = self.inner.lock();
        if slot.retired {
            return Err(TuneError::RetiredLedger);
        }
        Ok(MutexGuard::map(slot, |slot| &mut slot.state))
    }

    pub fn snapshot(&self) -> LedgerState {
        self.state().clone()
    }

    pub fn read<T>(&self, query: impl FnOnce(&LedgerState) -> T) -> T {
        query(&self.state())
    }

    pub fn is_retired(&self) -> bool {
        self.inner.lock().retired
    }

    pub fn register_pending(
        &self,
        trial_id: TrialId,
        config: Option<&Configuration>,
        resource: u32,
    ) -> Result<bool> {
        self.state_mut()?
            .register_pending(trial_id, config, resource)
    }

    pub fn record_observation(&self, observation: Observation) -> Result<()> {
        self.state_mut()?.record_observation(observation)
    }

    pub fn remove_pending(&self, trial_id: TrialId, resource: u32) -> bool {
        match self.state_mut() {
            Ok(mut state) => state.pending.remove(&PendingEvaluation { trial_id, resource }),
            Err(_) => false,
        }
    }

    pub fn set_status(&self, trial_id: TrialId, status: TrialStatus) -> Result<()> {
        self.state_mut()?.set_status(trial_id, status)
    }

    pub fn finish_trial(&self, trial_id: TrialId, status: TrialStatus) -> Result<usize> {
        let mut state = self.state_mut()?;
        state.set_status(trial_id, status)?;
        Ok(state.remove_pending_of(trial_id))
    }

    pub fn remove_observation(&self, trial_id: TrialId, resource: u32) -> Result<Observation> {
        self.state_mut()?.remove_observation(trial_id, resource)
    }

    /// Moves the state out. This handle and its clones stay empty and reject
    /// every later mutation.
    pub(crate) fn retire(&self) -> LedgerState {
        let mut slot = self.inner.lock();
        slot.retired = true;
        std::mem::take(&mut slot.state)
    }
}
