use std::{fs::File, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    config::Mode,
    errors::Result,
    ledger::{LedgerState, Observation, Trial},
    library::Configuration,
    model::CachedFit,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearcherState {
    pub ledger: LedgerState,
    pub model_cache: Option<CachedFit>,
    pub points_to_evaluate: Vec<Configuration>,
}

impl SearcherState {
    pub fn best(&self, mode: Mode) -> Option<(&Trial, &Observation)> {
        best_observation(&self.ledger, mode)
    }

    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = File::options()
            .write(true)
            .truncate(true)
            .create(true)
            .open(path)?;
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
}

pub(crate) fn best_observation(ledger: &LedgerState, mode: Mode) -> Option<(&Trial, &Observation)> {
    ledger.training_observations().min_by(|(_, a), (_, b)| {
        b.resource.cmp(&a.resource).then_with(|| {
            mode.to_minimization(a.metric)
                .total_cmp(&mode.to_minimization(b.metric))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::library::Value;

    fn state() -> SearcherState {
        let ledger = Ledger::new();
        for (trial_id, (resource, metric)) in [(1, 0.1), (3, 0.5), (3, 0.4), (1, 0.05)]
            .into_iter()
            .enumerate()
        {
            let trial_id = trial_id as u64;
            let config = [("x".to_string(), Value::Integer(trial_id as i32))]
                .into_iter()
                .collect();
            ledger
                .register_pending(trial_id, Some(&config), resource)
                .unwrap();
            ledger
                .record_observation(Observation {
                    trial_id,
                    resource,
                    metric,
                    elapsed_time: 1.,
                })
                .unwrap();
        }
        SearcherState {
            ledger: ledger.snapshot(),
            model_cache: None,
            points_to_evaluate: vec![],
        }
    }

    #[test]
    fn best_prefers_the_largest_resource() {
        let state = state();
        let (trial, observation) = state.best(Mode::Min).unwrap();
        assert_eq!((trial.id, observation.metric), (2, 0.4));
        let (trial, _) = state.best(Mode::Max).unwrap();
        assert_eq!(trial.id, 1);
    }

    #[test]
    fn state_survives_a_file_round_trip() {
        let state = state();
        let path = std::env::temp_dir().join(format!("mf-state-{}.json", std::process::id()));
        state.write_to_file(&path).unwrap();
        let read = SearcherState::read_from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(read, state);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(SearcherState::read_from_file("/nonexistent/dir/state.json").is_err());
    }
}
