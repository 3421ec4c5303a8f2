use thiserror::Error;

use crate::ledger::{TrialId, TrialStatus};

#[derive(Debug, Error)]
pub enum TuneError {
    #[error("resource {resource} is outside of the declared range [{min}, {max}]")]
    Range { resource: f64, min: u32, max: u32 },

    #[error("no posterior has been trained at resource {0}")]
    UnsupportedResource(u32),

    #[error("trial {trial_id} already has an observation at resource {resource}")]
    StateConflict { trial_id: TrialId, resource: u32 },

    #[error("unknown trial {0}")]
    UnknownTrial(TrialId),

    #[error("trial {trial_id} has no observation at resource {resource}")]
    UnknownObservation { trial_id: TrialId, resource: u32 },

    #[error("trial {trial_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        trial_id: TrialId,
        from: TrialStatus,
        to: TrialStatus,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid observation: {0}")]
    InvalidObservation(String),

    #[error("numerical failure: {0}")]
    Numerical(String),

    #[error("the ledger was moved into a restored searcher")]
    RetiredLedger,

    #[error("no new configuration found after {0} random draws")]
    SearchSpaceExhausted(usize),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TuneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_offending_values() {
        let err = TuneError::Range {
            resource: 100.,
            min: 1,
            max: 81,
        };
        assert!(err.to_string().contains("100"));
        assert!(err.to_string().contains("[1, 81]"));

        let err = TuneError::StateConflict {
            trial_id: 3,
            resource: 9,
        };
        assert!(err.to_string().contains("trial 3"));
        assert!(err.to_string().contains("resource 9"));

        let err = TuneError::UnsupportedResource(27);
        assert!(err.to_string().contains("27"));
    }
}
