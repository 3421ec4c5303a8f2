pub mod acquisition;
pub mod codec;
pub mod config;
pub mod errors;
pub mod ledger;
pub mod library;
pub mod model;
pub mod output;
pub mod rungs;
pub mod runner;
pub mod scheduler;
pub mod searchers;
pub use anyhow;
pub use errors::{Result, TuneError};
