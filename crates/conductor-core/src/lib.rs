pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod delegate;
pub mod error;
pub mod escalation;
pub mod guard;
pub mod io;
pub mod paths;
pub mod run;
pub mod run_store;
pub mod types;
pub mod workflow;

pub use error::{ConductorError, Result};
