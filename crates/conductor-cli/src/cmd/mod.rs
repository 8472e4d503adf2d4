pub mod config;
pub mod escalation;
pub mod init;
pub mod run;
pub mod runs;
pub mod workflow;
