use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("not initialized: run 'conductor init'")]
    NotInitialized,

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("unknown step '{step}' in workflow '{workflow}'")]
    UnknownStep { workflow: String, step: String },

    #[error("step '{step}' has no branch for outcome '{outcome}' and no default")]
    UnknownOutcome { step: String, outcome: String },

    #[error("delegate '{delegate}' unavailable: {reason}")]
    DelegateUnavailable { delegate: String, reason: String },

    #[error("loop '{tag}' exceeded its ceiling of {ceiling} attempt(s)")]
    LimitExceeded { tag: String, ceiling: u32 },

    #[error("invalid workflow '{workflow}': {reason}")]
    InvalidWorkflow { workflow: String, reason: String },

    #[error("invalid name '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidName(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("run {run} is {state}, expected {expected}")]
    InvalidRunState {
        run: String,
        state: String,
        expected: String,
    },

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("escalation not found: {0}")]
    EscalationNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ConductorError {
    pub fn unavailable(delegate: impl Into<String>, reason: impl Into<String>) -> Self {
        ConductorError::DelegateUnavailable {
            delegate: delegate.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;
