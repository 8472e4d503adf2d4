use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Outcome kinds
// ---------------------------------------------------------------------------

/// Outcome kind for a `Completed` result that carries no branch label.
pub const ON_SUCCESS: &str = "on_success";
/// Outcome kind for every `Failed` result.
pub const ON_FAILURE: &str = "on_failure";

/// Reserved target name for terminal success.
pub const DONE: &str = "done";

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

/// The single result a delegate produces for one invocation.
///
/// Serialized with a `status` discriminator; this is also the JSON shape
/// command delegates print on stdout:
///
/// ```json
/// {"status": "completed", "output": "patched parser", "branch": "simple"}
/// {"status": "failed", "reason": "tests still red"}
/// {"status": "needs_input", "question": "Which API version?"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepResult {
    Completed {
        #[serde(default)]
        output: String,
        /// Branch label chosen by the delegate (e.g. "simple" vs "complex").
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },
    Failed {
        reason: String,
    },
    NeedsInput {
        question: String,
    },
}

impl StepResult {
    pub fn completed(output: impl Into<String>) -> Self {
        StepResult::Completed {
            output: output.into(),
            branch: None,
        }
    }

    pub fn completed_with_branch(output: impl Into<String>, branch: impl Into<String>) -> Self {
        StepResult::Completed {
            output: output.into(),
            branch: Some(branch.into()),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        StepResult::Failed {
            reason: reason.into(),
        }
    }

    pub fn needs_input(question: impl Into<String>) -> Self {
        StepResult::NeedsInput {
            question: question.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StepResult::Completed { .. } => "completed",
            StepResult::Failed { .. } => "failed",
            StepResult::NeedsInput { .. } => "needs_input",
        }
    }

    /// The outcome kind used for the successor lookup.
    ///
    /// `NeedsInput` never advances the cursor, so it has no outcome kind.
    pub fn outcome(&self) -> Option<&str> {
        match self {
            StepResult::Completed { branch, .. } => Some(branch.as_deref().unwrap_or(ON_SUCCESS)),
            StepResult::Failed { .. } => Some(ON_FAILURE),
            StepResult::NeedsInput { .. } => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, StepResult::Completed { .. })
    }

    /// One-line summary for tables and reports.
    pub fn summary(&self) -> String {
        match self {
            StepResult::Completed { output, branch } => match branch {
                Some(b) => format!("completed [{b}] {}", first_line(output)),
                None => format!("completed {}", first_line(output)),
            },
            StepResult::Failed { reason } => format!("failed: {}", first_line(reason)),
            StepResult::NeedsInput { question } => format!("needs input: {}", first_line(question)),
        }
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("").trim()
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// Where a branch leads: another step, or terminal success.
///
/// Written as a plain string in YAML; `done` is reserved for the terminal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Target {
    Step(String),
    Done,
}

impl Target {
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Target::Step(id) => Some(id),
            Target::Done => None,
        }
    }
}

impl From<String> for Target {
    fn from(s: String) -> Self {
        if s == DONE {
            Target::Done
        } else {
            Target::Step(s)
        }
    }
}

impl From<&str> for Target {
    fn from(s: &str) -> Self {
        Target::from(s.to_string())
    }
}

impl From<Target> for String {
    fn from(t: Target) -> Self {
        match t {
            Target::Step(id) => id,
            Target::Done => DONE.to_string(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Step(id) => f.write_str(id),
            Target::Done => f.write_str(DONE),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
