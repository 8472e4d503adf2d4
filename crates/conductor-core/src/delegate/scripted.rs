//! Replay delegate: returns pre-recorded outcomes per step.
//!
//! Scripts are YAML maps from `step` (or `step/branch` for parallel members)
//! to a queue of outcomes consumed in order:
//!
//! ```yaml
//! reproduce:
//!   - status: failed
//!     reason: could not trigger the panic
//!   - status: completed
//!     output: tests/regression.rs fails as expected
//! verify-fix:
//!   - unavailable: test runner offline
//! ```
//!
//! An exhausted queue is `DelegateUnavailable`, so a script that is too short
//! ends the run visibly instead of looping.

use super::{Delegate, DelegateRequest};
use crate::error::{ConductorError, Result};
use crate::run::LogEntry;
use crate::types::StepResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptEntry {
    Unavailable { unavailable: String },
    Result(StepResult),
}

#[derive(Debug, Default)]
pub struct ScriptedDelegate {
    queues: Mutex<HashMap<String, VecDeque<ScriptEntry>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `result` for `key` (`step` or `step/branch`).
    pub fn push(self, key: &str, result: StepResult) -> Self {
        self.enqueue(key, ScriptEntry::Result(result));
        self
    }

    pub fn push_unavailable(self, key: &str, reason: &str) -> Self {
        self.enqueue(
            key,
            ScriptEntry::Unavailable {
                unavailable: reason.to_string(),
            },
        );
        self
    }

    fn enqueue(&self, key: &str, entry: ScriptEntry) {
        lock(&self.queues)
            .entry(key.to_string())
            .or_default()
            .push_back(entry);
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let script: BTreeMap<String, Vec<ScriptEntry>> = serde_yaml::from_str(data)?;
        let delegate = Self::new();
        for (key, entries) in script {
            for entry in entries {
                delegate.enqueue(&key, entry);
            }
        }
        Ok(delegate)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    /// Drop the entries a previous process already consumed, one per log
    /// entry, so a resumed run continues where the script left off.
    pub fn fast_forward(&self, log: &[LogEntry]) {
        let mut queues = lock(&self.queues);
        for entry in log {
            if let Some(queue) = queues.get_mut(&entry.key()) {
                queue.pop_front();
            }
        }
    }

    /// Keys invoked so far, in invocation order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Entries still queued for `key`.
    pub fn remaining(&self, key: &str) -> usize {
        lock(&self.queues).get(key).map_or(0, VecDeque::len)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Delegate for ScriptedDelegate {
    async fn invoke(&self, request: &DelegateRequest) -> Result<StepResult> {
        let key = request.key();
        lock(&self.calls).push(key.clone());
        let next = lock(&self.queues).get_mut(&key).and_then(VecDeque::pop_front);
        match next {
            Some(ScriptEntry::Result(result)) => Ok(result),
            Some(ScriptEntry::Unavailable { unavailable }) => {
                Err(ConductorError::unavailable(&request.delegate, unavailable))
            }
            None => Err(ConductorError::unavailable(
                &request.delegate,
                format!("script exhausted for '{key}'"),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn request(step: &str, branch: Option<&str>) -> DelegateRequest {
        DelegateRequest {
            run_id: "r1".into(),
            workflow: "deliberate".into(),
            step: step.into(),
            branch: branch.map(str::to_string),
            delegate: "advocate".into(),
            intent: "Argue".into(),
            attempt: 1,
            context: BTreeMap::new(),
            answer: None,
        }
    }

    #[tokio::test]
    async fn replays_in_order_then_exhausts() {
        let d = ScriptedDelegate::new()
            .push("judge", StepResult::failed("undecided"))
            .push("judge", StepResult::completed("ship it"));
        let req = request("judge", None);
        assert_eq!(d.invoke(&req).await.unwrap(), StepResult::failed("undecided"));
        assert_eq!(d.invoke(&req).await.unwrap(), StepResult::completed("ship it"));
        let err = d.invoke(&req).await.unwrap_err();
        assert!(err.to_string().contains("script exhausted"));
        assert_eq!(d.calls(), vec!["judge", "judge", "judge"]);
    }

    #[tokio::test]
    async fn branch_members_have_their_own_queue() {
        let d = ScriptedDelegate::new()
            .push("arguments/for", StepResult::completed("pro"))
            .push("arguments/against", StepResult::completed("con"));
        let against = d.invoke(&request("arguments", Some("against"))).await.unwrap();
        assert_eq!(against, StepResult::completed("con"));
        assert_eq!(d.remaining("arguments/for"), 1);
    }

    #[tokio::test]
    async fn yaml_script_with_unavailable_entry() {
        let yaml = r#"
reproduce:
  - status: failed
    reason: no crash
  - unavailable: sandbox down
"#;
        let d = ScriptedDelegate::from_yaml(yaml).unwrap();
        let req = request("reproduce", None);
        assert_eq!(d.invoke(&req).await.unwrap(), StepResult::failed("no crash"));
        let err = d.invoke(&req).await.unwrap_err();
        assert!(matches!(err, ConductorError::DelegateUnavailable { ref reason, .. } if reason == "sandbox down"));
    }

    #[test]
    fn fast_forward_skips_consumed_entries() {
        let d = ScriptedDelegate::new()
            .push("clarify", StepResult::needs_input("which?"))
            .push("clarify", StepResult::completed("v2"));
        let consumed = LogEntry::new(1, "clarify", None, 1, StepResult::needs_input("which?"));
        d.fast_forward(&[consumed]);
        assert_eq!(d.remaining("clarify"), 1);
    }
}
