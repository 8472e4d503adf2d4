//! The boundary between the coordinator and the workers that perform steps.
//!
//! A delegate receives a [`DelegateRequest`] and returns exactly one
//! [`StepResult`], or fails with `DelegateUnavailable`. Whatever it does on
//! the way (editing files, running tests, asking an LLM) is invisible to the
//! coordinator. Delegates never retry; retry policy lives in the guard.

pub mod command;
pub mod scripted;

use crate::config::{Config, DelegateBackend};
use crate::error::{ConductorError, Result};
use crate::types::StepResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use command::CommandDelegate;
pub use scripted::ScriptedDelegate;

// ---------------------------------------------------------------------------
// DelegateRequest
// ---------------------------------------------------------------------------

/// Everything a delegate is told about the step it performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateRequest {
    pub run_id: String,
    pub workflow: String,
    pub step: String,
    /// Parallel member id for fan-out steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub delegate: String,
    pub intent: String,
    pub attempt: u32,
    /// Latest result of each relevant prior step, keyed `step` or `step/branch`.
    #[serde(default)]
    pub context: BTreeMap<String, StepResult>,
    /// Operator answer when the step is resumed after `NeedsInput`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

impl DelegateRequest {
    /// Key used for log entries and scripts: `step` or `step/branch`.
    pub fn key(&self) -> String {
        match &self.branch {
            Some(b) => format!("{}/{b}", self.step),
            None => self.step.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Delegate
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Delegate: Send + Sync {
    async fn invoke(&self, request: &DelegateRequest) -> Result<StepResult>;
}

// ---------------------------------------------------------------------------
// HumanDelegate
// ---------------------------------------------------------------------------

/// Routes a step to the operator via the awaiting-input boundary.
///
/// The first invocation asks the question; once resumed, the answer becomes
/// the result. Answers starting with `fail:` fail the step with the rest of
/// the line as the reason.
pub struct HumanDelegate;

#[async_trait]
impl Delegate for HumanDelegate {
    async fn invoke(&self, request: &DelegateRequest) -> Result<StepResult> {
        let Some(answer) = &request.answer else {
            return Ok(StepResult::needs_input(format!(
                "[{}] {}",
                request.key(),
                request.intent
            )));
        };
        let trimmed = answer.trim();
        match trimmed.strip_prefix("fail:") {
            Some(reason) => Ok(StepResult::failed(reason.trim())),
            None => Ok(StepResult::completed(trimmed)),
        }
    }
}

// ---------------------------------------------------------------------------
// DelegateRegistry
// ---------------------------------------------------------------------------

/// Delegate name → implementation, with an optional fallback for names that
/// have no dedicated entry.
#[derive(Clone, Default)]
pub struct DelegateRegistry {
    delegates: HashMap<String, Arc<dyn Delegate>>,
    fallback: Option<Arc<dyn Delegate>>,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, delegate: Arc<dyn Delegate>) {
        self.delegates.insert(name.into(), delegate);
    }

    pub fn with(mut self, name: impl Into<String>, delegate: Arc<dyn Delegate>) -> Self {
        self.register(name, delegate);
        self
    }

    pub fn with_fallback(mut self, delegate: Arc<dyn Delegate>) -> Self {
        self.fallback = Some(delegate);
        self
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Delegate>> {
        self.delegates
            .get(name)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| ConductorError::unavailable(name, "no delegate registered"))
    }

    /// Build the registry described by `config.delegates`.
    pub fn from_config(config: &Config, root: &Path) -> Result<Self> {
        let mut registry =
            Self::new().with_fallback(build_backend(&config.delegates.default, root)?);
        for (name, backend) in &config.delegates.named {
            registry.register(name.clone(), build_backend(backend, root)?);
        }
        Ok(registry)
    }
}

fn build_backend(backend: &DelegateBackend, root: &Path) -> Result<Arc<dyn Delegate>> {
    Ok(match backend {
        DelegateBackend::Command {
            program,
            args,
            env,
            timeout_secs,
        } => {
            let mut delegate = CommandDelegate::new(program, root)
                .args(args.clone())
                .envs(env.clone());
            if let Some(secs) = timeout_secs {
                delegate = delegate.timeout(Duration::from_secs(*secs));
            }
            Arc::new(delegate)
        }
        DelegateBackend::Script { path } => Arc::new(ScriptedDelegate::load(&root.join(path))?),
        DelegateBackend::Human => Arc::new(HumanDelegate),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn request(step: &str) -> DelegateRequest {
        DelegateRequest {
            run_id: "r1".into(),
            workflow: "fix".into(),
            step: step.into(),
            branch: None,
            delegate: "worker".into(),
            intent: "Do the thing".into(),
            attempt: 1,
            context: BTreeMap::new(),
            answer: None,
        }
    }

    #[tokio::test]
    async fn human_delegate_asks_then_completes() {
        let mut req = request("clarify");
        let first = HumanDelegate.invoke(&req).await.unwrap();
        assert_eq!(first, StepResult::needs_input("[clarify] Do the thing"));

        req.answer = Some("  use v2  ".into());
        let second = HumanDelegate.invoke(&req).await.unwrap();
        assert_eq!(second, StepResult::completed("use v2"));
    }

    #[tokio::test]
    async fn human_delegate_fail_prefix() {
        let mut req = request("verify-fix");
        req.answer = Some("fail: still crashes".into());
        let result = HumanDelegate.invoke(&req).await.unwrap();
        assert_eq!(result, StepResult::failed("still crashes"));
    }

    #[test]
    fn registry_resolves_named_then_fallback() {
        let registry = DelegateRegistry::new()
            .with("reviewer", Arc::new(HumanDelegate))
            .with_fallback(Arc::new(HumanDelegate));
        assert!(registry.resolve("reviewer").is_ok());
        assert!(registry.resolve("anyone").is_ok());
    }

    #[test]
    fn registry_without_fallback_is_unavailable() {
        let registry = DelegateRegistry::new();
        let err = registry.resolve("reviewer").err().unwrap();
        assert!(matches!(err, ConductorError::DelegateUnavailable { .. }));
    }

    #[test]
    fn registry_from_default_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = DelegateRegistry::from_config(&Config::new("p"), dir.path()).unwrap();
        assert!(registry.resolve("implementer").is_ok());
    }

    #[test]
    fn request_key_includes_branch() {
        let mut req = request("arguments");
        assert_eq!(req.key(), "arguments");
        req.branch = Some("advocate-for".into());
        assert_eq!(req.key(), "arguments/advocate-for");
    }
}
