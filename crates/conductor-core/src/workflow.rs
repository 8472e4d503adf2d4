//! Declarative workflow definitions.
//!
//! A `WorkflowDefinition` is an ordered list of `Step`s plus the loop
//! ceilings and spawn budget it was designed around. The only runtime query
//! is [`WorkflowDefinition::successor`], a pure lookup from
//! `(step, outcome kind)` to the next step or terminal success.
//!
//! ```yaml
//! name: fix
//! description: Reproduce, diagnose and fix a bug
//! spawn_budget: 12
//! loops:
//!   reproduction: 2
//! steps:
//!   - id: reproduce
//!     intent: Write a failing test that reproduces the bug
//!     delegate: reproducer
//!     loop: reproduction
//!     branches:
//!       on_success: diagnose
//!       on_failure: reproduce
//! ```

use crate::error::{ConductorError, Result};
use crate::paths;
use crate::types::{Target, ON_FAILURE, ON_SUCCESS};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

// ---------------------------------------------------------------------------
// Branch (fan-out member)
// ---------------------------------------------------------------------------

/// One member of a fan-out step. Members run concurrently, so their
/// declared write-sets must be pairwise disjoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub delegate: String,
    /// Resources this member may write (paths or resource names).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub writes: Vec<String>,
}

impl Branch {
    pub fn new(id: impl Into<String>, delegate: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            delegate: delegate.into(),
            writes: Vec::new(),
        }
    }

    pub fn writes(mut self, resources: &[&str]) -> Self {
        self.writes = resources.iter().map(|r| r.to_string()).collect();
        self
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub intent: String,
    /// Delegate for a single-invocation step. Exactly one of `delegate`
    /// and `parallel` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel: Vec<Branch>,
    /// Steps whose latest attempt must have completed before this one runs.
    /// When set, only their results are passed as context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    /// Outcome kind → target.
    #[serde(default)]
    pub branches: BTreeMap<String, Target>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Target>,
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_tag: Option<String>,
}

impl Step {
    pub fn new(id: impl Into<String>, intent: impl Into<String>, delegate: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            intent: intent.into(),
            delegate: Some(delegate.into()),
            parallel: Vec::new(),
            needs: Vec::new(),
            branches: BTreeMap::new(),
            default: None,
            loop_tag: None,
        }
    }

    pub fn fan_out(id: impl Into<String>, intent: impl Into<String>, members: Vec<Branch>) -> Self {
        Self {
            delegate: None,
            parallel: members,
            ..Step::new(id, intent, "")
        }
    }

    pub fn on(mut self, outcome: &str, target: impl Into<Target>) -> Self {
        self.branches.insert(outcome.to_string(), target.into());
        self
    }

    pub fn on_success(self, target: impl Into<Target>) -> Self {
        self.on(ON_SUCCESS, target)
    }

    pub fn on_failure(self, target: impl Into<Target>) -> Self {
        self.on(ON_FAILURE, target)
    }

    pub fn otherwise(mut self, target: impl Into<Target>) -> Self {
        self.default = Some(target.into());
        self
    }

    pub fn in_loop(mut self, tag: impl Into<String>) -> Self {
        self.loop_tag = Some(tag.into());
        self
    }

    pub fn needs(mut self, steps: &[&str]) -> Self {
        self.needs = steps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn is_fan_out(&self) -> bool {
        !self.parallel.is_empty()
    }

    /// Invocations this step issues: `(branch id, delegate name)` pairs.
    /// Single-delegate steps yield one pair with no branch id.
    pub fn invocations(&self) -> Vec<(Option<&str>, &str)> {
        if self.is_fan_out() {
            self.parallel
                .iter()
                .map(|b| (Some(b.id.as_str()), b.delegate.as_str()))
                .collect()
        } else {
            self.delegate
                .as_deref()
                .map(|d| vec![(None, d)])
                .unwrap_or_default()
        }
    }

    /// Every target this step can lead to, default included.
    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.branches.values().chain(self.default.iter())
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Loop tag → default ceiling. Configuration may override these.
    #[serde(default)]
    pub loops: BTreeMap<String, u32>,
    /// Delegate invocations allowed per run. `None` uses the configured limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_budget: Option<u32>,
    pub steps: Vec<Step>,
}

impl WorkflowDefinition {
    pub fn first_step(&self) -> Result<&Step> {
        self.steps
            .first()
            .ok_or_else(|| self.invalid("workflow has no steps"))
    }

    pub fn step(&self, id: &str) -> Result<&Step> {
        self.steps
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| ConductorError::UnknownStep {
                workflow: self.name.clone(),
                step: id.to_string(),
            })
    }

    /// Loop tag → default ceiling declared by this workflow.
    pub fn loops(&self) -> &BTreeMap<String, u32> {
        &self.loops
    }

    pub fn spawn_budget(&self) -> Option<u32> {
        self.spawn_budget
    }

    /// Resolve the successor of `step_id` for `outcome`.
    ///
    /// Falls back to the step's `default` branch when the outcome kind is not
    /// mapped; with no default the lookup fails with `UnknownOutcome`.
    pub fn successor(&self, step_id: &str, outcome: &str) -> Result<Target> {
        let step = self.step(step_id)?;
        step.branches
            .get(outcome)
            .or(step.default.as_ref())
            .cloned()
            .ok_or_else(|| ConductorError::UnknownOutcome {
                step: step_id.to_string(),
                outcome: outcome.to_string(),
            })
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Result<()> {
        paths::validate_name(&self.name)?;
        self.first_step()?;

        let mut ids = HashSet::new();
        for step in &self.steps {
            paths::validate_name(&step.id)?;
            if !ids.insert(step.id.as_str()) {
                return Err(self.invalid(format!("duplicate step id '{}'", step.id)));
            }
        }

        for step in &self.steps {
            self.validate_step(step, &ids)?;
        }
        Ok(())
    }

    fn validate_step(&self, step: &Step, ids: &HashSet<&str>) -> Result<()> {
        match (&step.delegate, step.is_fan_out()) {
            (Some(d), false) if !d.is_empty() => {}
            (None, true) => self.validate_fan_out(step)?,
            _ => {
                return Err(self.invalid(format!(
                    "step '{}' must name exactly one of 'delegate' or 'parallel'",
                    step.id
                )))
            }
        }

        if step.branches.is_empty() && step.default.is_none() {
            return Err(self.invalid(format!("step '{}' has no branches", step.id)));
        }
        for target in step.targets() {
            if let Some(id) = target.step_id() {
                if !ids.contains(id) {
                    return Err(self.invalid(format!(
                        "step '{}' branches to undefined step '{id}'",
                        step.id
                    )));
                }
            }
        }
        for need in &step.needs {
            if !ids.contains(need.as_str()) {
                return Err(self.invalid(format!(
                    "step '{}' needs undefined step '{need}'",
                    step.id
                )));
            }
        }
        if let Some(tag) = &step.loop_tag {
            paths::validate_name(tag)?;
            if !self.loops.contains_key(tag) {
                return Err(self.invalid(format!(
                    "step '{}' uses loop '{tag}' which has no ceiling",
                    step.id
                )));
            }
        }
        Ok(())
    }

    fn validate_fan_out(&self, step: &Step) -> Result<()> {
        let mut seen = HashSet::new();
        for member in &step.parallel {
            paths::validate_name(&member.id)?;
            if !seen.insert(member.id.as_str()) {
                return Err(self.invalid(format!(
                    "step '{}' has duplicate parallel member '{}'",
                    step.id, member.id
                )));
            }
            if member.delegate.is_empty() {
                return Err(self.invalid(format!(
                    "parallel member '{}/{}' has no delegate",
                    step.id, member.id
                )));
            }
        }
        if let Some((a, b, resource)) = overlapping_writes(&step.parallel) {
            return Err(self.invalid(format!(
                "parallel members '{a}' and '{b}' of step '{}' both write '{resource}'",
                step.id
            )));
        }
        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> ConductorError {
        ConductorError::InvalidWorkflow {
            workflow: self.name.clone(),
            reason: reason.into(),
        }
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    pub fn from_yaml(data: &str) -> Result<Self> {
        let definition: WorkflowDefinition = serde_yaml::from_str(data)?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Write-set disjointness
// ---------------------------------------------------------------------------

/// Two resources overlap when they are equal or one is a path prefix of the
/// other (`tests` overlaps `tests/unit`, `tests/unit` does not overlap
/// `tests/unit-helpers`).
pub fn writes_overlap(a: &str, b: &str) -> bool {
    let (pa, pb) = (Path::new(a), Path::new(b));
    pa.starts_with(pb) || pb.starts_with(pa)
}

/// First pair of members whose write-sets overlap, with the offending resource.
pub fn overlapping_writes(members: &[Branch]) -> Option<(String, String, String)> {
    for (i, left) in members.iter().enumerate() {
        for right in &members[i + 1..] {
            for w in &left.writes {
                if right.writes.iter().any(|r| writes_overlap(w, r)) {
                    return Some((left.id.clone(), right.id.clone(), w.clone()));
                }
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "demo".into(),
            description: String::new(),
            loops: BTreeMap::from([("retry".to_string(), 2)]),
            spawn_budget: None,
            steps: vec![
                Step::new("build", "Build it", "builder")
                    .in_loop("retry")
                    .on_success("check")
                    .on_failure("build"),
                Step::new("check", "Check it", "checker")
                    .on_success("done")
                    .otherwise("build"),
            ],
        }
    }

    #[test]
    fn successor_follows_mapped_branch() {
        let wf = two_step();
        assert_eq!(
            wf.successor("build", ON_SUCCESS).unwrap(),
            Target::Step("check".into())
        );
        assert_eq!(wf.successor("check", ON_SUCCESS).unwrap(), Target::Done);
    }

    #[test]
    fn successor_falls_back_to_default() {
        let wf = two_step();
        assert_eq!(
            wf.successor("check", "needs-rework").unwrap(),
            Target::Step("build".into())
        );
    }

    #[test]
    fn successor_unknown_outcome_without_default() {
        let wf = two_step();
        let err = wf.successor("build", "complex").unwrap_err();
        assert!(matches!(err, ConductorError::UnknownOutcome { .. }));
    }

    #[test]
    fn successor_unknown_step() {
        let wf = two_step();
        let err = wf.successor("deploy", ON_SUCCESS).unwrap_err();
        assert!(matches!(err, ConductorError::UnknownStep { .. }));
    }

    #[test]
    fn validate_accepts_well_formed() {
        two_step().validate().unwrap();
    }

    #[test]
    fn validate_rejects_dangling_target() {
        let mut wf = two_step();
        wf.steps[1] = Step::new("check", "Check it", "checker").on_success("deploy");
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("undefined step 'deploy'"));
    }

    #[test]
    fn validate_rejects_loop_without_ceiling() {
        let mut wf = two_step();
        wf.loops.clear();
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("no ceiling"));
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let mut wf = two_step();
        wf.steps.push(Step::new("build", "Again", "builder").on_success("done"));
        assert!(wf.validate().is_err());
    }

    #[test]
    fn validate_rejects_overlapping_fan_out() {
        let mut wf = two_step();
        wf.steps.push(
            Step::fan_out(
                "fix-files",
                "Fix in parallel",
                vec![
                    Branch::new("unit", "fixer").writes(&["tests"]),
                    Branch::new("integration", "fixer").writes(&["tests/integration"]),
                ],
            )
            .on_success("done"),
        );
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("both write"));
    }

    #[test]
    fn writes_overlap_is_component_wise() {
        assert!(writes_overlap("tests", "tests/unit"));
        assert!(writes_overlap("src/lib.rs", "src/lib.rs"));
        assert!(!writes_overlap("tests/unit", "tests/unit-helpers"));
        assert!(!writes_overlap("docs", "src"));
    }

    #[test]
    fn yaml_definition_loads() {
        let yaml = r#"
name: hotfix
description: Minimal fix loop
loops:
  verify: 3
steps:
  - id: patch
    intent: Apply a patch
    delegate: implementer
    loop: verify
    branches:
      on_success: check
  - id: check
    intent: Run the tests
    delegate: test-runner
    branches:
      on_success: done
      on_failure: patch
"#;
        let wf = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(wf.steps.len(), 2);
        assert_eq!(wf.steps[0].loop_tag.as_deref(), Some("verify"));
        assert_eq!(wf.successor("check", ON_FAILURE).unwrap(), Target::Step("patch".into()));
        assert_eq!(wf.loops().get("verify"), Some(&3));
        assert_eq!(wf.spawn_budget(), None);
    }

    #[test]
    fn invocations_for_fan_out() {
        let step = Step::fan_out(
            "argue",
            "Argue both sides",
            vec![Branch::new("for", "advocate"), Branch::new("against", "advocate")],
        );
        assert_eq!(
            step.invocations(),
            vec![(Some("for"), "advocate"), (Some("against"), "advocate")]
        );
    }
}
