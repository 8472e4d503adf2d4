//! Built-in workflows and the project catalog.
//!
//! The catalog is the built-ins overlaid by `.conductor/workflows/*.yaml`;
//! a project file with a built-in's name replaces it.

use crate::error::{ConductorError, Result};
use crate::paths;
use crate::workflow::{Branch, Step, WorkflowDefinition};
use std::collections::BTreeMap;
use std::path::Path;

pub const BUILTIN_NAMES: &[&str] = &["fix", "iterate", "deliberate", "doc-review", "test-audit"];

/// The built-in definition called `name`, if there is one.
pub fn builtin(name: &str) -> Option<WorkflowDefinition> {
    match name {
        "fix" => Some(fix()),
        "iterate" => Some(iterate()),
        "deliberate" => Some(deliberate()),
        "doc-review" => Some(doc_review()),
        "test-audit" => Some(test_audit()),
        _ => None,
    }
}

fn definition(
    name: &str,
    description: &str,
    loops: &[(&str, u32)],
    spawn_budget: Option<u32>,
    steps: Vec<Step>,
) -> WorkflowDefinition {
    WorkflowDefinition {
        name: name.to_string(),
        description: description.to_string(),
        loops: loops.iter().map(|(t, c)| (t.to_string(), *c)).collect(),
        spawn_budget,
        steps,
    }
}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

fn fix() -> WorkflowDefinition {
    definition(
        "fix",
        "Reproduce a bug with a failing test, then fix it until the test passes",
        &[
            ("investigation", 2),
            ("reproduction", 2),
            ("diagnosis", 2),
            ("fix-verification", 3),
        ],
        None,
        vec![
            Step::new("investigate", "Locate the code paths involved in the reported bug", "investigator")
                .in_loop("investigation")
                .on_success("reproduce")
                .on_failure("investigate"),
            Step::new("reproduce", "Write a test that fails because of the bug", "reproducer")
                .in_loop("reproduction")
                .on_success("diagnose")
                .on_failure("reproduce"),
            Step::new("diagnose", "Explain the root cause of the failing test", "investigator")
                .needs(&["reproduce"])
                .in_loop("diagnosis")
                .on_success("implement-fix")
                .on_failure("diagnose"),
            Step::new("implement-fix", "Change the code so the reproduction passes", "implementer")
                .in_loop("fix-verification")
                .on_success("verify-fix")
                .on_failure("implement-fix"),
            Step::new("verify-fix", "Run the reproduction and the surrounding suite", "test-runner")
                .on_success("commit")
                .on_failure("implement-fix"),
            Step::new("commit", "Commit the fix with its regression test", "committer")
                .on_success("done")
                .on_failure("implement-fix"),
        ],
    )
}

fn iterate() -> WorkflowDefinition {
    definition(
        "iterate",
        "Clarify, plan and implement a change, then review it",
        &[("planning", 2), ("implementation", 3)],
        None,
        vec![
            Step::new("clarify", "Clarify the requested change and judge its size", "planner")
                .on("simple", "implement")
                .otherwise("plan"),
            Step::new("plan", "Break the change into an implementation plan", "planner")
                .in_loop("planning")
                .on_success("implement")
                .on_failure("plan"),
            Step::new("implement", "Implement the change", "implementer")
                .in_loop("implementation")
                .on_success("acceptance-check")
                .on_failure("implement"),
            Step::new("acceptance-check", "Check the change against its acceptance criteria", "reviewer")
                .on_success("security-review")
                .on_failure("implement"),
            Step::new("security-review", "Review the change for security issues", "security-reviewer")
                .on_success("code-review")
                .on_failure("implement"),
            Step::new("code-review", "Review the change for quality", "reviewer")
                .on_success("done")
                .on_failure("implement"),
        ],
    )
}

fn deliberate() -> WorkflowDefinition {
    definition(
        "deliberate",
        "Argue both sides of a decision and let a judge rule",
        &[("framing", 2), ("deliberation-round", 3)],
        Some(10),
        vec![
            Step::new("frame-question", "State the decision and the options under consideration", "moderator")
                .in_loop("framing")
                .on_success("arguments")
                .on_failure("frame-question"),
            Step::fan_out(
                "arguments",
                "Make the strongest case for the assigned side",
                vec![
                    Branch::new("advocate-for", "advocate"),
                    Branch::new("advocate-against", "advocate"),
                ],
            )
            .in_loop("deliberation-round")
            .on_success("judge")
            .on_failure("arguments"),
            Step::new("judge", "Weigh both cases and rule, or ask for another round", "judge")
                .needs(&["arguments"])
                .on_success("done")
                .otherwise("arguments"),
        ],
    )
}

fn doc_review() -> WorkflowDefinition {
    definition(
        "doc-review",
        "Review documentation for accuracy and style, then apply the edits",
        &[("inventory", 2), ("review-round", 2), ("doc-revision", 2)],
        None,
        vec![
            Step::new("inventory", "List the documents in scope and what they claim", "investigator")
                .in_loop("inventory")
                .on_success("review")
                .on_failure("inventory"),
            Step::fan_out(
                "review",
                "Review the documents from the assigned angle",
                vec![
                    Branch::new("accuracy", "reviewer"),
                    Branch::new("style", "reviewer"),
                ],
            )
            .in_loop("review-round")
            .on_success("consolidate")
            .on_failure("review"),
            Step::new("consolidate", "Merge review findings into one edit list", "editor")
                .needs(&["review"])
                .on_success("apply-edits")
                .on_failure("review"),
            Step::new("apply-edits", "Apply the consolidated edits", "editor")
                .in_loop("doc-revision")
                .on_success("verify-docs")
                .on_failure("apply-edits"),
            Step::new("verify-docs", "Check the edited documents against the code", "reviewer")
                .on_success("done")
                .on_failure("apply-edits"),
        ],
    )
}

fn test_audit() -> WorkflowDefinition {
    definition(
        "test-audit",
        "Audit the test suite and repair weak or broken tests",
        &[("discovery", 2), ("auditing", 2), ("fix-verification", 3)],
        None,
        vec![
            Step::new("discover-tests", "Inventory the test suites and how to run them", "investigator")
                .in_loop("discovery")
                .on_success("audit")
                .on_failure("discover-tests"),
            Step::new("audit", "Find weak, redundant or broken tests", "reviewer")
                .in_loop("auditing")
                .on_success("fix-tests")
                .on_failure("audit"),
            Step::fan_out(
                "fix-tests",
                "Repair the audited tests in the assigned area",
                vec![
                    Branch::new("unit", "implementer").writes(&["tests/unit"]),
                    Branch::new("integration", "implementer").writes(&["tests/integration"]),
                ],
            )
            .in_loop("fix-verification")
            .needs(&["audit"])
            .on_success("run-suite")
            .on_failure("fix-tests"),
            Step::new("run-suite", "Run the full suite", "test-runner")
                .on_success("done")
                .on_failure("fix-tests"),
        ],
    )
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Where a catalog entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Builtin,
    Project,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Builtin => f.write_str("builtin"),
            Source::Project => f.write_str("project"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    workflows: BTreeMap<String, (WorkflowDefinition, Source)>,
}

impl Catalog {
    pub fn builtins() -> Self {
        let workflows = BUILTIN_NAMES
            .iter()
            .filter_map(|n| builtin(n))
            .map(|d| (d.name.clone(), (d, Source::Builtin)))
            .collect();
        Self { workflows }
    }

    /// Built-ins plus every `*.yaml` file in the project's workflows dir.
    /// A file whose `name` does not match its file stem is rejected.
    pub fn load(root: &Path) -> Result<Self> {
        let mut catalog = Self::builtins();
        let dir = paths::workflows_dir(root);
        if !dir.exists() {
            return Ok(catalog);
        }
        let mut files: Vec<_> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "yaml"))
            .collect();
        files.sort();
        for path in files {
            let definition = WorkflowDefinition::load(&path)?;
            if path != paths::workflow_path(root, &definition.name) {
                return Err(ConductorError::InvalidWorkflow {
                    workflow: definition.name,
                    reason: format!("defined in '{}' but named differently", path.display()),
                });
            }
            tracing::debug!(workflow = %definition.name, path = %path.display(), "loaded project workflow");
            catalog
                .workflows
                .insert(definition.name.clone(), (definition, Source::Project));
        }
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Result<&WorkflowDefinition> {
        self.workflows
            .get(name)
            .map(|(d, _)| d)
            .ok_or_else(|| ConductorError::UnknownWorkflow(name.to_string()))
    }

    pub fn source(&self, name: &str) -> Option<Source> {
        self.workflows.get(name).map(|(_, s)| *s)
    }

    pub fn names(&self) -> Vec<String> {
        self.workflows.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&WorkflowDefinition, Source)> {
        self.workflows.values().map(|(d, s)| (d, *s))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Target, ON_FAILURE, ON_SUCCESS};

    #[test]
    fn builtins_are_valid() {
        for name in BUILTIN_NAMES {
            let wf = builtin(name).unwrap();
            assert_eq!(wf.name, *name);
            wf.validate().unwrap_or_else(|e| panic!("{name}: {e}"));
        }
    }

    #[test]
    fn every_builtin_step_routes_success_and_failure() {
        for name in BUILTIN_NAMES {
            let wf = builtin(name).unwrap();
            for step in &wf.steps {
                for outcome in [ON_SUCCESS, ON_FAILURE] {
                    wf.successor(&step.id, outcome)
                        .unwrap_or_else(|e| panic!("{name}/{}: {e}", step.id));
                }
            }
        }
    }

    #[test]
    fn iterate_acceptance_check_leads_to_security_review() {
        let wf = builtin("iterate").unwrap();
        assert_eq!(
            wf.successor("acceptance-check", ON_SUCCESS).unwrap(),
            Target::Step("security-review".into())
        );
    }

    #[test]
    fn iterate_clarify_branches_on_label() {
        let wf = builtin("iterate").unwrap();
        assert_eq!(
            wf.successor("clarify", "simple").unwrap(),
            Target::Step("implement".into())
        );
        assert_eq!(
            wf.successor("clarify", ON_SUCCESS).unwrap(),
            Target::Step("plan".into())
        );
    }

    #[test]
    fn deliberate_has_smaller_budget() {
        assert_eq!(builtin("deliberate").unwrap().spawn_budget, Some(10));
        assert_eq!(builtin("fix").unwrap().spawn_budget, None);
    }

    #[test]
    fn unknown_builtin() {
        assert!(builtin("deploy").is_none());
        let err = Catalog::builtins().get("deploy").unwrap_err();
        assert!(matches!(err, ConductorError::UnknownWorkflow(_)));
    }

    #[test]
    fn project_workflows_extend_and_override() {
        let dir = tempfile::TempDir::new().unwrap();
        let wf_dir = paths::workflows_dir(dir.path());
        std::fs::create_dir_all(&wf_dir).unwrap();
        std::fs::write(
            wf_dir.join("hotfix.yaml"),
            "name: hotfix\nsteps:\n  - id: patch\n    intent: Patch\n    delegate: implementer\n    branches:\n      on_success: done\n",
        )
        .unwrap();
        std::fs::write(
            wf_dir.join("fix.yaml"),
            "name: fix\ndescription: local fix\nsteps:\n  - id: only\n    intent: Fix\n    delegate: implementer\n    branches:\n      on_success: done\n",
        )
        .unwrap();

        let catalog = Catalog::load(dir.path()).unwrap();
        assert_eq!(catalog.source("hotfix"), Some(Source::Project));
        assert_eq!(catalog.source("fix"), Some(Source::Project));
        assert_eq!(catalog.get("fix").unwrap().description, "local fix");
        assert_eq!(catalog.source("iterate"), Some(Source::Builtin));
        assert_eq!(catalog.names().len(), 6);
    }

    #[test]
    fn mismatched_file_name_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let wf_dir = paths::workflows_dir(dir.path());
        std::fs::create_dir_all(&wf_dir).unwrap();
        std::fs::write(
            wf_dir.join("other.yaml"),
            "name: hotfix\nsteps:\n  - id: patch\n    intent: Patch\n    delegate: implementer\n    branches:\n      on_success: done\n",
        )
        .unwrap();
        assert!(Catalog::load(dir.path()).is_err());
    }
}
