use crate::error::{ConductorError, Result};
use crate::paths;
use crate::workflow::WorkflowDefinition;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// LimitsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Delegate invocations allowed per run unless a workflow says otherwise.
    #[serde(default = "default_spawn_budget")]
    pub spawn_budget: u32,
    /// Loop tag → ceiling, applied to every workflow that uses the tag.
    #[serde(default = "default_loop_ceilings")]
    pub loops: BTreeMap<String, u32>,
}

fn default_spawn_budget() -> u32 {
    12
}

fn default_loop_ceilings() -> BTreeMap<String, u32> {
    BTreeMap::from([
        ("reproduction".to_string(), 2),
        ("fix-verification".to_string(), 3),
    ])
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            spawn_budget: default_spawn_budget(),
            loops: default_loop_ceilings(),
        }
    }
}

/// Per-workflow limit overrides, keyed by workflow name in `Config::workflows`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_budget: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub loops: BTreeMap<String, u32>,
}

// ---------------------------------------------------------------------------
// DelegateBackend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DelegateBackend {
    /// A subprocess reading the request JSON on stdin and printing a
    /// `StepResult` JSON on stdout.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    /// Replays outcomes from a YAML script, relative to the project root.
    Script { path: String },
    /// Asks the operator through the awaiting-input boundary.
    Human,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegatesConfig {
    #[serde(default = "default_delegate_backend")]
    pub default: DelegateBackend,
    /// Delegate name → backend.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub named: BTreeMap<String, DelegateBackend>,
}

fn default_delegate_backend() -> DelegateBackend {
    DelegateBackend::Human
}

impl Default for DelegatesConfig {
    fn default() -> Self {
        Self {
            default: default_delegate_backend(),
            named: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    pub project: ProjectConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub workflows: BTreeMap<String, WorkflowLimits>,
    #[serde(default)]
    pub delegates: DelegatesConfig,
}

fn default_version() -> u32 {
    1
}

impl Config {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            version: 1,
            project: ProjectConfig {
                name: project_name.into(),
                description: None,
            },
            limits: LimitsConfig::default(),
            workflows: BTreeMap::new(),
            delegates: DelegatesConfig::default(),
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(ConductorError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Load the project config, or defaults named after the root directory
    /// when the project has not been initialized.
    pub fn load_or_default(root: &Path) -> Result<Self> {
        match Self::load(root) {
            Err(ConductorError::NotInitialized) => {
                let name = root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "project".to_string());
                Ok(Self::new(name))
            }
            other => other,
        }
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Limit resolution
    // -----------------------------------------------------------------------

    /// Ceilings for `definition`: the workflow's own defaults, overlaid by
    /// global `limits.loops` for tags it uses, overlaid by its override block.
    pub fn ceilings_for(&self, definition: &WorkflowDefinition) -> BTreeMap<String, u32> {
        let mut ceilings = definition.loops.clone();
        for (tag, ceiling) in ceilings.iter_mut() {
            if let Some(&global) = self.limits.loops.get(tag) {
                *ceiling = global;
            }
        }
        if let Some(over) = self.workflows.get(&definition.name) {
            for (tag, &ceiling) in &over.loops {
                ceilings.insert(tag.clone(), ceiling);
            }
        }
        ceilings
    }

    pub fn spawn_budget_for(&self, definition: &WorkflowDefinition) -> u32 {
        self.workflows
            .get(&definition.name)
            .and_then(|w| w.spawn_budget)
            .or(definition.spawn_budget)
            .unwrap_or(self.limits.spawn_budget)
    }

    pub fn guard_for(&self, definition: &WorkflowDefinition) -> crate::guard::IterationGuard {
        crate::guard::IterationGuard::new(
            self.ceilings_for(definition),
            self.spawn_budget_for(definition),
        )
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self, known_workflows: &[String]) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        // 1. Budgets and ceilings
        if self.limits.spawn_budget == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "limits.spawn_budget is 0: no workflow can invoke a delegate".into(),
            });
        }
        for (tag, &ceiling) in &self.limits.loops {
            warnings.extend(ceiling_warning(&format!("limits.loops.{tag}"), ceiling));
        }

        // 2. Overrides must name a known workflow
        for (name, over) in &self.workflows {
            if !known_workflows.iter().any(|w| w == name) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("unknown workflow '{name}' in workflows"),
                });
            }
            if over.spawn_budget == Some(0) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("workflows.{name}.spawn_budget is 0"),
                });
            }
            for (tag, &ceiling) in &over.loops {
                warnings.extend(ceiling_warning(
                    &format!("workflows.{name}.loops.{tag}"),
                    ceiling,
                ));
            }
        }

        // 3. Delegate backends
        let backends = std::iter::once(("default", &self.delegates.default)).chain(
            self.delegates
                .named
                .iter()
                .map(|(name, backend)| (name.as_str(), backend)),
        );
        for (name, backend) in backends {
            match backend {
                DelegateBackend::Command { program, .. } if program.trim().is_empty() => {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Error,
                        message: format!("delegate '{name}' has an empty command"),
                    });
                }
                DelegateBackend::Command { program, .. } => {
                    if which::which(program).is_err() {
                        warnings.push(ConfigWarning {
                            level: WarnLevel::Warning,
                            message: format!(
                                "delegate '{name}': program '{program}' not found on PATH"
                            ),
                        });
                    }
                }
                DelegateBackend::Script { path } if path.trim().is_empty() => {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Error,
                        message: format!("delegate '{name}' has an empty script path"),
                    });
                }
                _ => {}
            }
        }

        warnings
    }
}

fn ceiling_warning(key: &str, ceiling: u32) -> Option<ConfigWarning> {
    if ceiling == 0 {
        Some(ConfigWarning {
            level: WarnLevel::Error,
            message: format!("{key} is 0: the loop can never run"),
        })
    } else if ceiling > 12 {
        Some(ConfigWarning {
            level: WarnLevel::Warning,
            message: format!("{key} is {ceiling} (>12 is unusual)"),
        })
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Step;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "fix".into(),
            description: String::new(),
            loops: BTreeMap::from([
                ("reproduction".to_string(), 5),
                ("custom".to_string(), 4),
            ]),
            spawn_budget: Some(10),
            steps: vec![Step::new("a", "A", "worker").on_success("done")],
        }
    }

    #[test]
    fn default_config_roundtrip() {
        let cfg = Config::new("test-project");
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.project.name, "test-project");
        assert_eq!(parsed.limits.spawn_budget, 12);
        assert_eq!(parsed.limits.loops["reproduction"], 2);
        assert_eq!(parsed.limits.loops["fix-verification"], 3);
    }

    #[test]
    fn delegate_backend_yaml_tagged() {
        let backend = DelegateBackend::Command {
            program: "claude".into(),
            args: vec!["-p".into()],
            env: BTreeMap::new(),
            timeout_secs: Some(600),
        };
        let yaml = serde_yaml::to_string(&backend).unwrap();
        assert!(yaml.contains("type: command"));
        let parsed: DelegateBackend = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, backend);
    }

    #[test]
    fn minimal_yaml_gets_defaults() {
        let cfg: Config = serde_yaml::from_str("project:\n  name: demo\n").unwrap();
        assert_eq!(cfg.delegates.default, DelegateBackend::Human);
        assert_eq!(cfg.limits.spawn_budget, 12);
    }

    #[test]
    fn ceilings_layer_global_then_workflow() {
        let mut cfg = Config::new("p");
        cfg.workflows.insert(
            "fix".into(),
            WorkflowLimits {
                spawn_budget: None,
                loops: BTreeMap::from([("custom".to_string(), 1)]),
            },
        );
        let ceilings = cfg.ceilings_for(&definition());
        // global limits.loops beats the definition default
        assert_eq!(ceilings["reproduction"], 2);
        // workflow override beats both
        assert_eq!(ceilings["custom"], 1);
        // tags the workflow does not use are not pulled in
        assert!(!ceilings.contains_key("fix-verification"));
    }

    #[test]
    fn spawn_budget_precedence() {
        let mut cfg = Config::new("p");
        assert_eq!(cfg.spawn_budget_for(&definition()), 10);
        cfg.workflows.insert(
            "fix".into(),
            WorkflowLimits {
                spawn_budget: Some(3),
                loops: BTreeMap::new(),
            },
        );
        assert_eq!(cfg.spawn_budget_for(&definition()), 3);

        let mut no_budget = definition();
        no_budget.spawn_budget = None;
        no_budget.name = "other".into();
        assert_eq!(cfg.spawn_budget_for(&no_budget), 12);
    }

    #[test]
    fn validate_flags_zero_ceiling_and_unknown_workflow() {
        let mut cfg = Config::new("p");
        cfg.limits.loops.insert("reproduction".into(), 0);
        cfg.workflows.insert("nope".into(), WorkflowLimits::default());
        let warnings = cfg.validate(&["fix".to_string()]);
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("reproduction")));
        assert!(warnings.iter().any(|w| w.message.contains("unknown workflow 'nope'")));
    }

    #[test]
    fn validate_flags_empty_command() {
        let mut cfg = Config::new("p");
        cfg.delegates.named.insert(
            "implementer".into(),
            DelegateBackend::Command {
                program: " ".into(),
                args: vec![],
                env: BTreeMap::new(),
                timeout_secs: None,
            },
        );
        let warnings = cfg.validate(&[]);
        assert!(warnings
            .iter()
            .any(|w| w.message.contains("'implementer' has an empty command")));
    }

    #[test]
    fn load_without_init_is_not_initialized() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(ConductorError::NotInitialized)
        ));
        let cfg = Config::load_or_default(dir.path()).unwrap();
        assert_eq!(cfg.limits.spawn_budget, 12);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = Config::new("p");
        cfg.limits.spawn_budget = 7;
        cfg.save(dir.path()).unwrap();
        assert_eq!(Config::load(dir.path()).unwrap().limits.spawn_budget, 7);
    }
}
