//! Bounded retries per loop tag plus a run-wide spawn budget.
//!
//! Attempts are charged immediately before each invocation of a step that
//! carries a loop tag, so the first pass through a loop is attempt 1 and a
//! ceiling of N permits N invocations. The guard never recovers from its own
//! refusals; the coordinator turns `LimitExceeded` into an escalation.

use crate::error::{ConductorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag reported in `LimitExceeded` when the spawn budget runs out.
pub const SPAWN_BUDGET_TAG: &str = "spawn-budget";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationGuard {
    ceilings: BTreeMap<String, u32>,
    #[serde(default)]
    attempts: BTreeMap<String, u32>,
    spawn_budget: u32,
    #[serde(default)]
    spawns: u32,
}

impl IterationGuard {
    pub fn new(ceilings: BTreeMap<String, u32>, spawn_budget: u32) -> Self {
        Self {
            ceilings,
            attempts: BTreeMap::new(),
            spawn_budget,
            spawns: 0,
        }
    }

    /// Charge one attempt against `tag`, returning the attempt number.
    ///
    /// A tag with no configured ceiling is refused outright.
    pub fn record_attempt(&mut self, tag: &str) -> Result<u32> {
        let ceiling = self.ceiling(tag).unwrap_or(0);
        let used = self.attempts(tag);
        if used >= ceiling {
            return Err(ConductorError::LimitExceeded {
                tag: tag.to_string(),
                ceiling,
            });
        }
        let n = used + 1;
        self.attempts.insert(tag.to_string(), n);
        Ok(n)
    }

    pub fn remaining(&self, tag: &str) -> u32 {
        self.ceiling(tag)
            .unwrap_or(0)
            .saturating_sub(self.attempts(tag))
    }

    pub fn attempts(&self, tag: &str) -> u32 {
        self.attempts.get(tag).copied().unwrap_or(0)
    }

    pub fn ceiling(&self, tag: &str) -> Option<u32> {
        self.ceilings.get(tag).copied()
    }

    /// Charge `n` delegate invocations against the spawn budget.
    ///
    /// All-or-nothing: a fan-out that does not fit is refused as a whole.
    pub fn record_spawns(&mut self, n: u32) -> Result<u32> {
        if self.spawns + n > self.spawn_budget {
            return Err(ConductorError::LimitExceeded {
                tag: SPAWN_BUDGET_TAG.to_string(),
                ceiling: self.spawn_budget,
            });
        }
        self.spawns += n;
        Ok(self.spawns)
    }

    pub fn spawns(&self) -> u32 {
        self.spawns
    }

    pub fn spawns_remaining(&self) -> u32 {
        self.spawn_budget.saturating_sub(self.spawns)
    }

    pub fn spawn_budget(&self) -> u32 {
        self.spawn_budget
    }

    /// Loop tags with their `(attempts, ceiling)`, for reports.
    pub fn usage(&self) -> Vec<(&str, u32, u32)> {
        self.ceilings
            .iter()
            .map(|(tag, &ceiling)| (tag.as_str(), self.attempts(tag), ceiling))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> IterationGuard {
        IterationGuard::new(
            BTreeMap::from([
                ("reproduction".to_string(), 2),
                ("fix-verification".to_string(), 3),
            ]),
            4,
        )
    }

    #[test]
    fn ceiling_two_refuses_third_attempt() {
        let mut g = guard();
        assert_eq!(g.record_attempt("reproduction").unwrap(), 1);
        assert_eq!(g.record_attempt("reproduction").unwrap(), 2);
        let err = g.record_attempt("reproduction").unwrap_err();
        assert!(matches!(
            err,
            ConductorError::LimitExceeded { ref tag, ceiling: 2 } if tag == "reproduction"
        ));
        assert_eq!(g.attempts("reproduction"), 2);
    }

    #[test]
    fn remaining_counts_down_per_tag() {
        let mut g = guard();
        assert_eq!(g.remaining("fix-verification"), 3);
        g.record_attempt("fix-verification").unwrap();
        assert_eq!(g.remaining("fix-verification"), 2);
        assert_eq!(g.remaining("reproduction"), 2);
    }

    #[test]
    fn unknown_tag_is_refused() {
        let mut g = guard();
        assert!(g.record_attempt("mystery").is_err());
        assert_eq!(g.remaining("mystery"), 0);
    }

    #[test]
    fn spawn_budget_is_all_or_nothing() {
        let mut g = guard();
        g.record_spawns(3).unwrap();
        let err = g.record_spawns(2).unwrap_err();
        assert!(matches!(err, ConductorError::LimitExceeded { ref tag, ceiling: 4 } if tag == SPAWN_BUDGET_TAG));
        assert_eq!(g.spawns(), 3);
        assert_eq!(g.record_spawns(1).unwrap(), 4);
        assert_eq!(g.spawns_remaining(), 0);
    }

    #[test]
    fn guard_survives_yaml_roundtrip_with_counts() {
        let mut g = guard();
        g.record_attempt("reproduction").unwrap();
        g.record_spawns(1).unwrap();
        let yaml = serde_yaml::to_string(&g).unwrap();
        let back: IterationGuard = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, g);
    }
}
