//! The ordered catalog of pipeline stages.
//!
//! Dependency order is explicit: every [`Stage`] names its predecessor and
//! the registry orders stages so that a predecessor always comes first.
//! Registries are immutable once built.

mod builder;

pub use builder::{is_valid_stage_code, StageRegistryBuilder};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::{RecoveryError, Result};

/// Selector code that expands to every registered stage.
pub const ALL_STAGES: &str = "ALL";

/// Immutable definition of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    /// Unique stage code.
    pub code: String,
    /// Human readable name.
    pub name: String,
    /// Code of the stage that must succeed first.
    pub predecessor: Option<String>,
    /// Whether force mode may re-run this stage.
    pub supports_force: bool,
}

impl Stage {
    /// Creates a stage with no predecessor that supports force mode.
    #[must_use]
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            predecessor: None,
            supports_force: true,
        }
    }

    /// Sets the predecessor stage.
    #[must_use]
    pub fn after(mut self, predecessor: impl Into<String>) -> Self {
        self.predecessor = Some(predecessor.into());
        self
    }

    /// Sets whether force mode is allowed.
    #[must_use]
    pub fn with_force(mut self, supports_force: bool) -> Self {
        self.supports_force = supports_force;
        self
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code, self.name)
    }
}

/// Which stages a scan or run targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StageSelector {
    /// Every registered stage, in dependency order.
    All,
    /// A single stage by code.
    Single(String),
}

impl StageSelector {
    /// Creates a single-stage selector.
    #[must_use]
    pub fn single(code: impl Into<String>) -> Self {
        Self::Single(code.into())
    }
}

impl FromStr for StageSelector {
    type Err = RecoveryError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(RecoveryError::invalid_request("script must not be empty"));
        }
        if trimmed == ALL_STAGES {
            Ok(Self::All)
        } else {
            Ok(Self::Single(trimmed.to_string()))
        }
    }
}

impl fmt::Display for StageSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "{ALL_STAGES}"),
            Self::Single(code) => write!(f, "{code}"),
        }
    }
}

/// Ordered, validated catalog of stages.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    /// Stages in dependency order.
    stages: Vec<Stage>,
    /// Code to position in `stages`.
    index: HashMap<String, usize>,
}

impl StageRegistry {
    /// Creates a registry builder.
    #[must_use]
    pub fn builder() -> StageRegistryBuilder {
        StageRegistryBuilder::new()
    }

    /// Builds the persona generation pipeline.
    ///
    /// `supervision-setup` configures approval routing rather than
    /// generating content, so it cannot be forced.
    #[must_use]
    pub fn persona_pipeline() -> Self {
        let chain = [
            ("biography", "Biography"),
            ("attributions", "Attributions"),
            ("competencies", "Competencies"),
            ("avatar", "Avatar"),
            ("automation-analysis", "Automation analysis"),
            ("communications", "Communications"),
            ("workflows", "Workflows"),
            ("supervision-setup", "Supervision setup"),
            ("ml-models", "ML model recommendations"),
            ("audit", "Audit score"),
        ];

        let mut stages = Vec::with_capacity(chain.len());
        let mut previous: Option<&str> = None;
        for (code, name) in chain {
            let mut stage = Stage::new(code, name).with_force(code != "supervision-setup");
            stage.predecessor = previous.map(str::to_string);
            stages.push(stage);
            previous = Some(code);
        }

        Self::from_ordered(stages)
    }

    /// Wraps stages that are already validated and in dependency order.
    pub(crate) fn from_ordered(stages: Vec<Stage>) -> Self {
        let index = stages
            .iter()
            .enumerate()
            .map(|(i, stage)| (stage.code.clone(), i))
            .collect();
        Self { stages, index }
    }

    /// Resolves a stage code.
    pub fn resolve(&self, code: &str) -> Result<&Stage> {
        self.index
            .get(code)
            .map(|&i| &self.stages[i])
            .ok_or_else(|| RecoveryError::StageNotFound(code.to_string()))
    }

    /// Returns the predecessor chain of `code`, root first, the stage itself last.
    pub fn chain_up_to(&self, code: &str) -> Result<Vec<&Stage>> {
        let mut current = self.resolve(code)?;
        let mut chain = vec![current];
        while let Some(predecessor) = current.predecessor.as_deref() {
            current = self.resolve(predecessor)?;
            chain.push(current);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Returns every stage in dependency order.
    #[must_use]
    pub fn all(&self) -> &[Stage] {
        &self.stages
    }

    /// Expands a selector into stages, in dependency order.
    pub fn expand(&self, selector: &StageSelector) -> Result<Vec<&Stage>> {
        match selector {
            StageSelector::All => Ok(self.stages.iter().collect()),
            StageSelector::Single(code) => Ok(vec![self.resolve(code)?]),
        }
    }

    /// Returns the position of a stage in dependency order.
    #[must_use]
    pub fn position(&self, code: &str) -> Option<usize> {
        self.index.get(code).copied()
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the registry has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::persona_pipeline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn codes(stages: &[&Stage]) -> Vec<String> {
        stages.iter().map(|s| s.code.clone()).collect()
    }

    #[test]
    fn test_persona_pipeline_is_a_chain() {
        let registry = StageRegistry::persona_pipeline();
        assert_eq!(registry.len(), 10);

        let all = registry.all();
        assert!(all[0].predecessor.is_none());
        for pair in all.windows(2) {
            assert_eq!(pair[1].predecessor.as_deref(), Some(pair[0].code.as_str()));
        }
    }

    #[test]
    fn test_persona_pipeline_force_support() {
        let registry = StageRegistry::persona_pipeline();
        assert!(registry.resolve("avatar").unwrap().supports_force);
        assert!(!registry.resolve("supervision-setup").unwrap().supports_force);
    }

    #[test]
    fn test_resolve_unknown_stage() {
        let registry = StageRegistry::persona_pipeline();
        let err = registry.resolve("horoscope").unwrap_err();
        assert!(matches!(err, RecoveryError::StageNotFound(code) if code == "horoscope"));
    }

    #[test]
    fn test_chain_up_to() {
        let registry = StageRegistry::persona_pipeline();

        let chain = registry.chain_up_to("avatar").unwrap();
        assert_eq!(
            codes(&chain),
            vec!["biography", "attributions", "competencies", "avatar"]
        );

        let root = registry.chain_up_to("biography").unwrap();
        assert_eq!(codes(&root), vec!["biography"]);
    }

    #[test]
    fn test_expand_all_preserves_order() {
        let registry = StageRegistry::persona_pipeline();
        let expanded = registry.expand(&StageSelector::All).unwrap();
        let all: Vec<&Stage> = registry.all().iter().collect();
        assert_eq!(codes(&expanded), codes(&all));
    }

    #[test]
    fn test_expand_single() {
        let registry = StageRegistry::persona_pipeline();
        let expanded = registry.expand(&StageSelector::single("audit")).unwrap();
        assert_eq!(codes(&expanded), vec!["audit"]);

        assert!(registry.expand(&StageSelector::single("nope")).is_err());
    }

    #[test]
    fn test_selector_parse() {
        assert_eq!("ALL".parse::<StageSelector>().unwrap(), StageSelector::All);
        assert_eq!(
            " avatar ".parse::<StageSelector>().unwrap(),
            StageSelector::single("avatar")
        );
        assert!("".parse::<StageSelector>().is_err());
        // Only the exact uppercase literal selects everything.
        assert_eq!(
            "all".parse::<StageSelector>().unwrap(),
            StageSelector::single("all")
        );
    }

    #[test]
    fn test_position() {
        let registry = StageRegistry::persona_pipeline();
        assert_eq!(registry.position("biography"), Some(0));
        assert_eq!(registry.position("audit"), Some(9));
        assert_eq!(registry.position("ALL"), None);
    }
}
