//! Registry builder with validation.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use super::{Stage, StageRegistry, ALL_STAGES};
use crate::errors::RegistryError;

fn stage_code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z][a-z0-9]*(-[a-z0-9]+)*$").unwrap_or_else(|e| {
            unreachable!("stage code pattern is a valid regex: {e}")
        })
    })
}

/// Returns true if `code` is a well-formed stage code.
#[must_use]
pub fn is_valid_stage_code(code: &str) -> bool {
    stage_code_pattern().is_match(code)
}

/// Builder for creating validated stage registries.
#[derive(Debug, Clone, Default)]
pub struct StageRegistryBuilder {
    /// Declared stages, in insertion order.
    stages: Vec<Stage>,
}

impl StageRegistryBuilder {
    /// Creates a new registry builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a root stage.
    #[must_use]
    pub fn stage(mut self, code: impl Into<String>, name: impl Into<String>) -> Self {
        self.stages.push(Stage::new(code, name));
        self
    }

    /// Sets the predecessor of the most recently added stage.
    #[must_use]
    pub fn after(mut self, predecessor: impl Into<String>) -> Self {
        if let Some(last) = self.stages.last_mut() {
            last.predecessor = Some(predecessor.into());
        }
        self
    }

    /// Sets force support on the most recently added stage.
    #[must_use]
    pub fn force(mut self, supports_force: bool) -> Self {
        if let Some(last) = self.stages.last_mut() {
            last.supports_force = supports_force;
        }
        self
    }

    /// Adds a fully specified stage.
    #[must_use]
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Validates the declared stages and orders them by dependency.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty registry, duplicate or malformed codes,
    /// the reserved `ALL` code, unknown predecessors, or cycles.
    pub fn build(self) -> Result<StageRegistry, RegistryError> {
        if self.stages.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut by_code: HashMap<&str, &Stage> = HashMap::new();
        for stage in &self.stages {
            if stage.code == ALL_STAGES {
                return Err(RegistryError::ReservedCode(stage.code.clone()));
            }
            if !is_valid_stage_code(&stage.code) {
                return Err(RegistryError::InvalidCode(stage.code.clone()));
            }
            if by_code.insert(stage.code.as_str(), stage).is_some() {
                return Err(RegistryError::DuplicateStage(stage.code.clone()));
            }
        }

        for stage in &self.stages {
            if let Some(ref predecessor) = stage.predecessor {
                if !by_code.contains_key(predecessor.as_str()) {
                    return Err(RegistryError::UnknownPredecessor {
                        stage: stage.code.clone(),
                        predecessor: predecessor.clone(),
                    });
                }
            }
        }

        let order = dependency_order(&self.stages, &by_code)?;
        let ordered = order
            .into_iter()
            .filter_map(|code| by_code.get(code).map(|s| (*s).clone()))
            .collect();

        Ok(StageRegistry::from_ordered(ordered))
    }
}

/// Orders stages so every predecessor precedes its dependents, keeping
/// declaration order otherwise.
fn dependency_order<'a>(
    stages: &'a [Stage],
    by_code: &HashMap<&'a str, &'a Stage>,
) -> Result<Vec<&'a str>, RegistryError> {
    let mut placed: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(stages.len());

    for stage in stages {
        if placed.contains(stage.code.as_str()) {
            continue;
        }

        // Walk up until a placed stage or a root, watching for repeats.
        let mut pending: Vec<&str> = Vec::new();
        let mut current = Some(stage.code.as_str());
        while let Some(code) = current {
            if placed.contains(code) {
                break;
            }
            if let Some(pos) = pending.iter().position(|c| *c == code) {
                let mut path: Vec<String> = pending[pos..].iter().map(|c| (*c).to_string()).collect();
                path.push(code.to_string());
                return Err(RegistryError::Cycle { path });
            }
            pending.push(code);
            current = by_code.get(code).copied().and_then(|s| s.predecessor.as_deref());
        }

        for code in pending.into_iter().rev() {
            placed.insert(code);
            order.push(code);
        }
    }

    Ok(order)
}
