use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::domain::{Options, validate_name};
use crate::error::KiraError;
use crate::table::ResultTable;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrategyFailure {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Http(String),

    #[error("returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("panicked while executing")]
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{strategy} {cause}")]
pub struct StrategyError {
    pub strategy: String,
    pub cause: StrategyFailure,
}

impl StrategyError {
    pub fn new(strategy: impl Into<String>, cause: StrategyFailure) -> Self {
        Self {
            strategy: strategy.into(),
            cause,
        }
    }
}

/// One concrete way of satisfying an analysis step.
///
/// An empty table is a valid answer. Any retrieval or parsing problem is a
/// `StrategyError`; callers never look at the concrete type.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, identifier: &str, options: &Options) -> Result<ResultTable, StrategyError>;
}

/// Step name → strategies in registration (= preference) order.
#[derive(Default, Clone)]
pub struct StrategyRegistry {
    steps: BTreeMap<String, Vec<Arc<dyn Strategy>>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering a second strategy with the same name for a step replaces the
    /// first one in place, keeping its position.
    pub fn register(
        &mut self,
        step: &str,
        strategy: Arc<dyn Strategy>,
    ) -> Result<(), KiraError> {
        validate_name("step", step)?;
        validate_name("strategy", strategy.name())?;
        let entries = self.steps.entry(step.to_string()).or_default();
        match entries
            .iter()
            .position(|existing| existing.name() == strategy.name())
        {
            Some(index) => entries[index] = strategy,
            None => entries.push(strategy),
        }
        Ok(())
    }

    pub fn resolve(&self, step: &str) -> Result<Vec<Arc<dyn Strategy>>, KiraError> {
        match self.steps.get(step) {
            Some(entries) if !entries.is_empty() => Ok(entries.clone()),
            _ => Err(KiraError::UnknownStep(step.to_string())),
        }
    }

    /// Resolve a step's eligible strategies in the order the step lists them.
    /// An empty `names` selects everything registered for the step.
    pub fn resolve_named(
        &self,
        step: &str,
        names: &[String],
    ) -> Result<Vec<Arc<dyn Strategy>>, KiraError> {
        let registered = self.resolve(step)?;
        if names.is_empty() {
            return Ok(registered);
        }
        names
            .iter()
            .map(|name| {
                registered
                    .iter()
                    .find(|strategy| strategy.name() == name)
                    .cloned()
                    .ok_or_else(|| KiraError::UnknownStrategy {
                        step: step.to_string(),
                        strategy: name.clone(),
                    })
            })
            .collect()
    }

    pub fn steps(&self) -> impl Iterator<Item = (&str, Vec<&str>)> {
        self.steps.iter().map(|(step, entries)| {
            (
                step.as_str(),
                entries.iter().map(|strategy| strategy.name()).collect(),
            )
        })
    }
}
