use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::analyzer::Analyzer;
use crate::cache::normalize;
use crate::domain::{Options, StepSpec};
use crate::error::KiraError;
use crate::table::ResultTable;

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub table: ResultTable,
    pub warnings: Vec<String>,
    pub cache_hits: usize,
    pub identifiers: usize,
    pub attempts: u32,
}

#[derive(Debug)]
pub enum CommandState {
    Pending,
    Running,
    Succeeded(StepOutput),
    Failed(KiraError),
}

impl CommandState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandState::Succeeded(_) | CommandState::Failed(_))
    }
}

/// One step bound to its identifiers and options, ready to run exactly once.
pub struct Command {
    spec: StepSpec,
    identifiers: Vec<String>,
    options: Options,
    analyzer: Analyzer,
    state: CommandState,
    attempts: u32,
}

impl Command {
    /// Identifiers are trimmed and deduplicated under the step's cache-key
    /// normalization, keeping the first-seen spelling.
    pub fn new(
        spec: StepSpec,
        identifiers: Vec<String>,
        options: Options,
        analyzer: Analyzer,
    ) -> Self {
        let mut seen = BTreeSet::new();
        let identifiers = identifiers
            .into_iter()
            .map(|value| value.trim().to_string())
            .filter(|value| {
                !value.is_empty() && seen.insert(normalize(value, spec.case_sensitive))
            })
            .collect();
        Self {
            spec,
            identifiers,
            options,
            analyzer,
            state: CommandState::Pending,
            attempts: 0,
        }
    }

    pub fn step(&self) -> &str {
        &self.spec.name
    }

    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    pub fn state(&self) -> &CommandState {
        &self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Run the step if it is still pending. Calling this again after a
    /// terminal state returns the captured outcome without doing any work.
    pub fn execute(&mut self) -> &CommandState {
        if !matches!(self.state, CommandState::Pending) {
            return &self.state;
        }
        self.state = CommandState::Running;
        info!(
            step = %self.spec.name,
            mode = %self.spec.mode,
            identifiers = self.identifiers.len(),
            "step started"
        );

        let max_attempts = self.spec.retries.saturating_add(1);
        let mut attempt = 1;
        let outcome = loop {
            self.attempts = attempt;
            match self.attempt_once() {
                Ok(output) => break Ok(output),
                Err(err) if attempt < max_attempts => {
                    warn!(step = %self.spec.name, attempt, error = %err, "step failed; retrying");
                    attempt += 1;
                }
                Err(err) => break Err(err),
            }
        };

        self.state = match outcome {
            Ok(mut output) => {
                output.attempts = self.attempts;
                info!(step = %self.spec.name, rows = output.table.len(), "step succeeded");
                CommandState::Succeeded(output)
            }
            Err(err) => {
                warn!(step = %self.spec.name, error = %err, "step failed");
                CommandState::Failed(err)
            }
        };
        &self.state
    }

    /// Consume the command, running it first if it is still pending.
    pub fn into_outcome(mut self) -> Result<StepOutput, KiraError> {
        self.execute();
        match self.state {
            CommandState::Succeeded(output) => Ok(output),
            CommandState::Failed(err) => Err(err),
            CommandState::Pending | CommandState::Running => Err(KiraError::StepFailed {
                step: self.spec.name,
                failures: vec!["step did not reach a terminal state".to_string()],
            }),
        }
    }

    fn attempt_once(&self) -> Result<StepOutput, KiraError> {
        let mut table = ResultTable::new();
        let mut warnings = Vec::new();
        let mut errors = Vec::new();
        let mut cache_hits = 0;

        for identifier in &self.identifiers {
            match self.analyzer.run(&self.spec, identifier, &self.options) {
                Ok(outcome) => {
                    cache_hits += outcome.cache_hits;
                    warnings.extend(
                        outcome
                            .failures
                            .iter()
                            .map(|failure| format!("{identifier}: {failure}")),
                    );
                    table.extend(outcome.table);
                }
                Err(err) => errors.push(err),
            }
        }

        if !errors.is_empty() && errors.len() == self.identifiers.len() {
            if errors.len() == 1 {
                return Err(errors.remove(0));
            }
            return Err(KiraError::StepFailed {
                step: self.spec.name.clone(),
                failures: errors.iter().map(ToString::to_string).collect(),
            });
        }
        warnings.extend(errors.iter().map(ToString::to_string));

        Ok(StepOutput {
            table,
            warnings,
            cache_hits,
            identifiers: self.identifiers.len(),
            attempts: 0,
        })
    }
}
