use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

/// Free-form per-step options handed to strategies. Sorted so cache keys are stable.
pub type Options = BTreeMap<String, String>;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("valid name pattern"));

/// Step and strategy names double as cache key segments, so they are restricted
/// to a path-safe alphabet.
pub fn validate_name(kind: &'static str, value: &str) -> Result<(), KiraError> {
    if NAME_RE.is_match(value) && !value.contains("..") {
        Ok(())
    } else {
        Err(KiraError::InvalidName {
            kind,
            value: value.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Run every eligible strategy and deduplicate the combined rows.
    Merge,
    /// Run strategies in preference order until one succeeds.
    Fallback,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Merge => write!(f, "merge"),
            ExecutionMode::Fallback => write!(f, "fallback"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "merge" => Ok(ExecutionMode::Merge),
            "fallback" => Ok(ExecutionMode::Fallback),
            _ => Err(KiraError::InvalidConfig(format!(
                "unknown mode `{value}` (expected merge|fallback)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// A failed step aborts the rest of the run.
    Fatal,
    /// A failed step is recorded and downstream steps see no rows from it.
    Soft,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Fatal => write!(f, "fatal"),
            FailurePolicy::Soft => write!(f, "soft"),
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fatal" => Ok(FailurePolicy::Fatal),
            "soft" => Ok(FailurePolicy::Soft),
            _ => Err(KiraError::InvalidConfig(format!(
                "unknown failure policy `{value}` (expected fatal|soft)"
            ))),
        }
    }
}

/// Where a step takes its identifiers from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepInput {
    /// A named global input of the analysis request.
    Input(String),
    /// The unique entities of an earlier step's result table.
    Step(String),
}

impl fmt::Display for StepInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepInput::Input(name) => write!(f, "input:{name}"),
            StepInput::Step(name) => write!(f, "step:{name}"),
        }
    }
}

impl FromStr for StepInput {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        match trimmed.split_once(':') {
            Some(("step", rest)) => Ok(StepInput::Step(rest.trim().to_string())),
            Some(("input", rest)) => Ok(StepInput::Input(rest.trim().to_string())),
            Some(_) => Err(KiraError::InvalidConfig(format!(
                "invalid step input `{value}` (expected input:NAME or step:NAME)"
            ))),
            None if trimmed.is_empty() => Err(KiraError::InvalidConfig(
                "step input must not be empty".to_string(),
            )),
            None => Ok(StepInput::Input(trimmed.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepSpec {
    pub name: String,
    /// Eligible strategies in preference order. Empty means every strategy
    /// registered for the step, in registration order.
    pub strategies: Vec<String>,
    pub mode: ExecutionMode,
    pub on_fail: FailurePolicy,
    pub input: StepInput,
    /// `None` keeps cache entries until they are invalidated explicitly.
    pub ttl: Option<Duration>,
    pub timeout: Duration,
    pub retries: u32,
    pub case_sensitive: bool,
    pub options: Options,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, input: StepInput) -> Self {
        Self {
            name: name.into(),
            strategies: Vec::new(),
            mode: ExecutionMode::Fallback,
            on_fail: FailurePolicy::Fatal,
            input,
            ttl: None,
            timeout: Duration::from_secs(120),
            retries: 0,
            case_sensitive: false,
            options: Options::new(),
        }
    }

    pub fn upstream(&self) -> Option<&str> {
        match &self.input {
            StepInput::Step(name) => Some(name.as_str()),
            StepInput::Input(_) => None,
        }
    }
}

/// Immutable input of one run: global identifiers, the ordered steps to run and
/// per-step option overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnalysisRequest {
    pub inputs: BTreeMap<String, Vec<String>>,
    pub steps: Vec<String>,
    pub overrides: BTreeMap<String, Options>,
}

impl AnalysisRequest {
    pub fn new(steps: Vec<String>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, values: Vec<String>) -> Self {
        self.inputs.insert(name.into(), values);
        self
    }

    pub fn with_override(
        mut self,
        step: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.overrides
            .entry(step.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    /// Step options with request overrides layered on top.
    pub fn options_for(&self, spec: &StepSpec) -> Options {
        let mut options = spec.options.clone();
        if let Some(overrides) = self.overrides.get(&spec.name) {
            options.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_step_input() {
        let input: StepInput = "step:components".parse().unwrap();
        assert_eq!(input, StepInput::Step("components".to_string()));
        let input: StepInput = "herbs".parse().unwrap();
        assert_eq!(input, StepInput::Input("herbs".to_string()));
        let err = "table:x".parse::<StepInput>().unwrap_err();
        assert_matches!(err, KiraError::InvalidConfig(_));
    }

    #[test]
    fn names_are_path_safe() {
        assert!(validate_name("step", "disease_targets").is_ok());
        assert!(validate_name("strategy", "chembl-v33").is_ok());
        assert_matches!(
            validate_name("step", "../etc"),
            Err(KiraError::InvalidName { .. })
        );
        assert_matches!(
            validate_name("step", "a/b"),
            Err(KiraError::InvalidName { .. })
        );
    }

    #[test]
    fn overrides_layer_on_step_options() {
        let mut spec = StepSpec::new("targets", StepInput::Input("smiles".to_string()));
        spec.options.insert("organism".to_string(), "mouse".to_string());
        spec.options.insert("limit".to_string(), "10".to_string());
        let request = AnalysisRequest::new(vec!["targets".to_string()]).with_override(
            "targets",
            "organism",
            "human",
        );
        let options = request.options_for(&spec);
        assert_eq!(options.get("organism").map(String::as_str), Some("human"));
        assert_eq!(options.get("limit").map(String::as_str), Some("10"));
    }
}
