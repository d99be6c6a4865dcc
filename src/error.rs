use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::pipeline::RunReport;
use crate::strategy::StrategyError;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("missing config file kira-np.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid {kind} name: {value}")]
    InvalidName { kind: &'static str, value: String },

    #[error("no strategies registered for step: {0}")]
    #[diagnostic(help("declare a source for this step in the `sources` section"))]
    UnknownStep(String),

    #[error("step is not declared in configuration: {0}")]
    UndefinedStep(String),

    #[error("strategy {strategy} is not registered for step {step}")]
    UnknownStrategy { step: String, strategy: String },

    #[error("duplicate step name: {0}")]
    DuplicateStep(String),

    #[error("step {step} depends on {upstream}, which does not run before it")]
    InvalidDependency { step: String, upstream: String },

    #[error("step {step} reads missing input: {input}")]
    MissingInput { step: String, input: String },

    #[error("every strategy failed for step {step} on {identifier}: {}", join_failures(.failures))]
    AllStrategiesFailed {
        step: String,
        identifier: String,
        failures: Vec<StrategyError>,
    },

    #[error("step {step} failed for every input: {}", .failures.join("; "))]
    StepFailed { step: String, failures: Vec<String> },

    #[error("pipeline aborted at fatal step {step}")]
    PipelineAborted { step: String, report: Box<RunReport> },

    #[error("cache backend unavailable: {0}")]
    CacheUnavailable(String),

    #[error("source {source_name} is misconfigured: {message}")]
    SourceConfig { source_name: String, message: String },

    #[error("HTTP client setup failed: {0}")]
    HttpClient(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

fn join_failures(failures: &[StrategyError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
