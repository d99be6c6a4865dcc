use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::analyzer::Analyzer;
use crate::app::{ProgressEvent, ProgressSink};
use crate::command::Command;
use crate::domain::{AnalysisRequest, FailurePolicy, StepInput, StepSpec, validate_name};
use crate::error::KiraError;
use crate::table::ResultTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    SucceededWithWarnings,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub step: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub rows: usize,
    pub identifiers: usize,
    pub cache_hits: usize,
    pub attempts: u32,
}

impl StepReport {
    fn skipped(step: &str) -> Self {
        Self {
            step: step.to_string(),
            status: StepStatus::Skipped,
            error: None,
            warnings: Vec::new(),
            rows: 0,
            identifiers: 0,
            cache_hits: 0,
            attempts: 0,
        }
    }
}

/// Outcome of one pipeline run. `manifest` lists every requested step in
/// order; `results` holds the tables of the steps that succeeded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub manifest: Vec<StepReport>,
    #[serde(skip)]
    pub results: BTreeMap<String, ResultTable>,
}

impl RunReport {
    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.manifest.iter().find(|report| report.step == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    NotStarted,
    Executing { step: String },
    StepCompleted { step: String },
    Completed,
    Failed { step: String },
}

/// Runs the requested steps strictly in order, one Command per step.
pub struct Pipeline {
    steps: Vec<StepSpec>,
    analyzer: Analyzer,
    state: PipelineState,
}

impl Pipeline {
    /// `steps` is the catalog of declared steps; a request picks from it.
    pub fn new(steps: Vec<StepSpec>, analyzer: Analyzer) -> Result<Self, KiraError> {
        let mut seen = BTreeSet::new();
        for spec in &steps {
            validate_name("step", &spec.name)?;
            if !seen.insert(spec.name.as_str()) {
                return Err(KiraError::DuplicateStep(spec.name.clone()));
            }
        }
        Ok(Self {
            steps,
            analyzer,
            state: PipelineState::NotStarted,
        })
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn catalog(&self) -> &[StepSpec] {
        &self.steps
    }

    /// Check the whole request before any step runs: every step is declared
    /// once, has resolvable strategies and reads an input that exists by the
    /// time it runs.
    pub fn plan(&self, request: &AnalysisRequest) -> Result<Vec<StepSpec>, KiraError> {
        let mut planned: Vec<StepSpec> = Vec::with_capacity(request.steps.len());
        for name in &request.steps {
            if planned.iter().any(|spec| &spec.name == name) {
                return Err(KiraError::DuplicateStep(name.clone()));
            }
            let spec = self
                .steps
                .iter()
                .find(|spec| &spec.name == name)
                .ok_or_else(|| KiraError::UndefinedStep(name.clone()))?;
            self.analyzer
                .registry()
                .resolve_named(&spec.name, &spec.strategies)?;
            match &spec.input {
                StepInput::Step(upstream) => {
                    if !planned.iter().any(|earlier| &earlier.name == upstream) {
                        return Err(KiraError::InvalidDependency {
                            step: spec.name.clone(),
                            upstream: upstream.clone(),
                        });
                    }
                }
                StepInput::Input(input) => {
                    if !request.inputs.contains_key(input) {
                        return Err(KiraError::MissingInput {
                            step: spec.name.clone(),
                            input: input.clone(),
                        });
                    }
                }
            }
            planned.push(spec.clone());
        }
        Ok(planned)
    }

    pub fn run(
        &mut self,
        request: &AnalysisRequest,
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, KiraError> {
        let plan = self.plan(request)?;
        let started = Instant::now();
        let mut results: BTreeMap<String, ResultTable> = BTreeMap::new();
        let mut manifest = Vec::with_capacity(plan.len());

        for (index, spec) in plan.iter().enumerate() {
            self.state = PipelineState::Executing {
                step: spec.name.clone(),
            };
            sink.event(ProgressEvent {
                message: format!("phase=Step; running {} ({}/{})", spec.name, index + 1, plan.len()),
                elapsed: None,
            });

            let identifiers = match &spec.input {
                StepInput::Input(name) => request.inputs.get(name).cloned().unwrap_or_default(),
                StepInput::Step(upstream) => results
                    .get(upstream)
                    .map(ResultTable::entities)
                    .unwrap_or_default(),
            };
            let mut command = Command::new(
                spec.clone(),
                identifiers,
                request.options_for(spec),
                self.analyzer.clone(),
            );
            command.execute();
            let attempts = command.attempts();
            let identifiers = command.identifiers().len();

            match command.into_outcome() {
                Ok(output) => {
                    manifest.push(StepReport {
                        step: spec.name.clone(),
                        status: StepStatus::Succeeded,
                        error: None,
                        warnings: output.warnings,
                        rows: output.table.len(),
                        identifiers,
                        cache_hits: output.cache_hits,
                        attempts,
                    });
                    results.insert(spec.name.clone(), output.table);
                    self.state = PipelineState::StepCompleted {
                        step: spec.name.clone(),
                    };
                    sink.event(ProgressEvent {
                        message: format!("phase=Step; finished {}", spec.name),
                        elapsed: Some(started.elapsed()),
                    });
                }
                Err(err) => {
                    manifest.push(StepReport {
                        step: spec.name.clone(),
                        status: StepStatus::Failed,
                        error: Some(err.to_string()),
                        warnings: Vec::new(),
                        rows: 0,
                        identifiers,
                        cache_hits: 0,
                        attempts,
                    });
                    match spec.on_fail {
                        FailurePolicy::Soft => {
                            warn!(step = %spec.name, error = %err, "soft step failed; continuing");
                            self.state = PipelineState::StepCompleted {
                                step: spec.name.clone(),
                            };
                        }
                        FailurePolicy::Fatal => {
                            manifest.extend(
                                plan[index + 1..]
                                    .iter()
                                    .map(|rest| StepReport::skipped(&rest.name)),
                            );
                            self.state = PipelineState::Failed {
                                step: spec.name.clone(),
                            };
                            warn!(step = %spec.name, error = %err, "fatal step failed; aborting run");
                            return Err(KiraError::PipelineAborted {
                                step: spec.name.clone(),
                                report: Box::new(RunReport {
                                    status: RunStatus::Failed,
                                    manifest,
                                    results,
                                }),
                            });
                        }
                    }
                }
            }
        }

        let degraded = manifest
            .iter()
            .any(|report| report.status != StepStatus::Succeeded || !report.warnings.is_empty());
        let status = if degraded {
            RunStatus::SucceededWithWarnings
        } else {
            RunStatus::Succeeded
        };
        self.state = PipelineState::Completed;
        info!(steps = manifest.len(), elapsed = ?started.elapsed(), "pipeline finished");
        sink.event(ProgressEvent {
            message: "phase=Done; pipeline finished".to_string(),
            elapsed: Some(started.elapsed()),
        });
        Ok(RunReport {
            status,
            manifest,
            results,
        })
    }
}
