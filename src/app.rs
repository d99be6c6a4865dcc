use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{info, warn};

use crate::analyzer::Analyzer;
use crate::cache::{CacheManager, InvalidateScope, MemoryBackend};
use crate::config::{CacheBackendKind, CacheSettings, ResolvedConfig};
use crate::domain::{AnalysisRequest, validate_name};
use crate::error::KiraError;
use crate::kv::HttpKvBackend;
use crate::output::{ExportResult, export_report};
use crate::pipeline::{Pipeline, RunReport, RunStatus, StepReport};
use crate::sources::build_registry;
use crate::store::FileStore;
use crate::strategy::StrategyRegistry;

/// Command-line adjustments layered over the configured request.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub steps: Option<Vec<String>>,
    pub inputs: Vec<(String, String)>,
    pub overrides: Vec<(String, String, String)>,
    pub out: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub status: RunStatus,
    pub steps: Vec<StepReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidateResult {
    pub valid: bool,
    pub cache_backend: String,
    pub steps: Vec<PlannedStep>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedStep {
    pub step: String,
    pub mode: String,
    pub on_fail: String,
    pub input: String,
    pub strategies: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearResult {
    pub scope: String,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategiesResult {
    pub steps: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App {
    config: ResolvedConfig,
    registry: Arc<StrategyRegistry>,
    cache: Arc<CacheManager>,
}

impl App {
    pub fn new(config: ResolvedConfig, registry: StrategyRegistry, cache: CacheManager) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            cache: Arc::new(cache),
        }
    }

    /// Build the registry from the declared sources and open the configured
    /// cache backend.
    pub fn from_config(config: ResolvedConfig, no_cache: bool) -> Result<Self, KiraError> {
        let registry = build_registry(&config.sources)?;
        let cache = if no_cache {
            CacheManager::disabled()
        } else {
            open_cache(&config.cache)?
        };
        Ok(Self::new(config, registry, cache))
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn request(&self, options: &RunOptions) -> Result<AnalysisRequest, KiraError> {
        let mut request = self.config.request();
        if let Some(steps) = &options.steps {
            request.steps = steps.clone();
        }

        let mut cli_inputs: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &options.inputs {
            validate_name("input", name)?;
            cli_inputs.entry(name.clone()).or_default().push(value.clone());
        }
        request.inputs.extend(cli_inputs);

        for (step, key, value) in &options.overrides {
            if !self.config.steps.iter().any(|spec| &spec.name == step) {
                return Err(KiraError::UndefinedStep(step.clone()));
            }
            request
                .overrides
                .entry(step.clone())
                .or_default()
                .insert(key.clone(), value.clone());
        }
        Ok(request)
    }

    pub fn pipeline(&self) -> Result<Pipeline, KiraError> {
        let analyzer = Analyzer::new(Arc::clone(&self.registry), Arc::clone(&self.cache));
        Pipeline::new(self.config.steps.clone(), analyzer)
    }

    pub fn run(&self, options: &RunOptions, sink: &dyn ProgressSink) -> Result<RunResult, KiraError> {
        let request = self.request(options)?;
        let mut pipeline = self.pipeline()?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Resolve; {} step(s), cache={}",
                request.steps.len(),
                self.cache.backend_name()
            ),
            elapsed: None,
        });

        match pipeline.run(&request, sink) {
            Ok(report) => {
                let export = self.export(options, &report, sink)?;
                Ok(RunResult {
                    status: report.status,
                    steps: report.manifest,
                    export,
                })
            }
            Err(KiraError::PipelineAborted { step, report }) => {
                if let Err(err) = self.export(options, &report, sink) {
                    warn!(error = %err, "failed to export partial results");
                }
                Err(KiraError::PipelineAborted { step, report })
            }
            Err(err) => Err(err),
        }
    }

    pub fn validate(
        &self,
        options: &RunOptions,
        sink: &dyn ProgressSink,
    ) -> Result<ValidateResult, KiraError> {
        sink.event(ProgressEvent {
            message: "phase=Resolve; planning pipeline".to_string(),
            elapsed: None,
        });
        let request = self.request(options)?;
        let plan = self.pipeline()?.plan(&request)?;
        let steps = plan
            .into_iter()
            .map(|spec| {
                let strategies = self
                    .registry
                    .resolve_named(&spec.name, &spec.strategies)?
                    .iter()
                    .map(|strategy| strategy.name().to_string())
                    .collect();
                Ok(PlannedStep {
                    mode: spec.mode.to_string(),
                    on_fail: spec.on_fail.to_string(),
                    input: spec.input.to_string(),
                    step: spec.name,
                    strategies,
                })
            })
            .collect::<Result<Vec<_>, KiraError>>()?;
        Ok(ValidateResult {
            valid: true,
            cache_backend: self.cache.backend_name().to_string(),
            steps,
        })
    }

    pub fn clear_cache(
        &self,
        step: Option<&str>,
        sink: &dyn ProgressSink,
    ) -> Result<ClearResult, KiraError> {
        let scope = match step {
            Some(step) => {
                validate_name("step", step)?;
                InvalidateScope::Step(step.to_string())
            }
            None => InvalidateScope::All,
        };
        let label = step.unwrap_or("all").to_string();
        sink.event(ProgressEvent {
            message: format!("phase=Cache; clearing {label}"),
            elapsed: None,
        });
        let removed = self.cache.invalidate(&scope);
        info!(scope = %label, removed, "cache cleared");
        Ok(ClearResult {
            scope: label,
            removed,
        })
    }

    pub fn strategies(&self) -> StrategiesResult {
        StrategiesResult {
            steps: self
                .registry
                .steps()
                .map(|(step, names)| {
                    (
                        step.to_string(),
                        names.into_iter().map(str::to_string).collect(),
                    )
                })
                .collect(),
        }
    }

    fn export(
        &self,
        options: &RunOptions,
        report: &RunReport,
        sink: &dyn ProgressSink,
    ) -> Result<Option<ExportResult>, KiraError> {
        let Some(dir) = &options.out else {
            return Ok(None);
        };
        sink.event(ProgressEvent {
            message: format!("phase=Export; writing {dir}"),
            elapsed: None,
        });
        export_report(dir, report).map(Some)
    }
}

/// Open the configured backend. A file store whose directory cannot be
/// created runs without a cache instead of failing the run.
pub fn open_cache(settings: &CacheSettings) -> Result<CacheManager, KiraError> {
    match settings.backend {
        CacheBackendKind::None => Ok(CacheManager::disabled()),
        CacheBackendKind::Memory => Ok(CacheManager::new(Box::new(MemoryBackend::new()))),
        CacheBackendKind::File => {
            let store = match &settings.path {
                Some(path) => FileStore::new_with_root(path.clone()),
                None => FileStore::new()?,
            };
            match store.ensure_root() {
                Ok(()) => Ok(CacheManager::new(Box::new(store))),
                Err(err) => {
                    warn!(root = %store.root(), error = %err, "cache directory unavailable; continuing without cache");
                    Ok(CacheManager::disabled())
                }
            }
        }
        CacheBackendKind::Http => {
            let url = settings.url.as_deref().ok_or_else(|| {
                KiraError::InvalidConfig("cache backend `http` requires cache.url".to_string())
            })?;
            Ok(CacheManager::new(Box::new(HttpKvBackend::new(
                url,
                settings.timeout,
            )?)))
        }
    }
}
