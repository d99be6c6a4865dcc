use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{
    AnalysisRequest, ExecutionMode, FailurePolicy, Options, StepInput, StepSpec, validate_name,
};
use crate::error::KiraError;
use crate::sources::{SourceDecl, SourceKind};

pub const DEFAULT_CONFIG_FILE: &str = "kira-np.json";
pub const ENV_CACHE_BACKEND: &str = "KIRA_NP_CACHE_BACKEND";
pub const ENV_CACHE_PATH: &str = "KIRA_NP_CACHE_PATH";
pub const ENV_CACHE_URL: &str = "KIRA_NP_CACHE_URL";

const SUPPORTED_SCHEMA: u32 = 1;
const DEFAULT_STEP_TIMEOUT_SECS: u64 = 120;
const DEFAULT_CACHE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputEntry>,
    #[serde(default)]
    pub defaults: StepDefaults,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub sources: Vec<SourceDecl>,
    #[serde(default)]
    pub steps: Vec<StepEntry>,
    #[serde(default)]
    pub overrides: BTreeMap<String, BTreeMap<String, Value>>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum InputEntry {
    Single(String),
    List(Vec<String>),
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StepDefaults {
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub on_fail: Option<FailurePolicy>,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Memory,
    File,
    Http,
    None,
}

impl fmt::Display for CacheBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CacheBackendKind::Memory => "memory",
            CacheBackendKind::File => "file",
            CacheBackendKind::Http => "http",
            CacheBackendKind::None => "none",
        };
        write!(f, "{label}")
    }
}

impl FromStr for CacheBackendKind {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(CacheBackendKind::Memory),
            "file" => Ok(CacheBackendKind::File),
            "http" => Ok(CacheBackendKind::Http),
            "none" | "off" => Ok(CacheBackendKind::None),
            _ => Err(KiraError::InvalidConfig(format!(
                "unknown cache backend `{value}` (expected memory|file|http|none)"
            ))),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CacheSection {
    #[serde(default)]
    pub backend: Option<CacheBackendKind>,
    #[serde(default)]
    pub path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StepEntry {
    Shorthand(String),
    Detailed(StepEntryObject),
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StepEntryObject {
    pub name: String,
    #[serde(default)]
    pub strategies: Vec<String>,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub on_fail: Option<FailurePolicy>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    pub backend: CacheBackendKind,
    /// `None` selects the per-user default directory.
    pub path: Option<Utf8PathBuf>,
    pub url: Option<String>,
    pub timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::File,
            path: None,
            url: None,
            timeout: Duration::from_secs(DEFAULT_CACHE_TIMEOUT_SECS),
        }
    }
}

impl CacheSettings {
    /// Layer `KIRA_NP_CACHE_*` variables on top of the file settings.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), KiraError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_CACHE_BACKEND).filter(|v| !v.trim().is_empty()) {
            self.backend = value.parse()?;
        }
        if let Some(value) = lookup(ENV_CACHE_PATH).filter(|v| !v.trim().is_empty()) {
            self.path = Some(Utf8PathBuf::from(value.trim()));
        }
        if let Some(value) = lookup(ENV_CACHE_URL).filter(|v| !v.trim().is_empty()) {
            self.url = Some(value.trim().to_string());
        }
        self.check()
    }

    fn check(&self) -> Result<(), KiraError> {
        if self.backend == CacheBackendKind::Http && self.url.is_none() {
            return Err(KiraError::InvalidConfig(
                "cache backend `http` requires cache.url".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub inputs: BTreeMap<String, Vec<String>>,
    pub cache: CacheSettings,
    pub sources: Vec<SourceDecl>,
    pub steps: Vec<StepSpec>,
    pub overrides: BTreeMap<String, Options>,
}

impl ResolvedConfig {
    /// The default request: every declared step, in declaration order.
    pub fn request(&self) -> AnalysisRequest {
        AnalysisRequest {
            inputs: self.inputs.clone(),
            steps: self.steps.iter().map(|spec| spec.name.clone()).collect(),
            overrides: self.overrides.clone(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(KiraError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let mut config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        if let Some(base) = config_path.parent() {
            rebase_paths(&mut config, base)?;
        }
        let mut resolved = Self::resolve_config(config)?;
        resolved
            .cache
            .apply_env(|key| std::env::var(key).ok())?;
        Ok(resolved)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, KiraError> {
        let schema_version = config.schema_version.unwrap_or(SUPPORTED_SCHEMA);
        if schema_version != SUPPORTED_SCHEMA {
            return Err(KiraError::InvalidConfig(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let inputs = config
            .inputs
            .into_iter()
            .map(|(name, entry)| {
                validate_name("input", &name)?;
                let values = match entry {
                    InputEntry::Single(value) => vec![value],
                    InputEntry::List(values) => values,
                };
                Ok((name, values))
            })
            .collect::<Result<BTreeMap<_, _>, KiraError>>()?;

        let cache = resolve_cache(&config.cache)?;
        let sources = resolve_sources(config.sources)?;

        let mut steps: Vec<StepSpec> = Vec::with_capacity(config.steps.len());
        for entry in config.steps {
            let object = match entry {
                StepEntry::Shorthand(name) => StepEntryObject {
                    name,
                    ..StepEntryObject::default()
                },
                StepEntry::Detailed(object) => object,
            };
            let spec = resolve_step(object, &config.defaults, &config.cache, &inputs, &steps)?;
            if steps.iter().any(|existing| existing.name == spec.name) {
                return Err(KiraError::DuplicateStep(spec.name));
            }
            steps.push(spec);
        }

        let mut overrides = BTreeMap::new();
        for (step, values) in config.overrides {
            if !steps.iter().any(|spec| spec.name == step) {
                return Err(KiraError::UndefinedStep(step));
            }
            let options = values
                .into_iter()
                .map(|(key, value)| Ok((key.clone(), option_value(&key, &value)?)))
                .collect::<Result<Options, KiraError>>()?;
            overrides.insert(step, options);
        }

        Ok(ResolvedConfig {
            schema_version,
            inputs,
            cache,
            sources,
            steps,
            overrides,
        })
    }
}

fn resolve_cache(section: &CacheSection) -> Result<CacheSettings, KiraError> {
    let settings = CacheSettings {
        backend: section.backend.unwrap_or(CacheBackendKind::File),
        path: section.path.clone(),
        url: section.url.clone(),
        timeout: Duration::from_secs(positive(
            "cache.timeout",
            section.timeout.unwrap_or(DEFAULT_CACHE_TIMEOUT_SECS),
        )?),
    };
    settings.check()?;
    Ok(settings)
}

fn resolve_sources(sources: Vec<SourceDecl>) -> Result<Vec<SourceDecl>, KiraError> {
    let mut seen = BTreeSet::new();
    for decl in &sources {
        validate_name("step", &decl.step)?;
        validate_name("strategy", &decl.name)?;
        if !seen.insert((decl.step.as_str(), decl.name.as_str())) {
            return Err(KiraError::InvalidConfig(format!(
                "source {} is declared twice for step {}",
                decl.name, decl.step
            )));
        }
    }
    Ok(sources)
}

fn resolve_step(
    object: StepEntryObject,
    defaults: &StepDefaults,
    cache: &CacheSection,
    inputs: &BTreeMap<String, Vec<String>>,
    earlier: &[StepSpec],
) -> Result<StepSpec, KiraError> {
    validate_name("step", &object.name)?;
    for strategy in &object.strategies {
        validate_name("strategy", strategy)?;
    }
    let input = match object.input.as_deref() {
        Some(value) => value.parse::<StepInput>()?,
        None => implicit_input(&object.name, inputs, earlier)?,
    };

    let mut spec = StepSpec::new(object.name, input);
    spec.strategies = object.strategies;
    spec.mode = object
        .mode
        .or(defaults.mode)
        .unwrap_or(ExecutionMode::Fallback);
    spec.on_fail = object
        .on_fail
        .or(defaults.on_fail)
        .unwrap_or(FailurePolicy::Fatal);
    spec.ttl = object
        .ttl
        .or(defaults.ttl)
        .or(cache.ttl)
        .map(Duration::from_secs);
    spec.timeout = Duration::from_secs(positive(
        "timeout",
        object
            .timeout
            .or(defaults.timeout)
            .unwrap_or(DEFAULT_STEP_TIMEOUT_SECS),
    )?);
    spec.retries = object.retries.or(defaults.retries).unwrap_or(0);
    spec.case_sensitive = object.case_sensitive;
    spec.options = object
        .options
        .into_iter()
        .map(|(key, value)| Ok((key.clone(), option_value(&key, &value)?)))
        .collect::<Result<Options, KiraError>>()?;
    Ok(spec)
}

/// A step without an explicit input reads the previous step, or the only
/// global input when it is the first step.
fn implicit_input(
    step: &str,
    inputs: &BTreeMap<String, Vec<String>>,
    earlier: &[StepSpec],
) -> Result<StepInput, KiraError> {
    if let Some(previous) = earlier.last() {
        return Ok(StepInput::Step(previous.name.clone()));
    }
    let mut names = inputs.keys();
    match (names.next(), names.next()) {
        (Some(only), None) => Ok(StepInput::Input(only.clone())),
        _ => Err(KiraError::InvalidConfig(format!(
            "step {step} must name its input (input:NAME or step:NAME)"
        ))),
    }
}

fn positive(field: &str, secs: u64) -> Result<u64, KiraError> {
    if secs == 0 {
        return Err(KiraError::InvalidConfig(format!(
            "{field} must be greater than zero"
        )));
    }
    Ok(secs)
}

fn option_value(key: &str, value: &Value) -> Result<String, KiraError> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        _ => Err(KiraError::InvalidConfig(format!(
            "option {key} must be a string, number or boolean"
        ))),
    }
}

/// Relative file paths in the document are relative to the document itself.
fn rebase_paths(config: &mut Config, base: &Path) -> Result<(), KiraError> {
    if base.as_os_str().is_empty() {
        return Ok(());
    }
    let base = Utf8PathBuf::from_path_buf(base.to_path_buf()).map_err(|path| {
        KiraError::InvalidConfig(format!("config directory is not UTF-8: {}", path.display()))
    })?;
    if let Some(path) = config.cache.path.as_mut() {
        if path.is_relative() {
            *path = base.join(&*path);
        }
    }
    for decl in &mut config.sources {
        if let SourceKind::Local(local) = &mut decl.kind {
            if local.path.is_relative() {
                local.path = base.join(&local.path);
            }
        }
    }
    Ok(())
}

/// `--input name=value`; repeated flags for the same name append.
pub fn parse_assignment(raw: &str) -> Result<(String, String), KiraError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| KiraError::InvalidConfig(format!("expected KEY=VALUE, got `{raw}`")))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(KiraError::InvalidConfig(format!(
            "expected KEY=VALUE, got `{raw}`"
        )));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

/// `--set step.option=value`. The option name is the part after the last dot,
/// so step names may themselves contain dots.
pub fn parse_override(raw: &str) -> Result<(String, String, String), KiraError> {
    let (path, value) = parse_assignment(raw)?;
    let (step, option) = path.rsplit_once('.').ok_or_else(|| {
        KiraError::InvalidConfig(format!("expected STEP.OPTION=VALUE, got `{raw}`"))
    })?;
    if step.is_empty() || option.is_empty() {
        return Err(KiraError::InvalidConfig(format!(
            "expected STEP.OPTION=VALUE, got `{raw}`"
        )));
    }
    Ok((step.to_string(), option.to_string(), value))
}
