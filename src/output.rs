use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::app::{ClearResult, ProgressEvent, ProgressSink, RunResult, StrategiesResult, ValidateResult};
use crate::error::KiraError;
use crate::pipeline::{RunReport, RunStatus, StepReport};
use crate::store::write_atomic;

pub const MANIFEST_FILE: &str = "manifest.json";

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(result: &RunResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_validate(result: &ValidateResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_clear(result: &ClearResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_strategies(result: &StrategiesResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Progress lines on stderr, for interactive runs.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} [{:.1}s]", event.message, elapsed.as_secs_f64()),
            None => eprintln!("{}", event.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportResult {
    pub dir: String,
    pub manifest: String,
    pub tables: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ManifestFile<'a> {
    tool: String,
    generated_at: String,
    status: RunStatus,
    steps: &'a [StepReport],
}

/// Write one `{step}.tsv` per produced table plus `manifest.json`, each
/// atomically. Tables are written in manifest order.
pub fn export_report(dir: &Utf8Path, report: &RunReport) -> Result<ExportResult, KiraError> {
    let mut tables = Vec::new();
    for step in &report.manifest {
        let Some(table) = report.results.get(&step.step) else {
            continue;
        };
        let path = dir.join(format!("{}.tsv", step.step));
        write_atomic(&path, table.to_tsv().as_bytes())?;
        tables.push(path.to_string());
    }

    let manifest = ManifestFile {
        tool: format!("kira-np/{}", env!("CARGO_PKG_VERSION")),
        generated_at: chrono::Utc::now().to_rfc3339(),
        status: report.status,
        steps: &report.manifest,
    };
    let manifest_path: Utf8PathBuf = dir.join(MANIFEST_FILE);
    let json = serde_json::to_vec_pretty(&manifest)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    write_atomic(&manifest_path, &json)?;

    Ok(ExportResult {
        dir: dir.to_string(),
        manifest: manifest_path.to_string(),
        tables,
    })
}
