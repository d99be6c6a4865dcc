use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::cache::normalize;
use crate::domain::Options;
use crate::error::KiraError;
use crate::strategy::{Strategy, StrategyError, StrategyFailure};
use crate::table::{Association, ResultTable};

const IDENTIFIER_COLUMN: &str = "identifier";
const ENTITY_COLUMN: &str = "entity";
const SCORE_COLUMN: &str = "score";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSourceConfig {
    pub path: Utf8PathBuf,
    #[serde(default)]
    pub min_score: Option<f64>,
    #[serde(default)]
    pub case_sensitive: bool,
}

/// Association table shipped as a TSV file (optionally `.gz`). The header must
/// name `identifier` and `entity` columns; `score` is optional and every other
/// column is carried as a row attribute.
#[derive(Debug, Clone)]
pub struct LocalTableStrategy {
    name: String,
    config: LocalSourceConfig,
}

impl LocalTableStrategy {
    pub fn new(name: &str, config: LocalSourceConfig) -> Result<Self, KiraError> {
        if !config.path.as_std_path().is_file() {
            return Err(KiraError::SourceConfig {
                source_name: name.to_string(),
                message: format!("table not found: {}", config.path),
            });
        }
        Ok(Self {
            name: name.to_string(),
            config,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.config.path
    }

    fn open(&self) -> Result<Box<dyn BufRead>, StrategyFailure> {
        let file = File::open(self.config.path.as_std_path())
            .map_err(|err| StrategyFailure::Io(format!("{}: {err}", self.config.path)))?;
        let reader: Box<dyn Read> = if self.config.path.extension() == Some("gz") {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        Ok(Box::new(BufReader::new(reader)))
    }

    fn min_score(&self, options: &Options) -> Result<Option<f64>, StrategyFailure> {
        match options.get("min_score") {
            Some(value) => value
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|min| min.is_finite())
                .map(Some)
                .ok_or_else(|| StrategyFailure::Malformed(format!("invalid min_score option: {value}"))),
            None => Ok(self.config.min_score),
        }
    }
}

impl Strategy for LocalTableStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, identifier: &str, options: &Options) -> Result<ResultTable, StrategyError> {
        let fail = |cause| StrategyError::new(&self.name, cause);
        let min_score = self.min_score(options).map_err(fail)?;
        let reader = self.open().map_err(fail)?;
        let table = read_table(reader, identifier, self.config.case_sensitive).map_err(fail)?;
        Ok(match min_score {
            Some(min) => ResultTable::from_rows(
                table
                    .into_rows()
                    .into_iter()
                    .filter(|row| row.score.is_some_and(|score| score >= min))
                    .collect(),
            ),
            None => table,
        })
    }
}

struct Columns {
    identifier: usize,
    entity: usize,
    score: Option<usize>,
    attributes: Vec<(usize, String)>,
}

impl Columns {
    fn from_header(header: &str) -> Result<Self, StrategyFailure> {
        let names = header
            .split('\t')
            .map(|name| name.trim().to_ascii_lowercase())
            .collect::<Vec<_>>();
        let find = |wanted: &str| names.iter().position(|name| name == wanted);
        let identifier = find(IDENTIFIER_COLUMN)
            .ok_or_else(|| StrategyFailure::Malformed("missing identifier column".to_string()))?;
        let entity = find(ENTITY_COLUMN)
            .ok_or_else(|| StrategyFailure::Malformed("missing entity column".to_string()))?;
        let score = find(SCORE_COLUMN);
        let attributes = names
            .iter()
            .enumerate()
            .filter(|(index, name)| {
                *index != identifier && *index != entity && Some(*index) != score && !name.is_empty()
            })
            .map(|(index, name)| (index, name.clone()))
            .collect();
        Ok(Self {
            identifier,
            entity,
            score,
            attributes,
        })
    }
}

/// Rows of a TSV stream whose identifier matches `identifier` after
/// normalization.
pub fn read_table<R: BufRead>(
    reader: R,
    identifier: &str,
    case_sensitive: bool,
) -> Result<ResultTable, StrategyFailure> {
    let mut lines = reader.lines();
    let header = match lines.next() {
        Some(line) => line.map_err(|err| StrategyFailure::Io(err.to_string()))?,
        None => return Err(StrategyFailure::Malformed("empty table".to_string())),
    };
    let columns = Columns::from_header(header.trim_start_matches('\u{feff}'))?;
    let wanted = normalize(identifier, case_sensitive);

    let mut table = ResultTable::new();
    for (index, line) in lines.enumerate() {
        let line = line.map_err(|err| StrategyFailure::Io(err.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let cells = line.split('\t').collect::<Vec<_>>();
        let cell = |column: usize| cells.get(column).map(|value| value.trim()).unwrap_or("");
        if normalize(cell(columns.identifier), case_sensitive) != wanted {
            continue;
        }
        let entity = cell(columns.entity);
        if entity.is_empty() {
            continue;
        }
        let mut row = Association::new(cell(columns.identifier), entity);
        if let Some(column) = columns.score {
            let raw = cell(column);
            if !raw.is_empty() {
                let score = raw
                    .parse::<f64>()
                    .ok()
                    .filter(|score| score.is_finite())
                    .ok_or_else(|| {
                        StrategyFailure::Malformed(format!("line {}: invalid score `{raw}`", index + 2))
                    })?;
                row.score = Some(score);
            }
        }
        row.attributes = columns
            .attributes
            .iter()
            .filter_map(|(column, name)| {
                let value = cell(*column);
                (!value.is_empty()).then(|| (name.clone(), value.to_string()))
            })
            .collect::<BTreeMap<_, _>>();
        table.push(row);
    }
    Ok(table)
}
