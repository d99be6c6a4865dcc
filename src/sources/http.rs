use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::Url;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::domain::Options;
use crate::error::KiraError;
use crate::http::{build_client, send_with_retries};
use crate::strategy::{Strategy, StrategyError, StrategyFailure};
use crate::table::{Association, ResultTable};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSourceConfig {
    pub url: String,
    /// Send the identifier as this query parameter instead of a path segment.
    #[serde(default)]
    pub identifier_param: Option<String>,
    /// JSON pointer to the row array; the document root when absent.
    #[serde(default)]
    pub rows: Option<String>,
    #[serde(default = "default_entity_field")]
    pub entity_field: String,
    #[serde(default)]
    pub score_field: Option<String>,
    #[serde(default)]
    pub identifier_field: Option<String>,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_entity_field() -> String {
    "entity".to_string()
}

fn default_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    30
}

/// JSON REST endpoint returning an array of association objects.
#[derive(Debug, Clone)]
pub struct HttpJsonStrategy {
    name: String,
    config: HttpSourceConfig,
    base: Url,
    client: Client,
}

impl HttpJsonStrategy {
    pub fn new(name: &str, config: HttpSourceConfig) -> Result<Self, KiraError> {
        let misconfigured = |message: String| KiraError::SourceConfig {
            source_name: name.to_string(),
            message,
        };
        let base = Url::parse(&config.url)
            .map_err(|err| misconfigured(format!("invalid url `{}`: {err}", config.url)))?;
        if config.identifier_param.is_none() && base.cannot_be_a_base() {
            return Err(misconfigured(format!(
                "url `{}` cannot take a path segment",
                config.url
            )));
        }
        if let Some(pointer) = &config.rows {
            if !pointer.is_empty() && !pointer.starts_with('/') {
                return Err(misconfigured(format!(
                    "rows must be a JSON pointer starting with `/`: {pointer}"
                )));
            }
        }
        let client = build_client(Duration::from_secs(config.timeout_secs))?;
        Ok(Self {
            name: name.to_string(),
            config,
            base,
            client,
        })
    }

    /// Static params first, then step options, then the identifier.
    pub fn request_url(&self, identifier: &str, options: &Options) -> Result<Url, StrategyFailure> {
        let mut url = self.base.clone();
        if self.config.identifier_param.is_none() {
            url.path_segments_mut()
                .map_err(|_| StrategyFailure::Http(format!("invalid url {}", self.base)))?
                .pop_if_empty()
                .push(identifier.trim());
        }
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in self.config.params.iter().chain(options.iter()) {
                query.append_pair(key, value);
            }
            if let Some(param) = &self.config.identifier_param {
                query.append_pair(param, identifier.trim());
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    fn fetch(&self, identifier: &str, options: &Options) -> Result<ResultTable, StrategyFailure> {
        let url = self.request_url(identifier, options)?;
        debug!(source = %self.name, %url, "requesting associations");
        let resp = send_with_retries(|| self.client.get(url.clone()), self.config.retries).map_err(
            |err| {
                if err.is_timeout() {
                    StrategyFailure::Timeout(Duration::from_secs(self.config.timeout_secs))
                } else {
                    StrategyFailure::Http(err.to_string())
                }
            },
        )?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(ResultTable::new());
        }
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(StrategyFailure::Status {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }
        let body = resp
            .text()
            .map_err(|err| StrategyFailure::Http(err.to_string()))?;
        let document: Value = serde_json::from_str(&body)
            .map_err(|err| StrategyFailure::Malformed(err.to_string()))?;
        parse_rows(&self.config, &document, identifier)
    }
}

impl Strategy for HttpJsonStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, identifier: &str, options: &Options) -> Result<ResultTable, StrategyError> {
        self.fetch(identifier, options)
            .map_err(|cause| StrategyError::new(&self.name, cause))
    }
}

/// Turn a JSON document into association rows. Items without an entity are
/// skipped; a missing row array or a non-object item is malformed.
pub fn parse_rows(
    config: &HttpSourceConfig,
    document: &Value,
    identifier: &str,
) -> Result<ResultTable, StrategyFailure> {
    let rows = match config.rows.as_deref() {
        Some(pointer) if !pointer.is_empty() => document
            .pointer(pointer)
            .ok_or_else(|| StrategyFailure::Malformed(format!("no value at {pointer}")))?,
        _ => document,
    };
    let items = match rows {
        Value::Array(items) => items,
        Value::Null => return Ok(ResultTable::new()),
        _ => {
            return Err(StrategyFailure::Malformed(
                "expected an array of rows".to_string(),
            ));
        }
    };

    let mut table = ResultTable::new();
    for item in items {
        let Value::Object(fields) = item else {
            return Err(StrategyFailure::Malformed(
                "expected each row to be an object".to_string(),
            ));
        };
        let Some(entity) = fields.get(&config.entity_field).and_then(scalar) else {
            continue;
        };
        let row_identifier = config
            .identifier_field
            .as_ref()
            .and_then(|field| fields.get(field))
            .and_then(scalar)
            .unwrap_or_else(|| identifier.trim().to_string());
        let mut row = Association::new(row_identifier, entity);
        if let Some(field) = &config.score_field {
            row.score = match fields.get(field) {
                None | Some(Value::Null) => None,
                Some(Value::Number(number)) => number.as_f64(),
                Some(Value::String(text)) if text.trim().is_empty() => None,
                Some(Value::String(text)) => Some(
                    text.trim()
                        .parse::<f64>()
                        .ok()
                        .filter(|score| score.is_finite())
                        .ok_or_else(|| StrategyFailure::Malformed(format!("invalid score `{text}`")))?,
                ),
                Some(other) => {
                    return Err(StrategyFailure::Malformed(format!("invalid score {other}")));
                }
            };
        }
        for name in &config.attributes {
            if let Some(value) = fields.get(name).and_then(scalar) {
                row.attributes.insert(name.clone(), value);
            }
        }
        table.push(row);
    }
    Ok(table)
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}
