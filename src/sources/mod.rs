pub mod http;
pub mod local;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::KiraError;
use crate::strategy::{Strategy, StrategyRegistry};

pub use http::{HttpJsonStrategy, HttpSourceConfig};
pub use local::{LocalSourceConfig, LocalTableStrategy};

/// One `sources` entry: a named strategy registered under a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDecl {
    pub name: String,
    pub step: String,
    #[serde(flatten)]
    pub kind: SourceKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceKind {
    Local(LocalSourceConfig),
    Http(HttpSourceConfig),
}

impl SourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Local(_) => "local",
            SourceKind::Http(_) => "http",
        }
    }
}

/// Instantiate every declared source, in declaration order, which is also
/// the fallback preference order within a step.
pub fn build_registry(sources: &[SourceDecl]) -> Result<StrategyRegistry, KiraError> {
    let mut registry = StrategyRegistry::new();
    for decl in sources {
        let strategy: Arc<dyn Strategy> = match &decl.kind {
            SourceKind::Local(config) => Arc::new(LocalTableStrategy::new(&decl.name, config.clone())?),
            SourceKind::Http(config) => Arc::new(HttpJsonStrategy::new(&decl.name, config.clone())?),
        };
        debug!(step = %decl.step, source = %decl.name, kind = decl.kind.label(), "registering source");
        registry.register(&decl.step, strategy)?;
    }
    Ok(registry)
}
