use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheManager};
use crate::domain::{ExecutionMode, Options, StepSpec};
use crate::error::KiraError;
use crate::strategy::{Strategy, StrategyError, StrategyFailure, StrategyRegistry};
use crate::table::{ResultTable, merge_ranked};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisOutcome {
    pub table: ResultTable,
    /// Strategies that were tried and failed. A successful outcome may still
    /// carry failures (fallback skipped them, merge ran without them).
    pub failures: Vec<StrategyError>,
    pub cache_hits: usize,
}

/// Runs one step for one identifier: picks strategies, consults the cache and
/// combines results according to the step's mode.
#[derive(Clone)]
pub struct Analyzer {
    registry: Arc<StrategyRegistry>,
    cache: Arc<CacheManager>,
}

impl Analyzer {
    pub fn new(registry: Arc<StrategyRegistry>, cache: Arc<CacheManager>) -> Self {
        Self { registry, cache }
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn run(
        &self,
        spec: &StepSpec,
        identifier: &str,
        options: &Options,
    ) -> Result<AnalysisOutcome, KiraError> {
        let strategies = self.registry.resolve_named(&spec.name, &spec.strategies)?;
        match spec.mode {
            ExecutionMode::Fallback => self.run_fallback(spec, &strategies, identifier, options),
            ExecutionMode::Merge => Ok(self.run_merge(spec, &strategies, identifier, options)),
        }
    }

    fn run_fallback(
        &self,
        spec: &StepSpec,
        strategies: &[Arc<dyn Strategy>],
        identifier: &str,
        options: &Options,
    ) -> Result<AnalysisOutcome, KiraError> {
        let keys = strategies
            .iter()
            .map(|strategy| self.key(spec, strategy.name(), identifier, options))
            .collect::<Vec<_>>();
        if let Some(entry) = keys.iter().find_map(|key| self.cache.get(key)) {
            debug!(step = %spec.name, identifier, strategy = %entry.strategy, "fallback served from cache");
            return Ok(AnalysisOutcome {
                table: entry.table,
                failures: Vec::new(),
                cache_hits: 1,
            });
        }

        let mut failures = Vec::new();
        for (strategy, key) in strategies.iter().zip(&keys) {
            let receiver = dispatch(strategy, identifier, options);
            match await_result(strategy.name(), receiver, spec.timeout, spec.timeout) {
                Ok(mut table) => {
                    table.tag_source(strategy.name());
                    self.cache.put(key, &table, spec.ttl);
                    return Ok(AnalysisOutcome {
                        table,
                        failures,
                        cache_hits: 0,
                    });
                }
                Err(err) => {
                    warn!(step = %spec.name, identifier, error = %err, "strategy failed; trying next");
                    failures.push(err);
                }
            }
        }
        Err(KiraError::AllStrategiesFailed {
            step: spec.name.clone(),
            identifier: identifier.to_string(),
            failures,
        })
    }

    fn run_merge(
        &self,
        spec: &StepSpec,
        strategies: &[Arc<dyn Strategy>],
        identifier: &str,
        options: &Options,
    ) -> AnalysisOutcome {
        let deadline = Instant::now() + spec.timeout;
        let mut parts = Vec::with_capacity(strategies.len());
        let mut pending = Vec::new();
        let mut cache_hits = 0;

        for (rank, strategy) in strategies.iter().enumerate() {
            let key = self.key(spec, strategy.name(), identifier, options);
            match self.cache.get(&key) {
                Some(entry) => {
                    cache_hits += 1;
                    parts.push((rank, entry.table));
                }
                None => pending.push((rank, strategy, key, dispatch(strategy, identifier, options))),
            }
        }

        let mut failures = Vec::new();
        for (rank, strategy, key, receiver) in pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match await_result(strategy.name(), receiver, remaining, spec.timeout) {
                Ok(mut table) => {
                    table.tag_source(strategy.name());
                    self.cache.put(&key, &table, spec.ttl);
                    parts.push((rank, table));
                }
                Err(err) => {
                    warn!(step = %spec.name, identifier, error = %err, "strategy failed; merging without it");
                    failures.push(err);
                }
            }
        }

        debug!(
            step = %spec.name,
            identifier,
            merged = parts.len(),
            failed = failures.len(),
            "merging strategy results"
        );
        AnalysisOutcome {
            table: merge_ranked(parts),
            failures,
            cache_hits,
        }
    }

    fn key(&self, spec: &StepSpec, strategy: &str, identifier: &str, options: &Options) -> CacheKey {
        CacheKey::new(&spec.name, strategy, identifier, options, spec.case_sensitive)
    }
}

/// Start a strategy on its own thread. The result arrives on the returned
/// channel; a panic closes the channel without a value.
fn dispatch(
    strategy: &Arc<dyn Strategy>,
    identifier: &str,
    options: &Options,
) -> Receiver<Result<ResultTable, StrategyError>> {
    let (sender, receiver) = mpsc::channel();
    let strategy = Arc::clone(strategy);
    let identifier = identifier.to_string();
    let options = options.clone();
    thread::spawn(move || {
        let result = strategy.execute(&identifier, &options);
        // The receiver is gone when the caller stopped waiting.
        let _ = sender.send(result);
    });
    receiver
}

/// Wait at most `wait` for a dispatched strategy. A strategy still running at
/// the deadline is abandoned; its late result is dropped unseen and never
/// reaches the cache.
fn await_result(
    name: &str,
    receiver: Receiver<Result<ResultTable, StrategyError>>,
    wait: Duration,
    budget: Duration,
) -> Result<ResultTable, StrategyError> {
    match receiver.recv_timeout(wait) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            Err(StrategyError::new(name, StrategyFailure::Timeout(budget)))
        }
        Err(RecvTimeoutError::Disconnected) => {
            Err(StrategyError::new(name, StrategyFailure::Panicked))
        }
    }
}
