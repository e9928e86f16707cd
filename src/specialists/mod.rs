//! Specialist registry and invocation
//!
//! Specialists are narrowly-scoped analysis units, pure over
//! (query, context snapshot). The registry isolates failures: a specialist
//! error or timeout becomes an error-carrying `SpecialistResult`, never a
//! burst abort.

use crate::market::MarketDataProvider;
use crate::models::{ContextSnapshot, SpecialistResult, SpecialistTag, Stance};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub mod forecast;
pub mod quant;
pub mod research;
pub mod sentiment;
pub mod whale;

pub use forecast::ForecastSpecialist;
pub use quant::QuantSpecialist;
pub use research::ResearchSpecialist;
pub use sentiment::SentimentSpecialist;
pub use whale::WhaleSpecialist;

/// Market proxy analyzed when the request names no instrument.
const DEFAULT_SYMBOL: &str = "SPY";

pub fn symbol_of(snapshot: &ContextSnapshot) -> &str {
    snapshot.symbol.as_deref().unwrap_or(DEFAULT_SYMBOL)
}

/// Successful specialist analysis before registry bookkeeping.
#[derive(Debug, Clone)]
pub struct SpecialistOutput {
    pub stance: Option<Stance>,
    pub payload: serde_json::Value,
    pub narrative: String,
}

#[async_trait]
pub trait Specialist: Send + Sync {
    fn tag(&self) -> SpecialistTag;

    async fn analyze(&self, snapshot: &ContextSnapshot) -> Result<SpecialistOutput>;
}

/// Capability-tagged lookup of registered specialists.
pub struct SpecialistRegistry {
    specialists: HashMap<SpecialistTag, Arc<dyn Specialist>>,
}

impl SpecialistRegistry {
    pub fn new() -> Self {
        Self {
            specialists: HashMap::new(),
        }
    }

    pub fn register(&mut self, specialist: Arc<dyn Specialist>) {
        self.specialists.insert(specialist.tag(), specialist);
    }

    pub fn get(&self, tag: SpecialistTag) -> Option<Arc<dyn Specialist>> {
        self.specialists.get(&tag).cloned()
    }

    pub fn tags(&self) -> Vec<SpecialistTag> {
        self.specialists.keys().copied().collect()
    }

    /// Invoke one specialist with a deadline. Never fails: errors and
    /// timeouts are captured in the result so one bad specialist cannot
    /// poison the burst.
    pub async fn invoke(
        &self,
        tag: SpecialistTag,
        snapshot: &ContextSnapshot,
        timeout: Duration,
    ) -> SpecialistResult {
        let start = Instant::now();

        let Some(specialist) = self.get(tag) else {
            warn!(%tag, "Specialist not registered");
            return SpecialistResult::failure(tag, "specialist not registered".into(), 0);
        };

        let outcome = tokio::time::timeout(timeout, specialist.analyze(snapshot)).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(output)) => {
                debug!(%tag, latency_ms, "Specialist complete");
                SpecialistResult {
                    tag,
                    stance: output.stance,
                    payload: output.payload,
                    narrative: output.narrative,
                    latency_ms,
                    error: None,
                }
            }
            Ok(Err(e)) => {
                warn!(%tag, error = %e, "Specialist failed");
                SpecialistResult::failure(tag, e.to_string(), latency_ms)
            }
            Err(_) => {
                warn!(%tag, ?timeout, "Specialist timed out");
                SpecialistResult::failure(
                    tag,
                    format!("timed out after {}ms", timeout.as_millis()),
                    latency_ms,
                )
            }
        }
    }
}

impl Default for SpecialistRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry wired with the full specialist set over one data provider.
pub fn create_default_registry(provider: Arc<dyn MarketDataProvider>) -> SpecialistRegistry {
    let mut registry = SpecialistRegistry::new();
    registry.register(Arc::new(QuantSpecialist::new(provider.clone())));
    registry.register(Arc::new(SentimentSpecialist::new(provider.clone())));
    registry.register(Arc::new(ForecastSpecialist::new(provider.clone())));
    registry.register(Arc::new(ResearchSpecialist::new(provider.clone())));
    registry.register(Arc::new(WhaleSpecialist::new(provider)));
    registry
}
