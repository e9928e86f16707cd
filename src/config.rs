//! Deployment configuration
//!
//! All tunables are deployment parameters with defaults, overridable via
//! environment variables. Numeric thresholds here are calibration inputs,
//! not correctness requirements.

use std::env;
use std::time::Duration;

/// Weights for the adversarial confidence estimate. Fixed by configuration
/// so the score is reproducible for a given debate and specialist set.
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceWeights {
    pub specialist_agreement: f64,
    pub debate_stability: f64,
    pub router_confidence: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            specialist_agreement: 0.40,
            debate_stability: 0.35,
            router_confidence: 0.25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Entropy cutoff above which a segment is escalated to the large model.
    pub entropy_threshold: f64,
    /// Second cutoff: large-model output above this is flagged low-confidence
    /// but still emitted.
    pub high_entropy_threshold: f64,
    pub max_debate_turns: u32,
    pub confidence_weights: ConfidenceWeights,
    /// Ceiling applied to confidence when the debate ends without approval
    /// or the request budget expires mid-debate.
    pub exhausted_confidence_cap: f64,
    /// Global wall-clock budget for one request.
    pub request_budget: Duration,
    pub specialist_timeout: Duration,
    /// How long a disconnected stream session is retained for resume.
    pub session_idle_window: Duration,
    /// Capacity of the orchestration -> publisher event queue.
    pub event_queue_capacity: usize,
    /// Concurrent in-flight generations allowed across all requests.
    pub gateway_max_concurrency: usize,
    pub draft_max_tokens: u32,
    pub draft_temperature: f32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            entropy_threshold: 0.4,
            high_entropy_threshold: 0.75,
            max_debate_turns: 2,
            confidence_weights: ConfidenceWeights::default(),
            exhausted_confidence_cap: 0.6,
            request_budget: Duration::from_secs(45),
            specialist_timeout: Duration::from_secs(8),
            session_idle_window: Duration::from_secs(60),
            event_queue_capacity: 256,
            gateway_max_concurrency: 8,
            draft_max_tokens: 768,
            draft_temperature: 0.3,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            entropy_threshold: env_f64("ENTROPY_THRESHOLD", defaults.entropy_threshold),
            high_entropy_threshold: env_f64(
                "HIGH_ENTROPY_THRESHOLD",
                defaults.high_entropy_threshold,
            ),
            max_debate_turns: env_u64("MAX_DEBATE_TURNS", defaults.max_debate_turns as u64) as u32,
            confidence_weights: ConfidenceWeights {
                specialist_agreement: env_f64(
                    "CONFIDENCE_W_AGREEMENT",
                    defaults.confidence_weights.specialist_agreement,
                ),
                debate_stability: env_f64(
                    "CONFIDENCE_W_STABILITY",
                    defaults.confidence_weights.debate_stability,
                ),
                router_confidence: env_f64(
                    "CONFIDENCE_W_ROUTER",
                    defaults.confidence_weights.router_confidence,
                ),
            },
            exhausted_confidence_cap: env_f64(
                "EXHAUSTED_CONFIDENCE_CAP",
                defaults.exhausted_confidence_cap,
            ),
            request_budget: Duration::from_secs(env_u64(
                "REQUEST_BUDGET_SECS",
                defaults.request_budget.as_secs(),
            )),
            specialist_timeout: Duration::from_secs(env_u64(
                "SPECIALIST_TIMEOUT_SECS",
                defaults.specialist_timeout.as_secs(),
            )),
            session_idle_window: Duration::from_secs(env_u64(
                "SESSION_IDLE_SECS",
                defaults.session_idle_window.as_secs(),
            )),
            event_queue_capacity: env_u64(
                "EVENT_QUEUE_CAPACITY",
                defaults.event_queue_capacity as u64,
            ) as usize,
            gateway_max_concurrency: env_u64(
                "GATEWAY_MAX_CONCURRENCY",
                defaults.gateway_max_concurrency as u64,
            ) as usize,
            draft_max_tokens: env_u64("DRAFT_MAX_TOKENS", defaults.draft_max_tokens as u64) as u32,
            draft_temperature: env_f64("DRAFT_TEMPERATURE", defaults.draft_temperature as f64)
                as f32,
        }
    }
}

fn env_f64(key: &str, fallback: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(fallback)
}

fn env_u64(key: &str, fallback: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(fallback)
}
