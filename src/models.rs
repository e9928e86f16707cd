//! Core data models for the advisory orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SpecialistTag {
    Quant,
    Sentiment,
    Forecast,
    Research,
    Whale,
}

impl SpecialistTag {
    pub const ALL: [SpecialistTag; 5] = [
        SpecialistTag::Quant,
        SpecialistTag::Sentiment,
        SpecialistTag::Forecast,
        SpecialistTag::Research,
        SpecialistTag::Whale,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SpecialistTag::Quant => "quant",
            SpecialistTag::Sentiment => "sentiment",
            SpecialistTag::Forecast => "forecast",
            SpecialistTag::Research => "research",
            SpecialistTag::Whale => "whale",
        }
    }
}

impl fmt::Display for SpecialistTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Directional stance a specialist takes on the queried instrument.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Stance {
    Bullish,
    Bearish,
    Neutral,
}

/// Closed set of intents the classifier may produce. Free-text routing is
/// never dispatched directly; it must land in one of these first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    PriceCheck,
    MarketAnalysis,
    PortfolioQuery,
    RiskAssessment,
    Educational,
}

impl IntentKind {
    /// Fixed intent -> specialist fan-out map.
    pub fn specialist_tags(&self) -> &'static [SpecialistTag] {
        match self {
            IntentKind::PriceCheck => &[SpecialistTag::Quant],
            IntentKind::MarketAnalysis => &SpecialistTag::ALL,
            IntentKind::PortfolioQuery => &[SpecialistTag::Quant, SpecialistTag::Forecast],
            IntentKind::RiskAssessment => &[
                SpecialistTag::Quant,
                SpecialistTag::Research,
                SpecialistTag::Whale,
            ],
            IntentKind::Educational => &[],
        }
    }

    pub fn parse(s: &str) -> Option<IntentKind> {
        match s.trim().to_lowercase().as_str() {
            "price_check" => Some(IntentKind::PriceCheck),
            "market_analysis" => Some(IntentKind::MarketAnalysis),
            "portfolio_query" => Some(IntentKind::PortfolioQuery),
            "risk_assessment" => Some(IntentKind::RiskAssessment),
            "educational" => Some(IntentKind::Educational),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccountScope {
    All,
    Isa,
    Invest,
}

impl Default for AccountScope {
    fn default() -> Self {
        AccountScope::All
    }
}

/// Which model produced a reasoning segment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceModel {
    Small,
    Large,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Proposer,
    Critic,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approve,
    Flag,
    Refute,
}

impl Verdict {
    pub fn parse(s: &str) -> Option<Verdict> {
        match s.trim().to_lowercase().as_str() {
            "approve" | "approved" => Some(Verdict::Approve),
            "flag" | "flagged" => Some(Verdict::Flag),
            "refute" | "refuted" | "blocked" => Some(Verdict::Refute),
            _ => None,
        }
    }
}

/// Confidence bucket surfaced alongside the scalar score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RobustnessLabel {
    BattleTested,
    Verified,
    Cautionary,
    HighEntropy,
}

impl RobustnessLabel {
    pub fn for_score(score: f64) -> Self {
        if score >= 0.85 {
            RobustnessLabel::BattleTested
        } else if score >= 0.70 {
            RobustnessLabel::Verified
        } else if score >= 0.50 {
            RobustnessLabel::Cautionary
        } else {
            RobustnessLabel::HighEntropy
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Buy,
    Sell,
    Rebalance,
    Hold,
}

//
// ================= Request =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryRequest {
    pub query: String,
    pub symbol: Option<String>,
    #[serde(default)]
    pub account_scope: AccountScope,
}

/// Typed result of intent classification. Dispatch is validated against
/// the closed `IntentKind` enum before any specialist runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    pub tags: Vec<SpecialistTag>,
    pub symbol: Option<String>,
    pub reason: String,
}

/// Read-only view of the request handed to each specialist. Specialists
/// never see the mutable decision state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub correlation_id: Uuid,
    pub query: String,
    pub symbol: Option<String>,
    pub account_scope: AccountScope,
}

//
// ================= Specialist Output =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialistResult {
    pub tag: SpecialistTag,
    pub stance: Option<Stance>,
    pub payload: serde_json::Value,
    pub narrative: String,
    pub latency_ms: u64,
    pub error: Option<String>,
}

impl SpecialistResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn failure(tag: SpecialistTag, error: String, latency_ms: u64) -> Self {
        Self {
            tag,
            stance: None,
            payload: serde_json::Value::Null,
            narrative: String::new(),
            latency_ms,
            error: Some(error),
        }
    }
}

//
// ================= Reasoning =================
//

/// Per-segment entropy summary over the producing model's token stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EntropySummary {
    pub mean: f64,
    pub max: f64,
    pub token_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningSegment {
    pub index: usize,
    pub text: String,
    pub source_model: SourceModel,
    pub entropy: EntropySummary,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateTurn {
    pub turn_index: u32,
    pub speaker: Speaker,
    pub verdict: Verdict,
    pub rationale: String,
}

//
// ================= Confidence =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceBreakdown {
    pub specialist_agreement: f64,
    pub debate_stability: f64,
    pub router_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceScore {
    pub value: f64,
    pub breakdown: ConfidenceBreakdown,
    pub capped: bool,
    pub label: RobustnessLabel,
}

//
// ================= Actions =================
//

/// The core only ever proposes; execution requires a signed token at the
/// external authorization boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedAction {
    pub kind: ActionKind,
    pub symbol: Option<String>,
    pub rationale: String,
    pub requires_authorization: bool,
}

//
// ================= Decision Context =================
//

/// Per-request decision state. Owned exclusively by the coordinating task
/// for the lifetime of one request; immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionContext {
    pub correlation_id: Uuid,
    pub query: String,
    pub account_scope: AccountScope,
    pub intent: Option<Intent>,
    pub specialist_results: Vec<SpecialistResult>,
    pub segments: Vec<ReasoningSegment>,
    pub thesis: String,
    pub debate: Vec<DebateTurn>,
    pub confidence: Option<ConfidenceScore>,
    pub degraded: bool,
    pub created_at: DateTime<Utc>,
}

impl DecisionContext {
    pub fn new(correlation_id: Uuid, request: &AdvisoryRequest) -> Self {
        Self {
            correlation_id,
            query: request.query.clone(),
            account_scope: request.account_scope,
            intent: None,
            specialist_results: Vec::new(),
            segments: Vec::new(),
            thesis: String::new(),
            debate: Vec::new(),
            confidence: None,
            degraded: false,
            created_at: Utc::now(),
        }
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            correlation_id: self.correlation_id,
            query: self.query.clone(),
            symbol: self.intent.as_ref().and_then(|i| i.symbol.clone()),
            account_scope: self.account_scope,
        }
    }
}

//
// ================= Final Result =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryOutcome {
    pub correlation_id: Uuid,
    pub thesis: String,
    pub confidence: ConfidenceScore,
    /// Last unresolved critic objection, verbatim, when the debate ended
    /// without approval.
    pub unresolved_objection: Option<String>,
    pub proposed_actions: Vec<ProposedAction>,
    pub degraded: bool,
}

//
// ================= Trace =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceRecord {
    pub correlation_id: Uuid,
    pub hop_index: u32,
    pub component: String,
    pub input_digest: String,
    pub output_digest: String,
    /// Chains over the previous record's chain digest for this correlation
    /// id; genesis hops chain over a zero digest.
    pub chain_digest: String,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_tag_map_is_closed() {
        for kind in [
            IntentKind::PriceCheck,
            IntentKind::MarketAnalysis,
            IntentKind::PortfolioQuery,
            IntentKind::RiskAssessment,
            IntentKind::Educational,
        ] {
            for tag in kind.specialist_tags() {
                assert!(SpecialistTag::ALL.contains(tag));
            }
        }
    }

    #[test]
    fn test_verdict_parse_accepts_critic_aliases() {
        assert_eq!(Verdict::parse("APPROVED"), Some(Verdict::Approve));
        assert_eq!(Verdict::parse("flagged"), Some(Verdict::Flag));
        assert_eq!(Verdict::parse("BLOCKED"), Some(Verdict::Refute));
        assert_eq!(Verdict::parse("maybe"), None);
    }

    #[test]
    fn test_robustness_buckets() {
        assert_eq!(RobustnessLabel::for_score(0.9), RobustnessLabel::BattleTested);
        assert_eq!(RobustnessLabel::for_score(0.7), RobustnessLabel::Verified);
        assert_eq!(RobustnessLabel::for_score(0.5), RobustnessLabel::Cautionary);
        assert_eq!(RobustnessLabel::for_score(0.1), RobustnessLabel::HighEntropy);
    }
}
