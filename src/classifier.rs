//! Intent classifier
//!
//! Produces a typed `Intent` validated against the closed `IntentKind`
//! enum before any specialist dispatch. Deterministic keyword routing
//! handles the common shapes; ambiguous queries fall back to a single
//! structured call to the small model, and a routing fallback guarantees
//! classification never fails the request.

use crate::error::OrchestrationError;
use crate::gateway::{ModelGateway, ModelTier};
use crate::models::{Intent, IntentKind};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, warn};

/// Static keyword lists — zero allocation
const PRICE_KEYWORDS: &[&str] = &[
    "price", "quote", "trading at", "worth", "how much", "current level",
];

const PORTFOLIO_KEYWORDS: &[&str] = &[
    "portfolio", "position", "holding", "allocation", "rebalance", "exposure", "my account",
];

const RISK_KEYWORDS: &[&str] = &[
    "risk", "safe", "downside", "hedge", "drawdown", "protect", "volatile",
];

const EDUCATIONAL_KEYWORDS: &[&str] = &[
    "what is", "what are", "explain", "definition", "meaning", "how does", "difference between",
];

const ANALYSIS_KEYWORDS: &[&str] = &[
    "should i", "buy", "sell", "add to", "trim", "analyze", "outlook", "thesis", "recommend",
];

pub struct IntentClassifier {
    gateway: Arc<ModelGateway>,
}

impl IntentClassifier {
    pub fn new(gateway: Arc<ModelGateway>) -> Self {
        Self { gateway }
    }

    /// Classify a query into a typed intent. Never fails: when both the
    /// keyword pass and the structured model call are inconclusive, routing
    /// falls back to a full market analysis.
    pub async fn classify(&self, query: &str) -> Intent {
        let symbol = extract_symbol(query);

        if let Some(kind) = classify_by_keywords(query) {
            debug!(?kind, ?symbol, "Intent resolved by keywords");
            return build_intent(kind, symbol, "keyword routing");
        }

        match self.classify_via_model(query).await {
            Ok((kind, model_symbol)) => {
                debug!(?kind, "Intent resolved by routing model");
                build_intent(kind, model_symbol.or(symbol), "routing model")
            }
            Err(e) => {
                warn!(error = %e, "Routing model failed - using fallback intent");
                build_intent(IntentKind::MarketAnalysis, symbol, "routing fallback")
            }
        }
    }

    /// One structured call, parsed strictly against the closed enum. Any
    /// free text outside the expected JSON shape is a schema violation.
    async fn classify_via_model(&self, query: &str) -> Result<(IntentKind, Option<String>)> {
        let clean_query: String = query.trim().chars().take(500).collect();
        let prompt = format!(
            r#"You route financial queries to specialist agents.

Valid intents: price_check, market_analysis, portfolio_query, risk_assessment, educational.

Return ONLY valid JSON, no explanation:
{{"intent": "<one valid intent>", "symbol": "<ticker or null>"}}

Query: "{}""#,
            clean_query
        );

        let generation = self
            .gateway
            .generate(ModelTier::Small, &prompt, 64, 0.0)
            .await?;

        let cleaned = generation
            .text
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();

        let json: serde_json::Value = serde_json::from_str(cleaned).map_err(|e| {
            OrchestrationError::SchemaViolation(format!(
                "routing output is not JSON: {} | raw={}",
                e, generation.text
            ))
        })?;

        let kind = json
            .get("intent")
            .and_then(|v| v.as_str())
            .and_then(IntentKind::parse)
            .ok_or_else(|| {
                OrchestrationError::SchemaViolation(format!(
                    "routing output has no valid intent: {}",
                    cleaned
                ))
            })?;

        let symbol = json
            .get("symbol")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("none"))
            .map(|s| s.to_uppercase());

        Ok((kind, symbol))
    }
}

fn build_intent(kind: IntentKind, symbol: Option<String>, reason: &str) -> Intent {
    Intent {
        kind,
        tags: kind.specialist_tags().to_vec(),
        symbol,
        reason: reason.to_string(),
    }
}

fn classify_by_keywords(query: &str) -> Option<IntentKind> {
    let lowered = query.to_lowercase();
    let has_any = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));

    // Educational phrasing wins: "what is RSI" should never fan out.
    if has_any(EDUCATIONAL_KEYWORDS) && !has_any(ANALYSIS_KEYWORDS) {
        return Some(IntentKind::Educational);
    }

    if has_any(PORTFOLIO_KEYWORDS) && !has_any(ANALYSIS_KEYWORDS) {
        return Some(IntentKind::PortfolioQuery);
    }

    if has_any(RISK_KEYWORDS) && !has_any(ANALYSIS_KEYWORDS) {
        return Some(IntentKind::RiskAssessment);
    }

    if has_any(PRICE_KEYWORDS) && !has_any(ANALYSIS_KEYWORDS) {
        return Some(IntentKind::PriceCheck);
    }

    if has_any(ANALYSIS_KEYWORDS) {
        return Some(IntentKind::MarketAnalysis);
    }

    None
}

/// Find a ticker-shaped token: 2-5 uppercase letters, not a common word.
fn extract_symbol(query: &str) -> Option<String> {
    const STOPWORDS: &[&str] = &["I", "A", "ETF", "RSI", "SMA", "EMA", "MACD", "OK", "USD", "GBP"];

    query
        .split(|c: char| !c.is_ascii_alphanumeric())
        .find(|w| {
            w.len() >= 2
                && w.len() <= 5
                && w.chars().all(|c| c.is_ascii_uppercase())
                && !STOPWORDS.contains(w)
        })
        .map(|w| w.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_routing() {
        assert_eq!(
            classify_by_keywords("what is a moving average?"),
            Some(IntentKind::Educational)
        );
        assert_eq!(
            classify_by_keywords("how is my portfolio allocation looking"),
            Some(IntentKind::PortfolioQuery)
        );
        assert_eq!(
            classify_by_keywords("is NVDA too risky here"),
            Some(IntentKind::RiskAssessment)
        );
        assert_eq!(
            classify_by_keywords("should I add to my tech position?"),
            Some(IntentKind::MarketAnalysis)
        );
    }

    #[test]
    fn test_analysis_phrasing_outranks_topic_keywords() {
        // "should I" forces full analysis even when risk words appear.
        assert_eq!(
            classify_by_keywords("should I hedge the downside in AAPL?"),
            Some(IntentKind::MarketAnalysis)
        );
    }

    #[test]
    fn test_symbol_extraction() {
        assert_eq!(extract_symbol("should I add to NVDA here?"), Some("NVDA".into()));
        assert_eq!(extract_symbol("what is RSI?"), None);
        assert_eq!(extract_symbol("thoughts on the market"), None);
    }

    #[test]
    fn test_intent_carries_closed_tag_set() {
        let intent = build_intent(IntentKind::RiskAssessment, None, "test");
        assert_eq!(intent.tags, IntentKind::RiskAssessment.specialist_tags());
    }
}
