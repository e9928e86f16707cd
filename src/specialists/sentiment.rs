//! Sentiment specialist - headline polarity aggregation

use super::{symbol_of, Specialist, SpecialistOutput};
use crate::error::OrchestrationError;
use crate::market::MarketDataProvider;
use crate::models::{ContextSnapshot, SpecialistTag, Stance};
use crate::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

const BULLISH_CUTOFF: f64 = 0.15;
const BEARISH_CUTOFF: f64 = -0.15;

pub struct SentimentSpecialist {
    provider: Arc<dyn MarketDataProvider>,
}

impl SentimentSpecialist {
    pub fn new(provider: Arc<dyn MarketDataProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Specialist for SentimentSpecialist {
    fn tag(&self) -> SpecialistTag {
        SpecialistTag::Sentiment
    }

    async fn analyze(&self, snapshot: &ContextSnapshot) -> Result<SpecialistOutput> {
        let symbol = symbol_of(snapshot);
        let headlines = self.provider.headlines(symbol).await?;

        if headlines.is_empty() {
            return Err(OrchestrationError::SpecialistError(format!(
                "no headline flow for {}",
                symbol
            )));
        }

        let score =
            headlines.iter().map(|h| h.polarity).sum::<f64>() / headlines.len() as f64;

        let stance = if score > BULLISH_CUTOFF {
            Stance::Bullish
        } else if score < BEARISH_CUTOFF {
            Stance::Bearish
        } else {
            Stance::Neutral
        };

        let label = match stance {
            Stance::Bullish => "positive",
            Stance::Bearish => "negative",
            Stance::Neutral => "mixed",
        };

        Ok(SpecialistOutput {
            stance: Some(stance),
            payload: json!({
                "symbol": symbol,
                "score": score,
                "headline_count": headlines.len(),
            }),
            narrative: format!(
                "Headline sentiment for {symbol} is {label} ({score:+.2}) across {} recent items.",
                headlines.len()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::SyntheticMarketData;
    use crate::models::AccountScope;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_sentiment_scores_headlines() {
        let specialist = SentimentSpecialist::new(Arc::new(SyntheticMarketData));
        let snapshot = ContextSnapshot {
            correlation_id: Uuid::new_v4(),
            query: "mood on MSFT?".to_string(),
            symbol: Some("MSFT".to_string()),
            account_scope: AccountScope::All,
        };

        let output = specialist.analyze(&snapshot).await.unwrap();
        assert!(output.stance.is_some());
        let score = output.payload["score"].as_f64().unwrap();
        assert!((-1.0..=1.0).contains(&score));
    }
}
