//! Research specialist - catalyst aggregation from the news feed

use super::{symbol_of, Specialist, SpecialistOutput};
use crate::error::OrchestrationError;
use crate::market::MarketDataProvider;
use crate::models::{ContextSnapshot, SpecialistTag, Stance};
use crate::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Net polarity beyond which research takes a directional stance.
const DIRECTIONAL_CUTOFF: f64 = 0.3;

pub struct ResearchSpecialist {
    provider: Arc<dyn MarketDataProvider>,
}

impl ResearchSpecialist {
    pub fn new(provider: Arc<dyn MarketDataProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Specialist for ResearchSpecialist {
    fn tag(&self) -> SpecialistTag {
        SpecialistTag::Research
    }

    async fn analyze(&self, snapshot: &ContextSnapshot) -> Result<SpecialistOutput> {
        let symbol = symbol_of(snapshot);
        let headlines = self.provider.headlines(symbol).await?;

        if headlines.is_empty() {
            return Err(OrchestrationError::SpecialistError(format!(
                "no research catalysts found for {}",
                symbol
            )));
        }

        let positive = headlines.iter().filter(|h| h.polarity > 0.0).count();
        let negative = headlines.iter().filter(|h| h.polarity < 0.0).count();
        let net: f64 = headlines.iter().map(|h| h.polarity).sum();

        let stance = if net > DIRECTIONAL_CUTOFF {
            Stance::Bullish
        } else if net < -DIRECTIONAL_CUTOFF {
            Stance::Bearish
        } else {
            Stance::Neutral
        };

        let catalysts: Vec<&str> = headlines.iter().map(|h| h.title.as_str()).collect();

        Ok(SpecialistOutput {
            stance: Some(stance),
            payload: json!({
                "symbol": symbol,
                "catalysts": catalysts,
                "positive_count": positive,
                "negative_count": negative,
                "net_polarity": net,
            }),
            narrative: format!(
                "Research on {symbol}: {} supportive and {} adverse catalysts in the current cycle (net {net:+.2}).",
                positive, negative
            ),
        })
    }
}
