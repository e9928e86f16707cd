//! Critic - adversarial review of the proposer's thesis
//!
//! The critic reads the full thesis plus the specialist evidence and must
//! land on exactly one verdict: approve, flag (soft disagreement), or
//! refute (hard disagreement, blocks finalization until rebutted).

use crate::error::OrchestrationError;
use crate::gateway::{ModelGateway, ModelTier};
use crate::models::{SpecialistResult, Verdict};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CriticReview {
    pub verdict: Verdict,
    pub rationale: String,
}

#[async_trait]
pub trait Critic: Send + Sync {
    async fn review(
        &self,
        thesis: &str,
        evidence: &[SpecialistResult],
        turn_index: u32,
    ) -> Result<CriticReview>;
}

const CRITIC_SYSTEM_PROMPT: &str = r#"You are the risk critic - the contrarian. Your job is to find reasons the proposed strategy is wrong or dangerous before it reaches the user.

Review criteria:
1. Exposure: is the implied position size defensible?
2. Logic gaps: does the thesis ignore contrary evidence in the specialist data?
3. Tail risk: what single event breaks this thesis?
4. Crowding: is the trade consensus to the point of fragility?

Return ONLY valid JSON:
{"verdict": "approve" | "flag" | "refute", "rationale": "<sharp adversarial argument; required for flag and refute>"}"#;

/// Model-backed critic using the large (capable) tier.
pub struct LlmCritic {
    gateway: Arc<ModelGateway>,
}

impl LlmCritic {
    pub fn new(gateway: Arc<ModelGateway>) -> Self {
        Self { gateway }
    }

    fn build_prompt(thesis: &str, evidence: &[SpecialistResult], turn_index: u32) -> String {
        let mut evidence_block = String::new();
        for result in evidence {
            if result.succeeded() {
                evidence_block.push_str(&format!(
                    "- [{}] stance={:?}: {}\n",
                    result.tag, result.stance, result.narrative
                ));
            } else {
                evidence_block.push_str(&format!(
                    "- [{}] FAILED: {}\n",
                    result.tag,
                    result.error.as_deref().unwrap_or("unknown")
                ));
            }
        }

        format!(
            "{CRITIC_SYSTEM_PROMPT}\n\n[SPECIALIST EVIDENCE]\n{evidence_block}\n[PROPOSED THESIS - review turn {turn_index}]\n{thesis}\n\nAudit this thesis against the criteria."
        )
    }

    fn parse_review(raw: &str) -> Result<CriticReview> {
        let cleaned = raw
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();

        let json: serde_json::Value = serde_json::from_str(cleaned).map_err(|e| {
            OrchestrationError::SchemaViolation(format!(
                "critic output is not JSON: {} | raw={}",
                e, raw
            ))
        })?;

        let verdict = json
            .get("verdict")
            .and_then(|v| v.as_str())
            .and_then(Verdict::parse)
            .ok_or_else(|| {
                OrchestrationError::SchemaViolation(format!(
                    "critic output has no valid verdict: {}",
                    cleaned
                ))
            })?;

        let rationale = json
            .get("rationale")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        // Disagreement without a stated reason is not reviewable.
        if verdict != Verdict::Approve && rationale.trim().is_empty() {
            return Err(OrchestrationError::SchemaViolation(
                "critic disagreement is missing a rationale".into(),
            ));
        }

        Ok(CriticReview { verdict, rationale })
    }
}

#[async_trait]
impl Critic for LlmCritic {
    async fn review(
        &self,
        thesis: &str,
        evidence: &[SpecialistResult],
        turn_index: u32,
    ) -> Result<CriticReview> {
        let prompt = Self::build_prompt(thesis, evidence, turn_index);

        match self
            .gateway
            .generate(ModelTier::Large, &prompt, 512, 0.2)
            .await
            .and_then(|generation| Self::parse_review(&generation.text))
        {
            Ok(review) => {
                debug!(turn_index, verdict = ?review.verdict, "Critic review complete");
                Ok(review)
            }
            Err(e) => {
                // An unreviewable thesis is flagged, never silently approved.
                warn!(turn_index, error = %e, "Critic failed - downgrading to flag");
                Ok(CriticReview {
                    verdict: Verdict::Flag,
                    rationale: format!("critic unavailable for review: {}", e),
                })
            }
        }
    }
}

/// Test critic replaying a fixed verdict sequence.
pub struct ScriptedCritic {
    reviews: std::sync::Mutex<std::collections::VecDeque<CriticReview>>,
}

impl ScriptedCritic {
    pub fn new(reviews: Vec<CriticReview>) -> Self {
        Self {
            reviews: std::sync::Mutex::new(reviews.into_iter().collect()),
        }
    }

    pub fn approving() -> Self {
        Self::new(vec![CriticReview {
            verdict: Verdict::Approve,
            rationale: String::new(),
        }])
    }
}

#[async_trait]
impl Critic for ScriptedCritic {
    async fn review(
        &self,
        _thesis: &str,
        _evidence: &[SpecialistResult],
        _turn_index: u32,
    ) -> Result<CriticReview> {
        self.reviews.lock().unwrap().pop_front().ok_or_else(|| {
            OrchestrationError::BackendUnavailable("scripted critic exhausted".into())
        })
    }
}
