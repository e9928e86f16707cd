//! R-Stitch router
//!
//! Drafts reasoning with the small model and escalates individual
//! sentence-level segments to the large model when the small model's token
//! entropy crosses the configured threshold. Escalated output is spliced
//! back in place so the trajectory reads as one narrative. The router
//! never blocks waiting for a "certain enough" answer: if the large model
//! is itself uncertain, or unreachable after its local retries, the
//! segment is emitted anyway and flagged low-confidence.

use crate::config::OrchestratorConfig;
use crate::error::OrchestrationError;
use crate::gateway::{split_sentences, ModelGateway, ModelTier};
use crate::models::{EntropySummary, ReasoningSegment, SourceModel};
use crate::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A completed draft: the stitched trajectory plus routing telemetry.
#[derive(Debug, Clone)]
pub struct DraftOutput {
    pub segments: Vec<ReasoningSegment>,
    pub thesis: String,
    /// 1 - mean entropy of the committed segments, in [0, 1].
    pub router_confidence: f64,
    pub escalated_count: usize,
}

pub struct RStitchRouter {
    gateway: Arc<ModelGateway>,
}

impl RStitchRouter {
    pub fn new(gateway: Arc<ModelGateway>) -> Self {
        Self { gateway }
    }

    /// Produce a stitched draft for `prompt`. Segment indices continue from
    /// `start_index` so rebuttal drafts extend the original trajectory.
    pub async fn draft(
        &self,
        prompt: &str,
        start_index: usize,
        cfg: &OrchestratorConfig,
        cancel: &CancellationToken,
    ) -> Result<DraftOutput> {
        let small_draft = self
            .gateway
            .generate(
                ModelTier::Small,
                prompt,
                cfg.draft_max_tokens,
                cfg.draft_temperature,
            )
            .await?;

        let sentences: Vec<String> = split_sentences(&small_draft.text)
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        if sentences.is_empty() {
            return Err(OrchestrationError::SchemaViolation(
                "small model returned an empty draft".into(),
            ));
        }

        let spans = entropy_spans(&sentences, &small_draft.token_entropies);

        let mut segments: Vec<ReasoningSegment> = Vec::with_capacity(sentences.len());
        let mut committed = String::new();
        let mut escalated_count = 0;

        // Segment decisions are sequential: each escalation prompt carries
        // the text committed so far.
        for (i, (sentence, span)) in sentences.iter().zip(spans.iter()).enumerate() {
            if cancel.is_cancelled() {
                return Err(OrchestrationError::Aborted("draft cancelled".into()));
            }

            let summary = summarize(span);
            let segment = if summary.mean <= cfg.entropy_threshold {
                ReasoningSegment {
                    index: start_index + i,
                    text: seal_boundary(sentence),
                    source_model: SourceModel::Small,
                    entropy: summary,
                    low_confidence: false,
                }
            } else {
                escalated_count += 1;
                self.escalate(prompt, &committed, sentence, start_index + i, summary, cfg)
                    .await
            };

            if !committed.is_empty() {
                committed.push(' ');
            }
            committed.push_str(&segment.text);
            segments.push(segment);
        }

        let mean_entropy =
            segments.iter().map(|s| s.entropy.mean).sum::<f64>() / segments.len() as f64;
        let router_confidence = (1.0 - mean_entropy).clamp(0.0, 1.0);

        debug!(
            segments = segments.len(),
            escalated = escalated_count,
            router_confidence,
            "Draft stitched"
        );

        Ok(DraftOutput {
            thesis: committed,
            segments,
            router_confidence,
            escalated_count,
        })
    }

    /// Re-issue one uncertain segment to the large model and splice the
    /// replacement in place.
    async fn escalate(
        &self,
        task_prompt: &str,
        committed: &str,
        uncertain_sentence: &str,
        index: usize,
        small_summary: EntropySummary,
        cfg: &OrchestratorConfig,
    ) -> ReasoningSegment {
        let prompt = format!(
            "{task_prompt}\n\nNarrative so far:\n{committed}\n\nThe next sentence was drafted with low confidence:\n\"{uncertain_sentence}\"\n\nRewrite that one sentence precisely, preserving the surrounding flow. Return only the sentence."
        );

        match self
            .gateway
            .generate(ModelTier::Large, &prompt, cfg.draft_max_tokens, 0.2)
            .await
        {
            Ok(generation) => {
                let sentences = split_sentences(&generation.text);
                let replacement = sentences.first().copied().unwrap_or(uncertain_sentence);
                let spans = entropy_spans(
                    &[replacement.to_string()],
                    &generation.token_entropies,
                );
                let summary = summarize(&spans[0]);

                // Even the large model can be uncertain; emit regardless.
                let low_confidence = summary.mean > cfg.high_entropy_threshold;
                if low_confidence {
                    warn!(index, mean = summary.mean, "Large model segment above high-entropy threshold");
                }

                ReasoningSegment {
                    index,
                    text: seal_boundary(replacement),
                    source_model: SourceModel::Large,
                    entropy: summary,
                    low_confidence,
                }
            }
            Err(e) => {
                // The gateway already spent its retry budget; keep the small
                // draft rather than stall the trajectory.
                warn!(index, error = %e, "Escalation failed - keeping small-model segment");
                ReasoningSegment {
                    index,
                    text: seal_boundary(uncertain_sentence),
                    source_model: SourceModel::Small,
                    entropy: small_summary,
                    low_confidence: true,
                }
            }
        }
    }
}

/// Map the draft's token entropies onto its sentences proportionally by
/// word position, so backends with non-word tokenizations still yield a
/// usable per-segment signal.
fn entropy_spans(sentences: &[String], token_entropies: &[f64]) -> Vec<Vec<f64>> {
    let word_counts: Vec<usize> = sentences
        .iter()
        .map(|s| s.split_whitespace().count().max(1))
        .collect();
    let total_words: usize = word_counts.iter().sum();
    let total_tokens = token_entropies.len();

    if total_tokens == 0 {
        return word_counts.iter().map(|_| vec![0.0]).collect();
    }

    let mut spans = Vec::with_capacity(sentences.len());
    let mut word_cursor = 0usize;
    for count in word_counts {
        let start = word_cursor * total_tokens / total_words;
        word_cursor += count;
        let end = (word_cursor * total_tokens / total_words).max(start + 1);
        spans.push(token_entropies[start..end.min(total_tokens)].to_vec());
    }
    spans
}

fn summarize(span: &[f64]) -> EntropySummary {
    if span.is_empty() {
        return EntropySummary {
            mean: 0.0,
            max: 0.0,
            token_count: 0,
        };
    }
    EntropySummary {
        mean: span.iter().sum::<f64>() / span.len() as f64,
        max: span.iter().cloned().fold(0.0, f64::max),
        token_count: span.len(),
    }
}

/// Boundary sanity check: collapse internal whitespace and make sure the
/// segment closes a clause.
fn seal_boundary(text: &str) -> String {
    let mut sealed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if !sealed.ends_with(['.', '!', '?']) {
        sealed.push('.');
    }
    sealed
}
