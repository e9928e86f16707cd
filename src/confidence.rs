//! Adversarial confidence estimator
//!
//! Deterministic weighted blend of specialist agreement, debate stability,
//! and router confidence. Same debate transcript and specialist set in,
//! same score out; there is no learned component.

use crate::config::ConfidenceWeights;
use crate::models::{
    ConfidenceBreakdown, ConfidenceScore, DebateTurn, RobustnessLabel, Speaker, SpecialistResult,
    Verdict,
};
use std::collections::HashMap;

/// Stability penalty per critic turn beyond the first.
const TURN_PENALTY: f64 = 0.2;
/// Bonus when a later rationale explicitly marks the critique resolved.
const RESOLUTION_BONUS: f64 = 0.05;
/// Agreement multiplier when fewer than half the specialists succeeded.
const DEGRADED_FACTOR: f64 = 0.5;

const RESOLVED_MARKERS: &[&str] = &["addressed", "resolved", "mitigated"];
const NEGATION_MARKERS: &[&str] = &["not ", "never ", "failed to", "un-addressed"];

pub struct ConfidenceEstimator {
    weights: ConfidenceWeights,
    exhausted_cap: f64,
}

impl ConfidenceEstimator {
    pub fn new(weights: ConfidenceWeights, exhausted_cap: f64) -> Self {
        Self {
            weights,
            exhausted_cap,
        }
    }

    pub fn estimate(
        &self,
        results: &[SpecialistResult],
        debate: &[DebateTurn],
        router_confidence: f64,
        degraded: bool,
        exhausted: bool,
    ) -> ConfidenceScore {
        let breakdown = ConfidenceBreakdown {
            specialist_agreement: specialist_agreement(results, degraded),
            debate_stability: debate_stability(debate),
            router_confidence: router_confidence.clamp(0.0, 1.0),
        };

        let weighted = self.weights.specialist_agreement * breakdown.specialist_agreement
            + self.weights.debate_stability * breakdown.debate_stability
            + self.weights.router_confidence * breakdown.router_confidence;
        let weighted = weighted.clamp(0.0, 1.0);

        // Exhausted debates and expired budgets never finalize above the cap.
        let capped = exhausted && weighted > self.exhausted_cap;
        let value = if capped {
            self.exhausted_cap
        } else {
            weighted
        };

        ConfidenceScore {
            value,
            breakdown,
            capped,
            label: RobustnessLabel::for_score(value),
        }
    }
}

/// Majority stance share over every specialist invoked. A failed
/// specialist contributes no stance but stays in the denominator, so a
/// partially failed burst always reads below its all-succeed baseline.
fn specialist_agreement(results: &[SpecialistResult], degraded: bool) -> f64 {
    if results.is_empty() {
        return 0.5;
    }

    let mut counts = HashMap::new();
    for result in results.iter().filter(|r| r.succeeded()) {
        if let Some(stance) = result.stance {
            *counts.entry(stance).or_insert(0usize) += 1;
        }
    }

    let majority = counts.values().copied().max().unwrap_or(0);
    let agreement = majority as f64 / results.len() as f64;

    if degraded {
        agreement * DEGRADED_FACTOR
    } else {
        agreement
    }
}

/// 1.0 when the critic approved on the first turn, decreasing per extra
/// turn required, scaled down hard when the final verdict stayed adverse.
fn debate_stability(debate: &[DebateTurn]) -> f64 {
    let critic_turns: Vec<_> = debate
        .iter()
        .filter(|t| t.speaker == Speaker::Critic)
        .collect();

    let Some(last) = critic_turns.last() else {
        return 0.5;
    };

    let mut stability = 1.0 - TURN_PENALTY * (critic_turns.len() as f64 - 1.0);

    stability *= match last.verdict {
        Verdict::Approve => 1.0,
        Verdict::Flag => 0.6,
        Verdict::Refute => 0.2,
    };

    for turn in critic_turns.iter().skip(1) {
        let rationale = turn.rationale.to_lowercase();
        let resolved = RESOLVED_MARKERS.iter().any(|m| rationale.contains(m))
            && !NEGATION_MARKERS.iter().any(|m| rationale.contains(m));
        if resolved {
            stability += RESOLUTION_BONUS;
        }
    }

    stability.clamp(0.0, 1.0)
}
