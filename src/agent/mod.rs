//! Orchestrator - the proposer side of the advisory loop
//!
//! CLASSIFYING → GATHERING → DRAFTING → DEBATING → FINALIZING → DONE
//!
//! DEBATING loops back to DRAFTING once per critic refutation, bounded by
//! the configured turn budget. Terminal states are DONE and ABORTED; the
//! client always sees exactly one `final` or `error` event either way.

use crate::classifier::IntentClassifier;
use crate::config::OrchestratorConfig;
use crate::confidence::ConfidenceEstimator;
use crate::critic::Critic;
use crate::error::OrchestrationError;
use crate::models::{
    ActionKind, AdvisoryOutcome, AdvisoryRequest, DebateTurn, DecisionContext, IntentKind,
    ProposedAction, Speaker, SpecialistResult, Stance, Verdict,
};
use crate::router::RStitchRouter;
use crate::specialists::SpecialistRegistry;
use crate::stream::{FinalPayload, StreamEvent};
use crate::telemetry::{TraceRecorder, TraceWriter};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Orchestration phases, surfaced verbatim in `status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Classifying,
    Gathering,
    Drafting,
    Debating,
    Finalizing,
    Done,
    Aborted,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Classifying => "classifying",
            Phase::Gathering => "gathering",
            Phase::Drafting => "drafting",
            Phase::Debating => "debating",
            Phase::Finalizing => "finalizing",
            Phase::Done => "done",
            Phase::Aborted => "aborted",
        }
    }
}

pub struct Orchestrator {
    classifier: IntentClassifier,
    registry: Arc<SpecialistRegistry>,
    router: RStitchRouter,
    critic: Box<dyn Critic>,
    estimator: ConfidenceEstimator,
    trace_writer: TraceWriter,
    cfg: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        classifier: IntentClassifier,
        registry: Arc<SpecialistRegistry>,
        router: RStitchRouter,
        critic: Box<dyn Critic>,
        estimator: ConfidenceEstimator,
        trace_writer: TraceWriter,
        cfg: OrchestratorConfig,
    ) -> Self {
        Self {
            classifier,
            registry,
            router,
            critic,
            estimator,
            trace_writer,
            cfg,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.cfg
    }

    /// Run one advisory request to completion. Emits ordered events into
    /// `events` (consumed by the stream publisher) and records one trace
    /// hop per component touched. Returns the outcome that backs the
    /// terminal `final` event, or the error that backed the terminal
    /// `error` event.
    pub async fn run(
        &self,
        request: AdvisoryRequest,
        correlation_id: Uuid,
        events: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<AdvisoryOutcome> {
        let mut recorder = TraceRecorder::new(correlation_id, self.trace_writer.clone());

        info!(
            %correlation_id,
            query = %request.query,
            "Orchestrator: starting request"
        );

        match self
            .drive(&request, correlation_id, &events, &cancel, &mut recorder)
            .await
        {
            Ok(outcome) => {
                emit(
                    &events,
                    StreamEvent::Final(FinalPayload {
                        correlation_id,
                        thesis: outcome.thesis.clone(),
                        confidence: outcome.confidence.clone(),
                        unresolved_objection: outcome.unresolved_objection.clone(),
                        proposed_actions: outcome.proposed_actions.clone(),
                        degraded: outcome.degraded,
                    }),
                )
                .await;
                info!(
                    %correlation_id,
                    phase = Phase::Done.as_str(),
                    confidence = outcome.confidence.value,
                    "Orchestrator: done"
                );
                Ok(outcome)
            }
            Err(e) => {
                // The terminal error event still gets a trace hop so the
                // event stream and the trace stay reconcilable.
                recorder.hop("error", &request.query, &e.to_string(), 0);
                emit(
                    &events,
                    StreamEvent::Error {
                        kind: e.kind().to_string(),
                        reason: e.to_string(),
                        aborted: matches!(e, OrchestrationError::Aborted(_)),
                    },
                )
                .await;
                warn!(
                    %correlation_id,
                    phase = Phase::Aborted.as_str(),
                    error = %e,
                    "Orchestrator: aborted"
                );
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        request: &AdvisoryRequest,
        correlation_id: Uuid,
        events: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
        recorder: &mut TraceRecorder,
    ) -> Result<AdvisoryOutcome> {
        let started = Instant::now();
        let deadline = started + self.cfg.request_budget;
        let mut ctx = DecisionContext::new(correlation_id, request);

        // === CLASSIFYING ===
        status(events, Phase::Classifying, "Classifying intent").await;

        let t = Instant::now();
        let mut intent = self.classifier.classify(&ctx.query).await;
        if intent.symbol.is_none() {
            intent.symbol = request.symbol.clone();
        }
        recorder.hop(
            "classifier",
            &ctx.query,
            &intent,
            t.elapsed().as_millis() as u64,
        );
        debug!(kind = ?intent.kind, tags = intent.tags.len(), "Intent classified");
        ctx.intent = Some(intent.clone());

        // === GATHERING ===
        if !intent.tags.is_empty() {
            status(
                events,
                Phase::Gathering,
                format!("Consulting {} specialists", intent.tags.len()),
            )
            .await;
            self.gather(&mut ctx, &intent.tags, events, cancel, recorder)
                .await?;
        }

        // === DRAFTING ===
        status(events, Phase::Drafting, "Drafting thesis").await;

        let prompt = draft_prompt(&ctx);
        let t = Instant::now();
        let draft = self.router.draft(&prompt, 0, &self.cfg, cancel).await?;
        recorder.hop(
            "router",
            &prompt,
            &draft.thesis,
            t.elapsed().as_millis() as u64,
        );
        for segment in &draft.segments {
            emit(events, StreamEvent::ReasoningSegment(segment.clone())).await;
        }
        ctx.segments = draft.segments;
        ctx.thesis = draft.thesis;
        let mut router_confidence = draft.router_confidence;

        // === DEBATING ===
        // Every thesis is reviewed at least once, trivial or not.
        let max_turns = self.cfg.max_debate_turns.max(1);
        let mut approved = false;
        let mut exhausted = false;
        let mut turn_index = 0u32;

        while turn_index < max_turns {
            if cancel.is_cancelled() {
                return Err(OrchestrationError::Aborted(
                    "client abort during debate".into(),
                ));
            }
            if Instant::now() >= deadline {
                warn!(%correlation_id, "Request budget exhausted mid-debate - finalizing");
                exhausted = true;
                break;
            }

            status(
                events,
                Phase::Debating,
                format!("Risk review turn {}", turn_index + 1),
            )
            .await;

            let t = Instant::now();
            let review = self
                .critic
                .review(&ctx.thesis, &ctx.specialist_results, turn_index)
                .await?;
            let turn = DebateTurn {
                turn_index,
                speaker: Speaker::Critic,
                verdict: review.verdict,
                rationale: review.rationale.clone(),
            };
            recorder.hop("critic", &ctx.thesis, &turn, t.elapsed().as_millis() as u64);
            emit(events, StreamEvent::DebateTurn(turn.clone())).await;
            ctx.debate.push(turn);
            turn_index += 1;

            match review.verdict {
                Verdict::Approve => {
                    approved = true;
                    break;
                }
                // Soft disagreement: recorded and surfaced, does not block.
                Verdict::Flag => break,
                Verdict::Refute => {
                    if turn_index >= max_turns || Instant::now() >= deadline {
                        exhausted = true;
                        break;
                    }

                    // Loop back to DRAFTING with the critique in context.
                    status(events, Phase::Drafting, "Drafting rebuttal").await;

                    let rebuttal_prompt = rebuttal_prompt(&ctx, &review.rationale);
                    let t = Instant::now();
                    let rebuttal = self
                        .router
                        .draft(&rebuttal_prompt, ctx.segments.len(), &self.cfg, cancel)
                        .await?;
                    recorder.hop(
                        "router",
                        &rebuttal_prompt,
                        &rebuttal.thesis,
                        t.elapsed().as_millis() as u64,
                    );
                    for segment in &rebuttal.segments {
                        emit(events, StreamEvent::ReasoningSegment(segment.clone())).await;
                    }
                    ctx.segments.extend(rebuttal.segments);
                    ctx.thesis = rebuttal.thesis;
                    router_confidence = rebuttal.router_confidence;
                }
            }
        }

        // === FINALIZING ===
        status(events, Phase::Finalizing, "Computing confidence").await;

        let exhausted = exhausted || Instant::now() >= deadline;
        let confidence = self.estimator.estimate(
            &ctx.specialist_results,
            &ctx.debate,
            router_confidence,
            ctx.degraded,
            exhausted,
        );
        recorder.hop("confidence", &ctx.debate, &confidence, 0);
        ctx.confidence = Some(confidence.clone());

        // An unresolved objection is surfaced verbatim, never discarded.
        let unresolved_objection = if approved {
            None
        } else {
            ctx.debate
                .iter()
                .rev()
                .find(|t| t.speaker == Speaker::Critic)
                .map(|t| t.rationale.clone())
        };

        let proposed_actions = derive_actions(&ctx);
        let outcome = AdvisoryOutcome {
            correlation_id,
            thesis: ctx.thesis.clone(),
            confidence,
            unresolved_objection,
            proposed_actions,
            degraded: ctx.degraded,
        };
        recorder.hop(
            "finalizer",
            &ctx.thesis,
            &outcome,
            started.elapsed().as_millis() as u64,
        );

        Ok(outcome)
    }

    /// Fan out the specialist burst and wait for every member to settle -
    /// a join, never a race. Individual failures are isolated into their
    /// result rows; only a fully failed burst aborts the request.
    async fn gather(
        &self,
        ctx: &mut DecisionContext,
        tags: &[crate::models::SpecialistTag],
        events: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
        recorder: &mut TraceRecorder,
    ) -> Result<()> {
        let snapshot = ctx.snapshot();
        let mut join_set = JoinSet::new();

        for tag in tags {
            let registry = Arc::clone(&self.registry);
            let snapshot = snapshot.clone();
            let timeout = self.cfg.specialist_timeout;
            let tag = *tag;
            join_set.spawn(async move { registry.invoke(tag, &snapshot, timeout).await });
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    join_set.abort_all();
                    return Err(OrchestrationError::Aborted(
                        "client abort during specialist burst".into(),
                    ));
                }
                joined = join_set.join_next() => {
                    match joined {
                        None => break,
                        Some(Ok(result)) => {
                            recorder.hop(
                                &format!("specialist:{}", result.tag),
                                &snapshot.query,
                                &result,
                                result.latency_ms,
                            );
                            emit(events, StreamEvent::SpecialistResult(result.clone())).await;
                            ctx.specialist_results.push(result);
                        }
                        Some(Err(join_err)) => {
                            warn!(error = %join_err, "Specialist task join failure");
                        }
                    }
                }
            }
        }

        let total = ctx.specialist_results.len();
        let succeeded = ctx
            .specialist_results
            .iter()
            .filter(|r| r.succeeded())
            .count();

        if total > 0 && succeeded == 0 {
            return Err(OrchestrationError::AllSpecialistsFailed(format!(
                "all {} specialists in the burst failed",
                total
            )));
        }

        ctx.degraded = succeeded * 2 < total;
        if ctx.degraded {
            status(
                events,
                Phase::Gathering,
                format!("Degraded evidence: {succeeded}/{total} specialists succeeded"),
            )
            .await;
        }

        debug!(total, succeeded, degraded = ctx.degraded, "Specialist burst settled");
        Ok(())
    }
}

/// Stream sends never fail the orchestration: a vanished publisher means a
/// disconnected client, and committed work continues regardless.
async fn emit(events: &mpsc::Sender<StreamEvent>, event: StreamEvent) {
    if events.send(event).await.is_err() {
        debug!("Event channel closed - continuing without stream");
    }
}

async fn status(events: &mpsc::Sender<StreamEvent>, phase: Phase, detail: impl Into<String>) {
    emit(
        events,
        StreamEvent::status("orchestrator", phase.as_str(), detail),
    )
    .await;
}

/// Stitch the specialist evidence into the proposer prompt, one line per
/// surviving specialist in a stable order.
fn draft_prompt(ctx: &DecisionContext) -> String {
    let mut evidence = String::new();
    let mut sorted: Vec<&SpecialistResult> = ctx
        .specialist_results
        .iter()
        .filter(|r| r.succeeded())
        .collect();
    sorted.sort_by_key(|r| r.tag);
    for result in sorted {
        evidence.push_str(&format!("- [{}] {}\n", result.tag, result.narrative));
    }
    if evidence.is_empty() {
        evidence.push_str("- (no specialist evidence available)\n");
    }

    let symbol = ctx
        .intent
        .as_ref()
        .and_then(|i| i.symbol.as_deref())
        .unwrap_or("the market");

    format!(
        "You are the proposer in a financial advisory debate. Draft a concise, evidence-grounded thesis about {symbol}.\n\nClient query: {}\n\n[SPECIALIST EVIDENCE]\n{evidence}\nWrite three to five sentences. State the position, the supporting evidence, and the key risk. This is advisory reasoning, not an order.",
        ctx.query
    )
}

fn rebuttal_prompt(ctx: &DecisionContext, critique: &str) -> String {
    format!(
        "The risk critic challenged your thesis:\n\"{critique}\"\n\nYour current thesis:\n{}\n\nClient query: {}\n\nProvide a refined thesis that addresses the critique directly, or rebut it with specific evidence. Keep it to three to five sentences.",
        ctx.thesis, ctx.query
    )
}

/// Derive proposals from the surviving specialist consensus. Anything with
/// a real-world side effect is marked as requiring authorization at the
/// external gate.
fn derive_actions(ctx: &DecisionContext) -> Vec<ProposedAction> {
    let Some(intent) = &ctx.intent else {
        return Vec::new();
    };
    if intent.kind == IntentKind::Educational {
        return Vec::new();
    }

    let mut counts: HashMap<Stance, usize> = HashMap::new();
    for result in ctx.specialist_results.iter().filter(|r| r.succeeded()) {
        if let Some(stance) = result.stance {
            *counts.entry(stance).or_insert(0) += 1;
        }
    }

    let consensus = counts
        .iter()
        .max_by_key(|(_, count)| **count)
        .map(|(stance, _)| *stance);

    // A thesis that talks in trade directives always goes through the
    // authorization gate, whatever the consensus says.
    let thesis_upper = ctx.thesis.to_uppercase();
    let has_directive = ["BUY", "SELL", "ORDER", "TRADE"]
        .iter()
        .any(|w| thesis_upper.contains(w));

    let mut action = match consensus {
        Some(Stance::Bullish) => ProposedAction {
            kind: ActionKind::Buy,
            symbol: intent.symbol.clone(),
            rationale: "specialist consensus is constructive".into(),
            requires_authorization: true,
        },
        Some(Stance::Bearish) => ProposedAction {
            kind: ActionKind::Sell,
            symbol: intent.symbol.clone(),
            rationale: "specialist consensus is adverse".into(),
            requires_authorization: true,
        },
        _ => ProposedAction {
            kind: ActionKind::Hold,
            symbol: intent.symbol.clone(),
            rationale: "no directional consensus".into(),
            requires_authorization: false,
        },
    };
    action.requires_authorization |= has_directive;

    vec![action]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::critic::ScriptedCritic;
    use crate::gateway::{ModelGateway, ModelTier, StubBackend};
    use crate::market::SyntheticMarketData;
    use crate::specialists::create_default_registry;
    use crate::telemetry::{InMemoryTraceStore, TraceStore};

    fn build_orchestrator(critic: Box<dyn Critic>) -> (Orchestrator, Arc<InMemoryTraceStore>) {
        let gateway = Arc::new(ModelGateway::new(
            Arc::new(StubBackend::new("stub-small", ModelTier::Small)),
            Arc::new(StubBackend::new("stub-large", ModelTier::Large)),
            4,
        ));
        let store = Arc::new(InMemoryTraceStore::new());
        let (writer, _handle) = TraceWriter::spawn(store.clone());
        let cfg = OrchestratorConfig::default();

        let orchestrator = Orchestrator::new(
            IntentClassifier::new(gateway.clone()),
            Arc::new(create_default_registry(Arc::new(SyntheticMarketData))),
            RStitchRouter::new(gateway),
            critic,
            ConfidenceEstimator::new(cfg.confidence_weights, cfg.exhausted_confidence_cap),
            writer,
            cfg,
        );
        (orchestrator, store)
    }

    async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_happy_path_emits_single_final() {
        let (orchestrator, _store) = build_orchestrator(Box::new(ScriptedCritic::approving()));
        let (tx, rx) = mpsc::channel(256);

        let request = AdvisoryRequest {
            query: "should I add to NVDA here?".to_string(),
            symbol: None,
            account_scope: Default::default(),
        };

        let outcome = orchestrator
            .run(request, Uuid::new_v4(), tx, CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.thesis.is_empty());
        assert!(outcome.unresolved_objection.is_none());

        let events = drain(rx).await;
        let finals = events.iter().filter(|e| e.kind() == "final").count();
        let errors = events.iter().filter(|e| e.kind() == "error").count();
        assert_eq!((finals, errors), (1, 0));
        // Every thesis is debated at least once.
        assert!(events.iter().any(|e| e.kind() == "debate_turn"));
        assert!(events.iter().any(|e| e.kind() == "reasoning_segment"));
    }

    #[tokio::test]
    async fn test_trace_hops_match_components_touched() {
        let (orchestrator, store) = build_orchestrator(Box::new(ScriptedCritic::approving()));
        let (tx, _rx) = mpsc::channel(256);
        let correlation_id = Uuid::new_v4();

        orchestrator
            .run(
                AdvisoryRequest {
                    query: "should I add to NVDA here?".to_string(),
                    symbol: None,
                    account_scope: Default::default(),
                },
                correlation_id,
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        // Let the fire-and-forget writer drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let trace = store.get_trace(correlation_id).await.unwrap();
        let components: Vec<&str> = trace.iter().map(|r| r.component.as_str()).collect();

        // classifier + 5 specialists + router + critic + confidence + finalizer
        assert_eq!(trace.len(), 10);
        assert_eq!(components[0], "classifier");
        assert!(components.contains(&"specialist:quant"));
        assert!(components.contains(&"router"));
        assert!(components.contains(&"critic"));
        assert_eq!(components[components.len() - 1], "finalizer");
        assert!(crate::telemetry::verify_chain(&trace));
    }

    #[tokio::test]
    async fn test_pre_cancelled_request_aborts_with_error_event() {
        let (orchestrator, _store) = build_orchestrator(Box::new(ScriptedCritic::approving()));
        let (tx, rx) = mpsc::channel(256);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = orchestrator
            .run(
                AdvisoryRequest {
                    query: "should I add to NVDA here?".to_string(),
                    symbol: None,
                    account_scope: Default::default(),
                },
                Uuid::new_v4(),
                tx,
                cancel,
            )
            .await;

        assert!(matches!(result, Err(OrchestrationError::Aborted(_))));
        let events = drain(rx).await;
        let terminal = events.last().unwrap();
        assert_eq!(terminal.kind(), "error");
        match terminal {
            StreamEvent::Error { aborted, .. } => assert!(aborted),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_educational_query_skips_specialists_but_still_debates() {
        let (orchestrator, _store) = build_orchestrator(Box::new(ScriptedCritic::approving()));
        let (tx, rx) = mpsc::channel(256);

        let outcome = orchestrator
            .run(
                AdvisoryRequest {
                    query: "what is a moving average?".to_string(),
                    symbol: None,
                    account_scope: Default::default(),
                },
                Uuid::new_v4(),
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.proposed_actions.is_empty());
        let events = drain(rx).await;
        assert!(!events.iter().any(|e| e.kind() == "specialist_result"));
        assert!(events.iter().any(|e| e.kind() == "debate_turn"));
    }
}
