//! End-to-end orchestration scenarios: specialist burst isolation, debate
//! outcomes, stream resume, and trace reconciliation.

use advisory_orchestrator::agent::Orchestrator;
use advisory_orchestrator::classifier::IntentClassifier;
use advisory_orchestrator::config::OrchestratorConfig;
use advisory_orchestrator::confidence::ConfidenceEstimator;
use advisory_orchestrator::critic::{Critic, CriticReview, ScriptedCritic};
use advisory_orchestrator::error::OrchestrationError;
use advisory_orchestrator::gateway::{ModelGateway, ModelTier, StubBackend};
use advisory_orchestrator::models::{
    AdvisoryRequest, ContextSnapshot, SpecialistTag, Stance, Verdict,
};
use advisory_orchestrator::specialists::{Specialist, SpecialistOutput, SpecialistRegistry};
use advisory_orchestrator::stream::{spawn_publisher, SessionManager, StreamEvent};
use advisory_orchestrator::telemetry::{verify_chain, InMemoryTraceStore, TraceStore, TraceWriter};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

//
// ================= Test Doubles =================
//

struct OkSpecialist {
    tag: SpecialistTag,
    stance: Stance,
}

#[async_trait]
impl Specialist for OkSpecialist {
    fn tag(&self) -> SpecialistTag {
        self.tag
    }

    async fn analyze(&self, _snapshot: &ContextSnapshot) -> advisory_orchestrator::Result<SpecialistOutput> {
        Ok(SpecialistOutput {
            stance: Some(self.stance),
            payload: serde_json::json!({"source": "scripted"}),
            narrative: format!("{} evidence looks {:?}.", self.tag, self.stance),
        })
    }
}

struct FailingSpecialist {
    tag: SpecialistTag,
}

#[async_trait]
impl Specialist for FailingSpecialist {
    fn tag(&self) -> SpecialistTag {
        self.tag
    }

    async fn analyze(&self, _snapshot: &ContextSnapshot) -> advisory_orchestrator::Result<SpecialistOutput> {
        Err(OrchestrationError::SpecialistError(
            "upstream feed offline".into(),
        ))
    }
}

fn registry(specialists: Vec<Arc<dyn Specialist>>) -> Arc<SpecialistRegistry> {
    let mut registry = SpecialistRegistry::new();
    for specialist in specialists {
        registry.register(specialist);
    }
    Arc::new(registry)
}

fn build_orchestrator(
    registry: Arc<SpecialistRegistry>,
    critic: Box<dyn Critic>,
    store: Arc<InMemoryTraceStore>,
) -> Orchestrator {
    let gateway = Arc::new(ModelGateway::new(
        Arc::new(StubBackend::new("stub-small", ModelTier::Small)),
        Arc::new(StubBackend::new("stub-large", ModelTier::Large)),
        4,
    ));
    let (writer, _task) = TraceWriter::spawn(store);
    let cfg = OrchestratorConfig::default();

    Orchestrator::new(
        IntentClassifier::new(gateway.clone()),
        registry,
        advisory_orchestrator::router::RStitchRouter::new(gateway),
        critic,
        ConfidenceEstimator::new(cfg.confidence_weights, cfg.exhausted_confidence_cap),
        writer,
        cfg,
    )
}

fn review(verdict: Verdict, rationale: &str) -> CriticReview {
    CriticReview {
        verdict,
        rationale: rationale.to_string(),
    }
}

/// Risk-assessment phrasing fans out to quant, research, and whale.
fn risk_request() -> AdvisoryRequest {
    AdvisoryRequest {
        query: "is NVDA too risky here?".to_string(),
        symbol: None,
        account_scope: Default::default(),
    }
}

async fn run_collect(
    orchestrator: &Orchestrator,
    request: AdvisoryRequest,
) -> (
    advisory_orchestrator::Result<advisory_orchestrator::models::AdvisoryOutcome>,
    Vec<StreamEvent>,
) {
    let (tx, mut rx) = mpsc::channel(512);
    let result = orchestrator
        .run(request, Uuid::new_v4(), tx, CancellationToken::new())
        .await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    (result, events)
}

//
// ================= Scenarios =================
//

#[tokio::test]
async fn partial_specialist_failure_is_isolated_and_lowers_confidence() {
    // Burst of three: quant ok, whale ok, research fails.
    let store = Arc::new(InMemoryTraceStore::new());
    let orchestrator = build_orchestrator(
        registry(vec![
            Arc::new(OkSpecialist {
                tag: SpecialistTag::Quant,
                stance: Stance::Bullish,
            }),
            Arc::new(OkSpecialist {
                tag: SpecialistTag::Whale,
                stance: Stance::Bullish,
            }),
            Arc::new(FailingSpecialist {
                tag: SpecialistTag::Research,
            }),
        ]),
        Box::new(ScriptedCritic::approving()),
        store,
    );

    let (result, events) = run_collect(&orchestrator, risk_request()).await;
    let outcome = result.expect("burst with one failure must still finalize");

    let specialist_events: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::SpecialistResult(r) => Some(r),
            _ => None,
        })
        .collect();

    assert_eq!(specialist_events.len(), 3);
    assert_eq!(
        specialist_events.iter().filter(|r| r.succeeded()).count(),
        2
    );
    let failed = specialist_events
        .iter()
        .find(|r| !r.succeeded())
        .expect("research failure surfaces as a result event");
    assert_eq!(failed.tag, SpecialistTag::Research);
    assert!(failed.error.as_deref().unwrap().contains("offline"));

    assert_eq!(events.iter().filter(|e| e.kind() == "final").count(), 1);

    // Baseline: identical setup with research succeeding.
    let baseline_store = Arc::new(InMemoryTraceStore::new());
    let baseline = build_orchestrator(
        registry(vec![
            Arc::new(OkSpecialist {
                tag: SpecialistTag::Quant,
                stance: Stance::Bullish,
            }),
            Arc::new(OkSpecialist {
                tag: SpecialistTag::Whale,
                stance: Stance::Bullish,
            }),
            Arc::new(OkSpecialist {
                tag: SpecialistTag::Research,
                stance: Stance::Bullish,
            }),
        ]),
        Box::new(ScriptedCritic::approving()),
        baseline_store,
    );
    let (baseline_result, _) = run_collect(&baseline, risk_request()).await;
    let baseline_outcome = baseline_result.unwrap();

    assert!(outcome.confidence.value < baseline_outcome.confidence.value);
    assert!(!outcome.degraded, "2 of 3 succeeded is not degraded");
}

#[tokio::test]
async fn all_specialists_failed_aborts_with_error_event_and_trace() {
    let store = Arc::new(InMemoryTraceStore::new());
    let orchestrator = build_orchestrator(
        registry(vec![
            Arc::new(FailingSpecialist {
                tag: SpecialistTag::Quant,
            }),
            Arc::new(FailingSpecialist {
                tag: SpecialistTag::Research,
            }),
            Arc::new(FailingSpecialist {
                tag: SpecialistTag::Whale,
            }),
        ]),
        Box::new(ScriptedCritic::approving()),
        store.clone(),
    );

    let (tx, mut rx) = mpsc::channel(512);
    let correlation_id = Uuid::new_v4();
    let result = orchestrator
        .run(risk_request(), correlation_id, tx, CancellationToken::new())
        .await;

    assert!(matches!(
        result,
        Err(OrchestrationError::AllSpecialistsFailed(_))
    ));

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let terminal = events.last().unwrap();
    assert_eq!(terminal.kind(), "error");
    match terminal {
        StreamEvent::Error { kind, aborted, .. } => {
            assert_eq!(kind, "all_specialists_failed");
            assert!(!aborted);
        }
        _ => unreachable!(),
    }

    // The aborted request still leaves an auditable trace.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let trace = store.get_trace(correlation_id).await.unwrap();
    assert!(!trace.is_empty());
    assert!(trace.iter().any(|r| r.component == "error"));
}

#[tokio::test]
async fn refute_then_approve_produces_two_turns_and_lower_confidence() {
    let bullish_registry = || {
        registry(vec![
            Arc::new(OkSpecialist {
                tag: SpecialistTag::Quant,
                stance: Stance::Bullish,
            }) as Arc<dyn Specialist>,
            Arc::new(OkSpecialist {
                tag: SpecialistTag::Whale,
                stance: Stance::Bullish,
            }),
            Arc::new(OkSpecialist {
                tag: SpecialistTag::Research,
                stance: Stance::Bullish,
            }),
        ])
    };

    let store = Arc::new(InMemoryTraceStore::new());
    let contested = build_orchestrator(
        bullish_registry(),
        Box::new(ScriptedCritic::new(vec![
            review(Verdict::Refute, "Thesis ignores crowded positioning."),
            review(Verdict::Approve, "Positioning concern addressed."),
        ])),
        store,
    );

    let (result, events) = run_collect(&contested, risk_request()).await;
    let outcome = result.unwrap();

    let turns: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::DebateTurn(t) => Some(t),
            _ => None,
        })
        .collect();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].verdict, Verdict::Refute);
    assert_eq!(turns[1].verdict, Verdict::Approve);
    assert!(outcome.unresolved_objection.is_none());

    // The rebuttal re-entered DRAFTING: segments from both drafts streamed.
    let segments = events
        .iter()
        .filter(|e| e.kind() == "reasoning_segment")
        .count();
    assert!(segments > 4, "expected rebuttal segments, got {segments}");

    let baseline_store = Arc::new(InMemoryTraceStore::new());
    let baseline = build_orchestrator(
        bullish_registry(),
        Box::new(ScriptedCritic::approving()),
        baseline_store,
    );
    let (baseline_result, baseline_events) = run_collect(&baseline, risk_request()).await;

    assert_eq!(
        baseline_events
            .iter()
            .filter(|e| e.kind() == "debate_turn")
            .count(),
        1
    );
    assert!(outcome.confidence.value < baseline_result.unwrap().confidence.value);
}

#[tokio::test]
async fn exhausted_debate_caps_confidence_and_surfaces_objection() {
    let store = Arc::new(InMemoryTraceStore::new());
    let objection = "Tail risk from rate policy is unpriced.";
    let orchestrator = build_orchestrator(
        registry(vec![
            Arc::new(OkSpecialist {
                tag: SpecialistTag::Quant,
                stance: Stance::Bullish,
            }),
            Arc::new(OkSpecialist {
                tag: SpecialistTag::Whale,
                stance: Stance::Bullish,
            }),
            Arc::new(OkSpecialist {
                tag: SpecialistTag::Research,
                stance: Stance::Bullish,
            }),
        ]),
        Box::new(ScriptedCritic::new(vec![
            review(Verdict::Refute, "First pass is overconfident."),
            review(Verdict::Refute, objection),
        ])),
        store,
    );

    let (result, events) = run_collect(&orchestrator, risk_request()).await;
    let outcome = result.expect("exhausted debate still finalizes");

    // Bounded: default max_debate_turns = 2.
    assert_eq!(
        events.iter().filter(|e| e.kind() == "debate_turn").count(),
        2
    );
    assert!(outcome.confidence.value <= 0.6);
    // The critic's last objection is surfaced verbatim.
    assert_eq!(outcome.unresolved_objection.as_deref(), Some(objection));

    match events.last().unwrap() {
        StreamEvent::Final(payload) => {
            assert_eq!(payload.unresolved_objection.as_deref(), Some(objection));
        }
        other => panic!("expected final event, got {}", other.kind()),
    }
}

#[tokio::test]
async fn stream_resume_skips_acked_and_delivers_final() {
    let store = Arc::new(InMemoryTraceStore::new());
    let orchestrator = Arc::new(build_orchestrator(
        registry(vec![
            Arc::new(OkSpecialist {
                tag: SpecialistTag::Quant,
                stance: Stance::Bullish,
            }),
            Arc::new(OkSpecialist {
                tag: SpecialistTag::Whale,
                stance: Stance::Bullish,
            }),
            Arc::new(OkSpecialist {
                tag: SpecialistTag::Research,
                stance: Stance::Bullish,
            }),
        ]),
        Box::new(ScriptedCritic::approving()),
        store,
    ));

    let sessions = SessionManager::new(Duration::from_secs(60));
    let correlation_id = Uuid::new_v4();
    let session = sessions.open(correlation_id).await;
    let (events, publisher) = spawn_publisher(sessions.clone(), session.session_id, 256);

    // Client "disconnects" immediately: orchestration runs with no one
    // attached, events buffer in the session.
    orchestrator
        .run(risk_request(), correlation_id, events, CancellationToken::new())
        .await
        .unwrap();
    publisher.await.unwrap();

    // Reconnect having acked the first two events.
    let (replay, _rx) = sessions.attach(session.session_id, 2).await.unwrap();

    assert!(!replay.is_empty());
    assert_eq!(replay[0].seq, 3, "resume starts at last_acked + 1");
    let seqs: Vec<u64> = replay.iter().map(|e| e.seq).collect();
    let expected: Vec<u64> = (3..3 + replay.len() as u64).collect();
    assert_eq!(seqs, expected, "no gaps, no redelivery");
    assert_eq!(replay.last().unwrap().event.kind(), "final");
}

#[tokio::test]
async fn trace_records_reconcile_with_stream_events() {
    let store = Arc::new(InMemoryTraceStore::new());
    let orchestrator = build_orchestrator(
        registry(vec![
            Arc::new(OkSpecialist {
                tag: SpecialistTag::Quant,
                stance: Stance::Bullish,
            }),
            Arc::new(OkSpecialist {
                tag: SpecialistTag::Whale,
                stance: Stance::Neutral,
            }),
            Arc::new(OkSpecialist {
                tag: SpecialistTag::Research,
                stance: Stance::Bullish,
            }),
        ]),
        Box::new(ScriptedCritic::approving()),
        store.clone(),
    );

    let (tx, mut rx) = mpsc::channel(512);
    let correlation_id = Uuid::new_v4();
    orchestrator
        .run(risk_request(), correlation_id, tx, CancellationToken::new())
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    let trace = store.get_trace(correlation_id).await.unwrap();

    // One hop per component actually executed:
    // classifier + 3 specialists + router + critic + confidence + finalizer.
    assert_eq!(trace.len(), 8);
    assert!(verify_chain(&trace));

    // Every specialist event has a matching specialist hop and vice versa.
    let specialist_hops = trace
        .iter()
        .filter(|r| r.component.starts_with("specialist:"))
        .count();
    let specialist_events = events
        .iter()
        .filter(|e| e.kind() == "specialist_result")
        .count();
    assert_eq!(specialist_hops, specialist_events);

    let critic_hops = trace.iter().filter(|r| r.component == "critic").count();
    let debate_events = events.iter().filter(|e| e.kind() == "debate_turn").count();
    assert_eq!(critic_hops, debate_events);
}
