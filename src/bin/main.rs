use advisory_orchestrator::{
    agent::Orchestrator,
    classifier::IntentClassifier,
    config::OrchestratorConfig,
    confidence::ConfidenceEstimator,
    critic::LlmCritic,
    gateway::{ModelGateway, ModelTier, StubBackend},
    market::SyntheticMarketData,
    models::AdvisoryRequest,
    router::RStitchRouter,
    specialists::create_default_registry,
    stream::StreamEvent,
    telemetry::{InMemoryTraceStore, TraceStore, TraceWriter},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    info!("Advisory orchestrator demo starting");

    // Offline stub backends keep the demo deterministic.
    let gateway = Arc::new(ModelGateway::new(
        Arc::new(StubBackend::new("granite-tiny", ModelTier::Small)),
        Arc::new(StubBackend::new("lfm-native", ModelTier::Large)),
        8,
    ));

    let cfg = OrchestratorConfig::default();
    let store: Arc<InMemoryTraceStore> = Arc::new(InMemoryTraceStore::new());
    let (trace_writer, _trace_task) = TraceWriter::spawn(store.clone());

    let orchestrator = Orchestrator::new(
        IntentClassifier::new(gateway.clone()),
        Arc::new(create_default_registry(Arc::new(SyntheticMarketData))),
        RStitchRouter::new(gateway.clone()),
        Box::new(LlmCritic::new(gateway)),
        ConfidenceEstimator::new(cfg.confidence_weights, cfg.exhausted_confidence_cap),
        trace_writer,
        cfg,
    );

    let request = AdvisoryRequest {
        query: "Should I add to my NVDA position here?".to_string(),
        symbol: None,
        account_scope: Default::default(),
    };
    let correlation_id = Uuid::new_v4();

    let (events_tx, mut events_rx) = mpsc::channel::<StreamEvent>(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            println!("  [{}] {}", event.kind(), serde_json::to_string(&event).unwrap_or_default());
        }
    });

    println!("\n=== EVENT STREAM ===");
    let outcome = orchestrator
        .run(request, correlation_id, events_tx, CancellationToken::new())
        .await?;
    printer.await?;

    println!("\n=== ADVISORY OUTCOME ===");
    println!("Correlation ID: {}", outcome.correlation_id);
    println!("Thesis: {}", outcome.thesis);
    println!(
        "Confidence: {:.2} ({:?}){}",
        outcome.confidence.value,
        outcome.confidence.label,
        if outcome.confidence.capped { " [capped]" } else { "" }
    );
    if let Some(objection) = &outcome.unresolved_objection {
        println!("Unresolved objection: {}", objection);
    }
    for action in &outcome.proposed_actions {
        println!(
            "Proposed action: {:?} {:?} (authorization required: {})",
            action.kind, action.symbol, action.requires_authorization
        );
    }

    // Give the fire-and-forget writer a beat, then dump the trace.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    println!("\n=== TRACE ===");
    for record in store.get_trace(correlation_id).await? {
        println!(
            "  hop {} {} ({} ms)",
            record.hop_index, record.component, record.latency_ms
        );
    }

    Ok(())
}
