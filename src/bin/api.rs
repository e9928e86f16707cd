use advisory_orchestrator::{
    agent::Orchestrator,
    api::start_server,
    classifier::IntentClassifier,
    config::OrchestratorConfig,
    confidence::ConfidenceEstimator,
    critic::LlmCritic,
    gate::{ActionGate, DenyAllGate, StaticKeyGate},
    gateway::{HttpModelBackend, ModelBackend, ModelGateway, ModelTier, StubBackend},
    market::SyntheticMarketData,
    router::RStitchRouter,
    specialists::create_default_registry,
    stream::SessionManager,
    telemetry::{build_trace_store, TraceWriter},
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn build_backend(
    base_url: Option<&str>,
    model_env: &str,
    default_model: &str,
    api_key: Option<String>,
    tier: ModelTier,
) -> Arc<dyn ModelBackend> {
    let model = std::env::var(model_env).unwrap_or_else(|_| default_model.to_string());
    match base_url {
        Some(url) => match HttpModelBackend::new(url.to_string(), model.clone(), api_key) {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                eprintln!("⚠️  Failed to build HTTP backend for {model}: {e} - using stub");
                Arc::new(StubBackend::new(model, tier))
            }
        },
        None => Arc::new(StubBackend::new(model, tier)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let base_url = std::env::var("MODEL_API_BASE_URL").ok();
    if base_url.is_none() {
        eprintln!("⚠️  MODEL_API_BASE_URL not set - running with offline stub backends");
    }
    let api_key = std::env::var("MODEL_API_KEY").ok();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    let cfg = OrchestratorConfig::from_env();

    info!("🚀 Advisory Orchestrator - API Server");
    info!("📍 Port: {}", api_port);

    // Create components
    let gateway = Arc::new(ModelGateway::new(
        build_backend(
            base_url.as_deref(),
            "SMALL_MODEL",
            "granite-tiny",
            api_key.clone(),
            ModelTier::Small,
        ),
        build_backend(
            base_url.as_deref(),
            "LARGE_MODEL",
            "lfm-native",
            api_key,
            ModelTier::Large,
        ),
        cfg.gateway_max_concurrency,
    ));

    let trace_store = build_trace_store().await;
    let (trace_writer, _trace_task) = TraceWriter::spawn(trace_store.clone());
    let sessions = SessionManager::new(cfg.session_idle_window);

    let orchestrator = Arc::new(Orchestrator::new(
        IntentClassifier::new(gateway.clone()),
        Arc::new(create_default_registry(Arc::new(SyntheticMarketData))),
        RStitchRouter::new(gateway.clone()),
        Box::new(LlmCritic::new(gateway)),
        ConfidenceEstimator::new(cfg.confidence_weights, cfg.exhausted_confidence_cap),
        trace_writer,
        cfg,
    ));

    // Execution authority: deny-all unless a gate key is provisioned.
    let gate: Arc<dyn ActionGate> = match std::env::var("EXECUTION_GATE_KEY") {
        Ok(key) if !key.trim().is_empty() => Arc::new(StaticKeyGate::new("ops", key)),
        _ => Arc::new(DenyAllGate),
    };

    info!("✅ Orchestrator initialized");
    info!("📡 Starting API server...");

    // Start API server
    start_server(orchestrator, sessions, trace_store, gate, api_port).await?;

    Ok(())
}
