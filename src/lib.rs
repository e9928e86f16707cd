//! Advisory Orchestrator
//!
//! Coordinates specialized reasoning agents (quant, sentiment, forecast,
//! research, whale) into a single advisory output:
//! - Classifies intent and fans out a concurrent specialist burst
//! - Drafts a thesis with entropy-guided small/large model delegation
//! - Challenges every thesis through an adversarial critic debate
//! - Streams ordered, resumable events to the client
//! - Persists a correlated, hash-chained trace of every agent hop
//!
//! UNIFIED LOOP:
//! INPUT → CLASSIFY → GATHER → DRAFT → DEBATE → FINALIZE → PUBLISH

pub mod agent;
pub mod api;
pub mod classifier;
pub mod config;
pub mod confidence;
pub mod critic;
pub mod error;
pub mod gate;
pub mod gateway;
pub mod market;
pub mod models;
pub mod router;
pub mod specialists;
pub mod stream;
pub mod telemetry;

pub use error::Result;

// Re-export common types
pub use classifier::IntentClassifier;
pub use config::OrchestratorConfig;
pub use models::*;
