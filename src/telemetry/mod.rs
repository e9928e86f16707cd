//! Telemetry trace store
//!
//! One TraceRecord per agent hop, keyed by correlation id. Writes are
//! fire-and-forget relative to the response path: the orchestrator hands
//! records to a background writer task and never awaits the store. Each
//! write is idempotent on (correlation_id, hop_index), and records chain
//! digests for tamper evidence.
//!
//! Backend selection follows DATABASE_URL: Postgres when configured and
//! reachable, otherwise in-memory.

use crate::error::OrchestrationError;
use crate::models::TraceRecord;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::{mpsc, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Chain seed for the first hop of every correlation id.
pub const GENESIS_DIGEST: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

//
// ================= Digests =================
//

/// SHA256 of a serializable value, streamed straight into the hasher.
pub fn digest_of<T: Serialize>(value: &T) -> String {
    let mut hasher = Sha256::new();
    if serde_json::to_writer(&mut HashWriter(&mut hasher), value).is_err() {
        return String::new();
    }
    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn chain_digest(
    prev: &str,
    component: &str,
    hop_index: u32,
    input_digest: &str,
    output_digest: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev.as_bytes());
    hasher.update(component.as_bytes());
    hasher.update(hop_index.to_be_bytes());
    hasher.update(input_digest.as_bytes());
    hasher.update(output_digest.as_bytes());
    hex::encode(hasher.finalize())
}

/// Recompute the digest chain over an ordered trace. Any mutated or
/// missing hop breaks the chain.
pub fn verify_chain(records: &[TraceRecord]) -> bool {
    let mut prev = GENESIS_DIGEST.to_string();
    for (i, record) in records.iter().enumerate() {
        if record.hop_index != i as u32 {
            return false;
        }
        let expected = chain_digest(
            &prev,
            &record.component,
            record.hop_index,
            &record.input_digest,
            &record.output_digest,
        );
        if expected != record.chain_digest {
            return false;
        }
        prev = expected;
    }
    true
}

//
// ================= Store =================
//

#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Idempotent on (correlation_id, hop_index): a retried write of the
    /// same hop is a no-op.
    async fn record(&self, record: TraceRecord) -> Result<()>;

    /// Ordered trace for one request, for audit and replay tooling.
    async fn get_trace(&self, correlation_id: Uuid) -> Result<Vec<TraceRecord>>;
}

pub struct InMemoryTraceStore {
    rows: RwLock<HashMap<Uuid, BTreeMap<u32, TraceRecord>>>,
}

impl InMemoryTraceStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryTraceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TraceStore for InMemoryTraceStore {
    async fn record(&self, record: TraceRecord) -> Result<()> {
        let mut rows = self.rows.write().await;
        rows.entry(record.correlation_id)
            .or_default()
            .entry(record.hop_index)
            .or_insert(record);
        Ok(())
    }

    async fn get_trace(&self, correlation_id: Uuid) -> Result<Vec<TraceRecord>> {
        let rows = self.rows.read().await;
        Ok(rows
            .get(&correlation_id)
            .map(|hops| hops.values().cloned().collect())
            .unwrap_or_default())
    }
}

//
// ================= Postgres Backend =================
//

pub struct PgTraceStore {
    pool: PgPool,
    schema_ready: OnceCell<()>,
}

impl PgTraceStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: OnceCell::new(),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS trace_records (
                        correlation_id UUID NOT NULL,
                        hop_index INT NOT NULL,
                        component TEXT NOT NULL,
                        input_digest TEXT NOT NULL,
                        output_digest TEXT NOT NULL,
                        chain_digest TEXT NOT NULL,
                        latency_ms BIGINT NOT NULL,
                        created_at TIMESTAMPTZ NOT NULL,
                        PRIMARY KEY (correlation_id, hop_index)
                    )
                    "#,
                )
                .execute(&self.pool)
                .await
                .map_err(|e| OrchestrationError::DatabaseError(e.to_string()))?;
                Ok::<(), OrchestrationError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TraceStore for PgTraceStore {
    async fn record(&self, record: TraceRecord) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO trace_records
                (correlation_id, hop_index, component, input_digest,
                 output_digest, chain_digest, latency_ms, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (correlation_id, hop_index) DO NOTHING
            "#,
        )
        .bind(record.correlation_id)
        .bind(record.hop_index as i32)
        .bind(&record.component)
        .bind(&record.input_digest)
        .bind(&record.output_digest)
        .bind(&record.chain_digest)
        .bind(record.latency_ms as i64)
        .bind(record.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestrationError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn get_trace(&self, correlation_id: Uuid) -> Result<Vec<TraceRecord>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT correlation_id, hop_index, component, input_digest,
                   output_digest, chain_digest, latency_ms, created_at
            FROM trace_records
            WHERE correlation_id = $1
            ORDER BY hop_index ASC
            "#,
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OrchestrationError::DatabaseError(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| TraceRecord {
                correlation_id: row.get("correlation_id"),
                hop_index: row.get::<i32, _>("hop_index") as u32,
                component: row.get("component"),
                input_digest: row.get("input_digest"),
                output_digest: row.get("output_digest"),
                chain_digest: row.get("chain_digest"),
                latency_ms: row.get::<i64, _>("latency_ms") as u64,
                timestamp: row.get("created_at"),
            })
            .collect())
    }
}

/// Select the trace backend from the environment: Postgres when
/// DATABASE_URL is set and reachable, in-memory otherwise. A broken
/// database degrades observability, never requests.
pub async fn build_trace_store() -> Arc<dyn TraceStore> {
    match std::env::var("DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => {
            match PgPoolOptions::new().max_connections(4).connect(&url).await {
                Ok(pool) => {
                    info!("Trace store: Postgres backend");
                    Arc::new(PgTraceStore::new(pool))
                }
                Err(e) => {
                    warn!(error = %e, "DATABASE_URL set but unreachable - using in-memory trace store");
                    Arc::new(InMemoryTraceStore::new())
                }
            }
        }
        _ => {
            info!("Trace store: in-memory backend");
            Arc::new(InMemoryTraceStore::new())
        }
    }
}

//
// ================= Writer =================
//

/// Fire-and-forget handle used on the response path. Records are queued to
/// a background task; a full failure degrades observability only.
#[derive(Clone)]
pub struct TraceWriter {
    tx: mpsc::UnboundedSender<TraceRecord>,
}

impl TraceWriter {
    pub fn spawn(store: Arc<dyn TraceStore>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<TraceRecord>();

        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = store.record(record).await {
                    warn!(error = %e, "Trace write failed - continuing");
                }
            }
        });

        (Self { tx }, handle)
    }

    pub fn record(&self, record: TraceRecord) {
        if self.tx.send(record).is_err() {
            warn!("Trace writer is gone - dropping record");
        }
    }
}

/// Per-request recorder: assigns hop indices sequentially on the
/// coordinating task and chains digests hop to hop.
pub struct TraceRecorder {
    correlation_id: Uuid,
    writer: TraceWriter,
    next_hop: u32,
    prev_chain: String,
}

impl TraceRecorder {
    pub fn new(correlation_id: Uuid, writer: TraceWriter) -> Self {
        Self {
            correlation_id,
            writer,
            next_hop: 0,
            prev_chain: GENESIS_DIGEST.to_string(),
        }
    }

    pub fn hop<I: Serialize, O: Serialize>(
        &mut self,
        component: &str,
        input: &I,
        output: &O,
        latency_ms: u64,
    ) {
        let input_digest = digest_of(input);
        let output_digest = digest_of(output);
        let chain = chain_digest(
            &self.prev_chain,
            component,
            self.next_hop,
            &input_digest,
            &output_digest,
        );

        let record = TraceRecord {
            correlation_id: self.correlation_id,
            hop_index: self.next_hop,
            component: component.to_string(),
            input_digest,
            output_digest,
            chain_digest: chain.clone(),
            latency_ms,
            timestamp: Utc::now(),
        };

        self.next_hop += 1;
        self.prev_chain = chain;
        self.writer.record(record);
    }

    pub fn hops_recorded(&self) -> u32 {
        self.next_hop
    }
}
