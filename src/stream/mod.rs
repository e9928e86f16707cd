//! Stream publisher and session protocol
//!
//! Orchestration events are serialized to the client over a push channel
//! as ordered envelopes `{session_id, seq, type, payload, ts}`. The
//! publisher is a dedicated task reading from a bounded queue, decoupled
//! from the orchestration task's pace. Sessions survive a disconnect for
//! an idle window; reconnecting with `last_acked_seq` resumes delivery at
//! `last_acked_seq + 1` without replaying delivered events and without
//! restarting the underlying orchestration.

use crate::error::OrchestrationError;
use crate::models::{
    ConfidenceScore, DebateTurn, ProposedAction, ReasoningSegment, SpecialistResult,
};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Capacity of the per-client live delivery channel. A client that falls
/// further behind than this is detached and must resume from its ack.
const CLIENT_CHANNEL_CAPACITY: usize = 64;

//
// ================= Events =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalPayload {
    pub correlation_id: Uuid,
    pub thesis: String,
    pub confidence: ConfidenceScore,
    pub unresolved_objection: Option<String>,
    pub proposed_actions: Vec<ProposedAction>,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum StreamEvent {
    Status {
        component: String,
        state: String,
        detail: String,
    },
    SpecialistResult(SpecialistResult),
    ReasoningSegment(ReasoningSegment),
    DebateTurn(DebateTurn),
    Final(FinalPayload),
    Error {
        kind: String,
        reason: String,
        aborted: bool,
    },
}

impl StreamEvent {
    pub fn status(component: &str, state: &str, detail: impl Into<String>) -> Self {
        StreamEvent::Status {
            component: component.to_string(),
            state: state.to_string(),
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Status { .. } => "status",
            StreamEvent::SpecialistResult(_) => "specialist_result",
            StreamEvent::ReasoningSegment(_) => "reasoning_segment",
            StreamEvent::DebateTurn(_) => "debate_turn",
            StreamEvent::Final(_) => "final",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// Terminal events close the stream: exactly one per request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Final(_) | StreamEvent::Error { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub session_id: Uuid,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: StreamEvent,
}

/// Public snapshot of a live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSession {
    pub session_id: Uuid,
    pub correlation_id: Uuid,
    pub last_event_seq: u64,
    pub created_at: DateTime<Utc>,
}

//
// ================= Session Manager =================
//

struct SessionState {
    correlation_id: Uuid,
    created_at: DateTime<Utc>,
    next_seq: u64,
    last_acked_seq: u64,
    buffer: VecDeque<EventEnvelope>,
    client: Option<mpsc::Sender<EventEnvelope>>,
    last_active: Instant,
    finished: bool,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<Uuid, SessionState>>,
    idle_window: Duration,
}

impl SessionManager {
    pub fn new(idle_window: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            idle_window,
        })
    }

    /// Background sweep removing sessions idle past the retention window.
    pub fn spawn_gc(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = (manager.idle_window / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let mut sessions = manager.sessions.write().await;
                let before = sessions.len();
                sessions.retain(|_, state| state.last_active.elapsed() <= manager.idle_window);
                let removed = before - sessions.len();
                if removed > 0 {
                    debug!(removed, "Expired idle stream sessions");
                }
            }
        })
    }

    pub async fn open(&self, correlation_id: Uuid) -> StreamSession {
        let session_id = Uuid::new_v4();
        let created_at = Utc::now();

        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session_id,
            SessionState {
                correlation_id,
                created_at,
                next_seq: 0,
                last_acked_seq: 0,
                buffer: VecDeque::new(),
                client: None,
                last_active: Instant::now(),
                finished: false,
            },
        );

        StreamSession {
            session_id,
            correlation_id,
            last_event_seq: 0,
            created_at,
        }
    }

    pub async fn session(&self, session_id: Uuid) -> Option<StreamSession> {
        let sessions = self.sessions.read().await;
        sessions.get(&session_id).map(|state| StreamSession {
            session_id,
            correlation_id: state.correlation_id,
            last_event_seq: state.next_seq,
            created_at: state.created_at,
        })
    }

    /// Assign the next sequence number, buffer the event for resume, and
    /// forward it to the attached client if any. Returns the assigned seq,
    /// or `None` when the session no longer exists.
    pub async fn publish(&self, session_id: Uuid, event: StreamEvent) -> Option<u64> {
        let mut sessions = self.sessions.write().await;
        let state = sessions.get_mut(&session_id)?;

        state.next_seq += 1;
        state.last_active = Instant::now();
        if event.is_terminal() {
            state.finished = true;
        }

        let envelope = EventEnvelope {
            session_id,
            seq: state.next_seq,
            ts: Utc::now(),
            event,
        };
        state.buffer.push_back(envelope.clone());

        if let Some(client) = &state.client {
            // A full or closed channel detaches the client; the buffer
            // covers the gap when it resumes, so ordering is never broken
            // by skipping.
            if client.try_send(envelope).is_err() {
                debug!(%session_id, "Client channel unavailable - detaching");
                state.client = None;
            }
        }

        Some(state.next_seq)
    }

    /// Attach (or re-attach) a client. Replays buffered events with
    /// `seq > last_acked_seq`, then continues live on the returned channel.
    pub async fn attach(
        &self,
        session_id: Uuid,
        last_acked_seq: u64,
    ) -> Result<(Vec<EventEnvelope>, mpsc::Receiver<EventEnvelope>)> {
        let mut sessions = self.sessions.write().await;

        // Enforce the idle window here too, so expiry does not depend on
        // the sweep having run yet.
        if sessions
            .get(&session_id)
            .is_some_and(|s| s.last_active.elapsed() > self.idle_window)
        {
            sessions.remove(&session_id);
        }

        let state = sessions
            .get_mut(&session_id)
            .ok_or_else(|| OrchestrationError::SessionExpired(session_id.to_string()))?;

        state.last_acked_seq = state.last_acked_seq.max(last_acked_seq);
        state.last_active = Instant::now();

        // Acked events are gone for good: they are never redelivered.
        while state
            .buffer
            .front()
            .is_some_and(|e| e.seq <= state.last_acked_seq)
        {
            state.buffer.pop_front();
        }

        let replay: Vec<EventEnvelope> = state.buffer.iter().cloned().collect();

        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        state.client = Some(tx);

        debug!(
            %session_id,
            replayed = replay.len(),
            last_acked = state.last_acked_seq,
            "Client attached"
        );
        Ok((replay, rx))
    }

    /// Detach after a clean client read up to `seen_seq`.
    pub async fn detach(&self, session_id: Uuid, seen_seq: u64) {
        let mut sessions = self.sessions.write().await;
        if let Some(state) = sessions.get_mut(&session_id) {
            state.client = None;
            state.last_acked_seq = state.last_acked_seq.max(seen_seq);
            state.last_active = Instant::now();
        }
    }

    pub async fn is_finished(&self, session_id: Uuid) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .get(&session_id)
            .map(|s| s.finished)
            .unwrap_or(true)
    }
}

//
// ================= Publisher Task =================
//

/// Spawn the dedicated publisher for one session. The orchestration task
/// writes `StreamEvent`s into the returned sender at its own pace; the
/// publisher assigns sequence numbers and handles delivery. The task exits
/// after the terminal event, or when the orchestration side drops the
/// sender.
pub fn spawn_publisher(
    sessions: Arc<SessionManager>,
    session_id: Uuid,
    capacity: usize,
) -> (mpsc::Sender<StreamEvent>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<StreamEvent>(capacity.max(1));

    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            if sessions.publish(session_id, event).await.is_none() {
                warn!(%session_id, "Session vanished mid-stream - dropping publisher");
                return;
            }
            if terminal {
                return;
            }
        }
    });

    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntropySummary, SourceModel};

    fn segment(index: usize) -> StreamEvent {
        StreamEvent::ReasoningSegment(ReasoningSegment {
            index,
            text: format!("Segment {index}."),
            source_model: SourceModel::Small,
            entropy: EntropySummary {
                mean: 0.1,
                max: 0.2,
                token_count: 3,
            },
            low_confidence: false,
        })
    }

    #[tokio::test]
    async fn test_seq_is_monotonic_from_one() {
        let manager = SessionManager::new(Duration::from_secs(60));
        let session = manager.open(Uuid::new_v4()).await;

        for expected in 1..=4u64 {
            let seq = manager
                .publish(session.session_id, segment(expected as usize))
                .await
                .unwrap();
            assert_eq!(seq, expected);
        }
    }

    #[tokio::test]
    async fn test_resume_replays_only_unacked_events() {
        let manager = SessionManager::new(Duration::from_secs(60));
        let session = manager.open(Uuid::new_v4()).await;

        for i in 1..=5 {
            let _ = manager.publish(session.session_id, segment(i)).await;
        }

        let (replay, _rx) = manager.attach(session.session_id, 2).await.unwrap();
        let seqs: Vec<u64> = replay.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_live_delivery_continues_after_replay() {
        let manager = SessionManager::new(Duration::from_secs(60));
        let session = manager.open(Uuid::new_v4()).await;
        let _ = manager.publish(session.session_id, segment(1)).await;

        let (replay, mut rx) = manager.attach(session.session_id, 0).await.unwrap();
        assert_eq!(replay.len(), 1);

        let _ = manager.publish(session.session_id, segment(2)).await;
        let live = rx.recv().await.unwrap();
        assert_eq!(live.seq, 2);
    }

    #[tokio::test]
    async fn test_acked_events_are_never_redelivered() {
        let manager = SessionManager::new(Duration::from_secs(60));
        let session = manager.open(Uuid::new_v4()).await;

        for i in 1..=3 {
            let _ = manager.publish(session.session_id, segment(i)).await;
        }

        let (first, _rx) = manager.attach(session.session_id, 3).await.unwrap();
        assert!(first.is_empty());

        // A stale reconnect with an older ack cannot resurrect them either.
        let (second, _rx) = manager.attach(session.session_id, 1).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_event_buffered_across_disconnect() {
        let manager = SessionManager::new(Duration::from_secs(60));
        let session = manager.open(Uuid::new_v4()).await;

        let _ = manager.publish(session.session_id, segment(1)).await;
        manager
            .publish(
                session.session_id,
                StreamEvent::Error {
                    kind: "all_specialists_failed".into(),
                    reason: "no data".into(),
                    aborted: false,
                },
            )
            .await;

        assert!(manager.is_finished(session.session_id).await);

        let (replay, _rx) = manager.attach(session.session_id, 1).await.unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].event.kind(), "error");
    }

    #[tokio::test]
    async fn test_expired_session_rejects_resume() {
        let manager = SessionManager::new(Duration::from_millis(10));
        let session = manager.open(Uuid::new_v4()).await;
        let gc = manager.spawn_gc();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = manager.attach(session.session_id, 0).await;
        assert!(matches!(
            result,
            Err(OrchestrationError::SessionExpired(_))
        ));
        gc.abort();
    }

    #[tokio::test]
    async fn test_publisher_task_stops_after_terminal_event() {
        let manager = SessionManager::new(Duration::from_secs(60));
        let session = manager.open(Uuid::new_v4()).await;

        let (tx, handle) = spawn_publisher(manager.clone(), session.session_id, 16);
        tx.send(segment(1)).await.unwrap();
        tx.send(StreamEvent::Error {
            kind: "aborted".into(),
            reason: "client abort".into(),
            aborted: true,
        })
        .await
        .unwrap();

        handle.await.unwrap();
        let info = manager.session(session.session_id).await.unwrap();
        assert_eq!(info.last_event_seq, 2);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = EventEnvelope {
            session_id: Uuid::nil(),
            seq: 7,
            ts: Utc::now(),
            event: StreamEvent::status("orchestrator", "working", "Classifying intent"),
        };

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["type"], "status");
        assert_eq!(json["payload"]["component"], "orchestrator");
    }
}
