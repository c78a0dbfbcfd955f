use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::instrument;

use utils::telemetry::SessionMetrics;

use conductor_types::{
    AgentId, ClientEnvelope, ClientFrame, ServerFrame, StreamErrorCode,
};

use crate::subsystems::aggregator::AggregatorEvent;
use crate::subsystems::registry::{AgentRegistry, Registration, RegistryError};
use crate::subsystems::scheduler::SchedulerEvent;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("agent {0} has no live session")]
    NoSession(AgentId),

    #[error("agent {0} session buffer is full")]
    Backpressure(AgentId),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
}

const OUTBOUND_BUFFER: usize = 64;

struct SessionHandle {
    token: u64,
    outbound: mpsc::Sender<ServerFrame>,
    shutdown: mpsc::Sender<StreamErrorCode>,
}

/// One long-lived bidirectional stream per connected agent.
///
/// The transport edge (a WebSocket upgrade, or a pair of channels in tests)
/// feeds client frames in and drains server frames out; `run_session` is the
/// reader loop. Writes from the scheduler go through the per-agent handle, so
/// backpressure is a bounded channel and cancellation is a channel close.
pub struct SessionManager {
    sessions: DashMap<AgentId, SessionHandle>,
    registry: Arc<AgentRegistry>,
    scheduler_tx: mpsc::Sender<SchedulerEvent>,
    aggregator_tx: mpsc::Sender<AggregatorEvent>,
    metrics: SessionMetrics,
    next_token: AtomicU64,
}

impl SessionManager {
    pub fn new(
        registry: Arc<AgentRegistry>,
        scheduler_tx: mpsc::Sender<SchedulerEvent>,
        aggregator_tx: mpsc::Sender<AggregatorEvent>,
        metrics: SessionMetrics,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            registry,
            scheduler_tx,
            aggregator_tx,
            metrics,
            next_token: AtomicU64::new(1),
        }
    }

    pub fn outbound_buffer() -> usize {
        OUTBOUND_BUFFER
    }

    /// The reader loop for one agent connection. Returns when the transport
    /// closes, the session is superseded, or the agent breaks protocol.
    #[instrument(skip_all, fields(subsys = "Session"))]
    pub async fn run_session(
        &self,
        mut inbound: mpsc::Receiver<ClientEnvelope>,
        outbound: mpsc::Sender<ServerFrame>,
    ) {
        // the first frame must be Register
        let envelope = match inbound.recv().await {
            Some(envelope) => envelope,
            None => return,
        };
        let registration = match registration_from_frame(&envelope.frame) {
            Some(registration) => registration,
            None => {
                self.metrics.increment_protocol_violations();
                let _ = outbound
                    .send(ServerFrame::StreamError {
                        code: StreamErrorCode::ProtocolViolation,
                        retry_after_secs: None,
                    })
                    .await;
                return;
            }
        };
        let agent_id = registration.agent_id;

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let handle = SessionHandle {
            token,
            outbound: outbound.clone(),
            shutdown: shutdown_tx,
        };

        // a duplicate Register supersedes the prior session and releases its
        // in-flight shards
        if let Some(old) = self.sessions.insert(agent_id, handle) {
            tracing::info!(agent_id = %agent_id, "superseding existing session");
            let _ = old.shutdown.try_send(StreamErrorCode::Superseded);
            if let Err(err) = self.release_agent(agent_id).await {
                tracing::error!(agent_id = %agent_id, "failed to release superseded agent: {err}");
            }
        }

        if let Err(err) = self.registry.register(registration).await {
            tracing::error!(agent_id = %agent_id, "registration failed: {err}");
            self.remove_session(agent_id, token);
            return;
        }
        self.metrics.increment_connected();

        let _ = outbound
            .send(ServerFrame::Ack {
                frame_id: envelope.frame_id,
            })
            .await;
        let _ = self
            .scheduler_tx
            .send(SchedulerEvent::AgentAvailable { agent_id })
            .await;

        loop {
            tokio::select! {
                maybe = inbound.recv() => {
                    let Some(envelope) = maybe else {
                        // transport break: the agent stays registered until
                        // the heartbeat sweep or an explicit disconnect
                        break;
                    };
                    self.metrics.increment_frames();
                    if !self.handle_frame(agent_id, &envelope).await {
                        self.metrics.increment_protocol_violations();
                        let _ = outbound.send(ServerFrame::StreamError {
                            code: StreamErrorCode::ProtocolViolation,
                            retry_after_secs: None,
                        }).await;
                        break;
                    }
                    if outbound.send(ServerFrame::Ack { frame_id: envelope.frame_id }).await.is_err() {
                        break;
                    }
                }
                code = shutdown_rx.recv() => {
                    if let Some(code) = code {
                        let retry_after_secs = match code {
                            StreamErrorCode::Shutdown => Some(30),
                            _ => None,
                        };
                        let _ = outbound.send(ServerFrame::StreamError { code, retry_after_secs }).await;
                    }
                    break;
                }
            }
        }

        self.remove_session(agent_id, token);
        self.metrics.decrement_connected();
        tracing::debug!(agent_id = %agent_id, "session closed");
    }

    /// Route one client frame. Returns false on a protocol violation.
    async fn handle_frame(&self, agent_id: AgentId, envelope: &ClientEnvelope) -> bool {
        match &envelope.frame {
            // a second Register on the same connection is not a reconnect
            ClientFrame::Register { .. } => return false,
            ClientFrame::Heartbeat { telemetry } => {
                if let Err(err) = self.registry.heartbeat(agent_id, *telemetry) {
                    tracing::warn!(agent_id = %agent_id, "heartbeat from unknown agent: {err}");
                }
            }
            ClientFrame::WorkAck { shard_id } => {
                let _ = self
                    .scheduler_tx
                    .send(SchedulerEvent::OfferAck {
                        agent_id,
                        shard_id: *shard_id,
                    })
                    .await;
            }
            ClientFrame::WorkNack { shard_id, reason } => {
                let _ = self
                    .scheduler_tx
                    .send(SchedulerEvent::OfferNack {
                        agent_id,
                        shard_id: *shard_id,
                        reason: reason.clone(),
                    })
                    .await;
            }
            ClientFrame::ShardStarted { shard_id, ts } => {
                let _ = self
                    .aggregator_tx
                    .send(AggregatorEvent::ShardStarted {
                        shard_id: *shard_id,
                        agent_id,
                        ts: *ts,
                    })
                    .await;
            }
            ClientFrame::ShardFinished {
                shard_id,
                status,
                counters,
                error,
            } => {
                let _ = self
                    .aggregator_tx
                    .send(AggregatorEvent::ShardFinished {
                        shard_id: *shard_id,
                        status: *status,
                        counters: *counters,
                        error: error.clone(),
                    })
                    .await;
            }
            ClientFrame::Result { shard_id, result } => {
                let _ = self
                    .aggregator_tx
                    .send(AggregatorEvent::Result {
                        shard_id: *shard_id,
                        result: result.clone(),
                    })
                    .await;
            }
            ClientFrame::LogChunk {
                shard_id,
                seq,
                stream,
                data,
            } => {
                let _ = self
                    .aggregator_tx
                    .send(AggregatorEvent::LogChunk {
                        shard_id: *shard_id,
                        seq: *seq,
                        stream: *stream,
                        data: data.clone(),
                    })
                    .await;
            }
            ClientFrame::ArtifactUploaded { shard_id, artifact } => {
                let _ = self
                    .aggregator_tx
                    .send(AggregatorEvent::ArtifactUploaded {
                        shard_id: *shard_id,
                        artifact: artifact.clone(),
                    })
                    .await;
            }
        }
        true
    }

    /// Non-blocking send used by the scheduler. A full buffer is surfaced as
    /// backpressure so the caller can treat the agent as unavailable.
    pub fn try_send(&self, agent_id: AgentId, frame: ServerFrame) -> Result<(), SessionError> {
        let handle = self
            .sessions
            .get(&agent_id)
            .ok_or(SessionError::NoSession(agent_id))?;
        handle.outbound.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SessionError::Backpressure(agent_id),
            mpsc::error::TrySendError::Closed(_) => SessionError::NoSession(agent_id),
        })
    }

    /// Graceful-shutdown fan-out: every live agent is told to stop taking new
    /// work while in-flight shards finish.
    pub async fn broadcast_drain(&self) {
        let agent_ids: Vec<AgentId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for agent_id in agent_ids {
            if let Err(err) = self.try_send(agent_id, ServerFrame::Drain {}) {
                tracing::warn!(agent_id = %agent_id, "drain not delivered: {err}");
            }
        }
    }

    /// Tear down an agent's session, if one is live.
    pub fn close(&self, agent_id: AgentId, code: StreamErrorCode) {
        if let Some(handle) = self.sessions.get(&agent_id) {
            let _ = handle.shutdown.try_send(code);
        }
    }

    /// Sweep teardown for an agent whose heartbeat expired.
    pub async fn expire_agent(&self, agent_id: AgentId) {
        self.close(agent_id, StreamErrorCode::Shutdown);
        if let Err(err) = self.release_agent(agent_id).await {
            tracing::error!(agent_id = %agent_id, "failed to release expired agent: {err}");
        }
    }

    /// A clean close from the agent is an explicit disconnect: the agent goes
    /// offline immediately instead of waiting for the sweep.
    pub async fn explicit_disconnect(&self, agent_id: AgentId) {
        self.close(agent_id, StreamErrorCode::Shutdown);
        if let Err(err) = self.release_agent(agent_id).await {
            tracing::error!(agent_id = %agent_id, "failed to release disconnected agent: {err}");
        }
    }

    /// Take the agent offline and hand its shards to the scheduler, which
    /// decides requeue vs. error per shard.
    async fn release_agent(&self, agent_id: AgentId) -> Result<(), SessionError> {
        let released = self.registry.mark_offline(agent_id).await?;
        let _ = self
            .scheduler_tx
            .send(SchedulerEvent::ShardsReleased {
                agent_id,
                shard_ids: released,
            })
            .await;
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn remove_session(&self, agent_id: AgentId, token: u64) {
        // only remove our own entry; a superseding session may have replaced it
        self.sessions
            .remove_if(&agent_id, |_, handle| handle.token == token);
    }
}

fn registration_from_frame(frame: &ClientFrame) -> Option<Registration> {
    match frame {
        ClientFrame::Register {
            agent_id,
            name,
            zones,
            max_parallel,
            container_capable,
            version,
        } => Some(Registration {
            agent_id: *agent_id,
            name: name.clone(),
            zones: zones.clone(),
            max_parallel: *max_parallel,
            container_capable: *container_capable,
            version: version.clone(),
        }),
        _ => None,
    }
}
