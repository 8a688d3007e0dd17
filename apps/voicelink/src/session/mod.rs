//! Offer/answer state machine for the single controller this agent serves.
//!
//! Everything here runs on one task. Relay frames, negotiator callbacks and
//! the completions of spawned negotiation work all arrive as
//! [`CoordinatorInput`]s and are handled one at a time, so the ICE buffers
//! and flags in [`Session`] have exactly one writer. Completions carry the
//! generation of the session that started them; a completion for a session
//! that has since been torn down is dropped.

use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use signal_proto::{decode, encode, IceCandidate, OutboundSignal, SignalEvent};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::IceServer;
use crate::host::HostShell;
use crate::negotiator::{
    ConnectionState, MediaNegotiator, NegotiationError, NegotiatorEvent, NegotiatorFactory,
};
use crate::signaling::{ChannelEvent, SignalSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub peer_id: String,
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Negotiating,
    Active,
    Terminated,
}

/// Point-in-time copy of the coordinator's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub phase: Phase,
    /// `None` while idle.
    pub generation: Option<u64>,
    pub offer_sent: bool,
    pub answer_received: bool,
    pub remote_description_applied: bool,
    pub pending_local: usize,
    pub pending_remote: usize,
    pub terminated_sessions: u64,
}

enum CoordinatorInput {
    Negotiator {
        generation: u64,
        event: NegotiatorEvent,
    },
    OfferReady {
        generation: u64,
        result: Result<String, NegotiationError>,
    },
    RemoteApplied {
        generation: u64,
        result: Result<(), NegotiationError>,
    },
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

struct Session {
    generation: u64,
    phase: Phase,
    negotiator: Arc<dyn MediaNegotiator>,
    pending_local: Vec<IceCandidate>,
    pending_remote: Vec<IceCandidate>,
    offer_sent: bool,
    answer_received: bool,
    remote_description_applied: bool,
    /// Event pump plus in-flight offer/answer work.
    tasks: Vec<JoinHandle<()>>,
    negotiator_closed: bool,
}

impl Session {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Session {
    // Only reached without teardown when the coordinator task is aborted.
    fn drop(&mut self) {
        self.abort_tasks();
        if self.negotiator_closed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let negotiator = Arc::clone(&self.negotiator);
        let generation = self.generation;
        runtime.spawn(async move {
            if let Err(err) = negotiator.close().await {
                tracing::warn!(target = "session", generation, error = %err, "negotiator close failed");
            }
        });
    }
}

pub struct Coordinator {
    config: SessionConfig,
    sink: Arc<dyn SignalSink>,
    factory: Arc<dyn NegotiatorFactory>,
    host: Arc<dyn HostShell>,
    inputs: mpsc::UnboundedSender<CoordinatorInput>,
    session: Option<Session>,
    last_generation: u64,
    terminated_sessions: u64,
}

impl Coordinator {
    /// Starts the coordinator task. It consumes `inbound` until shut down.
    pub fn spawn(
        config: SessionConfig,
        sink: Arc<dyn SignalSink>,
        factory: Arc<dyn NegotiatorFactory>,
        host: Arc<dyn HostShell>,
        inbound: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> CoordinatorHandle {
        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            config,
            sink,
            factory,
            host,
            inputs: inputs.clone(),
            session: None,
            last_generation: 0,
            terminated_sessions: 0,
        };
        let task = tokio::spawn(coordinator.run(inbound, inputs_rx));
        CoordinatorHandle {
            inputs,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<ChannelEvent>,
        mut inputs: mpsc::UnboundedReceiver<CoordinatorInput>,
    ) {
        tracing::debug!(target = "session", peer_id = %self.config.peer_id, "coordinator running");
        loop {
            tokio::select! {
                // relay frames first so a snapshot reflects every frame queued before it
                biased;
                Some(event) = inbound.recv() => self.on_channel_event(event).await,
                Some(input) = inputs.recv() => match input {
                    CoordinatorInput::Shutdown(done) => {
                        self.teardown("coordinator shutdown").await;
                        let _ = done.send(());
                        break;
                    }
                    input => self.on_input(input).await,
                },
                else => break,
            }
        }
        tracing::debug!(target = "session", "coordinator stopped");
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Frame(raw) => self.on_signal(decode(&raw)).await,
            ChannelEvent::Lost { reason } => {
                if self.session.is_some() {
                    tracing::warn!(target = "session", reason = %reason, "relay lost mid-session");
                    self.teardown("relay connection lost").await;
                }
            }
        }
    }

    async fn on_input(&mut self, input: CoordinatorInput) {
        match input {
            CoordinatorInput::Negotiator { generation, event } => {
                if self.is_current(generation) {
                    self.on_negotiator_event(event).await;
                } else {
                    tracing::trace!(target = "session", generation, "stale negotiator event dropped");
                }
            }
            CoordinatorInput::OfferReady { generation, result } => {
                if self.is_current(generation) {
                    self.on_offer_ready(result).await;
                } else {
                    tracing::debug!(target = "session", generation, "stale offer dropped");
                }
            }
            CoordinatorInput::RemoteApplied { generation, result } => {
                if self.is_current(generation) {
                    self.on_remote_applied(result).await;
                } else {
                    tracing::debug!(target = "session", generation, "stale answer completion dropped");
                }
            }
            CoordinatorInput::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // handled by the run loop
            CoordinatorInput::Shutdown(_) => {}
        }
    }

    async fn on_signal(&mut self, event: SignalEvent) {
        tracing::debug!(target = "session", kind = event.kind(), "signal received");
        match event {
            SignalEvent::Start => self.start_session().await,
            SignalEvent::Stop => {
                if self.session.is_some() {
                    self.teardown("stop requested").await;
                } else {
                    tracing::debug!(target = "session", "stop while idle");
                }
            }
            SignalEvent::Answer { sdp } => self.on_answer(sdp).await,
            SignalEvent::IceCandidate(candidate) => self.on_remote_candidate(candidate).await,
            SignalEvent::Unknown { raw } => {
                tracing::debug!(target = "session", len = raw.len(), "ignoring unrecognised frame");
            }
        }
    }

    async fn start_session(&mut self) {
        if self.session.is_some() {
            tracing::info!(target = "session", "start while negotiating, replacing session");
            self.teardown("superseded by start").await;
        }

        self.last_generation += 1;
        let generation = self.last_generation;
        let (negotiator, mut events) = match self.factory.create(&self.config.ice_servers).await {
            Ok(created) => created,
            Err(err) => {
                tracing::error!(target = "session", generation, error = %err, "could not create negotiator");
                self.terminated_sessions += 1;
                self.host.notify_user("Negotiation failed", &err.to_string());
                return;
            }
        };

        let inputs = self.inputs.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if inputs
                    .send(CoordinatorInput::Negotiator { generation, event })
                    .is_err()
                {
                    break;
                }
            }
        });

        let inputs = self.inputs.clone();
        let offering = Arc::clone(&negotiator);
        let offer = tokio::spawn(async move {
            let result = prepare_offer(offering.as_ref()).await;
            let _ = inputs.send(CoordinatorInput::OfferReady { generation, result });
        });

        self.session = Some(Session {
            generation,
            phase: Phase::Negotiating,
            negotiator,
            pending_local: Vec::new(),
            pending_remote: Vec::new(),
            offer_sent: false,
            answer_received: false,
            remote_description_applied: false,
            tasks: vec![pump, offer],
            negotiator_closed: false,
        });
        tracing::info!(target = "session", generation, phase = ?Phase::Negotiating, "session started");
    }

    async fn on_offer_ready(&mut self, result: Result<String, NegotiationError>) {
        let sdp = match result {
            Ok(sdp) => sdp,
            Err(err) => return self.negotiation_failed(err).await,
        };
        if let Some(session) = self.session.as_mut() {
            session.offer_sent = true;
        }
        let offer = OutboundSignal::Offer {
            peer_id: self.config.peer_id.clone(),
            sdp,
        };
        if self.emit(&offer).await {
            tracing::info!(target = "session", peer_id = %self.config.peer_id, "offer sent");
        }
    }

    async fn on_answer(&mut self, sdp: String) {
        let Some(session) = self.session.as_mut() else {
            tracing::warn!(target = "session", "answer without a session ignored");
            return;
        };
        if session.answer_received {
            tracing::warn!(target = "session", generation = session.generation, "duplicate answer ignored");
            return;
        }
        session.answer_received = true;
        session.phase = Phase::Active;
        let generation = session.generation;
        let pending = mem::take(&mut session.pending_local);

        let negotiator = Arc::clone(&session.negotiator);
        let inputs = self.inputs.clone();
        session.tasks.push(tokio::spawn(async move {
            let result = negotiator.set_remote_description(sdp).await;
            let _ = inputs.send(CoordinatorInput::RemoteApplied { generation, result });
        }));
        tracing::info!(
            target = "session",
            generation,
            phase = ?Phase::Active,
            flushed = pending.len(),
            "answer received"
        );

        for candidate in pending {
            if !self.emit_candidate(candidate).await {
                return;
            }
        }
    }

    async fn on_remote_applied(&mut self, result: Result<(), NegotiationError>) {
        if let Err(err) = result {
            return self.negotiation_failed(err).await;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.remote_description_applied = true;
        let pending = mem::take(&mut session.pending_remote);
        let negotiator = Arc::clone(&session.negotiator);
        tracing::debug!(
            target = "session",
            generation = session.generation,
            buffered = pending.len(),
            "remote description applied"
        );
        for candidate in &pending {
            negotiator.add_ice_candidate(candidate).await;
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!(target = "session", "remote candidate without a session dropped");
            return;
        };
        if session.remote_description_applied {
            let negotiator = Arc::clone(&session.negotiator);
            negotiator.add_ice_candidate(&candidate).await;
        } else {
            session.pending_remote.push(candidate);
            tracing::debug!(
                target = "session",
                buffered = session.pending_remote.len(),
                "remote candidate buffered"
            );
        }
    }

    async fn on_negotiator_event(&mut self, event: NegotiatorEvent) {
        match event {
            NegotiatorEvent::LocalCandidate(candidate) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                if session.answer_received {
                    self.emit_candidate(candidate).await;
                } else {
                    session.pending_local.push(candidate);
                }
            }
            NegotiatorEvent::ConnectionState(state) => {
                tracing::info!(target = "session", state = ?state, "peer connection state");
                if state == ConnectionState::Failed {
                    self.teardown("peer connection failed").await;
                    self.host
                        .notify_user("Connection failed", "The peer connection could not be established.");
                } else if state.is_terminal() {
                    self.teardown("peer connection closed").await;
                }
            }
        }
    }

    async fn emit_candidate(&mut self, candidate: IceCandidate) -> bool {
        let signal = OutboundSignal::IceCandidate {
            peer_id: self.config.peer_id.clone(),
            candidate,
        };
        self.emit(&signal).await
    }

    /// Queues one frame. A dead channel abandons the session.
    async fn emit(&mut self, signal: &OutboundSignal) -> bool {
        match self.sink.send(encode(signal)) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(target = "session", error = %err, "cannot reach relay, abandoning session");
                self.teardown("signaling channel closed").await;
                false
            }
        }
    }

    async fn negotiation_failed(&mut self, err: NegotiationError) {
        tracing::error!(target = "session", error = %err, "negotiation failed");
        self.teardown("negotiation failed").await;
        self.host.notify_user("Negotiation failed", &err.to_string());
    }

    async fn teardown(&mut self, reason: &str) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.abort_tasks();
        if let Err(err) = session.negotiator.close().await {
            tracing::warn!(target = "session", error = %err, "negotiator close failed");
        }
        session.negotiator_closed = true;
        self.terminated_sessions += 1;
        tracing::info!(
            target = "session",
            generation = session.generation,
            phase = ?Phase::Terminated,
            reason,
            dropped_local = session.pending_local.len(),
            dropped_remote = session.pending_remote.len(),
            "session terminated"
        );
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.generation == generation)
    }

    fn snapshot(&self) -> SessionSnapshot {
        match &self.session {
            Some(session) => SessionSnapshot {
                phase: session.phase,
                generation: Some(session.generation),
                offer_sent: session.offer_sent,
                answer_received: session.answer_received,
                remote_description_applied: session.remote_description_applied,
                pending_local: session.pending_local.len(),
                pending_remote: session.pending_remote.len(),
                terminated_sessions: self.terminated_sessions,
            },
            None => SessionSnapshot {
                phase: Phase::Idle,
                generation: None,
                offer_sent: false,
                answer_received: false,
                remote_description_applied: false,
                pending_local: 0,
                pending_remote: 0,
                terminated_sessions: self.terminated_sessions,
            },
        }
    }
}

async fn prepare_offer(negotiator: &dyn MediaNegotiator) -> Result<String, NegotiationError> {
    let sdp = negotiator.create_offer().await?;
    negotiator.set_local_description(sdp.clone()).await?;
    Ok(sdp)
}

/// Owner-side handle to a running [`Coordinator`].
pub struct CoordinatorHandle {
    inputs: mpsc::UnboundedSender<CoordinatorInput>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinatorHandle {
    /// `None` once the coordinator has stopped.
    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let (reply, answer) = oneshot::channel();
        self.inputs.send(CoordinatorInput::Snapshot(reply)).ok()?;
        answer.await.ok()
    }

    /// Tears down any live session and waits for the task to finish.
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.inputs.send(CoordinatorInput::Shutdown(done)).is_ok() {
            let _ = finished.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
