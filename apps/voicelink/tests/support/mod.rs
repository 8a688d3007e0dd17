#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_tungstenite::{accept_async, WebSocketStream};
use voicelink_core::config::IceServer;
use voicelink_core::host::HostShell;
use voicelink_core::negotiator::{
    MediaNegotiator, NegotiationError, NegotiatorEvent, NegotiatorEvents, NegotiatorFactory,
};
use voicelink_core::session::{Coordinator, CoordinatorHandle, SessionConfig, SessionSnapshot};
use voicelink_core::signaling::{ChannelError, ChannelEvent, SignalSink};
use voicelink_core::IceCandidate;

pub const PEER: &str = "1337";
pub const WAIT: Duration = Duration::from_secs(5);

/// Polls `check` until it holds, failing the test after [`WAIT`].
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let polled = tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

/// Awaits `fut`, failing the test after [`WAIT`].
pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(WAIT, fut).await {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

pub fn candidate(tag: &str) -> IceCandidate {
    IceCandidate::new(
        "0",
        0,
        format!("candidate:{tag} 1 udp 2122260223 10.0.0.1 50000 typ host"),
    )
}

pub fn ice_frame(tag: &str) -> String {
    format!("ice:{}", candidate(tag))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(usize),
    CreateOffer(usize),
    SetLocal(usize),
    SetRemote(usize, String),
    AddIce(usize, String),
    Close(usize),
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

pub struct FakeNegotiator {
    id: usize,
    log: CallLog,
    offer_gate: Option<Arc<Semaphore>>,
    remote_gate: Option<Arc<Semaphore>>,
    reject_remote: bool,
}

async fn pass(gate: &Option<Arc<Semaphore>>) {
    if let Some(gate) = gate {
        if let Ok(permit) = gate.acquire().await {
            permit.forget();
        }
    }
}

#[async_trait]
impl MediaNegotiator for FakeNegotiator {
    async fn create_offer(&self) -> Result<String, NegotiationError> {
        self.log.lock().push(Call::CreateOffer(self.id));
        pass(&self.offer_gate).await;
        Ok(format!("v=0\r\no=fake {} 0 IN IP4 127.0.0.1\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n", self.id))
    }

    async fn set_local_description(&self, _sdp: String) -> Result<(), NegotiationError> {
        self.log.lock().push(Call::SetLocal(self.id));
        Ok(())
    }

    async fn set_remote_description(&self, sdp: String) -> Result<(), NegotiationError> {
        self.log.lock().push(Call::SetRemote(self.id, sdp));
        pass(&self.remote_gate).await;
        if self.reject_remote {
            return Err(NegotiationError::RemoteDescription("answer rejected".into()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> bool {
        self.log
            .lock()
            .push(Call::AddIce(self.id, candidate.candidate.clone()));
        true
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.log.lock().push(Call::Close(self.id));
        Ok(())
    }
}

/// Hands out [`FakeNegotiator`]s numbered from 1 and keeps their event
/// senders so tests can play the media stack's side.
#[derive(Default)]
pub struct FakeFactory {
    pub log: CallLog,
    pub offer_gate: Option<Arc<Semaphore>>,
    pub remote_gate: Option<Arc<Semaphore>>,
    pub reject_remote: bool,
    pub refuse_create: bool,
    events: Mutex<Vec<mpsc::UnboundedSender<NegotiatorEvent>>>,
}

impl FakeFactory {
    /// Holds every `create_offer` until `gate` hands out a permit.
    pub fn with_offer_gate(gate: Arc<Semaphore>) -> Self {
        Self {
            offer_gate: Some(gate),
            ..Self::default()
        }
    }

    /// Holds every `set_remote_description` until `gate` hands out a permit.
    pub fn with_remote_gate(gate: Arc<Semaphore>) -> Self {
        Self {
            remote_gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn rejecting_remote() -> Self {
        Self {
            reject_remote: true,
            ..Self::default()
        }
    }

    pub fn refusing_create() -> Self {
        Self {
            refuse_create: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.log.lock().clone()
    }

    pub fn emit(&self, id: usize, event: NegotiatorEvent) {
        let events = self.events.lock();
        let _ = events[id - 1].send(event);
    }

    /// Whether anything still drains negotiator `id`'s events.
    pub fn pumping(&self, id: usize) -> bool {
        !self.events.lock()[id - 1].is_closed()
    }

    pub fn created(&self) -> usize {
        self.events.lock().len()
    }
}

#[async_trait]
impl NegotiatorFactory for FakeFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn MediaNegotiator>, NegotiatorEvents), NegotiationError> {
        if self.refuse_create {
            return Err(NegotiationError::Create("no audio device".into()));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let id = {
            let mut events = self.events.lock();
            events.push(events_tx);
            events.len()
        };
        self.log.lock().push(Call::Create(id));
        let negotiator = FakeNegotiator {
            id,
            log: Arc::clone(&self.log),
            offer_gate: self.offer_gate.clone(),
            remote_gate: self.remote_gate.clone(),
            reject_remote: self.reject_remote,
        };
        Ok((Arc::new(negotiator), events_rx))
    }
}

#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl RecordingSink {
    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl SignalSink for RecordingSink {
    fn send(&self, frame: String) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.frames.lock().push(frame);
        Ok(())
    }
}

pub struct FakeHost {
    permitted: bool,
    pub foreground_requested: AtomicBool,
    notifications: Mutex<Vec<(String, String)>>,
}

impl FakeHost {
    pub fn new(permitted: bool) -> Self {
        Self {
            permitted,
            foreground_requested: AtomicBool::new(false),
            notifications: Mutex::new(Vec::new()),
        }
    }

    pub fn titles(&self) -> Vec<String> {
        self.notifications
            .lock()
            .iter()
            .map(|(title, _)| title.clone())
            .collect()
    }
}

impl HostShell for FakeHost {
    fn check_capture_permission(&self) -> bool {
        self.permitted
    }

    fn request_foreground_execution(&self) {
        self.foreground_requested.store(true, Ordering::SeqCst);
    }

    fn notify_user(&self, title: &str, body: &str) {
        self.notifications
            .lock()
            .push((title.to_string(), body.to_string()));
    }
}

/// A coordinator wired to fakes on every side.
pub struct Harness {
    pub inbound: mpsc::UnboundedSender<ChannelEvent>,
    pub sink: Arc<RecordingSink>,
    pub factory: Arc<FakeFactory>,
    pub host: Arc<FakeHost>,
    pub coordinator: CoordinatorHandle,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_factory(FakeFactory::default())
    }

    pub fn with_factory(factory: FakeFactory) -> Self {
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let sink = Arc::new(RecordingSink::default());
        let factory = Arc::new(factory);
        let host = Arc::new(FakeHost::new(true));
        let coordinator = Coordinator::spawn(
            SessionConfig {
                peer_id: PEER.to_string(),
                ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            },
            Arc::clone(&sink) as Arc<dyn SignalSink>,
            Arc::clone(&factory) as Arc<dyn NegotiatorFactory>,
            Arc::clone(&host) as Arc<dyn HostShell>,
            inbound_rx,
        );
        Self {
            inbound,
            sink,
            factory,
            host,
            coordinator,
        }
    }

    pub fn frame(&self, raw: &str) {
        self.inbound
            .send(ChannelEvent::Frame(raw.to_string()))
            .expect("coordinator running");
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        within("snapshot", self.coordinator.snapshot())
            .await
            .expect("coordinator running")
    }

    /// Re-queries until `pred` holds; negotiator events reach the loop
    /// through a pump task, so a single query can be early.
    pub async fn snapshot_until(
        &self,
        what: &str,
        pred: impl Fn(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        within(what, async {
            loop {
                let snapshot = self.snapshot().await;
                if pred(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
    }

    pub async fn wait_for_frames(&self, count: usize) -> Vec<String> {
        let sink = Arc::clone(&self.sink);
        eventually(&format!("{count} outbound frames"), || sink.frames().len() >= count).await;
        self.sink.frames()
    }

    /// Sends `start` and waits for the offer it produces.
    pub async fn start_and_offer(&self) -> String {
        let before = self.sink.frames().len();
        self.frame("start");
        let frames = self.wait_for_frames(before + 1).await;
        frames[before].clone()
    }

    pub async fn wait_for_call(&self, call: Call) {
        let factory = Arc::clone(&self.factory);
        eventually(&format!("{call:?}"), || factory.calls().contains(&call)).await;
    }
}

pub fn position(calls: &[Call], call: &Call) -> usize {
    calls
        .iter()
        .position(|c| c == call)
        .unwrap_or_else(|| panic!("{call:?} missing from {calls:?}"))
}

/// In-process relay that hands each accepted WebSocket to the test.
pub struct Relay {
    pub addr: SocketAddr,
    pub accepted: mpsc::UnboundedReceiver<WebSocketStream<TcpStream>>,
    pub connections: Arc<AtomicUsize>,
}

impl Relay {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
        let addr = listener.local_addr().expect("relay addr");
        let (accepted_tx, accepted) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Ok(ws) = accept_async(stream).await {
                    if accepted_tx.send(ws).is_err() {
                        break;
                    }
                }
            }
        });
        Self {
            addr,
            accepted,
            connections,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn next_client(&mut self) -> WebSocketStream<TcpStream> {
        within("relay accept", self.accepted.recv())
            .await
            .expect("relay listener running")
    }
}

/// An address nothing listens on.
pub async fn dead_relay_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    format!("ws://{addr}")
}
