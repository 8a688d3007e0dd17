//! Process lifecycle: permission gate, notifications, and wiring the relay
//! channel to the session coordinator.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::AgentConfig;
use crate::negotiator::NegotiatorFactory;
use crate::session::{Coordinator, CoordinatorHandle, SessionSnapshot};
use crate::signaling::{ChannelError, ChannelState, SignalSink, SignalingChannel};

pub const RUNNING_TITLE: &str = "Service running";
pub const RUNNING_BODY: &str = "Waiting for the controller to start a session.";
pub const PERMISSION_TITLE: &str = "Permission required";
pub const PERMISSION_BODY: &str = "Audio recording permission is required to continue.";

/// What the agent needs from the environment it runs in.
pub trait HostShell: Send + Sync {
    fn check_capture_permission(&self) -> bool;
    fn request_foreground_execution(&self);
    fn notify_user(&self, title: &str, body: &str);
}

/// Host for a plain desktop process. Notifications go to the log.
#[derive(Debug, Clone)]
pub struct ProcessHost {
    capture_permitted: bool,
}

impl ProcessHost {
    pub fn new(capture_permitted: bool) -> Self {
        Self { capture_permitted }
    }
}

impl HostShell for ProcessHost {
    fn check_capture_permission(&self) -> bool {
        self.capture_permitted
    }

    fn request_foreground_execution(&self) {
        tracing::debug!(target = "host", "foreground execution requested");
    }

    fn notify_user(&self, title: &str, body: &str) {
        tracing::info!(target = "host", title, body, "notification");
    }
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("startup precondition unmet: {0}")]
    PreconditionUnmet(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// A running agent: one relay channel feeding one coordinator.
pub struct Agent {
    channel: Arc<SignalingChannel>,
    coordinator: CoordinatorHandle,
    supervisor: Option<JoinHandle<()>>,
}

impl Agent {
    pub async fn start(
        config: AgentConfig,
        host: Arc<dyn HostShell>,
        factory: Arc<dyn NegotiatorFactory>,
    ) -> Result<Self, StartupError> {
        host.request_foreground_execution();
        if !host.check_capture_permission() {
            tracing::error!(target = "host", "audio capture permission missing");
            host.notify_user(PERMISSION_TITLE, PERMISSION_BODY);
            return Err(StartupError::PreconditionUnmet(
                "audio capture permission missing".to_string(),
            ));
        }
        host.notify_user(RUNNING_TITLE, RUNNING_BODY);

        let channel = Arc::new(SignalingChannel::new(config.channel_config()?));
        let inbound = channel.take_inbound().ok_or(ChannelError::Closed)?;
        let coordinator = Coordinator::spawn(
            config.session_config(),
            Arc::clone(&channel) as Arc<dyn SignalSink>,
            factory,
            host,
            inbound,
        );

        if let Err(err) = channel.connect().await {
            tracing::warn!(target = "host", error = %err, "initial relay connect failed");
        }
        let supervisor = config
            .reconnect_delay
            .map(|delay| tokio::spawn(supervise(Arc::clone(&channel), delay)));

        tracing::info!(
            target = "host",
            client_id = %config.client_id,
            peer_id = %config.peer_id,
            reconnect = supervisor.is_some(),
            "agent started"
        );
        Ok(Self {
            channel,
            coordinator,
            supervisor,
        })
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        self.coordinator.snapshot().await
    }

    pub async fn shutdown(mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
        self.channel.close().await;
        self.coordinator.shutdown().await;
        tracing::info!(target = "host", "agent stopped");
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
    }
}

/// Re-dials the relay whenever the channel drops, `delay` after each loss
/// or failed attempt.
async fn supervise(channel: Arc<SignalingChannel>, delay: Duration) {
    let mut state = channel.subscribe_state();
    loop {
        let alive = state
            .wait_for(|state| *state == ChannelState::Disconnected)
            .await
            .is_ok();
        if !alive {
            break;
        }
        tokio::time::sleep(delay).await;
        tracing::info!(target = "host", "reconnecting to relay");
        if let Err(err) = channel.connect().await {
            tracing::warn!(target = "host", error = %err, "relay reconnect failed");
        }
    }
}
