//! Session coordinator: wires the group socket to ChatCore, runs the receive and heartbeat tasks.

use std::sync::Arc;
use std::time::Duration;

use lanchat_core::envelope::DEFAULT_MAX_MESSAGE_BYTES;
use lanchat_core::presence::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_PRESENCE_TIMEOUT};
use lanchat_core::{
    now_millis, ChatCore, ChatEvent, ClientId, Codec, CoreConfig, GroupKey, Millis,
    NicknameError, OutboundError,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{self, GroupSocket, MulticastGroup, NetworkError, SendError};

/// Default time allowed for the goodbye datagram to leave the host.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(300);

/// UI collaborator. Called from the receive and heartbeat tasks; implementations marshal to their own thread.
pub trait ChatHandler: Send + Sync {
    fn on_chat_message(&self, sender: &str, text: &str);

    /// Private line addressed to this session.
    fn on_private_message(&self, sender: &str, text: &str) {
        self.on_chat_message(sender, text);
    }

    fn on_presence_update(&self, nickname: &str, timestamp: Millis);

    fn on_user_joined(&self, _nickname: &str) {}

    fn on_user_left(&self, nickname: &str);

    fn on_network_status(&self, info: &str);
}

/// Callback payloads as values, for front ends that prefer a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Chat(ChatEvent),
    NetworkStatus(String),
}

impl ChatHandler for mpsc::UnboundedSender<SessionEvent> {
    fn on_chat_message(&self, sender: &str, text: &str) {
        let _ = self.send(SessionEvent::Chat(ChatEvent::Message {
            sender: sender.to_string(),
            text: text.to_string(),
        }));
    }

    fn on_private_message(&self, sender: &str, text: &str) {
        let _ = self.send(SessionEvent::Chat(ChatEvent::Private {
            sender: sender.to_string(),
            text: text.to_string(),
        }));
    }

    fn on_presence_update(&self, nickname: &str, timestamp: Millis) {
        let _ = self.send(SessionEvent::Chat(ChatEvent::Presence {
            nickname: nickname.to_string(),
            timestamp,
        }));
    }

    fn on_user_joined(&self, nickname: &str) {
        let _ = self.send(SessionEvent::Chat(ChatEvent::Joined {
            nickname: nickname.to_string(),
        }));
    }

    fn on_user_left(&self, nickname: &str) {
        let _ = self.send(SessionEvent::Chat(ChatEvent::Left {
            nickname: nickname.to_string(),
        }));
    }

    fn on_network_status(&self, info: &str) {
        let _ = self.send(SessionEvent::NetworkStatus(info.to_string()));
    }
}

fn deliver(handler: &dyn ChatHandler, event: ChatEvent) {
    match event {
        ChatEvent::Message { sender, text } => handler.on_chat_message(&sender, &text),
        ChatEvent::Private { sender, text } => handler.on_private_message(&sender, &text),
        ChatEvent::Presence {
            nickname,
            timestamp,
        } => handler.on_presence_update(&nickname, timestamp),
        ChatEvent::Joined { nickname } => handler.on_user_joined(&nickname),
        ChatEvent::Left { nickname } => handler.on_user_left(&nickname),
    }
}

/// Everything a session needs besides the socket and the handler.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub nickname: String,
    pub client_id: ClientId,
    pub key: GroupKey,
    pub max_message_bytes: usize,
    pub heartbeat_interval: Duration,
    pub presence_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl SessionConfig {
    pub fn new(nickname: impl Into<String>, key: GroupKey) -> Self {
        Self {
            nickname: nickname.into(),
            client_id: ClientId::generate(),
            key,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            presence_timeout: DEFAULT_PRESENCE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid nickname: {0}")]
    Nickname(#[from] NicknameError),
    #[error("heartbeat interval {heartbeat:?} must be shorter than presence timeout {timeout:?}")]
    HeartbeatTooSlow {
        heartbeat: Duration,
        timeout: Duration,
    },
    #[error("network setup: {0}")]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Outbound(#[from] OutboundError),
    #[error(transparent)]
    Send(#[from] SendError),
}

impl SessionError {
    /// The message could not fit a datagram; only the sender is told.
    pub fn is_oversized(&self) -> bool {
        matches!(
            self,
            SessionError::Outbound(OutboundError::Oversized { .. })
                | SessionError::Send(SendError::Oversized { .. })
        )
    }
}

/// A running chat session on one group socket.
pub struct Session<S: GroupSocket + 'static = MulticastGroup> {
    core: Arc<ChatCore>,
    socket: Arc<S>,
    shutdown_grace: Duration,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session<MulticastGroup> {
    /// Open the multicast group and start a session on it. Setup failures are reported to the handler once.
    pub async fn join(
        config: SessionConfig,
        group: std::net::Ipv4Addr,
        port: u16,
        handler: Arc<dyn ChatHandler>,
    ) -> Result<Self, SessionError> {
        let socket = match MulticastGroup::open(group, port) {
            Ok(s) => s,
            Err(e) => {
                handler.on_network_status(&format!("ERROR: {e} | Status: Disconnected"));
                return Err(e.into());
            }
        };
        handler.on_network_status(&format!(
            "{} | Multicast: {}",
            socket.joined_via(),
            socket.group()
        ));
        Self::start(config, Arc::new(socket), handler).await
    }
}

impl<S: GroupSocket + 'static> Session<S> {
    /// Start the receive and heartbeat tasks on `socket` and announce presence.
    pub async fn start(
        config: SessionConfig,
        socket: Arc<S>,
        handler: Arc<dyn ChatHandler>,
    ) -> Result<Self, SessionError> {
        if config.heartbeat_interval >= config.presence_timeout {
            return Err(SessionError::HeartbeatTooSlow {
                heartbeat: config.heartbeat_interval,
                timeout: config.presence_timeout,
            });
        }
        let core = Arc::new(ChatCore::new(CoreConfig {
            nickname: config.nickname,
            client_id: config.client_id,
            codec: Codec::new(config.key, config.max_message_bytes),
            presence_timeout: config.presence_timeout,
        })?);
        let (stop, stop_rx) = watch::channel(false);

        let recv_task = {
            let core = core.clone();
            let socket = socket.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                transport::receive_loop(socket.as_ref(), |datagram| {
                    for event in core.on_datagram(datagram, now_millis()) {
                        deliver(handler.as_ref(), event);
                    }
                })
                .await;
            })
        };
        let heartbeat_task = tokio::spawn(heartbeat_loop(
            core.clone(),
            socket.clone(),
            handler,
            config.heartbeat_interval,
            stop_rx,
        ));

        let session = Self {
            core,
            socket,
            shutdown_grace: config.shutdown_grace,
            stop,
            tasks: Mutex::new(vec![recv_task, heartbeat_task]),
        };
        info!(
            nickname = session.core.nickname(),
            client_id = %session.core.client_id(),
            "session started"
        );
        session.send_presence().await;
        Ok(session)
    }

    pub fn nickname(&self) -> &str {
        self.core.nickname()
    }

    pub fn client_id(&self) -> &ClientId {
        self.core.client_id()
    }

    /// Broadcast a public line.
    pub async fn send_chat(&self, text: &str) -> Result<(), SessionError> {
        let datagram = self.core.chat(text)?;
        self.socket.send(&datagram).await?;
        Ok(())
    }

    /// Broadcast a line that only `target` will display.
    pub async fn send_private(&self, target: &str, text: &str) -> Result<(), SessionError> {
        let datagram = self.core.private(target, text)?;
        self.socket.send(&datagram).await?;
        Ok(())
    }

    /// Online members other than this session, sorted.
    pub fn users(&self) -> Vec<String> {
        self.core.users(now_millis())
    }

    async fn send_presence(&self) {
        match self.core.presence() {
            Ok(d) => {
                if let Err(e) = self.socket.send(&d).await {
                    warn!("presence send failed: {}", e);
                }
            }
            Err(e) => warn!("presence encode failed: {}", e),
        }
    }

    async fn send_goodbye(&self) {
        match self.core.goodbye() {
            Ok(d) => {
                if let Err(e) = self.socket.send(&d).await {
                    warn!("goodbye send failed: {}", e);
                }
            }
            Err(e) => warn!("goodbye encode failed: {}", e),
        }
    }

    /// Say goodbye, give the datagram time to leave, then stop both tasks and close the socket.
    /// Later calls return immediately.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        self.send_goodbye().await;
        tokio::time::sleep(self.shutdown_grace).await;
        self.stop.send_replace(true);
        self.socket.close();
        for task in tasks {
            let _ = task.await;
        }
        info!(nickname = self.core.nickname(), "session closed");
    }
}

impl<S: GroupSocket + 'static> Drop for Session<S> {
    fn drop(&mut self) {
        self.stop.send_replace(true);
        self.socket.close();
    }
}

async fn heartbeat_loop<S: GroupSocket + ?Sized>(
    core: Arc<ChatCore>,
    socket: Arc<S>,
    handler: Arc<dyn ChatHandler>,
    every: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately; start() already announced us.
    interval.tick().await;
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                let tick = core.tick(now_millis());
                for nickname in &tick.left {
                    handler.on_user_left(nickname);
                }
                match tick.heartbeat {
                    Ok(d) => {
                        if let Err(e) = socket.send(&d).await {
                            warn!("heartbeat send failed: {}", e);
                        }
                    }
                    Err(e) => warn!("heartbeat encode failed: {}", e),
                }
            }
        }
    }
    debug!("heartbeat loop stopped");
}
