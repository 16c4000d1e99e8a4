//! Host-driven API: ChatCore receives datagrams and ticks from the host, returns events and frames.

use std::time::Duration;

use crate::envelope::{Codec, EnvelopeError};
use crate::identity::{validate_nickname, ClientId, NicknameError};
use crate::presence::{Millis, PresenceRegistry};
use crate::protocol::{Message, Packet, MAX_DATAGRAM_LEN};
use crate::wire::{self, Frame};

/// Settings for one chat session.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub nickname: String,
    pub client_id: ClientId,
    pub codec: Codec,
    pub presence_timeout: Duration,
}

/// Something the UI should show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Public line. `sender` is empty for unattributed lines.
    Message { sender: String, text: String },
    /// Private line addressed to this session.
    Private { sender: String, text: String },
    /// Heartbeat from a member (every receipt, not only the first).
    Presence { nickname: String, timestamp: Millis },
    /// First heartbeat from a member not yet online.
    Joined { nickname: String },
    /// Member left by goodbye or timeout.
    Left { nickname: String },
}

/// Output of a periodic tick.
#[derive(Debug)]
pub struct Tick {
    /// Encrypted presence datagram to broadcast.
    pub heartbeat: Result<Vec<u8>, OutboundError>,
    /// Members evicted by this tick's sweep.
    pub left: Vec<String>,
}

/// Protocol state for one session. Holds no sockets.
pub struct ChatCore {
    nickname: String,
    client_id: ClientId,
    codec: Codec,
    registry: PresenceRegistry,
}

impl ChatCore {
    pub fn new(config: CoreConfig) -> Result<Self, NicknameError> {
        let nickname = validate_nickname(&config.nickname)?.to_string();
        Ok(Self {
            nickname,
            client_id: config.client_id,
            codec: config.codec,
            registry: PresenceRegistry::new(config.presence_timeout),
        })
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    /// Frame, encrypt and size-check a message from this session.
    /// The header is never truncated; `chat` and `private` cap the text before framing.
    pub fn outbound(&self, message: Message) -> Result<Vec<u8>, OutboundError> {
        let packet = Packet::new(self.client_id.clone(), message);
        let plaintext = wire::encode_frame(&packet);
        let blob = self.codec.seal(&plaintext)?;
        if blob.len() > MAX_DATAGRAM_LEN {
            return Err(OutboundError::Oversized { len: blob.len() });
        }
        Ok(blob.into_bytes())
    }

    pub fn chat(&self, text: &str) -> Result<Vec<u8>, OutboundError> {
        self.outbound(Message::Chat {
            sender: self.nickname.clone(),
            text: self.codec.bound(text).into_owned(),
        })
    }

    pub fn private(&self, target: &str, text: &str) -> Result<Vec<u8>, OutboundError> {
        let target = validate_nickname(target).map_err(OutboundError::Target)?;
        self.outbound(Message::Private {
            target: target.to_string(),
            text: self.codec.bound(text).into_owned(),
        })
    }

    pub fn presence(&self) -> Result<Vec<u8>, OutboundError> {
        self.outbound(Message::Presence {
            nickname: self.nickname.clone(),
        })
    }

    pub fn goodbye(&self) -> Result<Vec<u8>, OutboundError> {
        self.outbound(Message::Goodbye {
            nickname: self.nickname.clone(),
        })
    }

    /// Process one received datagram. Undecryptable input is dropped without an event.
    pub fn on_datagram(&self, bytes: &[u8], now: Millis) -> Vec<ChatEvent> {
        let blob = match std::str::from_utf8(bytes) {
            Ok(s) => s,
            Err(_) => {
                tracing::trace!(len = bytes.len(), "dropping non-text datagram");
                return Vec::new();
            }
        };
        let plaintext = match self.codec.decrypt(blob) {
            Ok(p) => p,
            Err(e) => {
                tracing::trace!(error = %e, len = bytes.len(), "dropping undecryptable datagram");
                return Vec::new();
            }
        };
        match wire::decode_frame(plaintext.as_bytes()) {
            Frame::Packet(packet) => self.on_packet(packet, now),
            Frame::Unrecognized(line) => unattributed_line(line).into_iter().collect(),
        }
    }

    fn on_packet(&self, packet: Packet, now: Millis) -> Vec<ChatEvent> {
        if packet.client_id == self.client_id {
            return Vec::new();
        }
        let mut events = Vec::new();
        match packet.message {
            Message::Chat { sender, text } => {
                events.push(ChatEvent::Message { sender, text });
            }
            Message::Private { target, text } => {
                if target != self.nickname {
                    return events;
                }
                let sender = self
                    .registry
                    .nickname_for(&packet.client_id)
                    .unwrap_or_else(|| packet.client_id.to_string());
                events.push(ChatEvent::Private { sender, text });
            }
            Message::Presence { nickname } => {
                if self.registry.upsert(&nickname, &packet.client_id, now) {
                    tracing::debug!(%nickname, "member online");
                    events.push(ChatEvent::Joined {
                        nickname: nickname.clone(),
                    });
                }
                events.push(ChatEvent::Presence {
                    nickname,
                    timestamp: now,
                });
            }
            Message::Goodbye { nickname } => {
                if self.registry.remove(&nickname) {
                    tracing::debug!(%nickname, "member said goodbye");
                    events.push(ChatEvent::Left { nickname });
                }
            }
        }
        events
    }

    /// Periodic tick: sweep timed-out members and build this session's heartbeat.
    pub fn tick(&self, now: Millis) -> Tick {
        let left = self.registry.sweep(now);
        for nickname in &left {
            tracing::debug!(%nickname, "member timed out");
        }
        Tick {
            heartbeat: self.presence(),
            left,
        }
    }

    /// Online members as seen at `now`, excluding this session.
    pub fn users(&self, now: Millis) -> Vec<String> {
        self.registry.snapshot_at(now)
    }
}

/// Best-effort rendering of a payload that decrypted but did not parse.
fn unattributed_line(line: String) -> Option<ChatEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (sender, text) = match line.split_once(": ") {
        Some((s, t)) if !s.is_empty() && !s.contains(char::is_whitespace) => {
            (s.to_string(), t.to_string())
        }
        _ => (String::new(), line.to_string()),
    };
    Some(ChatEvent::Message { sender, text })
}

#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    #[error("envelope: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("datagram of {len} bytes exceeds the UDP limit")]
    Oversized { len: usize },
    #[error("invalid target: {0}")]
    Target(NicknameError),
}
