//! Group chat message types.

use crate::identity::ClientId;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_LEN: usize = 65507;

/// Field tags used by the pipe framing (see wire module).
pub const TAG_CHAT: &str = "chat";
pub const TAG_PRIVATE: &str = "pm";
pub const TAG_PRESENCE: &str = "presence";
pub const TAG_GOODBYE: &str = "bye";

/// Everything a session can put on the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Public line from `sender`.
    Chat { sender: String, text: String },
    /// Line meant for one nickname. Every member receives it; only the target shows it.
    Private { target: String, text: String },
    /// Heartbeat: "nickname is still online".
    Presence { nickname: String },
    /// Clean leave.
    Goodbye { nickname: String },
}

impl Message {
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Chat { .. } => TAG_CHAT,
            Message::Private { .. } => TAG_PRIVATE,
            Message::Presence { .. } => TAG_PRESENCE,
            Message::Goodbye { .. } => TAG_GOODBYE,
        }
    }
}

/// A message together with the client id of the session that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub client_id: ClientId,
    pub message: Message,
}

impl Packet {
    pub fn new(client_id: ClientId, message: Message) -> Self {
        Self { client_id, message }
    }
}
