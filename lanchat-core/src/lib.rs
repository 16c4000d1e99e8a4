//! LAN group chat protocol over UDP multicast.
//! Host-driven: no I/O; host passes datagrams and ticks in, receives events and frames out.

pub mod core;
pub mod envelope;
pub mod identity;
pub mod presence;
pub mod protocol;
pub mod wire;

pub use crate::core::{ChatCore, ChatEvent, CoreConfig, OutboundError, Tick};
pub use envelope::{Codec, EnvelopeError, GroupKey, KeyError};
pub use identity::{validate_nickname, ClientId, NicknameError};
pub use presence::{now_millis, Millis, PresenceRegistry};
pub use protocol::{Message, Packet, MAX_DATAGRAM_LEN};
pub use wire::{decode_frame, encode_frame, Frame};
