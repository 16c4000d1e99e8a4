//! Framing: pipe-delimited text, `<clientId>|<tag>|<field>[|<text>]`.
//!
//! Free text always sits in the last field so a `|` inside it survives the split.

use crate::identity::ClientId;
use crate::protocol::{Message, Packet, TAG_CHAT, TAG_GOODBYE, TAG_PRESENCE, TAG_PRIVATE};

const SEPARATOR: char = '|';
const MAX_FIELDS: usize = 4;

/// Result of decoding one plaintext payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Packet(Packet),
    /// Anything that does not match a known shape, as (lossy) text.
    Unrecognized(String),
}

/// Encode a packet as its plaintext frame.
pub fn encode_frame(packet: &Packet) -> String {
    let id = packet.client_id.as_str();
    let tag = packet.message.tag();
    match &packet.message {
        Message::Chat { sender, text } => format!("{id}|{tag}|{sender}|{text}"),
        Message::Private { target, text } => format!("{id}|{tag}|{target}|{text}"),
        Message::Presence { nickname } | Message::Goodbye { nickname } => {
            format!("{id}|{tag}|{nickname}")
        }
    }
}

/// Classify a plaintext payload. Never fails: unknown shapes fall back to [`Frame::Unrecognized`].
pub fn decode_frame(bytes: &[u8]) -> Frame {
    let text = String::from_utf8_lossy(bytes);
    match parse_packet(&text) {
        Some(packet) => Frame::Packet(packet),
        None => Frame::Unrecognized(text.into_owned()),
    }
}

fn parse_packet(text: &str) -> Option<Packet> {
    let fields: Vec<&str> = text.splitn(MAX_FIELDS, SEPARATOR).collect();
    if fields.len() < 3 {
        return None;
    }
    let client_id: ClientId = fields[0].parse().ok()?;
    let message = match (fields[1], fields.len()) {
        (TAG_CHAT, 4) if !fields[2].is_empty() => Message::Chat {
            sender: fields[2].to_string(),
            text: fields[3].to_string(),
        },
        (TAG_PRIVATE, 4) if !fields[2].is_empty() => Message::Private {
            target: fields[2].to_string(),
            text: fields[3].to_string(),
        },
        (TAG_PRESENCE, 3) if !fields[2].is_empty() => Message::Presence {
            nickname: fields[2].to_string(),
        },
        (TAG_GOODBYE, 3) if !fields[2].is_empty() => Message::Goodbye {
            nickname: fields[2].to_string(),
        },
        _ => return None,
    };
    Some(Packet { client_id, message })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(message: Message) -> Packet {
        Packet::new("c1".parse().unwrap(), message)
    }

    fn roundtrip(message: Message) {
        let p = packet(message);
        let frame = encode_frame(&p);
        assert_eq!(decode_frame(frame.as_bytes()), Frame::Packet(p));
    }

    #[test]
    fn roundtrip_every_kind() {
        roundtrip(Message::Chat {
            sender: "alice".into(),
            text: "hi".into(),
        });
        roundtrip(Message::Private {
            target: "bob".into(),
            text: "secret".into(),
        });
        roundtrip(Message::Presence {
            nickname: "alice".into(),
        });
        roundtrip(Message::Goodbye {
            nickname: "alice".into(),
        });
    }

    #[test]
    fn wire_shapes() {
        let chat = packet(Message::Chat {
            sender: "alice".into(),
            text: "hi".into(),
        });
        assert_eq!(encode_frame(&chat), "c1|chat|alice|hi");
        let pm = packet(Message::Private {
            target: "bob".into(),
            text: "yo".into(),
        });
        assert_eq!(encode_frame(&pm), "c1|pm|bob|yo");
        let hb = packet(Message::Presence {
            nickname: "alice".into(),
        });
        assert_eq!(encode_frame(&hb), "c1|presence|alice");
    }

    #[test]
    fn pipes_in_text_survive() {
        roundtrip(Message::Chat {
            sender: "alice".into(),
            text: "a | b || c|".into(),
        });
        roundtrip(Message::Private {
            target: "bob".into(),
            text: "x|y".into(),
        });
    }

    #[test]
    fn empty_text_is_allowed() {
        roundtrip(Message::Chat {
            sender: "alice".into(),
            text: String::new(),
        });
    }

    #[test]
    fn wrong_field_count_falls_back() {
        for raw in [
            "c1|presence|alice|extra",
            "c1|bye",
            "c1|pm|bob",
            "c1|chat|alice",
            "c1|presence|",
            "|chat|alice|hi",
        ] {
            assert_eq!(
                decode_frame(raw.as_bytes()),
                Frame::Unrecognized(raw.to_string()),
                "{raw}"
            );
        }
    }

    #[test]
    fn legacy_and_foreign_payloads_fall_back() {
        for raw in ["HEARTBEAT:alice", "GOODBYE:alice", "alice: hello", "", "c1|hello"] {
            assert_eq!(
                decode_frame(raw.as_bytes()),
                Frame::Unrecognized(raw.to_string())
            );
        }
    }

    #[test]
    fn invalid_utf8_is_lossy_not_fatal() {
        let frame = decode_frame(&[0xff, 0xfe, b'|', b'x']);
        assert!(matches!(frame, Frame::Unrecognized(_)));
    }
}
