//! Session identity: per-process client id and nickname rules.

use std::fmt;
use std::str::FromStr;

/// Longest nickname accepted, in chars.
pub const MAX_NICKNAME_CHARS: usize = 32;

/// Opaque per-process token carried in every frame. Peers use it to drop their own broadcasts.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    /// Fresh random id (UUID v4, simple hex form).
    pub fn generate() -> Self {
        ClientId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ClientId {
    type Err = ClientIdError;

    /// Accepts any non-empty token that cannot break the pipe framing.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ClientIdError::Empty);
        }
        if s.contains('|') || s.chars().any(char::is_control) {
            return Err(ClientIdError::InvalidChar);
        }
        Ok(ClientId(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClientIdError {
    #[error("client id is empty")]
    Empty,
    #[error("client id contains a reserved character")]
    InvalidChar,
}

/// Check a nickname against the framing rules. Returns the trimmed nickname.
pub fn validate_nickname(nickname: &str) -> Result<&str, NicknameError> {
    let trimmed = nickname.trim();
    if trimmed.is_empty() {
        return Err(NicknameError::Empty);
    }
    if trimmed.chars().count() > MAX_NICKNAME_CHARS {
        return Err(NicknameError::TooLong);
    }
    if trimmed.contains('|') || trimmed.chars().any(char::is_control) {
        return Err(NicknameError::InvalidChar);
    }
    Ok(trimmed)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NicknameError {
    #[error("nickname is empty")]
    Empty,
    #[error("nickname is longer than {MAX_NICKNAME_CHARS} characters")]
    TooLong,
    #[error("nickname contains '|' or a control character")]
    InvalidChar,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_distinct() {
        let a = ClientId::generate();
        let b = ClientId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(!a.as_str().contains('|'));
    }

    #[test]
    fn client_id_parse() {
        assert_eq!("c1".parse::<ClientId>().unwrap().as_str(), "c1");
        assert_eq!("".parse::<ClientId>(), Err(ClientIdError::Empty));
        assert_eq!("a|b".parse::<ClientId>(), Err(ClientIdError::InvalidChar));
    }

    #[test]
    fn nickname_rules() {
        assert_eq!(validate_nickname("  alice "), Ok("alice"));
        assert_eq!(validate_nickname("   "), Err(NicknameError::Empty));
        assert_eq!(validate_nickname("a|b"), Err(NicknameError::InvalidChar));
        assert_eq!(validate_nickname("a\nb"), Err(NicknameError::InvalidChar));
        let long = "x".repeat(MAX_NICKNAME_CHARS + 1);
        assert_eq!(validate_nickname(&long), Err(NicknameError::TooLong));
    }
}
