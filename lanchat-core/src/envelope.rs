//! Group envelope: AES-128-CBC with a random IV per message, IV prepended, base64 encoded.
//!
//! The key is shared by everyone on the group and never exchanged on the wire.

use std::borrow::Cow;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const KEY_LEN: usize = 16;
pub const IV_LEN: usize = 16;

/// Default cap on plaintext size before encryption.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 8 * 1024;

/// Appended to plaintext cut at the size cap.
pub const TRUNCATION_MARKER: &str = "... [message truncated]";

/// Key every legacy client was built with. Only used when no key is configured.
const LEGACY_KEY: &[u8; KEY_LEN] = b"1234567890123456";

/// 128-bit group key.
#[derive(Clone, PartialEq, Eq)]
pub struct GroupKey([u8; KEY_LEN]);

impl GroupKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        GroupKey(bytes)
    }

    /// 32 hex chars.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let raw = hex::decode(s.trim()).map_err(KeyError::Hex)?;
        let bytes: [u8; KEY_LEN] = raw
            .try_into()
            .map_err(|v: Vec<u8>| KeyError::Length(v.len()))?;
        Ok(GroupKey(bytes))
    }

    /// Derive a key from a shared passphrase (SHA-256, first 16 bytes).
    pub fn from_passphrase(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"lanchat-group-key-v1");
        hasher.update(passphrase.as_bytes());
        let digest = hasher.finalize();
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&digest[..KEY_LEN]);
        GroupKey(key)
    }

    /// Hex if the input is exactly 32 hex digits, passphrase otherwise.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let t = s.trim();
        if t.is_empty() {
            return Err(KeyError::Empty);
        }
        if t.len() == KEY_LEN * 2 && t.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Self::from_hex(t);
        }
        Ok(Self::from_passphrase(t))
    }

    pub fn legacy() -> Self {
        GroupKey(*LEGACY_KEY)
    }

    pub fn is_legacy(&self) -> bool {
        &self.0 == LEGACY_KEY
    }
}

impl std::fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GroupKey(..)")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key is empty")]
    Empty,
    #[error("key is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("key must be {KEY_LEN} bytes, got {0}")]
    Length(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("cipher setup failed")]
    Crypto,
    #[error("envelope is not base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("envelope too short: {0} bytes")]
    TooShort(usize),
    #[error("bad padding or wrong key")]
    Padding,
    #[error("plaintext is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl EnvelopeError {
    /// Failures caused by the received bytes rather than local setup.
    pub fn is_decode(&self) -> bool {
        !matches!(self, EnvelopeError::Crypto)
    }
}

/// Encrypts outgoing payloads and opens incoming ones.
#[derive(Clone, Debug)]
pub struct Codec {
    key: GroupKey,
    max_message_bytes: usize,
}

impl Codec {
    pub fn new(key: GroupKey, max_message_bytes: usize) -> Self {
        Self {
            key,
            max_message_bytes,
        }
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    /// Apply the size cap to user text, logging when it cuts.
    pub fn bound<'a>(&self, message: &'a str) -> Cow<'a, str> {
        let bounded = truncate_message(message, self.max_message_bytes);
        if let Cow::Owned(_) = bounded {
            tracing::warn!(
                len = message.len(),
                cap = self.max_message_bytes,
                "message truncated before encryption"
            );
        }
        bounded
    }

    /// Truncate to the cap, then [`seal`](Self::seal).
    pub fn encrypt(&self, plaintext: &str) -> Result<String, EnvelopeError> {
        self.seal(&self.bound(plaintext))
    }

    /// Encrypt under a fresh IV and base64 the `iv || ciphertext`. No size cap.
    pub fn seal(&self, plaintext: &str) -> Result<String, EnvelopeError> {
        let mut iv = [0u8; IV_LEN];
        OsRng
            .try_fill_bytes(&mut iv)
            .map_err(|_| EnvelopeError::Crypto)?;
        let ciphertext = Aes128CbcEnc::new(&self.key.0.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    /// Reverse of [`Codec::encrypt`]. Any malformed input yields an error, never a panic.
    pub fn decrypt(&self, blob: &str) -> Result<String, EnvelopeError> {
        let data = STANDARD.decode(blob.trim())?;
        if data.len() <= IV_LEN {
            return Err(EnvelopeError::TooShort(data.len()));
        }
        let (iv, ciphertext) = data.split_at(IV_LEN);
        let mut iv_arr = [0u8; IV_LEN];
        iv_arr.copy_from_slice(iv);
        let plain = Aes128CbcDec::new(&self.key.0.into(), &iv_arr.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| EnvelopeError::Padding)?;
        Ok(String::from_utf8(plain)?)
    }
}

/// Cut `message` at the last char boundary within `cap` bytes and append the marker.
pub fn truncate_message(message: &str, cap: usize) -> Cow<'_, str> {
    if message.len() <= cap {
        return Cow::Borrowed(message);
    }
    let mut end = cap;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + TRUNCATION_MARKER.len());
    out.push_str(&message[..end]);
    out.push_str(TRUNCATION_MARKER);
    Cow::Owned(out)
}
