//! Participant identities and lobby identifiers.
//!
//! Every participant gets a fresh ed25519 [`Identity`] per session. A lobby is
//! named by the public key of its append-only log, encoded as a [`LobbyId`]:
//!
//! ```text
//! ┌──────────────────────────────┬──────────────┐
//! │ public key                   │ fnv1a-32     │
//! │ 32 bytes                     │ 4 bytes (BE) │
//! └──────────────────────────────┴──────────────┘
//!            lowercase hex, 72 characters
//! ```
//!
//! Any single-byte corruption of the encoded form is rejected: a changed hex
//! digit alters exactly one decoded byte, and FNV-1a maps every single-byte
//! change of its input to a different hash.

use std::fmt;
use std::str::FromStr;

use data_encoding::HEXLOWER;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while decoding keys and lobby identifiers.
#[derive(Debug, Error)]
pub enum IdError {
    #[error("lobby id must be {expected} characters, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("lobby id is not lowercase hex: {0}")]
    Encoding(#[from] data_encoding::DecodeError),

    #[error("lobby id checksum mismatch")]
    Checksum,

    #[error("invalid public key: {0}")]
    Key(#[from] ed25519_dalek::SignatureError),
}

/// Signature verification failed.
#[derive(Debug, Error)]
#[error("signature verification failed")]
pub struct SignatureError;

/// An ed25519 public key. Always a valid curve point.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub const LENGTH: usize = 32;

    /// Construct from raw bytes, rejecting bytes that are not a valid key.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, IdError> {
        let key = VerifyingKey::from_bytes(bytes)?;
        Ok(Self(key.to_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Verify a detached signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| SignatureError)?;
        key.verify_strict(message, &signature.0)
            .map_err(|_| SignatureError)
    }

    /// First five bytes in hex, for log lines.
    pub fn fmt_short(&self) -> String {
        HEXLOWER.encode(&self.0[..5])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fmt_short())
    }
}

impl FromStr for PublicKey {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = HEXLOWER.decode(s.as_bytes())?;
        let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| IdError::Length {
            expected: Self::LENGTH * 2,
            actual: s.len(),
        })?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            let bytes = <[u8; 32]>::deserialize(deserializer)?;
            Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
        }
    }
}

/// A detached ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Self(ed25519_dalek::Signature::from_bytes(bytes))
    }
}

/// An ed25519 secret key.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl SecretKey {
    pub fn generate() -> Self {
        Self(SigningKey::generate(&mut rand::rngs::OsRng))
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(SigningKey::from_bytes(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(..)")
    }
}

/// A participant keypair, fresh per participant per session.
#[derive(Clone, Debug)]
pub struct Identity {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl Identity {
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::generate())
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        Self {
            public: secret.public(),
            secret,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.secret.sign(message)
    }
}

/// The identifier of a lobby: the public key of its log, checksummed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LobbyId(PublicKey);

impl LobbyId {
    /// Length of the encoded form in characters.
    pub const ENCODED_LEN: usize = (PublicKey::LENGTH + 4) * 2;

    pub fn from_public_key(key: PublicKey) -> Self {
        Self(key)
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.0
    }

    pub fn encode(&self) -> String {
        let mut raw = Vec::with_capacity(PublicKey::LENGTH + 4);
        raw.extend_from_slice(self.0.as_bytes());
        raw.extend_from_slice(&checksum(self.0.as_bytes()).to_be_bytes());
        HEXLOWER.encode(&raw)
    }

    pub fn decode(encoded: &str) -> Result<Self, IdError> {
        if encoded.len() != Self::ENCODED_LEN {
            return Err(IdError::Length {
                expected: Self::ENCODED_LEN,
                actual: encoded.len(),
            });
        }
        let raw = HEXLOWER.decode(encoded.as_bytes())?;
        let (key, sum) = raw.split_at(PublicKey::LENGTH);
        let key: [u8; 32] = key.try_into().map_err(|_| IdError::Checksum)?;
        let sum: [u8; 4] = sum.try_into().map_err(|_| IdError::Checksum)?;
        if checksum(&key) != u32::from_be_bytes(sum) {
            return Err(IdError::Checksum);
        }
        Ok(Self(PublicKey::from_bytes(&key)?))
    }
}

/// FNV-1a over the key bytes.
fn checksum(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

impl fmt::Display for LobbyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for LobbyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LobbyId({})", self.0.fmt_short())
    }
}

impl FromStr for LobbyId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl Serialize for LobbyId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for LobbyId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::decode(&s).map_err(serde::de::Error::custom)
    }
}
