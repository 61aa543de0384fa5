//! Signed peer messages for the unordered extension channel.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌───────────┬─────────────────────────┬────────────┐
//! │ signer    │ payload                 │ signature  │
//! │ 32 bytes  │ len-prefixed PeerMessage│ 64 bytes   │
//! └───────────┴─────────────────────────┴────────────┘
//! ```
//!
//! These messages are best-effort and may arrive reordered or duplicated.
//! Nothing that defines the shared document travels here; that goes through
//! the signed append-only log.

use lobby_core::{ClientPrivateState, Identity, LobbyId, PublicKey, Signature};
use serde::{Deserialize, Serialize};

use crate::error::{LobbyError, Result};

/// Upper bound on an encoded envelope.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024;
/// Upper bound on display names carried in join requests.
pub const MAX_NAME_LEN: usize = 64;
/// Upper bound on the free-form status of a private state.
pub const MAX_STATUS_LEN: usize = 256;

/// Message types on the extension channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Request to be admitted to the shared document
    Join = 1,
    /// Per-member private state update
    PrivateState = 2,
}

/// Payload of a join request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: LobbyId,
    pub public_key: PublicKey,
    pub name: String,
}

/// A message exchanged between peers of one lobby.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    Join(JoinRequest),
    PrivateState(ClientPrivateState),
}

impl PeerMessage {
    pub fn join(id: LobbyId, public_key: PublicKey, name: impl Into<String>) -> Self {
        PeerMessage::Join(JoinRequest {
            id,
            public_key,
            name: name.into(),
        })
    }

    pub fn msg_type(&self) -> MessageType {
        match self {
            PeerMessage::Join(_) => MessageType::Join,
            PeerMessage::PrivateState(_) => MessageType::PrivateState,
        }
    }

    /// Schema checks beyond what decoding enforces.
    pub fn validate(&self) -> Result<()> {
        match self {
            PeerMessage::Join(join) => {
                if join.name.trim().is_empty() {
                    return Err(LobbyError::InvalidPeerMessage("empty join name".into()));
                }
                if join.name.chars().count() > MAX_NAME_LEN {
                    return Err(LobbyError::InvalidPeerMessage("join name too long".into()));
                }
            }
            PeerMessage::PrivateState(state) => {
                if let Some(status) = &state.status {
                    if status.chars().count() > MAX_STATUS_LEN {
                        return Err(LobbyError::InvalidPeerMessage("status too long".into()));
                    }
                }
            }
        }
        Ok(())
    }
}

/// A peer message with a detached signature by its author.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedMessage {
    pub signer: PublicKey,
    pub payload: Vec<u8>,
    pub signature: Signature,
}

/// A verified, schema-checked message and its signer.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedMessage {
    pub signer: PublicKey,
    pub message: PeerMessage,
}

impl SignedMessage {
    /// Sign and encode a message for the wire.
    pub fn seal(identity: &Identity, message: &PeerMessage) -> Result<Vec<u8>> {
        let payload = bincode::serde::encode_to_vec(message, bincode::config::standard())
            .map_err(|e| LobbyError::Codec(e.to_string()))?;
        let envelope = SignedMessage {
            signer: identity.public,
            signature: identity.sign(&payload),
            payload,
        };
        bincode::serde::encode_to_vec(&envelope, bincode::config::standard())
            .map_err(|e| LobbyError::Codec(e.to_string()))
    }

    /// Decode, verify and validate bytes received from the wire.
    pub fn open(bytes: &[u8]) -> Result<VerifiedMessage> {
        if bytes.len() > MAX_MESSAGE_BYTES {
            return Err(LobbyError::InvalidPeerMessage(format!(
                "message of {} bytes exceeds limit",
                bytes.len()
            )));
        }
        let (envelope, _): (SignedMessage, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| LobbyError::InvalidPeerMessage(e.to_string()))?;
        envelope
            .signer
            .verify(&envelope.payload, &envelope.signature)
            .map_err(|e| LobbyError::InvalidPeerMessage(e.to_string()))?;
        let (message, _): (PeerMessage, _) =
            bincode::serde::decode_from_slice(&envelope.payload, bincode::config::standard())
                .map_err(|e| LobbyError::InvalidPeerMessage(e.to_string()))?;
        message.validate()?;
        Ok(VerifiedMessage {
            signer: envelope.signer,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lobby_id() -> LobbyId {
        LobbyId::from_public_key(Identity::generate().public)
    }

    #[test]
    fn test_join_seal_open() {
        let identity = Identity::generate();
        let msg = PeerMessage::join(lobby_id(), identity.public, "Alice");

        let bytes = SignedMessage::seal(&identity, &msg).unwrap();
        let opened = SignedMessage::open(&bytes).unwrap();

        assert_eq!(opened.signer, identity.public);
        assert_eq!(opened.message, msg);
        assert_eq!(opened.message.msg_type(), MessageType::Join);
    }

    #[test]
    fn test_private_state_seal_open() {
        let identity = Identity::generate();
        let msg = PeerMessage::PrivateState(ClientPrivateState {
            ready: true,
            status: Some("brb".into()),
        });
        let opened = SignedMessage::open(&SignedMessage::seal(&identity, &msg).unwrap()).unwrap();
        assert_eq!(opened.message, msg);
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let identity = Identity::generate();
        let msg = PeerMessage::join(lobby_id(), identity.public, "Alice");
        let bytes = SignedMessage::seal(&identity, &msg).unwrap();

        let (mut envelope, _): (SignedMessage, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        let last = envelope.payload.len() - 1;
        envelope.payload[last] ^= 0x01;
        let tampered =
            bincode::serde::encode_to_vec(&envelope, bincode::config::standard()).unwrap();

        assert!(matches!(
            SignedMessage::open(&tampered),
            Err(LobbyError::InvalidPeerMessage(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            SignedMessage::open(&[0xFF, 0xFE, 0xFD]),
            Err(LobbyError::InvalidPeerMessage(_))
        ));
        assert!(SignedMessage::open(&vec![0u8; MAX_MESSAGE_BYTES + 1]).is_err());
    }

    #[test]
    fn test_schema_validation() {
        let identity = Identity::generate();
        let empty = PeerMessage::join(lobby_id(), identity.public, "   ");
        let bytes = SignedMessage::seal(&identity, &empty).unwrap();
        assert!(SignedMessage::open(&bytes).is_err());

        let long = PeerMessage::join(lobby_id(), identity.public, "x".repeat(MAX_NAME_LEN + 1));
        assert!(long.validate().is_err());

        let status = PeerMessage::PrivateState(ClientPrivateState {
            ready: false,
            status: Some("s".repeat(MAX_STATUS_LEN + 1)),
        });
        assert!(status.validate().is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Join as u8, 1);
        assert_eq!(MessageType::PrivateState as u8, 2);
    }
}
