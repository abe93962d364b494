use base64::Engine;
use base64::engine::general_purpose::STANDARD as Base64;
use chrono::{DateTime, SecondsFormat, Utc};
use cifrachat_crypto::{SealedMessage, NONCE_LENGTH, TAG_LENGTH};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const MAX_EVENT_LEN: usize = 64 * 1024;

#[derive(Debug)]
pub enum CodecError {
    EventTooLarge,
    InvalidJson,
    UnknownEvent,
    UnrecognizedPayload,
    InvalidEncoding,
    InvalidNonce,
    InvalidTag,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EventTooLarge => write!(f, "event exceeds limits"),
            Self::InvalidJson => write!(f, "invalid event json"),
            Self::UnknownEvent => write!(f, "unknown event name"),
            Self::UnrecognizedPayload => write!(f, "unrecognized payload shape"),
            Self::InvalidEncoding => write!(f, "invalid base64 field"),
            Self::InvalidNonce => write!(f, "nonce length mismatch"),
            Self::InvalidTag => write!(f, "authentication tag length mismatch"),
        }
    }
}

impl Error for CodecError {}

/// Base64 envelope triple exactly as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub encrypted: String,
    pub iv: String,
    #[serde(rename = "authTag")]
    pub auth_tag: String,
}

impl EncryptedPayload {
    /// Encodes a sealed message for transport.
    pub fn from_sealed(sealed: &SealedMessage) -> Self {
        Self {
            encrypted: Base64.encode(&sealed.ciphertext),
            iv: Base64.encode(sealed.nonce),
            auth_tag: Base64.encode(sealed.tag),
        }
    }

    /// Decodes the wire triple, enforcing nonce and tag lengths.
    pub fn to_sealed(&self) -> Result<SealedMessage, CodecError> {
        let ciphertext = Base64
            .decode(&self.encrypted)
            .map_err(|_| CodecError::InvalidEncoding)?;
        let nonce_bytes = Base64
            .decode(&self.iv)
            .map_err(|_| CodecError::InvalidEncoding)?;
        let tag_bytes = Base64
            .decode(&self.auth_tag)
            .map_err(|_| CodecError::InvalidEncoding)?;
        if nonce_bytes.len() != NONCE_LENGTH {
            return Err(CodecError::InvalidNonce);
        }
        if tag_bytes.len() != TAG_LENGTH {
            return Err(CodecError::InvalidTag);
        }
        let mut nonce = [0u8; NONCE_LENGTH];
        nonce.copy_from_slice(&nonce_bytes);
        let mut tag = [0u8; TAG_LENGTH];
        tag.copy_from_slice(&tag_bytes);
        Ok(SealedMessage {
            nonce,
            ciphertext,
            tag,
        })
    }
}

/// Relayed message as every client sees it, live or through history.
///
/// `id` and `username` come from the server-side connection, never from
/// the inbound payload, and `at` is assigned at broadcast time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeRecord {
    pub id: String,
    pub username: String,
    #[serde(flatten)]
    pub payload: EncryptedPayload,
    pub at: String,
}

impl EnvelopeRecord {
    /// Stamps an envelope with its origin and a millisecond timestamp.
    pub fn new(
        id: String,
        username: String,
        payload: EncryptedPayload,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            username,
            payload,
            at: at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Server to client events, one JSON object per text frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "encryption-key")]
    EncryptionKey { key: String },
    #[serde(rename = "chat:history")]
    History(Vec<EnvelopeRecord>),
    #[serde(rename = "chat:message")]
    Message(EnvelopeRecord),
    #[serde(rename = "chat:error")]
    Error { error: String },
}

impl ServerEvent {
    /// Renders the event as a websocket text frame body.
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|_| CodecError::InvalidJson)
    }
}

/// Payload shapes accepted on `chat:send`. Variant order matters: when a
/// frame carries both the triple and `message`, the triple wins.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Encrypted(EncryptedPayload),
    Plain { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Send(OutboundMessage),
}

impl ClientEvent {
    /// Parses a client text frame, classifying failures for the relay.
    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        if raw.len() > MAX_EVENT_LEN {
            return Err(CodecError::EventTooLarge);
        }
        let value: Value = serde_json::from_str(raw).map_err(|_| CodecError::InvalidJson)?;
        let event = value
            .get("event")
            .and_then(Value::as_str)
            .ok_or(CodecError::InvalidJson)?;
        match event {
            "chat:send" => {
                let data = value.get("data").cloned().unwrap_or(Value::Null);
                serde_json::from_value::<OutboundMessage>(data)
                    .map(ClientEvent::Send)
                    .map_err(|_| CodecError::UnrecognizedPayload)
            }
            _ => Err(CodecError::UnknownEvent),
        }
    }
}
