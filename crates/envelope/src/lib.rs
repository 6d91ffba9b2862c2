//! The on-wire metadata wrapper around every bus message, and the typed
//! codec over it.
//!
//! An [`Envelope`] is the fixed header `{type, senderId, targetId,
//! correlationId, timestamp, version, payload}`; its payload is an
//! arbitrary JSON tree, so unknown payload fields survive pass-through
//! untouched. Typed access goes through [`Message`], a tagged union
//! dispatched from the envelope's `type` string by a decoder registry
//! populated at startup. Unknown types are decode errors, never silent
//! drops.

use std::collections::BTreeMap;
use std::sync::LazyLock;

mod message;
pub use message::Message;

/// Version of the envelope header itself, independent of any payload
/// version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Immutable wire header. The envelope shape is fixed: unknown fields
/// here are an error, unlike in payloads.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub sender_id: String,
    /// None broadcasts to every subscriber of the channel.
    pub target_id: Option<String>,
    pub correlation_id: uuid::Uuid,
    /// Milliseconds since the Unix epoch at send time.
    pub timestamp: i64,
    pub version: u32,
    pub payload: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope")]
    Envelope(#[source] serde_json::Error),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("message {message_type:?} is missing its payload version")]
    MissingVersion { message_type: String },
    #[error("message {message_type:?} has payload version {version}, newest supported is {supported}")]
    UnsupportedVersion {
        message_type: String,
        version: u64,
        supported: u32,
    },
    #[error("malformed {message_type:?} payload")]
    Payload {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Envelope {
    /// Wrap a typed message. The payload tree is the message's fields
    /// plus its `version` integer.
    pub fn new(message: &Message, sender_id: impl Into<String>, target_id: Option<String>) -> Self {
        Self::with_correlation(message, sender_id, target_id, uuid::Uuid::new_v4())
    }

    /// Like [`Envelope::new`], but with a caller-chosen correlation id.
    /// Responses reuse the correlation id of the request they answer.
    pub fn with_correlation(
        message: &Message,
        sender_id: impl Into<String>,
        target_id: Option<String>,
        correlation_id: uuid::Uuid,
    ) -> Self {
        Self {
            message_type: message.message_type().to_string(),
            sender_id: sender_id.into(),
            target_id,
            correlation_id,
            timestamp: models::now_ms(),
            version: ENVELOPE_VERSION,
            payload: message.to_payload(),
        }
    }

    /// Serialization of an envelope is total.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("envelope serialization cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(bytes).map_err(DecodeError::Envelope)
    }

    /// Dispatch the payload into the typed [`Message`] union, checking
    /// the payload version against the decoder registry.
    pub fn message(&self) -> Result<Message, DecodeError> {
        let Some(entry) = registry().get(self.message_type.as_str()) else {
            return Err(DecodeError::UnknownType(self.message_type.clone()));
        };

        let Some(version) = self.payload.get("version").and_then(|v| v.as_u64()) else {
            return Err(DecodeError::MissingVersion {
                message_type: self.message_type.clone(),
            });
        };
        if version > u64::from(entry.version) {
            return Err(DecodeError::UnsupportedVersion {
                message_type: self.message_type.clone(),
                version,
                supported: entry.version,
            });
        }

        (entry.decode)(&self.payload).map_err(|source| DecodeError::Payload {
            message_type: self.message_type.clone(),
            source,
        })
    }
}

pub(crate) struct Entry {
    pub version: u32,
    pub decode: fn(&serde_json::Value) -> Result<Message, serde_json::Error>,
}

pub(crate) fn registry() -> &'static BTreeMap<&'static str, Entry> {
    static REGISTRY: LazyLock<BTreeMap<&'static str, Entry>> = LazyLock::new(message::build_registry);
    &REGISTRY
}
