//! Wire format for the presentation channel.
//!
//! Frames are JSON objects tagged by `type`, each carrying the sender's
//! `senderId`:
//!
//! ```text
//! {"type":"REQUEST_STATE","senderId":"…"}
//! {"type":"FILE_URL","senderId":"…","url":"blob:…"}
//! {"type":"PAGE_UPDATE","senderId":"…","page":6,"totalPages":10}
//! {"type":"END_SESSION","senderId":"…"}
//! ```
//!
//! The variant set is closed. A frame with an unknown `type` fails to decode
//! and is dropped by the receiver with a warning; there is no version field.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Identity of one window instance, generated once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 8 hex digits are plenty to tell two windows apart in logs.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed sync frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("failed to encode sync frame: {0}")]
    Encode(#[source] serde_json::Error),
}

/// An immutable message on the presentation channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub sender_id: PeerId,
    #[serde(flatten)]
    pub body: MessageBody,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageBody {
    /// Ask whichever window holds the canonical state to announce it.
    RequestState {},
    /// Location of the document the sender is presenting.
    FileUrl { url: String },
    /// Sender's view state. Either field may be missing or non-numeric on
    /// the wire; such a field is ignored on its own.
    PageUpdate {
        #[serde(
            default,
            deserialize_with = "lenient_count",
            skip_serializing_if = "Option::is_none"
        )]
        page: Option<u32>,
        #[serde(
            rename = "totalPages",
            default,
            deserialize_with = "lenient_count",
            skip_serializing_if = "Option::is_none"
        )]
        total_pages: Option<u32>,
    },
    EndSession {},
}

impl MessageBody {
    pub fn page_update(page: u32, total_pages: u32) -> Self {
        MessageBody::PageUpdate {
            page: Some(page),
            total_pages: Some(total_pages),
        }
    }

    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::RequestState {} => "REQUEST_STATE",
            MessageBody::FileUrl { .. } => "FILE_URL",
            MessageBody::PageUpdate { .. } => "PAGE_UPDATE",
            MessageBody::EndSession {} => "END_SESSION",
        }
    }
}

impl SyncMessage {
    pub fn new(sender_id: PeerId, body: MessageBody) -> Self {
        Self { sender_id, body }
    }

    pub fn encode(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(WireError::Encode)
    }

    pub fn decode(frame: &str) -> Result<Self, WireError> {
        serde_json::from_str(frame).map_err(WireError::Malformed)
    }
}

/// Accept a positive integer; anything else (string, float, negative, null)
/// reads as absent.
fn lenient_count<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value
        .and_then(|v| v.as_u64())
        .filter(|&n| n >= 1)
        .and_then(|n| u32::try_from(n).ok()))
}
