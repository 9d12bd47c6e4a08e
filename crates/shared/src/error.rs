use std::fmt;

use serde::{Deserialize, Serialize};

/// Error name the PDS returns for an absent record.
pub const RECORD_NOT_FOUND_ERROR: &str = "RecordNotFound";
/// Message prefix the PDS uses for an absent record, e.g.
/// `Could not locate record: at://did:plc:x/app.bsky.feed.postgate/3k`.
pub const RECORD_NOT_FOUND_MESSAGE: &str = "Could not locate record";

/// Body of a failed XRPC call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XrpcErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl XrpcErrorBody {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: Some(message.into()),
        }
    }

    pub fn record_not_found(uri: impl fmt::Display) -> Self {
        Self::new(
            RECORD_NOT_FOUND_ERROR,
            format!("{RECORD_NOT_FOUND_MESSAGE}: {uri}"),
        )
    }

    pub fn is_record_not_found(&self) -> bool {
        self.error == RECORD_NOT_FOUND_ERROR
            || self
                .message
                .as_deref()
                .is_some_and(|m| m.contains(RECORD_NOT_FOUND_MESSAGE))
    }
}

impl fmt::Display for XrpcErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.error),
            None => f.write_str(&self.error),
        }
    }
}
