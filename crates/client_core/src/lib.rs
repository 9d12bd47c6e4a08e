use async_trait::async_trait;
use shared::{
    domain::{AtUri, Did, Handle},
    error::XrpcErrorBody,
    protocol::{GetRecordOutput, PostView, PutRecordInput, PutRecordOutput},
};
use thiserror::Error;

pub mod config;
pub mod postgate;
mod retry;
pub mod shadow;
pub mod wizard;
mod xrpc;

pub use postgate::{PostgateClient, PostgateError, QuoteDetachAction, QuotepostAction};
pub use retry::{retry_with, RetryPolicy};
pub use shadow::{InMemoryPostShadow, PostShadow, PostShadowCache};
pub use wizard::{WizardAction, WizardController, WizardState, WizardStep};
pub use xrpc::{Session, XrpcAgent};

#[derive(Debug, Error)]
pub enum XrpcError {
    #[error("xrpc transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("xrpc call failed with status {status}: {body}")]
    Api { status: u16, body: XrpcErrorBody },
    #[error("xrpc response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("not signed in: missing session")]
    NoSession,
}

impl XrpcError {
    pub fn is_record_not_found(&self) -> bool {
        matches!(self, Self::Api { body, .. } if body.is_record_not_found())
    }

    /// Transport failures and 5xx responses; everything else will fail the
    /// same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_)) || self.status().is_some_and(|s| s >= 500)
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Repository and AppView calls the postgate client depends on.
#[async_trait]
pub trait RepoAgent: Send + Sync {
    /// DID of the signed-in account, whose repository receives writes.
    async fn session_did(&self) -> Option<Did>;
    async fn resolve_handle(&self, handle: &Handle) -> Result<Did, XrpcError>;
    async fn get_record(
        &self,
        repo: &Did,
        collection: &str,
        rkey: &str,
    ) -> Result<GetRecordOutput, XrpcError>;
    async fn put_record(&self, input: PutRecordInput) -> Result<PutRecordOutput, XrpcError>;
    async fn get_posts(&self, uris: &[AtUri]) -> Result<Vec<PostView>, XrpcError>;
}
