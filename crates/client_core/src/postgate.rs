//! Postgate records: per-post quote permissions and detached quotes.
//!
//! All mutations funnel through [`PostgateClient::upsert`], which reads the
//! current record and writes the updated one back. There is no cross-call
//! atomicity: two concurrent upserts on the same post race and the last write
//! wins.

use std::sync::Arc;

use chrono::Utc;
use shared::{
    domain::{AtUri, Did, Handle},
    protocol::{
        EmbeddedRecordView, EmbeddingRule, PostView, PostgateRecord, PutRecordInput,
        QuotedPostView, RecordEmbedView, RepoRecord, POSTGATE_COLLECTION,
    },
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{retry_with, PostShadowCache, RepoAgent, RetryPolicy, XrpcError};

#[derive(Debug, Error)]
pub enum PostgateError {
    #[error("post uri {0} has no record key")]
    MissingRecordKey(AtUri),
    #[error("failed to resolve handle {handle}")]
    ResolveHandle {
        handle: Handle,
        #[source]
        source: XrpcError,
    },
    #[error("failed to get postgate record for {post}")]
    Get {
        post: AtUri,
        #[source]
        source: XrpcError,
    },
    #[error("failed to write postgate record for {post}")]
    Write {
        post: AtUri,
        #[source]
        source: XrpcError,
    },
    #[error("failed to encode postgate record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("not signed in: postgate records are written to the caller's repository")]
    NoSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteDetachAction {
    Detach,
    Reattach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotepostAction {
    Enable,
    Disable,
}

/// Fields to fold into an existing record. `None` leaves the base untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostgateDelta {
    pub detached_quotes: Option<Vec<AtUri>>,
    pub quotepost_rules: Option<Vec<EmbeddingRule>>,
}

pub fn create_record(
    post: &AtUri,
    detached_quotes: Option<Vec<AtUri>>,
    quotepost_rules: Option<Vec<EmbeddingRule>>,
) -> PostgateRecord {
    PostgateRecord {
        post: post.clone(),
        created_at: Utc::now(),
        detached_quotes,
        quotepost_rules,
    }
}

/// Unions detached quotes (first occurrence wins) and replaces rules wholesale
/// when the delta carries them.
pub fn merge_records(base: PostgateRecord, delta: PostgateDelta) -> PostgateRecord {
    let detached_quotes = match delta.detached_quotes {
        Some(extra) => {
            let mut merged = base.detached_quotes.unwrap_or_default();
            for uri in extra {
                if !merged.contains(&uri) {
                    merged.push(uri);
                }
            }
            Some(merged)
        }
        None => base.detached_quotes,
    };

    PostgateRecord {
        detached_quotes,
        quotepost_rules: delta.quotepost_rules.or(base.quotepost_rules),
        ..base
    }
}

/// Embed view a viewer should see for `quoting_post` quoting `quoted`.
pub fn maybe_detached_quote_embed(
    quoting_post: &AtUri,
    quoted: PostView,
    postgate: Option<&PostgateRecord>,
) -> RecordEmbedView {
    if postgate.is_some_and(|gate| gate.is_detached(quoting_post)) {
        detached_embed(quoted.uri)
    } else {
        RecordEmbedView {
            record: EmbeddedRecordView::Record(QuotedPostView::from(quoted)),
        }
    }
}

fn detached_embed(quoted: AtUri) -> RecordEmbedView {
    RecordEmbedView {
        record: EmbeddedRecordView::Detached {
            uri: quoted,
            detached: true,
        },
    }
}

fn record_key(post_uri: &AtUri) -> Result<&str, PostgateError> {
    post_uri
        .rkey()
        .ok_or_else(|| PostgateError::MissingRecordKey(post_uri.clone()))
}

pub struct PostgateClient {
    agent: Arc<dyn RepoAgent>,
    shadow: Arc<dyn PostShadowCache>,
    retry: RetryPolicy,
}

impl PostgateClient {
    pub fn new(agent: Arc<dyn RepoAgent>, shadow: Arc<dyn PostShadowCache>) -> Self {
        Self::with_retry_policy(agent, shadow, RetryPolicy::default())
    }

    pub fn with_retry_policy(
        agent: Arc<dyn RepoAgent>,
        shadow: Arc<dyn PostShadowCache>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            agent,
            shadow,
            retry,
        }
    }

    async fn resolve_repo(&self, post_uri: &AtUri) -> Result<Did, PostgateError> {
        if let Some(did) = post_uri.authority_did() {
            return Ok(did);
        }
        let handle = Handle::new(post_uri.authority());
        let did = self
            .agent
            .resolve_handle(&handle)
            .await
            .map_err(|source| PostgateError::ResolveHandle {
                handle: handle.clone(),
                source,
            })?;
        debug!(handle = %handle, did = %did, "postgate: resolved handle");
        Ok(did)
    }

    /// `post_uri` with its authority replaced by the repository DID.
    async fn canonical_uri(&self, post_uri: &AtUri) -> Result<AtUri, PostgateError> {
        let did = self.resolve_repo(post_uri).await?;
        Ok(post_uri.with_authority(&did))
    }

    /// Absent and malformed records both come back as `None`.
    pub async fn get_record(
        &self,
        post_uri: &AtUri,
    ) -> Result<Option<PostgateRecord>, PostgateError> {
        let rkey = record_key(post_uri)?;
        let repo = self.resolve_repo(post_uri).await?;

        let fetched = retry_with(
            self.retry,
            |err: &XrpcError| !err.is_record_not_found(),
            || self.agent.get_record(&repo, POSTGATE_COLLECTION, rkey),
        )
        .await;

        let output = match fetched {
            Ok(output) => output,
            Err(err) if err.is_record_not_found() => {
                debug!(post_uri = %post_uri, "postgate: no record");
                return Ok(None);
            }
            Err(source) => {
                return Err(PostgateError::Get {
                    post: post_uri.clone(),
                    source,
                })
            }
        };

        match serde_json::from_value::<RepoRecord>(output.value) {
            Ok(RepoRecord::Postgate(record)) => Ok(Some(record)),
            Ok(_) => {
                warn!(post_uri = %post_uri, "postgate: record has unexpected type; treating as absent");
                Ok(None)
            }
            Err(err) => {
                warn!(post_uri = %post_uri, error = %err, "postgate: malformed record; treating as absent");
                Ok(None)
            }
        }
    }

    /// The remote record, or an open record for the post if none exists.
    /// The default is never written.
    pub async fn get_record_or_default(
        &self,
        post_uri: &AtUri,
    ) -> Result<PostgateRecord, PostgateError> {
        let post_uri = &self.canonical_uri(post_uri).await?;
        Ok(self
            .get_record(post_uri)
            .await?
            .unwrap_or_else(|| create_record(post_uri, None, None)))
    }

    pub async fn write_record(
        &self,
        post_uri: &AtUri,
        record: &PostgateRecord,
    ) -> Result<(), PostgateError> {
        let rkey = record_key(post_uri)?;
        let repo = self
            .agent
            .session_did()
            .await
            .ok_or(PostgateError::NoSession)?;
        let value = serde_json::to_value(RepoRecord::Postgate(record.clone()))?;

        retry_with(
            self.retry,
            XrpcError::is_transient,
            || {
                self.agent.put_record(PutRecordInput {
                    repo: repo.clone(),
                    collection: POSTGATE_COLLECTION.to_string(),
                    rkey: rkey.to_string(),
                    record: value.clone(),
                })
            },
        )
        .await
        .map_err(|source| PostgateError::Write {
            post: post_uri.clone(),
            source,
        })?;

        info!(post_uri = %post_uri, repo = %repo, "postgate: record written");
        Ok(())
    }

    /// Reads the current record, hands it to `update`, and writes back whatever
    /// `update` returns. `None` means no write. Returns the written record.
    pub async fn upsert<F>(
        &self,
        post_uri: &AtUri,
        update: F,
    ) -> Result<Option<PostgateRecord>, PostgateError>
    where
        F: FnOnce(Option<PostgateRecord>) -> Option<PostgateRecord>,
    {
        let prev = self.get_record(post_uri).await?;
        let Some(next) = update(prev) else {
            debug!(post_uri = %post_uri, "postgate: update is a no-op; skipping write");
            return Ok(None);
        };
        self.write_record(post_uri, &next).await?;
        Ok(Some(next))
    }

    /// Detaches or reattaches `post` (a post quoting `quote_uri`) from the
    /// caller's post `quote_uri`, then patches the cached embed of `post`.
    pub async fn toggle_quote_detachment(
        &self,
        post: &PostView,
        quote_uri: &AtUri,
        action: QuoteDetachAction,
    ) -> Result<(), PostgateError> {
        let quoting = post.uri.clone();
        let quote_uri = &self.canonical_uri(quote_uri).await?;
        self.upsert(quote_uri, |prev| match (prev, action) {
            (Some(prev), QuoteDetachAction::Detach) => Some(merge_records(
                prev,
                PostgateDelta {
                    detached_quotes: Some(vec![quoting]),
                    quotepost_rules: None,
                },
            )),
            (Some(prev), QuoteDetachAction::Reattach) => {
                let detached_quotes = prev
                    .detached_quotes()
                    .iter()
                    .filter(|uri| **uri != quoting)
                    .cloned()
                    .collect();
                Some(PostgateRecord {
                    detached_quotes: Some(detached_quotes),
                    ..prev
                })
            }
            (None, QuoteDetachAction::Detach) => {
                Some(create_record(quote_uri, Some(vec![quoting]), None))
            }
            (None, QuoteDetachAction::Reattach) => None,
        })
        .await?;

        match action {
            QuoteDetachAction::Detach => {
                self.shadow
                    .update_cached_embed(&post.uri, detached_embed(quote_uri.clone()));
            }
            QuoteDetachAction::Reattach => self.restore_quote_embed(&post.uri, quote_uri).await,
        }
        Ok(())
    }

    async fn restore_quote_embed(&self, post_uri: &AtUri, quote_uri: &AtUri) {
        match self.agent.get_posts(std::slice::from_ref(quote_uri)).await {
            Ok(posts) => match posts.into_iter().find(|p| &p.uri == quote_uri) {
                Some(quoted) => self.shadow.update_cached_embed(
                    post_uri,
                    RecordEmbedView {
                        record: EmbeddedRecordView::Record(QuotedPostView::from(quoted)),
                    },
                ),
                None => warn!(
                    quote_uri = %quote_uri,
                    "postgate: quoted post missing after reattach; leaving cached embed"
                ),
            },
            Err(err) => warn!(
                quote_uri = %quote_uri,
                error = %err,
                "postgate: failed to refetch quoted post after reattach"
            ),
        }
    }

    pub async fn toggle_quotepost_enabled(
        &self,
        post_uri: &AtUri,
        action: QuotepostAction,
    ) -> Result<(), PostgateError> {
        let post_uri = &self.canonical_uri(post_uri).await?;
        self.upsert(post_uri, |prev| match (prev, action) {
            (Some(prev), QuotepostAction::Disable) => Some(merge_records(
                prev,
                PostgateDelta {
                    detached_quotes: None,
                    quotepost_rules: Some(vec![EmbeddingRule::Disable]),
                },
            )),
            (None, QuotepostAction::Disable) => {
                Some(create_record(post_uri, None, Some(vec![EmbeddingRule::Disable])))
            }
            (Some(prev), QuotepostAction::Enable) => Some(PostgateRecord {
                quotepost_rules: Some(Vec::new()),
                ..prev
            }),
            (None, QuotepostAction::Enable) => None,
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/postgate_tests.rs"]
mod tests;
