use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{AtUri, Did, Handle, ProfileSummary};

pub const POSTGATE_COLLECTION: &str = "app.bsky.feed.postgate";
pub const POSTGATE_DISABLE_RULE: &str = "app.bsky.feed.postgate#disableRule";
pub const STARTER_PACK_COLLECTION: &str = "app.bsky.graph.starterpack";

/// Records this client reads from or writes to a repository, tagged by `$type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum RepoRecord {
    #[serde(rename = "app.bsky.feed.postgate")]
    Postgate(PostgateRecord),
    #[serde(rename = "app.bsky.graph.starterpack")]
    StarterPack(StarterPackRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum EmbeddingRule {
    #[serde(rename = "app.bsky.feed.postgate#disableRule")]
    Disable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostgateRecord {
    pub post: AtUri,
    pub created_at: DateTime<Utc>,
    #[serde(
        rename = "detachedEmbeddingUris",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub detached_quotes: Option<Vec<AtUri>>,
    #[serde(
        rename = "embeddingRules",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub quotepost_rules: Option<Vec<EmbeddingRule>>,
}

impl PostgateRecord {
    pub fn detached_quotes(&self) -> &[AtUri] {
        self.detached_quotes.as_deref().unwrap_or_default()
    }

    pub fn quotepost_rules(&self) -> &[EmbeddingRule] {
        self.quotepost_rules.as_deref().unwrap_or_default()
    }

    pub fn is_detached(&self, quoting_post: &AtUri) -> bool {
        self.detached_quotes().contains(quoting_post)
    }

    pub fn quotes_disabled(&self) -> bool {
        self.quotepost_rules().contains(&EmbeddingRule::Disable)
    }

    /// No rules and no detachments; equivalent to having no record at all.
    pub fn is_open(&self) -> bool {
        self.detached_quotes().is_empty() && self.quotepost_rules().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarterPackFeedItem {
    pub uri: AtUri,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StarterPackRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub list: AtUri,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feeds: Option<Vec<StarterPackFeedItem>>,
    pub created_at: DateTime<Utc>,
}

/// `app.bsky.feed.defs#postView`, reduced to what quote embeds need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostView {
    pub uri: AtUri,
    pub cid: String,
    pub author: ProfileSummary,
    pub record: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed: Option<Value>,
    pub indexed_at: DateTime<Utc>,
}

/// `app.bsky.embed.record#view`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEmbedView {
    pub record: EmbeddedRecordView,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum EmbeddedRecordView {
    #[serde(rename = "app.bsky.embed.record#viewRecord")]
    Record(QuotedPostView),
    #[serde(rename = "app.bsky.embed.record#viewDetached")]
    Detached { uri: AtUri, detached: bool },
    #[serde(rename = "app.bsky.embed.record#viewNotFound", rename_all = "camelCase")]
    NotFound { uri: AtUri, not_found: bool },
}

/// `app.bsky.embed.record#viewRecord`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotedPostView {
    pub uri: AtUri,
    pub cid: String,
    pub author: ProfileSummary,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Value>,
    pub indexed_at: DateTime<Utc>,
}

impl From<PostView> for QuotedPostView {
    fn from(post: PostView) -> Self {
        Self {
            uri: post.uri,
            cid: post.cid,
            author: post.author,
            value: post.record,
            embeds: post.embed.into_iter().collect(),
            indexed_at: post.indexed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRecordOutput {
    pub uri: AtUri,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRecordInput {
    pub repo: Did,
    pub collection: String,
    pub rkey: String,
    pub record: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRecordOutput {
    pub uri: AtUri,
    pub cid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveHandleOutput {
    pub did: Did,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPostsOutput {
    pub posts: Vec<PostView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionInput {
    pub identifier: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionOutput {
    pub did: Did,
    pub handle: Handle,
    pub access_jwt: String,
}
