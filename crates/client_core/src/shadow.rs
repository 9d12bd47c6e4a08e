//! Optimistic per-post overrides layered over cached post views.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use shared::{domain::AtUri, protocol::RecordEmbedView};
use tracing::debug;

pub trait PostShadowCache: Send + Sync {
    /// Replaces the cached embed of `post_uri`. Fire-and-forget.
    fn update_cached_embed(&self, post_uri: &AtUri, embed: RecordEmbedView);
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostShadow {
    pub embed: Option<RecordEmbedView>,
}

#[derive(Debug, Default)]
pub struct InMemoryPostShadow {
    entries: RwLock<HashMap<AtUri, PostShadow>>,
}

impl InMemoryPostShadow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, post_uri: &AtUri) -> Option<PostShadow> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(post_uri)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

impl PostShadowCache for InMemoryPostShadow {
    fn update_cached_embed(&self, post_uri: &AtUri, embed: RecordEmbedView) {
        debug!(post_uri = %post_uri, "shadow: embed updated");
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(post_uri.clone())
            .or_default()
            .embed = Some(embed);
    }
}
