use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! string_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_newtype!(Did);
string_newtype!(Handle);

impl Did {
    pub fn is_did(value: &str) -> bool {
        value.starts_with("did:")
    }
}

const AT_URI_SCHEME: &str = "at://";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AtUriError {
    #[error("at-uri must start with at:// (got {0:?})")]
    MissingScheme(String),
    #[error("at-uri has an empty authority: {0:?}")]
    EmptyAuthority(String),
    #[error("at-uri has too many path segments: {0:?}")]
    TooManySegments(String),
}

/// `at://<authority>[/<collection>[/<rkey>]]`
///
/// The authority is either a DID or a handle; query and fragment parts are
/// not supported by the records this client touches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AtUri {
    authority: String,
    collection: Option<String>,
    rkey: Option<String>,
}

impl AtUri {
    pub fn new(
        authority: impl Into<String>,
        collection: impl Into<String>,
        rkey: impl Into<String>,
    ) -> Self {
        Self {
            authority: authority.into(),
            collection: Some(collection.into()),
            rkey: Some(rkey.into()),
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    pub fn rkey(&self) -> Option<&str> {
        self.rkey.as_deref()
    }

    pub fn has_did_authority(&self) -> bool {
        Did::is_did(&self.authority)
    }

    pub fn authority_did(&self) -> Option<Did> {
        self.has_did_authority()
            .then(|| Did::new(self.authority.clone()))
    }

    /// Same collection and rkey under a different authority.
    pub fn with_authority(&self, did: &Did) -> Self {
        Self {
            authority: did.0.clone(),
            collection: self.collection.clone(),
            rkey: self.rkey.clone(),
        }
    }
}

impl FromStr for AtUri {
    type Err = AtUriError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let rest = raw
            .strip_prefix(AT_URI_SCHEME)
            .ok_or_else(|| AtUriError::MissingScheme(raw.to_string()))?;
        let mut segments = rest.trim_end_matches('/').split('/');

        let authority = segments.next().unwrap_or_default();
        if authority.is_empty() {
            return Err(AtUriError::EmptyAuthority(raw.to_string()));
        }
        let collection = segments.next().filter(|s| !s.is_empty());
        let rkey = segments.next().filter(|s| !s.is_empty());
        if segments.next().is_some() || (collection.is_none() && rkey.is_some()) {
            return Err(AtUriError::TooManySegments(raw.to_string()));
        }

        Ok(Self {
            authority: authority.to_string(),
            collection: collection.map(str::to_string),
            rkey: rkey.map(str::to_string),
        })
    }
}

impl TryFrom<String> for AtUri {
    type Error = AtUriError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AtUri> for String {
    fn from(value: AtUri) -> Self {
        value.to_string()
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{AT_URI_SCHEME}{}", self.authority)?;
        if let Some(collection) = &self.collection {
            write!(f, "/{collection}")?;
            if let Some(rkey) = &self.rkey {
                write!(f, "/{rkey}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSummary {
    pub did: Did,
    pub handle: Handle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSummary {
    pub uri: AtUri,
    pub display_name: String,
    pub creator: Did,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}
