use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{AtUri, Did, Handle},
    error::XrpcErrorBody,
    protocol::{
        CreateSessionInput, CreateSessionOutput, GetPostsOutput, GetRecordOutput, PostView,
        PutRecordInput, PutRecordOutput, ResolveHandleOutput,
    },
};
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::{RepoAgent, XrpcError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub did: Did,
    pub handle: Handle,
    pub access_jwt: String,
}

impl From<CreateSessionOutput> for Session {
    fn from(value: CreateSessionOutput) -> Self {
        Self {
            did: value.did,
            handle: value.handle,
            access_jwt: value.access_jwt,
        }
    }
}

/// XRPC client for a PDS that also proxies AppView queries.
pub struct XrpcAgent {
    http: Client,
    service_url: String,
    session: RwLock<Option<Session>>,
}

impl XrpcAgent {
    pub fn new(service_url: &str) -> Result<Self> {
        let parsed = Url::parse(service_url)
            .with_context(|| format!("invalid service url '{service_url}'"))?;
        Ok(Self {
            http: Client::new(),
            service_url: parsed.as_str().trim_end_matches('/').to_string(),
            session: RwLock::new(None),
        })
    }

    pub fn with_session(self, session: Session) -> Self {
        Self {
            session: RwLock::new(Some(session)),
            ..self
        }
    }

    pub async fn session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    pub async fn login(&self, identifier: &str, password: &str) -> Result<Session, XrpcError> {
        let output: CreateSessionOutput = self
            .procedure(
                "com.atproto.server.createSession",
                &CreateSessionInput {
                    identifier: identifier.to_string(),
                    password: password.to_string(),
                },
            )
            .await?;
        let session = Session::from(output);
        info!(did = %session.did, handle = %session.handle, "xrpc: session created");
        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    fn endpoint(&self, nsid: &str) -> String {
        format!("{}/xrpc/{nsid}", self.service_url)
    }

    async fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.session.read().await.as_ref() {
            Some(session) => request.bearer_auth(&session.access_jwt),
            None => request,
        }
    }

    async fn query<T: DeserializeOwned>(
        &self,
        nsid: &str,
        params: &[(&str, &str)],
    ) -> Result<T, XrpcError> {
        debug!(nsid, "xrpc: query");
        let request = self.authorize(self.http.get(self.endpoint(nsid)).query(params)).await;
        decode_response(request.send().await?).await
    }

    async fn procedure<I: Serialize, T: DeserializeOwned>(
        &self,
        nsid: &str,
        input: &I,
    ) -> Result<T, XrpcError> {
        debug!(nsid, "xrpc: procedure");
        let request = self.authorize(self.http.post(self.endpoint(nsid)).json(input)).await;
        decode_response(request.send().await?).await
    }
}

async fn decode_response<T: DeserializeOwned>(response: Response) -> Result<T, XrpcError> {
    let status = response.status();
    let bytes = response.bytes().await?;
    if status.is_success() {
        return Ok(serde_json::from_slice(&bytes)?);
    }

    let body = serde_json::from_slice::<XrpcErrorBody>(&bytes).unwrap_or_else(|_| {
        XrpcErrorBody::new(
            status.canonical_reason().unwrap_or("UnknownError"),
            String::from_utf8_lossy(&bytes),
        )
    });
    Err(XrpcError::Api {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl RepoAgent for XrpcAgent {
    async fn session_did(&self) -> Option<Did> {
        self.session.read().await.as_ref().map(|s| s.did.clone())
    }

    async fn resolve_handle(&self, handle: &Handle) -> Result<Did, XrpcError> {
        let output: ResolveHandleOutput = self
            .query(
                "com.atproto.identity.resolveHandle",
                &[("handle", handle.as_str())],
            )
            .await?;
        Ok(output.did)
    }

    async fn get_record(
        &self,
        repo: &Did,
        collection: &str,
        rkey: &str,
    ) -> Result<GetRecordOutput, XrpcError> {
        self.query(
            "com.atproto.repo.getRecord",
            &[
                ("repo", repo.as_str()),
                ("collection", collection),
                ("rkey", rkey),
            ],
        )
        .await
    }

    async fn put_record(&self, input: PutRecordInput) -> Result<PutRecordOutput, XrpcError> {
        if self.session.read().await.is_none() {
            return Err(XrpcError::NoSession);
        }
        self.procedure("com.atproto.repo.putRecord", &input).await
    }

    async fn get_posts(&self, uris: &[AtUri]) -> Result<Vec<PostView>, XrpcError> {
        let uris: Vec<String> = uris.iter().map(ToString::to_string).collect();
        let params: Vec<(&str, &str)> = uris.iter().map(|u| ("uris", u.as_str())).collect();
        let output: GetPostsOutput = self.query("app.bsky.feed.getPosts", &params).await?;
        Ok(output.posts)
    }
}

#[cfg(test)]
#[path = "tests/xrpc_tests.rs"]
mod tests;
