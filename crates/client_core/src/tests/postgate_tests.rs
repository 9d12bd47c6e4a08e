use super::*;

use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::{
    domain::ProfileSummary,
    error::XrpcErrorBody,
    protocol::{PutRecordOutput, POSTGATE_DISABLE_RULE},
};
use tokio::{net::TcpListener, sync::Mutex};

use crate::{InMemoryPostShadow, Session, XrpcAgent};

const ALICE: &str = "did:plc:alice";
const BOB: &str = "did:plc:bob";
const TEST_JWT: &str = "test-jwt";

type RecordKey = (String, String, String);

#[derive(Clone, Default)]
struct FakePds {
    records: Arc<Mutex<HashMap<RecordKey, Value>>>,
    handles: Arc<Mutex<HashMap<String, String>>>,
    posts: Arc<Mutex<HashMap<String, PostView>>>,
    get_record_calls: Arc<Mutex<usize>>,
    resolve_calls: Arc<Mutex<usize>>,
    puts: Arc<Mutex<Vec<PutRecordInput>>>,
    fail_get_record_times: Arc<Mutex<usize>>,
    fail_put_record_times: Arc<Mutex<usize>>,
    reject_put_record: Arc<Mutex<bool>>,
    put_record_calls: Arc<Mutex<usize>>,
    fail_get_posts: Arc<Mutex<bool>>,
}

impl FakePds {
    async fn seed_record(&self, repo: &str, rkey: &str, value: Value) {
        self.records.lock().await.insert(
            (
                repo.to_string(),
                POSTGATE_COLLECTION.to_string(),
                rkey.to_string(),
            ),
            value,
        );
    }

    async fn stored(&self, repo: &str, rkey: &str) -> Option<Value> {
        self.records
            .lock()
            .await
            .get(&(
                repo.to_string(),
                POSTGATE_COLLECTION.to_string(),
                rkey.to_string(),
            ))
            .cloned()
    }
}

fn xrpc_error(status: StatusCode, body: XrpcErrorBody) -> Response {
    (status, Json(body)).into_response()
}

#[derive(Deserialize)]
struct ResolveHandleQuery {
    handle: String,
}

async fn handle_resolve_handle(
    State(pds): State<FakePds>,
    Query(q): Query<ResolveHandleQuery>,
) -> Response {
    *pds.resolve_calls.lock().await += 1;
    match pds.handles.lock().await.get(&q.handle) {
        Some(did) => Json(json!({ "did": did })).into_response(),
        None => xrpc_error(
            StatusCode::BAD_REQUEST,
            XrpcErrorBody::new("InvalidRequest", "Unable to resolve handle"),
        ),
    }
}

#[derive(Deserialize)]
struct GetRecordQuery {
    repo: String,
    collection: String,
    rkey: String,
}

async fn handle_get_record(
    State(pds): State<FakePds>,
    Query(q): Query<GetRecordQuery>,
) -> Response {
    *pds.get_record_calls.lock().await += 1;
    {
        let mut fails = pds.fail_get_record_times.lock().await;
        if *fails > 0 {
            *fails -= 1;
            return xrpc_error(
                StatusCode::SERVICE_UNAVAILABLE,
                XrpcErrorBody::new("UpstreamFailure", "try again later"),
            );
        }
    }

    let uri = format!("at://{}/{}/{}", q.repo, q.collection, q.rkey);
    let stored = pds
        .records
        .lock()
        .await
        .get(&(q.repo, q.collection, q.rkey))
        .cloned();
    match stored {
        Some(value) => Json(json!({ "uri": uri, "cid": "bafyrecord", "value": value })).into_response(),
        None => xrpc_error(StatusCode::BAD_REQUEST, XrpcErrorBody::record_not_found(uri)),
    }
}

async fn handle_put_record(
    State(pds): State<FakePds>,
    headers: HeaderMap,
    Json(input): Json<PutRecordInput>,
) -> Response {
    let authorized = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TEST_JWT}"));
    if !authorized {
        return xrpc_error(
            StatusCode::UNAUTHORIZED,
            XrpcErrorBody::new("AuthMissing", "Authentication Required"),
        );
    }
    *pds.put_record_calls.lock().await += 1;
    if *pds.reject_put_record.lock().await {
        return xrpc_error(
            StatusCode::BAD_REQUEST,
            XrpcErrorBody::new("InvalidRecord", "Record/embeddingRules/0 is invalid"),
        );
    }
    {
        let mut fails = pds.fail_put_record_times.lock().await;
        if *fails > 0 {
            *fails -= 1;
            return xrpc_error(
                StatusCode::BAD_GATEWAY,
                XrpcErrorBody::new("UpstreamFailure", "write failed"),
            );
        }
    }

    let uri = AtUri::new(input.repo.as_str(), &input.collection, &input.rkey);
    pds.records.lock().await.insert(
        (
            input.repo.to_string(),
            input.collection.clone(),
            input.rkey.clone(),
        ),
        input.record.clone(),
    );
    pds.puts.lock().await.push(input);
    Json(PutRecordOutput {
        uri,
        cid: "bafywritten".to_string(),
    })
    .into_response()
}

async fn handle_get_posts(
    State(pds): State<FakePds>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    if *pds.fail_get_posts.lock().await {
        return xrpc_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            XrpcErrorBody::new("InternalServerError", "appview unavailable"),
        );
    }
    let posts = pds.posts.lock().await;
    let found: Vec<PostView> = params
        .iter()
        .filter(|(key, _)| key == "uris")
        .filter_map(|(_, uri)| posts.get(uri).cloned())
        .collect();
    Json(json!({ "posts": found })).into_response()
}

async fn spawn_fake_pds() -> anyhow::Result<(String, FakePds)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let pds = FakePds::default();
    pds.handles
        .lock()
        .await
        .insert("alice.test".to_string(), ALICE.to_string());
    let app = Router::new()
        .route(
            "/xrpc/com.atproto.identity.resolveHandle",
            get(handle_resolve_handle),
        )
        .route("/xrpc/com.atproto.repo.getRecord", get(handle_get_record))
        .route("/xrpc/com.atproto.repo.putRecord", post(handle_put_record))
        .route("/xrpc/app.bsky.feed.getPosts", get(handle_get_posts))
        .with_state(pds.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), pds))
}

fn alice_session() -> Session {
    Session {
        did: Did::new(ALICE),
        handle: Handle::new("alice.test"),
        access_jwt: TEST_JWT.to_string(),
    }
}

async fn signed_in_client() -> (PostgateClient, FakePds, Arc<InMemoryPostShadow>) {
    let (server_url, pds) = spawn_fake_pds().await.expect("spawn fake pds");
    let agent = XrpcAgent::new(&server_url)
        .expect("agent")
        .with_session(alice_session());
    let shadow = Arc::new(InMemoryPostShadow::new());
    let client =
        PostgateClient::with_retry_policy(Arc::new(agent), shadow.clone(), RetryPolicy::immediate(2));
    (client, pds, shadow)
}

fn alice_post(rkey: &str) -> AtUri {
    AtUri::new(ALICE, "app.bsky.feed.post", rkey)
}

fn post_view(uri: AtUri, author: &str) -> PostView {
    PostView {
        uri,
        cid: "bafypost".to_string(),
        author: ProfileSummary {
            did: Did::new(author),
            handle: Handle::new(format!("{}.test", author.trim_start_matches("did:plc:"))),
            display_name: None,
            avatar: None,
        },
        record: json!({ "$type": "app.bsky.feed.post", "text": "hello" }),
        embed: None,
        indexed_at: "2024-08-01T00:00:00Z".parse().expect("timestamp"),
    }
}

fn stored_record(value: Value) -> PostgateRecord {
    match serde_json::from_value::<RepoRecord>(value).expect("stored record decodes") {
        RepoRecord::Postgate(record) => record,
        other => panic!("unexpected record {other:?}"),
    }
}

fn existing_record(post: &AtUri) -> Value {
    json!({
        "$type": POSTGATE_COLLECTION,
        "post": post.to_string(),
        "createdAt": "2024-08-01T00:00:00.000Z",
        "embeddingRules": []
    })
}

#[test]
fn merge_collapses_duplicate_detached_quotes() {
    let post = alice_post("p1");
    let quoting = AtUri::new(BOB, "app.bsky.feed.post", "q1");
    let delta = PostgateDelta {
        detached_quotes: Some(vec![quoting.clone()]),
        quotepost_rules: None,
    };

    let once = merge_records(create_record(&post, None, None), delta.clone());
    let twice = merge_records(once.clone(), delta);
    assert_eq!(twice.detached_quotes(), &[quoting]);
    assert_eq!(once, twice);
}

#[test]
fn merge_replaces_rules_only_when_supplied_and_keeps_identity() {
    let post = alice_post("p1");
    let existing = AtUri::new(BOB, "app.bsky.feed.post", "q1");
    let base = create_record(&post, Some(vec![existing.clone()]), None);

    let disabled = merge_records(
        base.clone(),
        PostgateDelta {
            detached_quotes: None,
            quotepost_rules: Some(vec![EmbeddingRule::Disable]),
        },
    );
    assert!(disabled.quotes_disabled());
    assert_eq!(disabled.detached_quotes(), &[existing.clone()]);
    assert_eq!(disabled.post, base.post);
    assert_eq!(disabled.created_at, base.created_at);

    let untouched = merge_records(disabled.clone(), PostgateDelta::default());
    assert_eq!(untouched, disabled);
}

#[test]
fn detached_quote_embed_depends_on_postgate() {
    let quoted_uri = alice_post("p1");
    let quoting = AtUri::new(BOB, "app.bsky.feed.post", "q1");
    let gate = create_record(&quoted_uri, Some(vec![quoting.clone()]), None);

    let embed = maybe_detached_quote_embed(&quoting, post_view(quoted_uri.clone(), ALICE), Some(&gate));
    assert_eq!(
        embed.record,
        EmbeddedRecordView::Detached {
            uri: quoted_uri.clone(),
            detached: true
        }
    );

    let other = AtUri::new(BOB, "app.bsky.feed.post", "q2");
    let embed = maybe_detached_quote_embed(&other, post_view(quoted_uri.clone(), ALICE), Some(&gate));
    assert!(matches!(embed.record, EmbeddedRecordView::Record(ref view) if view.uri == quoted_uri));

    let embed = maybe_detached_quote_embed(&quoting, post_view(quoted_uri.clone(), ALICE), None);
    assert!(matches!(embed.record, EmbeddedRecordView::Record(_)));
}

#[tokio::test]
async fn missing_record_is_absent_and_not_retried() {
    let (client, pds, _shadow) = signed_in_client().await;

    let record = client.get_record(&alice_post("p1")).await.expect("get");
    assert!(record.is_none());
    assert_eq!(*pds.get_record_calls.lock().await, 1);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let (client, pds, _shadow) = signed_in_client().await;
    let post = alice_post("p1");
    pds.seed_record(ALICE, "p1", existing_record(&post)).await;
    *pds.fail_get_record_times.lock().await = 2;

    let record = client.get_record(&post).await.expect("get").expect("record");
    assert_eq!(record.post, post);
    assert_eq!(*pds.get_record_calls.lock().await, 3);
}

#[tokio::test]
async fn exhausted_retries_surface_wrapped_error() {
    let (client, pds, _shadow) = signed_in_client().await;
    *pds.fail_get_record_times.lock().await = 10;

    let err = client
        .get_record(&alice_post("p1"))
        .await
        .expect_err("must fail");
    assert!(matches!(err, PostgateError::Get { .. }));
    assert!(err.to_string().contains("failed to get postgate record"));
    assert_eq!(*pds.get_record_calls.lock().await, 3);
}

#[tokio::test]
async fn malformed_record_is_treated_as_absent() {
    let (client, pds, _shadow) = signed_in_client().await;
    pds.seed_record(ALICE, "p1", json!({ "$type": POSTGATE_COLLECTION, "post": 42 }))
        .await;

    assert!(client.get_record(&alice_post("p1")).await.expect("get").is_none());
}

#[tokio::test]
async fn handle_authority_is_resolved_before_fetching() {
    let (client, pds, _shadow) = signed_in_client().await;
    let post = alice_post("p1");
    pds.seed_record(ALICE, "p1", existing_record(&post)).await;

    let by_handle: AtUri = "at://alice.test/app.bsky.feed.post/p1".parse().expect("uri");
    let record = client.get_record(&by_handle).await.expect("get");
    assert_eq!(record.map(|r| r.post), Some(post));
    assert_eq!(*pds.resolve_calls.lock().await, 1);
}

#[tokio::test]
async fn unresolvable_handle_is_an_error() {
    let (client, _pds, _shadow) = signed_in_client().await;
    let by_handle: AtUri = "at://nobody.test/app.bsky.feed.post/p1".parse().expect("uri");

    let err = client.get_record(&by_handle).await.expect_err("must fail");
    assert!(matches!(err, PostgateError::ResolveHandle { .. }));
}

#[tokio::test]
async fn default_record_is_open_and_not_written() {
    let (client, pds, _shadow) = signed_in_client().await;
    let post = alice_post("p1");

    let record = client.get_record_or_default(&post).await.expect("get");
    assert_eq!(record.post, post);
    assert!(record.is_open());
    assert!(pds.puts.lock().await.is_empty());
}

#[tokio::test]
async fn detach_without_record_creates_one_and_patches_shadow() {
    let (client, pds, shadow) = signed_in_client().await;
    let quoted = alice_post("p1");
    let quoting = post_view(AtUri::new(BOB, "app.bsky.feed.post", "q1"), BOB);

    client
        .toggle_quote_detachment(&quoting, &quoted, QuoteDetachAction::Detach)
        .await
        .expect("detach");

    let puts = pds.puts.lock().await.clone();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].repo, Did::new(ALICE));
    assert_eq!(puts[0].collection, POSTGATE_COLLECTION);
    assert_eq!(puts[0].rkey, "p1");

    let stored = stored_record(pds.stored(ALICE, "p1").await.expect("stored"));
    assert_eq!(stored.post, quoted);
    assert_eq!(stored.detached_quotes(), &[quoting.uri.clone()]);

    let embed = shadow.get(&quoting.uri).and_then(|s| s.embed).expect("patched");
    assert_eq!(
        embed.record,
        EmbeddedRecordView::Detached {
            uri: quoted,
            detached: true
        }
    );
}

#[tokio::test]
async fn detaching_twice_keeps_a_single_entry() {
    let (client, pds, _shadow) = signed_in_client().await;
    let quoted = alice_post("p1");
    let quoting = post_view(AtUri::new(BOB, "app.bsky.feed.post", "q1"), BOB);

    for _ in 0..2 {
        client
            .toggle_quote_detachment(&quoting, &quoted, QuoteDetachAction::Detach)
            .await
            .expect("detach");
    }

    let stored = stored_record(pds.stored(ALICE, "p1").await.expect("stored"));
    assert_eq!(stored.detached_quotes(), &[quoting.uri]);
}

#[tokio::test]
async fn reattach_without_record_writes_nothing() {
    let (client, pds, shadow) = signed_in_client().await;
    let quoted = alice_post("p1");
    pds.posts
        .lock()
        .await
        .insert(quoted.to_string(), post_view(quoted.clone(), ALICE));
    let quoting = post_view(AtUri::new(BOB, "app.bsky.feed.post", "q1"), BOB);

    let written = client
        .upsert(&quoted, |prev| {
            assert!(prev.is_none());
            None
        })
        .await
        .expect("upsert");
    assert!(written.is_none());

    client
        .toggle_quote_detachment(&quoting, &quoted, QuoteDetachAction::Reattach)
        .await
        .expect("reattach");
    assert!(pds.puts.lock().await.is_empty());
    assert!(shadow.get(&quoting.uri).is_some());
}

#[tokio::test]
async fn reattach_removes_entry_and_restores_live_embed() {
    let (client, pds, shadow) = signed_in_client().await;
    let quoted = alice_post("p1");
    let quoting = post_view(AtUri::new(BOB, "app.bsky.feed.post", "q1"), BOB);
    let other = AtUri::new(BOB, "app.bsky.feed.post", "q2");
    pds.posts
        .lock()
        .await
        .insert(quoted.to_string(), post_view(quoted.clone(), ALICE));

    client
        .toggle_quote_detachment(&quoting, &quoted, QuoteDetachAction::Detach)
        .await
        .expect("detach");
    client
        .toggle_quote_detachment(&post_view(other.clone(), BOB), &quoted, QuoteDetachAction::Detach)
        .await
        .expect("detach other");
    client
        .toggle_quote_detachment(&quoting, &quoted, QuoteDetachAction::Reattach)
        .await
        .expect("reattach");

    let stored = stored_record(pds.stored(ALICE, "p1").await.expect("stored"));
    assert_eq!(stored.detached_quotes(), &[other]);

    let embed = shadow.get(&quoting.uri).and_then(|s| s.embed).expect("patched");
    match embed.record {
        EmbeddedRecordView::Record(view) => {
            assert_eq!(view.uri, quoted);
            assert_eq!(view.value["text"], "hello");
        }
        other => panic!("expected live embed, got {other:?}"),
    }
}

#[tokio::test]
async fn reattach_refetch_failure_is_not_fatal() {
    let (client, pds, shadow) = signed_in_client().await;
    let quoted = alice_post("p1");
    let quoting = post_view(AtUri::new(BOB, "app.bsky.feed.post", "q1"), BOB);
    pds.seed_record(ALICE, "p1", existing_record(&quoted)).await;
    *pds.fail_get_posts.lock().await = true;

    client
        .toggle_quote_detachment(&quoting, &quoted, QuoteDetachAction::Reattach)
        .await
        .expect("reattach succeeds despite refetch failure");

    assert_eq!(pds.puts.lock().await.len(), 1);
    assert!(shadow.get(&quoting.uri).is_none());
}

#[tokio::test]
async fn disable_then_enable_quotes_on_existing_record() {
    let (client, pds, _shadow) = signed_in_client().await;
    let post = alice_post("p1");
    pds.seed_record(ALICE, "p1", existing_record(&post)).await;

    client
        .toggle_quotepost_enabled(&post, QuotepostAction::Disable)
        .await
        .expect("disable");
    let stored = pds.stored(ALICE, "p1").await.expect("stored");
    assert_eq!(stored["embeddingRules"], json!([{ "$type": POSTGATE_DISABLE_RULE }]));
    assert_eq!(
        stored_record(stored.clone()).created_at,
        "2024-08-01T00:00:00Z"
            .parse::<chrono::DateTime<Utc>>()
            .expect("timestamp")
    );

    client
        .toggle_quotepost_enabled(&post, QuotepostAction::Enable)
        .await
        .expect("enable");
    let stored = pds.stored(ALICE, "p1").await.expect("stored");
    assert_eq!(stored["embeddingRules"], json!([]));
}

#[tokio::test]
async fn disable_without_record_creates_one_and_keeps_detachments_on_later_toggles() {
    let (client, pds, _shadow) = signed_in_client().await;
    let post = alice_post("p1");
    let quoting = post_view(AtUri::new(BOB, "app.bsky.feed.post", "q1"), BOB);

    client
        .toggle_quotepost_enabled(&post, QuotepostAction::Disable)
        .await
        .expect("disable");
    client
        .toggle_quote_detachment(&quoting, &post, QuoteDetachAction::Detach)
        .await
        .expect("detach");
    client
        .toggle_quotepost_enabled(&post, QuotepostAction::Enable)
        .await
        .expect("enable");

    let stored = stored_record(pds.stored(ALICE, "p1").await.expect("stored"));
    assert!(!stored.quotes_disabled());
    assert!(stored.is_detached(&quoting.uri));
    assert_eq!(pds.puts.lock().await.len(), 3);
}

#[tokio::test]
async fn enable_without_record_writes_nothing() {
    let (client, pds, _shadow) = signed_in_client().await;

    client
        .toggle_quotepost_enabled(&alice_post("p1"), QuotepostAction::Enable)
        .await
        .expect("enable");
    assert!(pds.puts.lock().await.is_empty());
}

#[tokio::test]
async fn write_is_retried_on_transient_failure() {
    let (client, pds, _shadow) = signed_in_client().await;
    *pds.fail_put_record_times.lock().await = 2;

    client
        .toggle_quotepost_enabled(&alice_post("p1"), QuotepostAction::Disable)
        .await
        .expect("disable");
    assert_eq!(pds.puts.lock().await.len(), 1);
    assert_eq!(*pds.put_record_calls.lock().await, 3);
}

#[tokio::test]
async fn rejected_write_is_not_retried() {
    let (client, pds, _shadow) = signed_in_client().await;
    *pds.reject_put_record.lock().await = true;

    let err = client
        .toggle_quotepost_enabled(&alice_post("p1"), QuotepostAction::Disable)
        .await
        .expect_err("must fail");
    match err {
        PostgateError::Write { source, .. } => assert_eq!(source.status(), Some(400)),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(*pds.put_record_calls.lock().await, 1);
    assert!(pds.puts.lock().await.is_empty());
}

#[tokio::test]
async fn handle_authority_is_stored_as_did() {
    let (client, pds, _shadow) = signed_in_client().await;
    let by_handle: AtUri = "at://alice.test/app.bsky.feed.post/p1".parse().expect("uri");
    let quoting = post_view(AtUri::new(BOB, "app.bsky.feed.post", "q1"), BOB);

    client
        .toggle_quote_detachment(&quoting, &by_handle, QuoteDetachAction::Detach)
        .await
        .expect("detach");

    let stored = stored_record(pds.stored(ALICE, "p1").await.expect("stored"));
    assert_eq!(stored.post, alice_post("p1"));
    assert_eq!(*pds.resolve_calls.lock().await, 1);

    let record = client
        .get_record_or_default(&"at://alice.test/app.bsky.feed.post/p2".parse::<AtUri>().expect("uri"))
        .await
        .expect("default");
    assert_eq!(record.post, alice_post("p2"));
}

#[tokio::test]
async fn write_requires_a_session() {
    let (server_url, pds) = spawn_fake_pds().await.expect("spawn fake pds");
    let agent = XrpcAgent::new(&server_url).expect("agent");
    let client = PostgateClient::with_retry_policy(
        Arc::new(agent),
        Arc::new(InMemoryPostShadow::new()),
        RetryPolicy::immediate(2),
    );

    let err = client
        .toggle_quotepost_enabled(&alice_post("p1"), QuotepostAction::Disable)
        .await
        .expect_err("must fail");
    assert!(matches!(err, PostgateError::NoSession));
    assert!(pds.puts.lock().await.is_empty());
}
