use super::*;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::ACCEPT;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

const REFRESH_BARE: usize = 0;
const REFRESH_SESSION: usize = 1;
const REFRESH_SESSION_WITH_USER: usize = 2;

/// Shared state of the mock backend the client tests run against.
#[derive(Default)]
struct Backend {
    refresh_calls: AtomicUsize,
    deck_calls: AtomicUsize,
    user_calls: AtomicUsize,
    refresh_ok: AtomicBool,
    refresh_style: AtomicUsize,
    deck_fail_first: AtomicBool,
    deck_always_unauthorized: AtomicBool,
}

fn sample_user_json() -> Value {
    json!({
        "username": "richard",
        "full_name": "Richard Si",
        "is_admin": false,
        "decks": [1],
    })
}

fn sample_deck_json() -> Value {
    json!({
        "id": 1,
        "name": "Trees",
        "cards": [
            { "id": "oak", "term": "oak", "definition": "a hardwood" },
            { "id": "pine", "term": "pine", "definition": "an evergreen" },
        ],
    })
}

fn has_valid_token(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer token-"))
}

async fn refresh_session(State(state): State<Arc<Backend>>) -> (StatusCode, Json<Value>) {
    let n = state.refresh_calls.fetch_add(1, SeqCst) + 1;
    if !state.refresh_ok.load(SeqCst) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "session expired" })),
        );
    }
    let token = format!("token-{n}");
    let body = match state.refresh_style.load(SeqCst) {
        REFRESH_BARE => json!(token),
        REFRESH_SESSION => json!({ "session": { "access_token": token } }),
        _ => json!({
            "session": { "access_token": token },
            "user": sample_user_json(),
        }),
    };
    (StatusCode::OK, Json(body))
}

async fn current_user(
    State(state): State<Arc<Backend>>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    state.user_calls.fetch_add(1, SeqCst);
    if !has_valid_token(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "not authenticated" })),
        );
    }
    (StatusCode::OK, Json(sample_user_json()))
}

async fn fetch_deck(
    State(state): State<Arc<Backend>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    state.deck_calls.fetch_add(1, SeqCst);
    if state.deck_always_unauthorized.load(SeqCst) || state.deck_fail_first.swap(false, SeqCst) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "token rejected" })),
        );
    }
    if !has_valid_token(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "not authenticated" })),
        );
    }
    if id != "1" {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "deck not found" })),
        );
    }
    (StatusCode::OK, Json(sample_deck_json()))
}

async fn public_decks() -> Json<Value> {
    Json(json!([sample_deck_json()]))
}

async fn echo_headers(headers: HeaderMap) -> Json<Value> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    Json(json!({ "accept": header("accept"), "priority": header("priority") }))
}

async fn spawn_backend(state: Arc<Backend>) -> String {
    let app = Router::new()
        .route("/refresh-session", post(refresh_session))
        .route("/current-user", get(current_user))
        .route("/deck/:id", get(fetch_deck))
        .route("/public-decks", get(public_decks))
        .route("/echo-headers", get(echo_headers))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn client_against(state: &Arc<Backend>) -> ApiClient {
    let _ = env_logger::builder().is_test(true).try_init();
    let base = spawn_backend(state.clone()).await;
    ApiClient::new(base).unwrap()
}

#[tokio::test]
async fn concurrent_requests_share_one_refresh() -> anyhow::Result<()> {
    let backend = Arc::new(Backend::default());
    backend.refresh_ok.store(true, SeqCst);
    backend.refresh_style.store(REFRESH_SESSION, SeqCst);
    let api = client_against(&backend).await;

    let (a, b, c, d) = tokio::join!(
        api.get::<User>("/current-user", RequestOptions::new()),
        api.get::<User>("/current-user", RequestOptions::new()),
        api.get::<Deck>("/deck/1", RequestOptions::new()),
        api.get::<Deck>("/deck/1", RequestOptions::new()),
    );
    a?;
    b?;
    let deck = c?;
    d?;

    assert_eq!(backend.refresh_calls.load(SeqCst), 1);
    assert_eq!(deck.name, "Trees");
    assert_eq!(deck.cards[0].term, "oak");
    Ok(())
}

#[tokio::test]
async fn failed_refresh_rejects_before_reaching_the_network() {
    let backend = Arc::new(Backend::default());
    let api = client_against(&backend).await;

    let err = api
        .get::<Deck>("/deck/1", RequestOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::AuthRequired));
    assert_eq!(err.status().map(|s| s.as_u16()), Some(401));
    assert_eq!(backend.deck_calls.load(SeqCst), 0);
}

#[tokio::test]
async fn unauthorized_response_triggers_exactly_one_retry() -> anyhow::Result<()> {
    let backend = Arc::new(Backend::default());
    backend.refresh_ok.store(true, SeqCst);
    backend.refresh_style.store(REFRESH_SESSION, SeqCst);
    backend.deck_fail_first.store(true, SeqCst);
    let api = client_against(&backend).await;

    let deck = api.get::<Deck>("/deck/1", RequestOptions::new()).await?;

    assert_eq!(deck.id, 1);
    // First attempt rejected, second accepted; one refresh up front plus one
    // triggered by the 401.
    assert_eq!(backend.deck_calls.load(SeqCst), 2);
    assert_eq!(backend.refresh_calls.load(SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn the_retry_is_never_itself_retried() {
    let backend = Arc::new(Backend::default());
    backend.refresh_ok.store(true, SeqCst);
    backend.refresh_style.store(REFRESH_SESSION, SeqCst);
    backend.deck_always_unauthorized.store(true, SeqCst);
    let api = client_against(&backend).await;

    let err = api
        .get::<Deck>("/deck/1", RequestOptions::new())
        .await
        .unwrap_err();

    assert_eq!(err.status().map(|s| s.as_u16()), Some(401));
    assert_eq!(backend.deck_calls.load(SeqCst), 2);
    assert_eq!(backend.refresh_calls.load(SeqCst), 2);
}

#[tokio::test]
async fn explicit_no_retry_fails_on_the_first_rejection() {
    let backend = Arc::new(Backend::default());
    backend.refresh_ok.store(true, SeqCst);
    backend.refresh_style.store(REFRESH_SESSION, SeqCst);
    backend.deck_always_unauthorized.store(true, SeqCst);
    let api = client_against(&backend).await;

    let err = api
        .get::<Deck>("/deck/1", RequestOptions::new().no_retry())
        .await
        .unwrap_err();

    assert_eq!(err.status().map(|s| s.as_u16()), Some(401));
    assert_eq!(backend.deck_calls.load(SeqCst), 1);
    assert_eq!(backend.refresh_calls.load(SeqCst), 1);
}

#[tokio::test]
async fn current_user_absorbs_all_failures() {
    let backend = Arc::new(Backend::default());
    let api = client_against(&backend).await;

    let user = api.current_user(RequestOptions::new()).await;

    assert!(user.is_none());
    // Best-effort: the request still went out without a token and came back
    // unauthorized, which is absorbed rather than propagated.
    assert_eq!(backend.user_calls.load(SeqCst), 1);
}

#[tokio::test]
async fn current_user_uses_the_record_bundled_with_a_refresh() {
    let backend = Arc::new(Backend::default());
    backend.refresh_ok.store(true, SeqCst);
    backend
        .refresh_style
        .store(REFRESH_SESSION_WITH_USER, SeqCst);
    let api = client_against(&backend).await;

    api.get::<Deck>("/deck/1", RequestOptions::new())
        .await
        .unwrap();
    let user = api.current_user(RequestOptions::new()).await.unwrap();

    assert_eq!(user.username, "richard");
    assert_eq!(backend.user_calls.load(SeqCst), 0);
}

#[tokio::test]
async fn current_user_fetches_when_nothing_is_cached() {
    let backend = Arc::new(Backend::default());
    backend.refresh_ok.store(true, SeqCst);
    // Bare-token refresh responses carry no user record.
    backend.refresh_style.store(REFRESH_BARE, SeqCst);
    let api = client_against(&backend).await;

    let user = api.current_user(RequestOptions::new()).await.unwrap();

    assert_eq!(user.full_name, "Richard Si");
    assert_eq!(backend.user_calls.load(SeqCst), 1);
    assert_eq!(backend.refresh_calls.load(SeqCst), 1);
}

#[tokio::test]
async fn best_effort_requests_proceed_without_a_token() -> anyhow::Result<()> {
    let backend = Arc::new(Backend::default());
    let api = client_against(&backend).await;

    let decks = api
        .get::<Vec<Deck>>("/public-decks", RequestOptions::new().auth(Auth::BestEffort))
        .await?;

    assert_eq!(decks.len(), 1);
    // The refresh was attempted once, and its failure did not sink the call.
    assert_eq!(backend.refresh_calls.load(SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn other_statuses_propagate_without_retry() {
    let backend = Arc::new(Backend::default());
    backend.refresh_ok.store(true, SeqCst);
    backend.refresh_style.store(REFRESH_SESSION, SeqCst);
    let api = client_against(&backend).await;

    let err = api
        .get::<Deck>("/deck/99", RequestOptions::new())
        .await
        .unwrap_err();

    assert_eq!(err.status().map(|s| s.as_u16()), Some(404));
    assert!(err.body().unwrap().contains("deck not found"));
    assert_eq!(backend.deck_calls.load(SeqCst), 1);
}

#[tokio::test]
async fn caller_headers_win_and_priority_is_forwarded() -> anyhow::Result<()> {
    let backend = Arc::new(Backend::default());
    let api = client_against(&backend).await;

    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("text/plain"));
    let options = RequestOptions::new()
        .auth(Auth::None)
        .priority(Priority::Low)
        .headers(headers);
    let echoed = api.get::<Value>("/echo-headers", options).await?;

    assert_eq!(echoed["accept"], "text/plain");
    assert_eq!(echoed["priority"], "u=5");
    Ok(())
}
