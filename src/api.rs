use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use reqwest::header::{self, HeaderMap};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::models::User;

const CURRENT_USER_PATH: &str = "/current-user";
const REFRESH_SESSION_PATH: &str = "/refresh-session";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unable to refresh session")]
    AuthRequired,
    #[error("request failed with status {status}")]
    Status { status: StatusCode, body: String },
    #[error("invalid JSON response: {0}")]
    Decode(#[source] serde_json::Error),
}

impl ApiError {
    /// HTTP status backing this error, if any. Lets a page layer branch on
    /// 401/403/404 without digging through variants.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Transport(err) => err.status(),
            ApiError::AuthRequired => Some(StatusCode::UNAUTHORIZED),
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Decode(_) => None,
        }
    }

    /// Response body of a failed request, if one was received.
    pub fn body(&self) -> Option<&str> {
        match self {
            ApiError::Status { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// Whether a request needs an access token before it may go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Auth {
    /// Refuse to hit the network without a valid token.
    #[default]
    Required,
    /// Try to obtain a token, but send the request either way. For endpoints
    /// where an anonymous answer is acceptable.
    BestEffort,
    /// Send without credentials.
    None,
}

/// Transport priority hint, sent as the RFC 9218 `Priority` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Auto,
    Low,
    High,
}

impl Priority {
    fn urgency(self) -> Option<&'static str> {
        match self {
            Priority::Auto => None,
            Priority::Low => Some("u=5"),
            Priority::High => Some("u=1"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub auth: Auth,
    /// Whether a 401 response may trigger one refresh-and-retry round.
    pub retry: bool,
    pub body: Option<serde_json::Value>,
    /// Extra headers, merged over the computed defaults. Caller wins on
    /// conflict.
    pub headers: HeaderMap,
    pub priority: Priority,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            auth: Auth::Required,
            retry: true,
            body: None,
            headers: HeaderMap::new(),
            priority: Priority::Auto,
        }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    pub fn no_retry(mut self) -> Self {
        self.retry = false;
        self
    }

    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Refresh responses come in two wire revisions: the original bare token
/// string, and the newer envelope with the token under `session` plus an
/// optional user record.
#[derive(Deserialize)]
#[serde(untagged)]
enum RefreshResponse {
    Token(String),
    Session {
        session: SessionToken,
        #[serde(default)]
        user: Option<User>,
    },
}

#[derive(Deserialize)]
struct SessionToken {
    access_token: String,
}

struct AuthState {
    access_token: Option<String>,
    current_user: Option<User>,
    // Non-None only while a refresh is running. Every concurrent caller
    // awaits this same future instead of starting its own refresh.
    refresh_in_flight: Option<Shared<BoxFuture<'static, bool>>>,
}

/// JSON API client. Attaches bearer tokens, refreshes the session when it
/// expires, and retries a rejected request at most once.
///
/// Cloning is cheap; clones share the access token and refresh state.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    path_prefix: String,
    auth: Arc<Mutex<AuthState>>,
}

impl ApiClient {
    pub fn new(path_prefix: impl Into<String>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().cookie_store(true).build()?;
        Ok(Self::with_client(path_prefix, http))
    }

    /// Build on top of a caller-supplied `reqwest::Client`.
    pub fn with_client(path_prefix: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            http,
            path_prefix: path_prefix.into(),
            auth: Arc::new(Mutex::new(AuthState {
                access_token: None,
                current_user: None,
                refresh_in_flight: None,
            })),
        }
    }

    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        self.request_json(Method::GET, path, options).await
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        self.request_json(Method::POST, path, options).await
    }

    /// Fetch the authenticated user. Resolves to `None` on any failure:
    /// having no user is a normal steady state for anonymous visitors, so
    /// this is the one call that swallows errors. A user record bundled with
    /// an earlier session refresh is returned without a network round-trip.
    pub async fn current_user(&self, options: RequestOptions) -> Option<User> {
        if let Some(user) = self.auth.lock().await.current_user.clone() {
            return Some(user);
        }
        let options = options.auth(Auth::BestEffort);
        match self.get::<User>(CURRENT_USER_PATH, options).await {
            Ok(user) => {
                self.auth.lock().await.current_user = Some(user.clone());
                Some(user)
            }
            Err(err) => {
                debug!("no authenticated user: {err}");
                None
            }
        }
    }

    /// Perform a request and return the raw response.
    ///
    /// With `Auth::Required` and no cached token the session is refreshed
    /// first; if that fails the network is never reached. A 401 response on
    /// an authenticated call triggers one refresh followed by one retry,
    /// after which the failure is returned as-is.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<reqwest::Response, ApiError> {
        match options.auth {
            Auth::Required => {
                if self.access_token().await.is_none() && !self.refresh_session().await {
                    return Err(ApiError::AuthRequired);
                }
            }
            Auth::BestEffort => {
                if self.access_token().await.is_none() {
                    self.refresh_session().await;
                }
            }
            Auth::None => {}
        }

        let mut retry = options.retry;
        loop {
            let mut builder = self
                .http
                .request(method.clone(), format!("{}{}", self.path_prefix, path))
                .header(header::ACCEPT, "application/json");
            if let Some(urgency) = options.priority.urgency() {
                builder = builder.header("priority", urgency);
            }
            if options.auth != Auth::None {
                if let Some(token) = self.access_token().await {
                    builder = builder.bearer_auth(token);
                }
            }
            if !options.headers.is_empty() {
                builder = builder.headers(options.headers.clone());
            }
            if let Some(body) = &options.body {
                builder = builder.json(body);
            }

            let resp = builder.send().await?;
            if resp.status().is_success() {
                return Ok(resp);
            }
            if resp.status() == StatusCode::UNAUTHORIZED && options.auth == Auth::Required && retry
            {
                // One refresh-and-retry round per logical call. The flag
                // stays off even if the retried request fails again.
                retry = false;
                if self.refresh_session().await {
                    continue;
                }
            }
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let resp = self.request(method, path, options).await?;
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(ApiError::Decode)
    }

    async fn access_token(&self) -> Option<String> {
        self.auth.lock().await.access_token.clone()
    }

    /// Renew the session, coalescing concurrent callers onto a single
    /// refresh. Returns whether a valid access token is now stored.
    async fn refresh_session(&self) -> bool {
        let pending = {
            let mut auth = self.auth.lock().await;
            if let Some(pending) = auth.refresh_in_flight.clone() {
                pending
            } else {
                let client = self.clone();
                let pending = async move { client.run_refresh().await }.boxed().shared();
                auth.refresh_in_flight = Some(pending.clone());
                pending
            }
        };
        pending.await
    }

    async fn run_refresh(&self) -> bool {
        debug!("attempting to refresh session");
        let outcome = self.fetch_refresh().await;

        let mut auth = self.auth.lock().await;
        let renewed = match outcome {
            Ok(RefreshResponse::Token(token)) => {
                auth.access_token = Some(token);
                true
            }
            Ok(RefreshResponse::Session { session, user }) => {
                auth.access_token = Some(session.access_token);
                if user.is_some() {
                    auth.current_user = user;
                }
                true
            }
            Err(err) => {
                warn!("failed to acquire new access token: {err}");
                auth.access_token = None;
                auth.current_user = None;
                false
            }
        };
        if renewed {
            debug!("access token acquired");
        }
        // Clear the marker exactly once, so the next expiry starts a fresh
        // attempt instead of awaiting a settled future.
        auth.refresh_in_flight = None;
        renewed
    }

    // The refresh request is built directly: it is unauthenticated and must
    // never re-enter the retry path that called it.
    async fn fetch_refresh(&self) -> Result<RefreshResponse, ApiError> {
        let resp = self
            .http
            .post(format!("{}{}", self.path_prefix, REFRESH_SESSION_PATH))
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(ApiError::Decode)
    }
}
