mod hub;
mod keys;
mod matchmaker;
mod registration;
mod stream;

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::security::limiter::{RateLimiter, RateScope};
use crate::util::{decode_opaque, query_param};
use chrono::{Duration, Utc};
use hub::Hub;
use matchmaker::{MatchError, MatchStatus, Matchmaker};
use pingora::apps::{HttpServerApp, HttpServerOptions};
use pingora::http::ResponseHeader;
use pingora::protocols::Stream;
use pingora::protocols::http::ServerSession;
use pingora::protocols::http::v2::server::H2Options;
use pingora::server::ShutdownWatch;
use registration::{LogNotifier, RegistrationError, RegistrationService};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sotto_crypto::token::PURPOSE_SESSION;
use sotto_crypto::{CryptoError, TokenIssuer, private_key_from_pem, public_key_pem};
use sotto_proto::CodecError;
use sotto_storage::{Storage, StorageError, connect};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};
use uuid::Uuid;

const LANDING_PAGE: &str = "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\" />\n<title>Sotto</title>\n<style>body{font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',sans-serif;background:#101014;color:#f4f4f5;margin:0;display:flex;align-items:center;justify-content:center;height:100vh;}main{max-width:480px;text-align:center;padding:2rem;background:#18181d;border-radius:16px;}h1{font-size:2rem;margin-bottom:0.5rem;}p{margin:0.75rem 0;color:#a1a1aa;}a{color:#7dd3fc;text-decoration:none;}</style>\n</head>\n<body>\n<main>\n<h1>Sotto</h1>\n<p>Zero-trust relay for end-to-end encrypted chats.</p>\n<p><a href=\"/health\">Health</a></p>\n</main>\n</body>\n</html>\n";

#[derive(Debug)]
pub enum ServerError {
    Invalid,
    Io,
    Storage,
    Crypto,
    Codec,
    Config,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid => write!(f, "invalid state"),
            Self::Io => write!(f, "io failure"),
            Self::Storage => write!(f, "storage failure"),
            Self::Crypto => write!(f, "crypto failure"),
            Self::Codec => write!(f, "codec failure"),
            Self::Config => write!(f, "configuration failure"),
        }
    }
}

impl Error for ServerError {}

impl From<StorageError> for ServerError {
    fn from(_: StorageError) -> Self {
        ServerError::Storage
    }
}

impl From<CryptoError> for ServerError {
    fn from(_: CryptoError) -> Self {
        ServerError::Crypto
    }
}

impl From<CodecError> for ServerError {
    fn from(_: CodecError) -> Self {
        ServerError::Codec
    }
}

const MAX_BODY_LEN: usize = 256 * 1024;

#[derive(Debug)]
enum ApiError {
    Unauthorized(Option<String>),
    BadRequest(String),
    NotFound,
    Conflict(String),
    Unavailable(String),
    Internal,
}

/// RFC 7807 body for every error response.
#[derive(Serialize)]
struct Problem<'a> {
    #[serde(rename = "type")]
    problem_type: &'a str,
    title: &'a str,
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a str>,
}

impl ApiError {
    fn status(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::BadRequest(_) => 400,
            Self::NotFound => 404,
            Self::Conflict(_) => 409,
            Self::Unavailable(_) => 503,
            Self::Internal => 500,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "Unauthorized",
            Self::BadRequest(_) => "BadRequest",
            Self::NotFound => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::Unavailable(_) => "ServiceUnavailable",
            Self::Internal => "InternalError",
        }
    }

    fn detail(&self) -> Option<&str> {
        match self {
            Self::Unauthorized(reason) => {
                Some(reason.as_deref().unwrap_or("authorization required"))
            }
            Self::BadRequest(reason) | Self::Conflict(reason) | Self::Unavailable(reason) => {
                Some(reason.as_str())
            }
            Self::NotFound => Some("resource not found"),
            Self::Internal => Some("internal server error"),
        }
    }

    fn to_problem(&self) -> Problem<'_> {
        Problem {
            problem_type: "about:blank",
            title: self.title(),
            status: self.status(),
            detail: self.detail(),
        }
    }
}

impl From<RegistrationError> for ApiError {
    fn from(err: RegistrationError) -> Self {
        match err {
            RegistrationError::InvalidIdentifier => ApiError::BadRequest(err.to_string()),
            RegistrationError::IdentifierTaken => {
                ApiError::Conflict("identifier already taken".to_string())
            }
            RegistrationError::InvalidCode => {
                ApiError::Unauthorized(Some("invalid otp".to_string()))
            }
            RegistrationError::InvalidKey => {
                ApiError::BadRequest("invalid identity_pubkey format".to_string())
            }
            RegistrationError::MissingIdentityKey => {
                ApiError::BadRequest("identity_pubkey required for new users".to_string())
            }
            RegistrationError::Token => ApiError::Unauthorized(Some("invalid token".to_string())),
            RegistrationError::Store => ApiError::Internal,
        }
    }
}

pub struct AppState {
    pub config: ServerConfig,
    pub storage: Arc<Storage>,
    pub tokens: TokenIssuer,
    pub server_rsa: Option<RsaPrivateKey>,
    pub registration: RegistrationService,
    pub matchmaker: Arc<Matchmaker>,
    pub hub: Hub,
    pub metrics: Arc<Metrics>,
    pub rate_limits: Arc<RateLimiter>,
    shutdown: watch::Sender<bool>,
}

impl AppState {
    /// Stops the matchmaker worker and session reaper, then closes every
    /// live connection. Stream loops drain and finish on their own.
    pub async fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
        info!(
            connections = self.hub.active_connections().await,
            "draining live connections"
        );
        self.hub.close_all().await;
    }
}

#[derive(Deserialize)]
struct RegisterRequest {
    identifier: String,
}

#[derive(Deserialize)]
struct Verify2faRequest {
    identifier: String,
    otp: String,
    #[serde(default)]
    identity_pubkey: Option<String>,
}

#[derive(Deserialize)]
struct EnqueueRequest {
    tag_hash: String,
}

pub struct SottoApp {
    pub state: Arc<AppState>,
}

impl SottoApp {
    pub fn new(state: Arc<AppState>) -> Self {
        SottoApp { state }
    }

    pub async fn init(config: ServerConfig) -> Result<Arc<AppState>, ServerError> {
        let storage = Arc::new(connect(&config.database_dsn).await?);
        storage.migrate().await?;
        let tokens = TokenIssuer::new(config.jwt_signing_key.as_bytes())?;
        let server_rsa = match config.server_rsa_priv_path.as_ref() {
            Some(path) => {
                let pem = fs::read_to_string(path).map_err(|_| ServerError::Config)?;
                Some(private_key_from_pem(&pem)?)
            }
            None => None,
        };
        let metrics = Arc::new(Metrics::new());
        let rate_limits = Arc::new(RateLimiter::new(&config.rate_limit));
        let registration = RegistrationService::new(
            Arc::clone(&storage),
            tokens.clone(),
            Box::new(LogNotifier),
            Duration::minutes(config.otp_expiry_minutes),
            Duration::minutes(config.handoff_ttl_minutes),
            Duration::hours(config.session_ttl_hours),
        );
        let matchmaker = Arc::new(Matchmaker::new(
            config.match_queue_capacity,
            Duration::seconds(config.waiter_max_age_seconds),
            StdDuration::from_millis(config.matchmaker_tick_ms),
            Arc::clone(&metrics),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(AppState {
            storage: Arc::clone(&storage),
            tokens,
            server_rsa,
            registration,
            matchmaker: Arc::clone(&matchmaker),
            hub: Hub::new(Arc::clone(&metrics)),
            metrics: Arc::clone(&metrics),
            rate_limits: Arc::clone(&rate_limits),
            shutdown: shutdown_tx,
            config,
        });
        matchmaker.spawn(shutdown_rx.clone());
        let reaper_state = Arc::clone(&state);
        let mut reaper_shutdown = shutdown_rx;
        tokio::spawn(async move {
            let mut ticker = interval(StdDuration::from_secs(60));
            loop {
                select! {
                    _ = ticker.tick() => {
                        match reaper_state.storage.purge_expired_sessions().await {
                            Ok(purged) => {
                                if purged > 0 {
                                    info!(sessions = purged, "expired registration sessions purged");
                                }
                            }
                            Err(err) => warn!("registration session cleanup failed: {}", err),
                        }
                    }
                    changed = reaper_shutdown.changed() => {
                        if changed.is_err() || *reaper_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        let signal_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(err) => {
                    warn!("signal handler install failed: {}", err);
                    return;
                }
            };
            select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            info!("shutdown signal received");
            signal_state.begin_shutdown().await;
        });
        Ok(state)
    }
}

impl HttpServerApp for SottoApp {
    fn process_new_http<'life0, 'life1, 'async_trait>(
        self: &'life0 Arc<Self>,
        session: ServerSession,
        shutdown: &'life1 ShutdownWatch,
    ) -> Pin<Box<dyn Future<Output = Option<Stream>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move { self.handle_session(session, shutdown).await })
    }

    fn h2_options(&self) -> Option<H2Options> {
        None
    }

    fn server_options(&self) -> Option<&HttpServerOptions> {
        None
    }
}

impl SottoApp {
    async fn handle_session(
        self: &Arc<Self>,
        mut session: ServerSession,
        shutdown: &ShutdownWatch,
    ) -> Option<Stream> {
        match session.read_request().await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                error!("failed to read request: {}", err);
                return None;
            }
        }
        let path = session.req_header().uri.path().to_string();
        let method = session.req_header().method.to_string();
        if path != "/api/ws"
            && let Some(retry_after) = self.check_rate_limit(&session, RateScope::Http).await
        {
            self.state.metrics.mark_http_rate_limited();
            if let Err(err) = self.respond_rate_limited(session, retry_after).await {
                error!("rate limit response failed: {}", err);
            }
            return None;
        }
        match path.as_str() {
            "/" | "/index.html" => {
                let mut response = ResponseHeader::build_no_case(200, None).ok()?;
                response
                    .append_header("content-type", "text/html; charset=utf-8")
                    .ok()?;
                session
                    .write_response_header(Box::new(response))
                    .await
                    .ok()?;
                session
                    .write_response_body(Vec::from(LANDING_PAGE.as_bytes()).into(), true)
                    .await
                    .ok()?;
                session.finish().await.ok()?;
                return None;
            }
            "/health" => {
                let body = json!({
                    "status": "ok",
                    "timestamp": Utc::now().timestamp(),
                });
                if let Err(err) = self.respond_json(&mut session, 200, body).await
                {
                    error!("health response failed: {}", err);
                }
                return None;
            }
            "/metrics" => {
                let payload = self.state.metrics.encode_prometheus();
                let mut response = ResponseHeader::build_no_case(200, None).ok()?;
                response
                    .append_header("content-type", "text/plain; version=0.0.4")
                    .ok()?;
                session
                    .write_response_header(Box::new(response))
                    .await
                    .ok()?;
                session
                    .write_response_body(payload.into_bytes().into(), true)
                    .await
                    .ok()?;
                session.finish().await.ok()?;
                return None;
            }
            _ => {}
        }
        if path == "/auth/register" && method == "POST" {
            if let Some(retry_after) = self.check_rate_limit(&session, RateScope::Register).await {
                self.state.metrics.mark_http_rate_limited();
                if let Err(err) = self.respond_rate_limited(session, retry_after).await {
                    error!("register rate limit response failed: {}", err);
                }
                return None;
            }
            match self.handle_register(&mut session).await {
                Ok(()) => {}
                Err(err) => {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            return None;
        }
        if path == "/auth/verify-2fa" && method == "POST" {
            if let Some(retry_after) = self.check_rate_limit(&session, RateScope::Register).await {
                self.state.metrics.mark_http_rate_limited();
                if let Err(err) = self.respond_rate_limited(session, retry_after).await {
                    error!("verify rate limit response failed: {}", err);
                }
                return None;
            }
            match self.handle_verify_2fa(&mut session).await {
                Ok(()) => {}
                Err(err) => {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            return None;
        }
        if path == "/auth/check-username" && method == "GET" {
            match self.handle_check_username(&mut session).await {
                Ok(()) => {}
                Err(err) => {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            return None;
        }
        if path == "/auth/server-pubkey" && method == "GET" {
            match self.handle_server_pubkey(&mut session).await {
                Ok(()) => {}
                Err(err) => {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            return None;
        }
        if path == "/api/keys/prekeys/upload" && method == "POST" {
            match self.handle_prekeys_upload(&mut session).await {
                Ok(()) => {}
                Err(err) => {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            return None;
        }
        if let Some(target) = path.strip_prefix("/api/keys/bundle/")
            && method == "GET"
        {
            let target = target.to_string();
            match self.handle_bundle_get(&mut session, &target).await {
                Ok(()) => {}
                Err(err) => {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            return None;
        }
        if path == "/api/match/enqueue" && method == "POST" {
            match self.handle_match_enqueue(&mut session).await {
                Ok(()) => {}
                Err(err) => {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            return None;
        }
        if path == "/api/match/status" && method == "GET" {
            match self.handle_match_status(&mut session).await {
                Ok(()) => {}
                Err(err) => {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            return None;
        }
        if path == "/api/ws" && method == "GET" {
            return self.process_stream(session, shutdown).await;
        }
        let _ = self.respond_api_error(&mut session, ApiError::NotFound).await;
        None
    }

    async fn handle_register(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let body = Self::read_body(session).await?;
        let request: RegisterRequest = serde_json::from_slice(&body)
            .map_err(|_| ApiError::BadRequest("invalid request".to_string()))?;
        let code = self
            .state
            .registration
            .start(&request.identifier)
            .await
            .map_err(ApiError::from)?;
        self.state.metrics.mark_code_issued();
        #[cfg(not(feature = "dev-otp"))]
        drop(code);
        let body = json!({"status": "ok"});
        #[cfg(feature = "dev-otp")]
        let body = {
            let mut body = body;
            if let Some(obj) = body.as_object_mut() {
                obj.insert("otp".to_string(), json!(code));
            }
            body
        };
        self.respond_json(session, 200, body)
            .await
            .map_err(|_| ApiError::Internal)
    }

    async fn handle_verify_2fa(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let body = Self::read_body(session).await?;
        let request: Verify2faRequest = serde_json::from_slice(&body)
            .map_err(|_| ApiError::BadRequest("invalid request".to_string()))?;
        let identity_pubkey = match request.identity_pubkey.as_deref() {
            Some(encoded) if !encoded.is_empty() => Some(
                decode_opaque(encoded, 32)
                    .map_err(|_| ApiError::BadRequest("invalid identity_pubkey format".to_string()))?,
            ),
            _ => None,
        };
        let (user_id, token) = self
            .state
            .registration
            .verify_2fa(&request.identifier, &request.otp, identity_pubkey.as_deref())
            .await
            .map_err(ApiError::from)?;
        let body = json!({
            "status": "ok",
            "user_id": user_id.to_string(),
            "token": token,
        });
        self.respond_json(session, 200, body)
            .await
            .map_err(|_| ApiError::Internal)
    }

    async fn handle_check_username(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let query = session.req_header().uri.query();
        let username = query_param(query, "username").unwrap_or("").to_string();
        if username.len() < registration::MIN_IDENTIFIER_LEN {
            return Err(ApiError::BadRequest(
                "username must be at least 3 characters".to_string(),
            ));
        }
        let body = match self.state.storage.find_user_by_identifier(&username).await {
            Ok(_) => json!({"available": false, "message": "identifier already taken"}),
            Err(StorageError::Missing) => {
                json!({"available": true, "message": "identifier is available"})
            }
            Err(err) => {
                warn!("identifier probe failed: {}", err);
                return Err(ApiError::Internal);
            }
        };
        self.respond_json(session, 200, body)
            .await
            .map_err(|_| ApiError::Internal)
    }

    async fn handle_server_pubkey(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let key = self.state.server_rsa.as_ref().ok_or(ApiError::NotFound)?;
        let pem = public_key_pem(key).map_err(|_| ApiError::Internal)?;
        self.respond_json(session, 200, json!({"public_key": pem}))
            .await
            .map_err(|_| ApiError::Internal)
    }

    async fn handle_match_enqueue(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let user_id = self.authenticate(session)?;
        let body = Self::read_body(session).await?;
        let request: EnqueueRequest = serde_json::from_slice(&body)
            .map_err(|_| ApiError::BadRequest("invalid request".to_string()))?;
        if request.tag_hash.trim().is_empty() {
            return Err(ApiError::BadRequest("tag_hash required".to_string()));
        }
        self.state
            .storage
            .upsert_match_profile(user_id, request.tag_hash.trim())
            .await
            .map_err(|err| {
                warn!("match profile upsert failed: {}", err);
                ApiError::Internal
            })?;
        match self.state.matchmaker.enqueue(user_id).await {
            Ok(()) => {}
            Err(MatchError::QueueFull) => {
                return Err(ApiError::Unavailable("queue full, try again".to_string()));
            }
        }
        self.respond_json(session, 200, json!({"status": "queued"}))
            .await
            .map_err(|_| ApiError::Internal)
    }

    async fn handle_match_status(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let user_id = self.authenticate(session)?;
        let body = match self.state.matchmaker.status(user_id).await {
            MatchStatus::Waiting => json!({"status": "waiting"}),
            MatchStatus::Matched(peer) => json!({
                "status": "matched",
                "pair_id": peer.to_string(),
            }),
            MatchStatus::Idle => json!({"status": "idle"}),
        };
        self.respond_json(session, 200, body)
            .await
            .map_err(|_| ApiError::Internal)
    }

    fn bearer_token(session: &ServerSession) -> Option<String> {
        let header = session
            .req_header()
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())?;
        let token = header.trim().strip_prefix("Bearer ").unwrap_or(header.trim());
        let token = token.trim();
        if token.is_empty() {
            None
        } else {
            Some(token.to_string())
        }
    }

    fn authenticate(&self, session: &ServerSession) -> Result<Uuid, ApiError> {
        let token = Self::bearer_token(session).ok_or_else(|| {
            ApiError::Unauthorized(Some("missing authorization header".to_string()))
        })?;
        self.state
            .tokens
            .validate(&token, PURPOSE_SESSION)
            .map_err(|_| ApiError::Unauthorized(Some("invalid token".to_string())))
    }

    /// Stream establishment accepts the session token from the request
    /// context or, for transports that cannot set headers, from the
    /// `token` query parameter.
    fn authenticate_stream(&self, session: &ServerSession) -> Result<Uuid, ApiError> {
        if let Some(token) = Self::bearer_token(session) {
            return self
                .state
                .tokens
                .validate(&token, PURPOSE_SESSION)
                .map_err(|_| ApiError::Unauthorized(Some("invalid token".to_string())));
        }
        let query = session.req_header().uri.query();
        let token = query_param(query, "token")
            .ok_or_else(|| ApiError::Unauthorized(Some("missing token".to_string())))?;
        self.state
            .tokens
            .validate(token, PURPOSE_SESSION)
            .map_err(|_| ApiError::Unauthorized(Some("invalid token".to_string())))
    }

    /// Writes a complete response: status, standard headers, body.
    async fn send_response(
        &self,
        session: &mut ServerSession,
        status: u16,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<(), ServerError> {
        let mut header =
            ResponseHeader::build_no_case(status, None).map_err(|_| ServerError::Invalid)?;
        for (name, value) in [("content-type", content_type), ("cache-control", "no-store")] {
            header
                .append_header(name, value)
                .map_err(|_| ServerError::Invalid)?;
        }
        session
            .write_response_header(Box::new(header))
            .await
            .map_err(|_| ServerError::Io)?;
        session
            .write_response_body(body.into(), true)
            .await
            .map_err(|_| ServerError::Io)?;
        self.state.metrics.mark_egress();
        Ok(())
    }

    async fn respond_json(
        &self,
        session: &mut ServerSession,
        status: u16,
        payload: serde_json::Value,
    ) -> Result<(), ServerError> {
        self.send_response(
            session,
            status,
            "application/json",
            payload.to_string().into_bytes(),
        )
        .await
    }

    async fn respond_api_error(
        &self,
        session: &mut ServerSession,
        error: ApiError,
    ) -> Result<(), ServerError> {
        let problem = error.to_problem();
        let body = serde_json::to_vec(&problem).map_err(|_| ServerError::Invalid)?;
        self.send_response(session, problem.status, "application/problem+json", body)
            .await
    }

    /// Drains the request body, refusing anything over `MAX_BODY_LEN`.
    async fn read_body(session: &mut ServerSession) -> Result<Vec<u8>, ApiError> {
        let mut body = Vec::new();
        while let Some(chunk) = session
            .read_request_body()
            .await
            .map_err(|_| ApiError::Internal)?
        {
            if body.len() + chunk.len() > MAX_BODY_LEN {
                return Err(ApiError::BadRequest("request body too large".to_string()));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    fn client_identity(session: &ServerSession) -> String {
        session
            .client_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    async fn check_rate_limit(
        &self,
        session: &ServerSession,
        scope: RateScope,
    ) -> Option<StdDuration> {
        let identity = Self::client_identity(session);
        let decision = self.state.rate_limits.check(scope, &identity).await;
        if decision.allowed {
            None
        } else {
            Some(
                decision
                    .retry_after
                    .unwrap_or_else(|| StdDuration::from_secs(1)),
            )
        }
    }

    async fn respond_rate_limited(
        &self,
        mut session: ServerSession,
        retry_after: StdDuration,
    ) -> Result<(), ServerError> {
        let problem = Problem {
            problem_type: "about:blank",
            title: "TooManyRequests",
            status: 429,
            detail: Some("rate limit exceeded"),
        };
        let mut header =
            ResponseHeader::build_no_case(429, None).map_err(|_| ServerError::Invalid)?;
        header
            .append_header("content-type", "application/problem+json")
            .map_err(|_| ServerError::Invalid)?;
        header
            .append_header("retry-after", retry_after.as_secs().max(1).to_string())
            .map_err(|_| ServerError::Invalid)?;
        session
            .write_response_header(Box::new(header))
            .await
            .map_err(|_| ServerError::Io)?;
        let body = serde_json::to_vec(&problem).map_err(|_| ServerError::Invalid)?;
        session
            .write_response_body(body.into(), true)
            .await
            .map_err(|_| ServerError::Io)?;
        session.finish().await.map_err(|_| ServerError::Io)?;
        self.state.metrics.mark_egress();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_status_mapping() {
        assert_eq!(ApiError::Unauthorized(None).status(), 401);
        assert_eq!(ApiError::BadRequest("x".to_string()).status(), 400);
        assert_eq!(ApiError::NotFound.status(), 404);
        assert_eq!(ApiError::Conflict("x".to_string()).status(), 409);
        assert_eq!(ApiError::Unavailable("x".to_string()).status(), 503);
        assert_eq!(ApiError::Internal.status(), 500);
    }

    #[test]
    fn problem_body_carries_title_status_detail() {
        let error = ApiError::Conflict("identifier already taken".to_string());
        let body = serde_json::to_value(error.to_problem()).unwrap();
        assert_eq!(body["type"], "about:blank");
        assert_eq!(body["title"], "Conflict");
        assert_eq!(body["status"], 409);
        assert_eq!(body["detail"], "identifier already taken");
        let fallback = serde_json::to_value(ApiError::Unauthorized(None).to_problem()).unwrap();
        assert_eq!(fallback["detail"], "authorization required");
    }

    #[test]
    fn registration_errors_map_to_http_statuses() {
        assert_eq!(ApiError::from(RegistrationError::InvalidIdentifier).status(), 400);
        assert_eq!(ApiError::from(RegistrationError::IdentifierTaken).status(), 409);
        assert_eq!(ApiError::from(RegistrationError::InvalidCode).status(), 401);
        assert_eq!(ApiError::from(RegistrationError::InvalidKey).status(), 400);
        assert_eq!(ApiError::from(RegistrationError::MissingIdentityKey).status(), 400);
        assert_eq!(ApiError::from(RegistrationError::Token).status(), 401);
        assert_eq!(ApiError::from(RegistrationError::Store).status(), 500);
    }
}
