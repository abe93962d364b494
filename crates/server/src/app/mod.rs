use crate::auth::{self, AuthError, Authenticator, SessionDirectory};
use crate::config::ServerConfig;
use crate::history::{HistoryBuffer, MAX_HISTORY};
use crate::metrics::Metrics;
use crate::openapi;
use crate::util::generate_id;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as Base64;
use chrono::Utc;
use cifrachat_crypto::password::{PasswordRecord, hash_password, verify_password};
use cifrachat_crypto::{EncryptionKey, MIN_SECRET_LENGTH, decrypt, derive_key, encrypt};
use cifrachat_proto::{
    ClientEvent, CodecError, EncryptedPayload, EnvelopeRecord, OutboundMessage, ServerEvent,
};
use cifrachat_storage::{NewUser, Storage, StorageError, connect};
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use pingora::apps::{HttpServerApp, HttpServerOptions, ReusedHttpStream};
use pingora::http::ResponseHeader;
use pingora::protocols::Stream as PingoraStream;
use pingora::protocols::http::ServerSession;
use pingora::protocols::http::v2::server::H2Options;
use pingora::server::ShutdownWatch;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{
    handshake::derive_accept_key,
    protocol::{Message, Role},
};
use tracing::{debug, error, info, warn};

const LANDING_PAGE: &str = "<!DOCTYPE html>\n<html lang=\"es\">\n<head>\n<meta charset=\"utf-8\" />\n<title>CifraChat</title>\n<style>body{font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',sans-serif;background:#0b1120;color:#f9fafb;margin:0;display:flex;align-items:center;justify-content:center;height:100vh;}main{max-width:480px;text-align:center;padding:2rem;background:rgba(15,23,42,0.85);border-radius:20px;box-shadow:0 10px 30px rgba(15,23,42,0.4);}h1{font-size:2.25rem;margin-bottom:0.5rem;}p{margin:0.75rem 0;color:#cbd5f5;}a{color:#38bdf8;text-decoration:none;}a:hover{text-decoration:underline;}</style>\n</head>\n<body>\n<main>\n<h1>CifraChat</h1>\n<p>Relay cifrado para salas de chat en tiempo real.</p>\n<p><a href=\"https://github.com/cifrachat/cifrachat\">Documentación del proyecto</a></p>\n<p><a href=\"/healthz\">Health</a> · <a href=\"/readyz\">Readiness</a></p>\n</main>\n</body>\n</html>\n";

const HEALTH_GREETING: &str = "Servidor de mensajería cifrada activo 🔐";

const OUTBOUND_QUEUE_DEPTH: usize = 128;
const SESSION_POLL_INTERVAL_MS: u64 = 50;
const MIN_USERNAME_CHARS: usize = 2;
const MIN_PASSWORD_CHARS: usize = 4;

#[derive(Debug)]
pub enum ServerError {
    Storage,
    Codec,
    Invalid,
    Io,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage => write!(f, "storage failure"),
            Self::Codec => write!(f, "codec failure"),
            Self::Invalid => write!(f, "invalid request"),
            Self::Io => write!(f, "io failure"),
        }
    }
}

impl Error for ServerError {}

fn header_contains_token(value: &HeaderValue, token: &str) -> bool {
    value
        .to_str()
        .ok()
        .map(|raw| {
            raw.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
}

fn normalize_username(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[derive(Debug)]
enum ApiError {
    Unauthorized(Option<String>),
    BadRequest(String),
    Conflict(String),
    Internal(Option<String>),
}

impl ApiError {
    fn status(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::BadRequest(_) => 400,
            Self::Conflict(_) => 409,
            Self::Internal(_) => 500,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "Unauthorized",
            Self::BadRequest(_) => "BadRequest",
            Self::Conflict(_) => "Conflict",
            Self::Internal(_) => "InternalError",
        }
    }
}

/// Connection-scoped relay rejections surfaced as `chat:error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChatError {
    InvalidPayload,
    DecryptFailure,
}

impl ChatError {
    /// Client-facing text carried in the `chat:error` payload.
    fn detail(&self) -> &'static str {
        match self {
            Self::InvalidPayload => "Envía { message } o { encrypted, iv, authTag }",
            Self::DecryptFailure => "Error al descifrar mensaje",
        }
    }
}

impl Display for ChatError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPayload => write!(f, "unrecognized payload"),
            Self::DecryptFailure => write!(f, "envelope failed decryption"),
        }
    }
}

pub struct ConnectionEntry {
    pub sender: mpsc::Sender<ServerEvent>,
    pub user_id: String,
    pub username: String,
}

pub struct AppState {
    pub config: ServerConfig,
    pub storage: Arc<Storage>,
    pub metrics: Arc<Metrics>,
    pub room_key: EncryptionKey,
    pub history: HistoryBuffer,
    pub connections: RwLock<HashMap<String, ConnectionEntry>>,
    pub authenticator: Authenticator,
    pub started_at: Instant,
}

pub struct CifraChatApp {
    pub state: Arc<AppState>,
    http_server_options: HttpServerOptions,
}

impl CifraChatApp {
    pub fn new(state: Arc<AppState>) -> Self {
        let http_server_options = HttpServerOptions::default();
        CifraChatApp {
            state,
            http_server_options,
        }
    }

    pub async fn init(config: ServerConfig) -> Result<Arc<AppState>, ServerError> {
        let storage = Arc::new(
            connect(&config.postgres_dsn)
                .await
                .map_err(|_| ServerError::Storage)?,
        );
        storage.migrate().await.map_err(|_| ServerError::Storage)?;
        let metrics = Arc::new(Metrics::new());
        match config.encryption_secret.as_deref() {
            Some(secret) if secret.len() >= MIN_SECRET_LENGTH => {}
            _ => warn!(
                "encryption secret missing or shorter than {} chars, using the built-in room key",
                MIN_SECRET_LENGTH
            ),
        }
        let room_key = derive_key(config.encryption_secret.as_deref());
        let authenticator = Authenticator::new(Arc::clone(&storage) as Arc<dyn SessionDirectory>);
        let state = Arc::new(AppState {
            config,
            storage,
            metrics,
            room_key,
            history: HistoryBuffer::new(MAX_HISTORY),
            connections: RwLock::new(HashMap::new()),
            authenticator,
            started_at: Instant::now(),
        });
        info!("relay state initialised");
        Ok(state)
    }
}

impl HttpServerApp for CifraChatApp {
    fn process_new_http<'life0, 'life1, 'async_trait>(
        self: &'life0 Arc<Self>,
        session: ServerSession,
        shutdown: &'life1 ShutdownWatch,
    ) -> Pin<Box<dyn Future<Output = Option<ReusedHttpStream>> + Send + 'async_trait>>
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
        Some(&self.http_server_options)
    }
}

impl CifraChatApp {
    async fn handle_session(
        self: &Arc<Self>,
        mut session: ServerSession,
        shutdown: &ShutdownWatch,
    ) -> Option<ReusedHttpStream> {
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
            "/healthz" => {
                let uptime = self.state.started_at.elapsed().as_secs();
                let health = json!({
                    "status": "healthy",
                    "uptime_seconds": uptime,
                    "version": env!("CARGO_PKG_VERSION"),
                    "connections": self.state.metrics.connections_active(),
                    "relayed": self.state.metrics.messages_egress(),
                })
                .to_string();
                let mut response = ResponseHeader::build_no_case(200, None).ok()?;
                response
                    .append_header("content-type", "application/json")
                    .ok()?;
                session
                    .write_response_header(Box::new(response))
                    .await
                    .ok()?;
                session
                    .write_response_body(health.into_bytes().into(), true)
                    .await
                    .ok()?;
                session.finish().await.ok()?;
                return None;
            }
            "/readyz" => {
                if self.state.storage.readiness().await.is_ok() {
                    let mut response = ResponseHeader::build_no_case(200, None).ok()?;
                    response.append_header("content-type", "text/plain").ok()?;
                    session
                        .write_response_header(Box::new(response))
                        .await
                        .ok()?;
                    session
                        .write_response_body(Vec::from("ready".as_bytes()).into(), true)
                        .await
                        .ok()?;
                } else {
                    let mut response = ResponseHeader::build_no_case(503, None).ok()?;
                    response.append_header("content-type", "text/plain").ok()?;
                    session
                        .write_response_header(Box::new(response))
                        .await
                        .ok()?;
                    session
                        .write_response_body(Vec::from("degraded".as_bytes()).into(), true)
                        .await
                        .ok()?;
                }
                session.finish().await.ok()?;
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
        if path == "/openapi.json" && method == "GET" {
            if let Err(err) = self.handle_openapi_spec(&mut session).await {
                error!("openapi response failed: {}", err);
            }
            return None;
        }
        if path == "/api/health" && method == "GET" {
            let mut response = ResponseHeader::build_no_case(200, None).ok()?;
            response
                .append_header("content-type", "text/plain; charset=utf-8")
                .ok()?;
            session
                .write_response_header(Box::new(response))
                .await
                .ok()?;
            session
                .write_response_body(Vec::from(HEALTH_GREETING.as_bytes()).into(), true)
                .await
                .ok()?;
            session.finish().await.ok()?;
            return None;
        }
        if path == "/api/register" && method == "POST" {
            match self.handle_register(&mut session).await {
                Ok(()) => {}
                Err(err) => {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            return None;
        }
        if path == "/api/login" && method == "POST" {
            match self.handle_login(&mut session).await {
                Ok(()) => {}
                Err(err) => {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            return None;
        }
        if path == "/api/encrypt" && method == "POST" {
            match self.handle_encrypt(&mut session).await {
                Ok(()) => {}
                Err(err) => {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            return None;
        }
        if path == "/api/decrypt" && method == "POST" {
            match self.handle_decrypt(&mut session).await {
                Ok(()) => {}
                Err(err) => {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            return None;
        }
        if path == "/api/encryption-key" && method == "GET" {
            match self.handle_encryption_key(&mut session).await {
                Ok(()) => {}
                Err(err) => {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            return None;
        }
        if path == "/connect" && method == "GET" {
            return self.handle_connect(session, shutdown).await;
        }
        let mut response = ResponseHeader::build_no_case(404, None).ok()?;
        response
            .append_header("content-type", "application/problem+json")
            .ok()?;
        let body = json!({
            "type": "about:blank",
            "title": "Not Found",
            "status": 404,
        })
        .to_string();
        session
            .write_response_header(Box::new(response))
            .await
            .ok()?;
        session
            .write_response_body(body.into_bytes().into(), true)
            .await
            .ok()?;
        session.finish().await.ok()?;
        None
    }

    async fn handle_register(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let body = Self::read_body(session).await?;
        let root: Value = serde_json::from_slice(&body).map_err(|_| {
            ApiError::BadRequest("Se requieren \"username\" y \"password\"".to_string())
        })?;
        let username =
            normalize_username(root.get("username").and_then(Value::as_str).unwrap_or(""));
        let password = root.get("password").and_then(Value::as_str).unwrap_or("");
        if username.chars().count() < MIN_USERNAME_CHARS {
            return Err(ApiError::BadRequest(
                "Usuario mínimo 2 caracteres".to_string(),
            ));
        }
        if password.chars().count() < MIN_PASSWORD_CHARS {
            return Err(ApiError::BadRequest(
                "Contraseña mínimo 4 caracteres".to_string(),
            ));
        }
        let record = hash_password(password);
        let user = self
            .state
            .storage
            .create_user(&NewUser {
                username,
                password_hash: record.hash,
                salt: record.salt,
            })
            .await
            .map_err(|err| match err {
                StorageError::Duplicate => ApiError::Conflict("Usuario ya existe".to_string()),
                _ => ApiError::Internal(None),
            })?;
        info!(user = %user.username, "user registered");
        self.respond_json(
            session,
            201,
            json!({ "id": user.user_id, "username": user.username }),
            "application/json",
        )
        .await
        .map_err(|_| ApiError::Internal(None))
    }

    async fn handle_login(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let body = Self::read_body(session).await?;
        let root: Value = serde_json::from_slice(&body).map_err(|_| {
            ApiError::BadRequest("Se requieren \"username\" y \"password\"".to_string())
        })?;
        let username =
            normalize_username(root.get("username").and_then(Value::as_str).unwrap_or(""));
        let password = root.get("password").and_then(Value::as_str).unwrap_or("");
        let user = match self.state.storage.load_user_by_username(&username).await {
            Ok(user) => user,
            Err(StorageError::Missing) => {
                self.state.metrics.mark_auth_failure();
                return Err(ApiError::Unauthorized(Some(
                    "Usuario o contraseña incorrectos".to_string(),
                )));
            }
            Err(_) => return Err(ApiError::Internal(None)),
        };
        let record = PasswordRecord {
            hash: user.password_hash.clone(),
            salt: user.salt.clone(),
        };
        if !verify_password(password, &record) {
            self.state.metrics.mark_auth_failure();
            return Err(ApiError::Unauthorized(Some(
                "Usuario o contraseña incorrectos".to_string(),
            )));
        }
        let issued = self
            .state
            .storage
            .create_session(&user.user_id, &user.username)
            .await
            .map_err(|_| ApiError::Internal(None))?;
        info!(user = %user.username, "session issued");
        self.respond_json(
            session,
            200,
            json!({
                "token": issued.token,
                "user": { "id": user.user_id, "username": user.username },
            }),
            "application/json",
        )
        .await
        .map_err(|_| ApiError::Internal(None))
    }

    async fn handle_encrypt(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let body = Self::read_body(session).await?;
        let root: Value = serde_json::from_slice(&body)
            .map_err(|_| ApiError::BadRequest("Se requiere \"message\" (string)".to_string()))?;
        let message = root
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::BadRequest("Se requiere \"message\" (string)".to_string()))?;
        let sealed = encrypt(message, &self.state.room_key)
            .map_err(|_| ApiError::Internal(Some("Error al cifrar".to_string())))?;
        let payload = serde_json::to_value(EncryptedPayload::from_sealed(&sealed))
            .map_err(|_| ApiError::Internal(None))?;
        self.respond_json(session, 200, payload, "application/json")
            .await
            .map_err(|_| ApiError::Internal(None))
    }

    async fn handle_decrypt(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let body = Self::read_body(session).await?;
        let root: Value = serde_json::from_slice(&body).map_err(|_| {
            ApiError::BadRequest("Se requieren \"iv\", \"authTag\" y \"encrypted\"".to_string())
        })?;
        let encrypted = root.get("encrypted").and_then(Value::as_str);
        let iv = root.get("iv").and_then(Value::as_str);
        let auth_tag = root.get("authTag").and_then(Value::as_str);
        let (encrypted, iv, auth_tag) = match (encrypted, iv, auth_tag) {
            (Some(encrypted), Some(iv), Some(auth_tag)) => (encrypted, iv, auth_tag),
            _ => {
                return Err(ApiError::BadRequest(
                    "Se requieren \"iv\", \"authTag\" y \"encrypted\"".to_string(),
                ));
            }
        };
        let payload = EncryptedPayload {
            encrypted: encrypted.to_string(),
            iv: iv.to_string(),
            auth_tag: auth_tag.to_string(),
        };
        let sealed = payload
            .to_sealed()
            .map_err(|_| ApiError::Internal(Some("Error al descifrar".to_string())))?;
        let message = decrypt(&sealed, &self.state.room_key)
            .map_err(|_| ApiError::Internal(Some("Error al descifrar".to_string())))?;
        self.respond_json(
            session,
            200,
            json!({ "message": message }),
            "application/json",
        )
        .await
        .map_err(|_| ApiError::Internal(None))
    }

    async fn handle_encryption_key(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let key = Base64.encode(self.state.room_key.as_bytes());
        self.respond_json(session, 200, json!({ "key": key }), "application/json")
            .await
            .map_err(|_| ApiError::Internal(None))
    }

    async fn handle_openapi_spec(
        self: &Arc<Self>,
        session: &mut ServerSession,
    ) -> Result<(), ServerError> {
        let spec = openapi::openapi_json();
        let mut response =
            ResponseHeader::build_no_case(200, None).map_err(|_| ServerError::Invalid)?;
        response
            .append_header("content-type", "application/json")
            .map_err(|_| ServerError::Invalid)?;
        response
            .append_header("cache-control", "no-store")
            .map_err(|_| ServerError::Invalid)?;
        session
            .write_response_header(Box::new(response))
            .await
            .map_err(|_| ServerError::Io)?;
        session
            .write_response_body(spec.as_bytes().to_vec().into(), true)
            .await
            .map_err(|_| ServerError::Io)?;
        Ok(())
    }

    async fn handle_connect(
        self: &Arc<Self>,
        mut session: ServerSession,
        shutdown: &ShutdownWatch,
    ) -> Option<ReusedHttpStream> {
        let (authorization, query) = {
            let req = session.req_header();
            let authorization = req
                .headers
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .map(|value| value.to_string());
            let query = req.uri.query().map(|value| value.to_string());
            (authorization, query)
        };
        let remote_addr = session.client_addr().map(|addr| addr.to_string());
        let token = auth::extract_token(authorization.as_deref(), query.as_deref());
        let identity = match token {
            Some(token) => match self.state.authenticator.authenticate(&token).await {
                Ok(identity) => identity,
                Err(AuthError::StoreUnavailable) => {
                    self.state.metrics.mark_store_failure();
                    error!(remote_addr = ?remote_addr, "session store unavailable, refusing connection");
                    let _ = self
                        .respond_problem(
                            &mut session,
                            401,
                            "Unauthorized",
                            Some("Sesión no verificable"),
                        )
                        .await;
                    return None;
                }
                Err(AuthError::Unauthenticated) => {
                    self.state.metrics.mark_auth_failure();
                    warn!(remote_addr = ?remote_addr, "rejected connection with unknown token");
                    let _ = self
                        .respond_problem(&mut session, 401, "Unauthorized", Some("Token inválido"))
                        .await;
                    return None;
                }
            },
            None => {
                self.state.metrics.mark_auth_failure();
                warn!(remote_addr = ?remote_addr, "rejected connection without token");
                let _ = self
                    .respond_problem(&mut session, 401, "Unauthorized", Some("Token requerido"))
                    .await;
                return None;
            }
        };
        let mut channel = match RelayChannel::upgrade(session).await {
            Ok(channel) => channel,
            Err(err) => {
                warn!(error = %err, "websocket upgrade failed");
                return None;
            }
        };
        let connection_id = generate_id(&identity.user_id);

        let key_event = ServerEvent::EncryptionKey {
            key: Base64.encode(self.state.room_key.as_bytes()),
        };
        if let Err(err) = channel.write_event(&key_event).await {
            warn!(connection = %connection_id, error = %err, "failed to deliver room key");
            return None;
        }
        self.state.metrics.mark_egress();
        let snapshot = self.state.history.snapshot().await;
        let replayed = snapshot.len();
        if let Err(err) = channel.write_event(&ServerEvent::History(snapshot)).await {
            warn!(connection = %connection_id, error = %err, "failed to replay history");
            return None;
        }
        self.state.metrics.mark_egress();

        let (tx_out, mut rx_out) = mpsc::channel::<ServerEvent>(OUTBOUND_QUEUE_DEPTH);
        {
            let mut connections = self.state.connections.write().await;
            connections.insert(
                connection_id.clone(),
                ConnectionEntry {
                    sender: tx_out.clone(),
                    user_id: identity.user_id.clone(),
                    username: identity.username.clone(),
                },
            );
        }
        self.state.metrics.incr_connections();
        info!(
            remote_addr = ?remote_addr,
            connection = %connection_id,
            user = %identity.username,
            replayed,
            "connection admitted"
        );

        let poll_interval = Duration::from_millis(SESSION_POLL_INTERVAL_MS);
        'session_loop: loop {
            if *shutdown.borrow() {
                info!(connection = %connection_id, "shutdown requested, closing connection");
                break;
            }
            while let Ok(event) = rx_out.try_recv() {
                if let Err(err) = channel.write_event(&event).await {
                    error!(connection = %connection_id, "outbound send failed: {}", err);
                    break 'session_loop;
                }
                self.state.metrics.mark_egress();
            }
            match timeout(poll_interval, channel.read_event()).await {
                Ok(Ok(Some(text))) => {
                    self.state.metrics.mark_ingress();
                    match classify_inbound(&text, &self.state.room_key) {
                        InboundOutcome::Broadcast(payload) => {
                            let record = EnvelopeRecord::new(
                                connection_id.clone(),
                                identity.username.clone(),
                                payload,
                                Utc::now(),
                            );
                            self.state.history.append(record.clone()).await;
                            broadcast_envelope(&self.state.connections, &self.state.metrics, record)
                                .await;
                        }
                        InboundOutcome::Reject(chat_error) => {
                            warn!(
                                connection = %connection_id,
                                error = %chat_error,
                                "inbound event rejected"
                            );
                            self.state.metrics.mark_rejected();
                            let event = ServerEvent::Error {
                                error: chat_error.detail().to_string(),
                            };
                            if let Err(err) = channel.write_event(&event).await {
                                error!(connection = %connection_id, "outbound send failed: {}", err);
                                break 'session_loop;
                            }
                            self.state.metrics.mark_egress();
                        }
                        InboundOutcome::Ignore => {
                            debug!(connection = %connection_id, "ignoring unknown event");
                        }
                    }
                }
                Ok(Ok(None)) => break,
                Ok(Err(err)) => {
                    error!(connection = %connection_id, "read failure: {}", err);
                    break;
                }
                Err(_) => {
                    if rx_out.is_closed() && rx_out.is_empty() {
                        break;
                    }
                    continue;
                }
            }
        }
        self.cleanup_connection(&connection_id).await;
        let _ = channel.finish().await;
        None
    }

    async fn cleanup_connection(&self, connection_id: &str) {
        let removed = {
            let mut connections = self.state.connections.write().await;
            connections.remove(connection_id)
        };
        if let Some(entry) = removed {
            self.state.metrics.decr_connections();
            info!(
                connection = connection_id,
                user_id = %entry.user_id,
                user = %entry.username,
                "connection closed"
            );
        }
    }

    async fn read_body(session: &mut ServerSession) -> Result<Vec<u8>, ApiError> {
        const MAX_BODY_SIZE: usize = 64 * 1024;
        let mut body = Vec::new();
        loop {
            match session.read_request_body().await {
                Ok(Some(chunk)) => {
                    if body.len() + chunk.len() > MAX_BODY_SIZE {
                        return Err(ApiError::BadRequest(
                            "Cuerpo de la petición demasiado grande".to_string(),
                        ));
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(err) => {
                    error!("error reading request body: {}", err);
                    return Err(ApiError::Internal(None));
                }
            }
        }
        Ok(body)
    }

    async fn respond_json(
        &self,
        session: &mut ServerSession,
        status: u16,
        payload: Value,
        content_type: &str,
    ) -> Result<(), ServerError> {
        let mut response =
            ResponseHeader::build_no_case(status, None).map_err(|_| ServerError::Invalid)?;
        response
            .append_header("content-type", content_type)
            .map_err(|_| ServerError::Invalid)?;
        response
            .append_header("cache-control", "no-store")
            .map_err(|_| ServerError::Invalid)?;
        session
            .write_response_header(Box::new(response))
            .await
            .map_err(|_| ServerError::Io)?;
        session
            .write_response_body(payload.to_string().into_bytes().into(), true)
            .await
            .map_err(|_| ServerError::Io)?;
        Ok(())
    }

    async fn respond_api_error(
        &self,
        session: &mut ServerSession,
        error: ApiError,
    ) -> Result<(), ServerError> {
        let status = error.status();
        let title = error.title();
        let detail = match &error {
            ApiError::Unauthorized(reason) => {
                Some(reason.as_deref().unwrap_or("authorization required"))
            }
            ApiError::Internal(reason) => {
                Some(reason.as_deref().unwrap_or("internal server error"))
            }
            ApiError::BadRequest(reason) => Some(reason.as_str()),
            ApiError::Conflict(reason) => Some(reason.as_str()),
        };
        let mut body = json!({
            "type": "about:blank",
            "title": title,
            "status": status,
        });
        if let Some(message) = detail
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert("detail".to_string(), json!(message));
        }
        self.respond_json(session, status, body, "application/problem+json")
            .await
    }

    async fn respond_problem(
        &self,
        session: &mut ServerSession,
        status: u16,
        title: &str,
        detail: Option<&str>,
    ) -> Result<(), ServerError> {
        let mut body = json!({
            "type": "about:blank",
            "title": title,
            "status": status,
        });
        if let Some(message) = detail
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert("detail".to_string(), json!(message));
        }
        self.respond_json(session, status, body, "application/problem+json")
            .await
    }
}

/// WebSocket leg of an admitted relay connection.
struct RelayChannel {
    stream: WebSocketStream<PingoraStream>,
}

impl RelayChannel {
    async fn upgrade(session: ServerSession) -> Result<Self, ServerError> {
        match session {
            ServerSession::H1(mut h1) => {
                let req = h1.req_header();
                let upgrade_ok = req
                    .headers
                    .get("Upgrade")
                    .map(|value| value.as_bytes())
                    .map(|bytes| std::str::from_utf8(bytes).unwrap_or(""))
                    .map(|value| value.eq_ignore_ascii_case("websocket"))
                    .unwrap_or(false);
                let connection_ok = req
                    .headers
                    .get("Connection")
                    .is_some_and(|value| header_contains_token(value, "upgrade"));
                if !upgrade_ok || !connection_ok {
                    let mut session = ServerSession::H1(h1);
                    let _ = session.respond_error(400).await;
                    return Err(ServerError::Invalid);
                }
                let version_ok = req
                    .headers
                    .get("Sec-WebSocket-Version")
                    .and_then(|value| value.to_str().ok())
                    .map(|value| value.trim() == "13")
                    .unwrap_or(false);
                if !version_ok {
                    let mut session = ServerSession::H1(h1);
                    let _ = session.respond_error(400).await;
                    return Err(ServerError::Invalid);
                }
                let key_header = match req.headers.get("Sec-WebSocket-Key") {
                    Some(value) => value,
                    None => {
                        let mut session = ServerSession::H1(h1);
                        let _ = session.respond_error(400).await;
                        return Err(ServerError::Invalid);
                    }
                };
                let key = match std::str::from_utf8(key_header.as_bytes()) {
                    Ok(value) => value.trim(),
                    Err(_) => {
                        let mut session = ServerSession::H1(h1);
                        let _ = session.respond_error(400).await;
                        return Err(ServerError::Invalid);
                    }
                };
                let accept_key = derive_accept_key(key.as_bytes());
                let mut response =
                    ResponseHeader::build_no_case(101, None).map_err(|_| ServerError::Invalid)?;
                response
                    .append_header("upgrade", "websocket")
                    .map_err(|_| ServerError::Invalid)?;
                response
                    .append_header("connection", "Upgrade")
                    .map_err(|_| ServerError::Invalid)?;
                response
                    .append_header("sec-websocket-accept", &accept_key)
                    .map_err(|_| ServerError::Invalid)?;
                h1.write_response_header(Box::new(response))
                    .await
                    .map_err(|_| ServerError::Io)?;
                let stream = h1.into_inner();
                let websocket = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
                Ok(Self { stream: websocket })
            }
            other => {
                let mut session = other;
                let _ = session.respond_error(400).await;
                Err(ServerError::Invalid)
            }
        }
    }

    async fn read_event(&mut self) -> Result<Option<String>, ServerError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Ok(Some(text)),
                    Err(err) => {
                        warn!(error = %err, "discarding non-utf8 binary frame");
                        continue;
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(err) = self.stream.send(Message::Pong(payload)).await {
                        error!(error = %err, "failed to reply to websocket ping");
                        return Err(ServerError::Io);
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    continue;
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Frame(_))) => {
                    continue;
                }
                Some(Err(err)) => {
                    error!(error = %err, "websocket read failure");
                    return Err(ServerError::Io);
                }
                None => return Ok(None),
            }
        }
    }

    async fn write_event(&mut self, event: &ServerEvent) -> Result<(), ServerError> {
        let text = event.encode().map_err(|_| ServerError::Codec)?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|_| ServerError::Io)
    }

    async fn finish(mut self) -> Result<(), ServerError> {
        if let Err(err) = self.stream.close(None).await {
            debug!(error = %err, "websocket close error");
        }
        Ok(())
    }
}

/// Relay decision for one inbound text frame.
#[derive(Debug)]
enum InboundOutcome {
    Broadcast(EncryptedPayload),
    Reject(ChatError),
    Ignore,
}

/// Validates an inbound frame against the room key. Client-sealed
/// envelopes that decrypt cleanly are relayed with their original bytes;
/// plaintext messages are sealed server-side first.
fn classify_inbound(raw: &str, key: &EncryptionKey) -> InboundOutcome {
    match ClientEvent::decode(raw) {
        Ok(ClientEvent::Send(OutboundMessage::Encrypted(payload))) => match payload.to_sealed() {
            Ok(sealed) => match decrypt(&sealed, key) {
                Ok(_) => InboundOutcome::Broadcast(payload),
                Err(_) => InboundOutcome::Reject(ChatError::DecryptFailure),
            },
            Err(_) => InboundOutcome::Reject(ChatError::DecryptFailure),
        },
        Ok(ClientEvent::Send(OutboundMessage::Plain { message })) => match encrypt(&message, key) {
            Ok(sealed) => InboundOutcome::Broadcast(EncryptedPayload::from_sealed(&sealed)),
            Err(_) => InboundOutcome::Reject(ChatError::DecryptFailure),
        },
        Err(CodecError::UnknownEvent) => InboundOutcome::Ignore,
        Err(_) => InboundOutcome::Reject(ChatError::InvalidPayload),
    }
}

/// Fans an envelope out to every admitted connection, the sender
/// included. Full queues drop the event for that recipient only.
async fn broadcast_envelope(
    connections: &RwLock<HashMap<String, ConnectionEntry>>,
    metrics: &Metrics,
    record: EnvelopeRecord,
) {
    let targets = {
        let connections = connections.read().await;
        connections
            .iter()
            .map(|(id, entry)| (id.clone(), entry.sender.clone()))
            .collect::<Vec<_>>()
    };
    let event = ServerEvent::Message(record);
    for (connection_id, sender) in targets {
        match sender.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics.mark_queue_dropped();
                warn!(connection = %connection_id, "outbound queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room_key() -> EncryptionKey {
        derive_key(Some("clave-de-pruebas-suficientemente-larga-1234"))
    }

    fn send_frame(data: Value) -> String {
        json!({ "event": "chat:send", "data": data }).to_string()
    }

    #[test]
    fn plain_message_is_sealed_for_broadcast() {
        let key = room_key();
        let frame = send_frame(json!({ "message": "hola sala" }));
        match classify_inbound(&frame, &key) {
            InboundOutcome::Broadcast(payload) => {
                let sealed = payload.to_sealed().unwrap();
                assert_eq!(decrypt(&sealed, &key).unwrap(), "hola sala");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn valid_envelope_is_rebroadcast_untouched() {
        let key = room_key();
        let sealed = encrypt("texto original", &key).unwrap();
        let payload = EncryptedPayload::from_sealed(&sealed);
        let frame = send_frame(serde_json::to_value(&payload).unwrap());
        match classify_inbound(&frame, &key) {
            InboundOutcome::Broadcast(relayed) => assert_eq!(relayed, payload),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn tampered_envelope_is_rejected() {
        let key = room_key();
        let sealed = encrypt("texto original", &key).unwrap();
        let mut payload = EncryptedPayload::from_sealed(&sealed);
        payload.auth_tag = Base64.encode([0u8; 16]);
        let frame = send_frame(serde_json::to_value(&payload).unwrap());
        assert!(matches!(
            classify_inbound(&frame, &key),
            InboundOutcome::Reject(ChatError::DecryptFailure)
        ));
    }

    #[test]
    fn malformed_envelope_fields_are_rejected() {
        let key = room_key();
        let frame = send_frame(json!({
            "encrypted": "AAECAw==",
            "iv": "corto",
            "authTag": "AAAAAAAAAAAAAAAAAAAAAA==",
        }));
        assert!(matches!(
            classify_inbound(&frame, &key),
            InboundOutcome::Reject(ChatError::DecryptFailure)
        ));
    }

    #[test]
    fn unrecognized_shape_is_rejected() {
        let key = room_key();
        let frame = send_frame(json!({ "note": "sin cuerpo" }));
        assert!(matches!(
            classify_inbound(&frame, &key),
            InboundOutcome::Reject(ChatError::InvalidPayload)
        ));
    }

    #[test]
    fn non_json_frame_is_rejected() {
        let key = room_key();
        assert!(matches!(
            classify_inbound("no es json", &key),
            InboundOutcome::Reject(ChatError::InvalidPayload)
        ));
    }

    #[test]
    fn unknown_event_is_ignored() {
        let key = room_key();
        let frame = json!({ "event": "typing:start", "data": {} }).to_string();
        assert!(matches!(
            classify_inbound(&frame, &key),
            InboundOutcome::Ignore
        ));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let key = room_key();
        let frame = send_frame(json!({ "message": "x".repeat(70 * 1024) }));
        assert!(matches!(
            classify_inbound(&frame, &key),
            InboundOutcome::Reject(ChatError::InvalidPayload)
        ));
    }

    #[tokio::test]
    async fn full_outbound_queue_drops_only_that_recipient() {
        let connections = RwLock::new(HashMap::new());
        let metrics = Metrics::new();
        let (stalled_tx, mut stalled_rx) = mpsc::channel(1);
        stalled_tx
            .try_send(ServerEvent::Error {
                error: "pendiente".to_string(),
            })
            .unwrap();
        let (healthy_tx, mut healthy_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        {
            let mut admitted = connections.write().await;
            admitted.insert(
                "conexion-lenta".to_string(),
                ConnectionEntry {
                    sender: stalled_tx,
                    user_id: "u-1".to_string(),
                    username: "ana".to_string(),
                },
            );
            admitted.insert(
                "conexion-sana".to_string(),
                ConnectionEntry {
                    sender: healthy_tx,
                    user_id: "u-2".to_string(),
                    username: "jose".to_string(),
                },
            );
        }

        let key = room_key();
        let sealed = encrypt("hola sala", &key).unwrap();
        let record = EnvelopeRecord::new(
            "conexion-sana".to_string(),
            "jose".to_string(),
            EncryptedPayload::from_sealed(&sealed),
            Utc::now(),
        );
        broadcast_envelope(&connections, &metrics, record.clone()).await;

        assert_eq!(healthy_rx.try_recv().unwrap(), ServerEvent::Message(record));
        assert!(healthy_rx.try_recv().is_err());
        assert_eq!(
            stalled_rx.try_recv().unwrap(),
            ServerEvent::Error {
                error: "pendiente".to_string(),
            }
        );
        assert!(stalled_rx.try_recv().is_err());
        assert!(
            metrics
                .encode_prometheus()
                .contains("cifrachat_send_queue_dropped 1\n")
        );
    }

    #[test]
    fn chat_error_wire_strings() {
        assert_eq!(
            ChatError::InvalidPayload.detail(),
            "Envía { message } o { encrypted, iv, authTag }"
        );
        assert_eq!(ChatError::DecryptFailure.detail(), "Error al descifrar mensaje");
    }

    #[test]
    fn username_normalization() {
        assert_eq!(normalize_username("  Ana  "), "ana");
        assert_eq!(normalize_username("JOSÉ"), "josé");
    }

    #[test]
    fn landing_page_mentions_product() {
        assert!(LANDING_PAGE.contains("CifraChat"));
    }
}
