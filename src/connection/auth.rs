//! Authentication handling for Flight connections.
//!
//! This module provides secure credential management and the handshake
//! negotiation that turns a target plus credentials into a [`Session`].

use crate::connection::params::{ConnectionTarget, TrustConfig};
use crate::connection::session::Session;
use crate::error::{ClientError, ConfigError, ConnectionError, StatusCode, TransportError};
use crate::query::headers::{CallMetadata, HeaderBuilder, AUTHORIZATION_HEADER};
use crate::transport::{EndpointConfig, FlightTransport, GrpcTransport, HandshakeInfo, TlsSettings};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Secure credentials container.
///
/// This struct ensures credentials are never accidentally logged or displayed.
/// A token, when present, is used instead of the password.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: Arc<SecureString>,
    token: Option<Arc<SecureString>>,
}

impl Credentials {
    /// Create username/password credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Arc::new(SecureString::new(password.into())),
            token: None,
        }
    }

    /// Create credentials carrying a personal access token or OAuth2 token.
    pub fn with_token(
        username: impl Into<String>,
        password: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            token: Some(Arc::new(SecureString::new(token.into()))),
            ..Self::new(username, password)
        }
    }

    /// Get the username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Check whether a token is present.
    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Get the password (for internal use only).
    pub(crate) fn password(&self) -> &str {
        self.password.as_str()
    }

    /// Value of the handshake `authorization` header.
    pub(crate) fn authorization(&self) -> String {
        match &self.token {
            Some(token) => format!("Bearer {}", token.as_str()),
            None => {
                let pair = format!("{}:{}", self.username, self.password());
                format!("Basic {}", STANDARD.encode(pair))
            }
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials(username: {})", self.username)
    }
}

/// Secure string that zeros memory on drop and never displays its contents.
struct SecureString {
    data: String,
}

impl SecureString {
    fn new(s: String) -> Self {
        Self { data: s }
    }

    fn as_str(&self) -> &str {
        &self.data
    }
}

impl Drop for SecureString {
    fn drop(&mut self) {
        let mut bytes = std::mem::take(&mut self.data).into_bytes();
        bytes.iter_mut().for_each(|b| *b = 0);
        std::hint::black_box(&bytes);
    }
}

impl fmt::Debug for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureString(<redacted>)")
    }
}

/// How the connection to the server is secured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// Plaintext connection
    Basic,
    /// TLS connection with the given trust settings
    Encrypted(TrustConfig),
}

impl AuthMode {
    fn tls_settings(&self) -> Option<TlsSettings> {
        match self {
            AuthMode::Basic => None,
            AuthMode::Encrypted(trust) => Some(TlsSettings {
                ca_pem: trust.ca_pem().map(<[u8]>::to_vec),
                verify_server: trust.verify_server(),
            }),
        }
    }
}

/// Builds handshake headers and derives the per-session auth headers.
pub struct AuthenticationHandler {
    credentials: Credentials,
    client_properties: CallMetadata,
}

impl AuthenticationHandler {
    /// Create a new authentication handler.
    ///
    /// `client_properties` are sent with the handshake so the server binds
    /// them to the session.
    pub fn new(credentials: Credentials, client_properties: CallMetadata) -> Self {
        Self {
            credentials,
            client_properties,
        }
    }

    /// Headers sent with the handshake: client properties, then authorization.
    pub fn handshake_headers(&self) -> CallMetadata {
        let mut headers = HeaderBuilder::new().base(&self.client_properties).build();
        headers.insert(AUTHORIZATION_HEADER, self.credentials.authorization());
        headers
    }

    /// Headers attached to every call after a successful handshake.
    ///
    /// A bearer token returned by the server replaces the credentials. When
    /// the server returns none, the full handshake headers are re-sent.
    pub fn session_headers(&self, handshake: &HandshakeInfo) -> CallMetadata {
        match &handshake.bearer {
            Some(bearer) => [(AUTHORIZATION_HEADER, bearer.as_str())].into_iter().collect(),
            None => self.handshake_headers(),
        }
    }

    /// Get the credentials username.
    pub fn username(&self) -> &str {
        self.credentials.username()
    }
}

impl fmt::Debug for AuthenticationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationHandler")
            .field("credentials", &self.credentials)
            .field("client_properties", &self.client_properties)
            .finish()
    }
}

/// Negotiates an authenticated [`Session`] with a Flight endpoint.
#[derive(Debug, Clone)]
pub struct AuthNegotiator {
    connect_timeout: Duration,
    query_timeout: Option<Duration>,
}

impl AuthNegotiator {
    /// Create a negotiator with a 30 second connection timeout.
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            query_timeout: None,
        }
    }

    /// Bound connecting and the handshake by `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Default timeout for queries on sessions created by this negotiator.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    /// Open a plaintext session.
    ///
    /// # Errors
    ///
    /// `Unavailable` when the server cannot be reached, `Unauthenticated` when
    /// the credentials are rejected.
    pub async fn connect_basic(
        &self,
        target: &ConnectionTarget,
        credentials: &Credentials,
        client_properties: Option<&CallMetadata>,
    ) -> Result<Session, ClientError> {
        self.connect(target, credentials, &AuthMode::Basic, client_properties)
            .await
    }

    /// Open an encrypted session.
    ///
    /// # Errors
    ///
    /// As [`connect_basic`](Self::connect_basic), plus `TlsVerification` when
    /// the server certificate chain fails validation.
    pub async fn connect_encrypted(
        &self,
        target: &ConnectionTarget,
        credentials: &Credentials,
        trust: &TrustConfig,
        client_properties: Option<&CallMetadata>,
    ) -> Result<Session, ClientError> {
        let mode = AuthMode::Encrypted(trust.clone());
        self.connect(target, credentials, &mode, client_properties)
            .await
    }

    /// Open a session in the given mode over a gRPC transport.
    pub async fn connect(
        &self,
        target: &ConnectionTarget,
        credentials: &Credentials,
        mode: &AuthMode,
        client_properties: Option<&CallMetadata>,
    ) -> Result<Session, ClientError> {
        self.negotiate(
            GrpcTransport::new(),
            target,
            credentials,
            mode,
            client_properties,
        )
        .await
    }

    /// Connect and handshake over the supplied transport.
    ///
    /// On failure the transport is closed and no session is produced.
    pub async fn negotiate<T>(
        &self,
        mut transport: T,
        target: &ConnectionTarget,
        credentials: &Credentials,
        mode: &AuthMode,
        client_properties: Option<&CallMetadata>,
    ) -> Result<Session, ClientError>
    where
        T: FlightTransport + 'static,
    {
        let endpoint = self.endpoint(target, mode);
        let properties = client_properties.cloned().unwrap_or_default();
        let handler = AuthenticationHandler::new(credentials.clone(), properties);

        debug!(
            target = %target,
            encrypted = endpoint.tls.is_some(),
            username = handler.username(),
            "Connecting"
        );

        if let Err(e) = transport.connect(&endpoint).await {
            close_quietly(&mut transport).await;
            return Err(classify(target, e));
        }

        let headers = handler.handshake_headers();
        let handshake =
            tokio::time::timeout(self.connect_timeout, transport.handshake(&headers)).await;

        let info = match handshake {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                close_quietly(&mut transport).await;
                return Err(classify(target, e));
            }
            Err(_) => {
                close_quietly(&mut transport).await;
                return Err(ConnectionError::Unavailable {
                    host: target.host().to_string(),
                    port: target.port(),
                    message: format!(
                        "Handshake timed out after {}ms",
                        self.connect_timeout.as_millis()
                    ),
                }
                .into());
            }
        };

        let mut session = Session::new(
            target.clone(),
            Arc::new(Mutex::new(transport)),
            handler.session_headers(&info),
        );
        if let Some(timeout) = self.query_timeout {
            session = session.with_query_timeout(timeout);
        }

        info!(session_id = session.id(), target = %target, "Session established");
        Ok(session)
    }

    fn endpoint(&self, target: &ConnectionTarget, mode: &AuthMode) -> EndpointConfig {
        let mut endpoint = EndpointConfig::new(target.host(), target.port())
            .with_connect_timeout(self.connect_timeout);

        if let Some(tls) = mode.tls_settings() {
            endpoint = endpoint.with_tls(tls);
        }
        if let Some(timeout) = self.query_timeout {
            endpoint = endpoint.with_request_timeout(timeout);
        }

        endpoint
    }
}

impl Default for AuthNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

async fn close_quietly<T: FlightTransport>(transport: &mut T) {
    if let Err(e) = transport.close().await {
        warn!(error = %e, "Failed to close transport after connection failure");
    }
}

/// Map a transport failure during connect or handshake to the public taxonomy.
fn classify(target: &ConnectionTarget, err: TransportError) -> ClientError {
    let unavailable = |message: String| ConnectionError::Unavailable {
        host: target.host().to_string(),
        port: target.port(),
        message,
    };

    match err {
        TransportError::ConnectFailed { message, .. } | TransportError::Interrupted(message) => {
            unavailable(message).into()
        }
        TransportError::Status {
            code: StatusCode::Unavailable | StatusCode::TimedOut,
            message,
        } => unavailable(message).into(),
        TransportError::Status {
            code: StatusCode::Unauthenticated | StatusCode::Unauthorized,
            message,
        } => ConnectionError::Unauthenticated(message).into(),
        TransportError::CertificateRejected(reason) => {
            ConnectionError::TlsVerification(reason).into()
        }
        TransportError::TlsError(message) => ConfigError::invalid("trust", message).into(),
        TransportError::InvalidMetadata(message) => {
            ConfigError::invalid("client_properties", message).into()
        }
        other => other.into(),
    }
}
