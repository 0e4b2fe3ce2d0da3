//! Transport protocol abstraction trait.
//!
//! This module defines the `FlightTransport` trait that abstracts the
//! underlying Flight RPC mechanism. Sessions and queries only talk to the
//! server through this trait, which keeps them testable against a mock.

use crate::error::TransportError;
use crate::query::headers::CallMetadata;
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::fmt;
use std::time::Duration;

/// One decoded Flight message.
///
/// A stream may carry a schema message with no batches at all, which is how
/// servers answer zero-row queries and DDL.
#[derive(Debug, Clone)]
pub enum FlightPayload {
    /// Result schema, sent ahead of any batch
    Schema(SchemaRef),
    /// A record batch
    Batch(RecordBatch),
}

/// Stream of decoded Flight messages for one ticket.
pub type BatchStream = BoxStream<'static, Result<FlightPayload, TransportError>>;

/// Trust settings handed to the transport for an encrypted connection.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsSettings {
    /// PEM-encoded CA certificates; `None` uses the bundled roots
    pub ca_pem: Option<Vec<u8>>,
    /// Whether the server certificate chain is validated
    pub verify_server: bool,
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("ca_pem", &self.ca_pem.as_ref().map(|p| p.len()))
            .field("verify_server", &self.verify_server)
            .finish()
    }
}

/// Endpoint parameters for establishing a transport connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// TLS settings; `None` for plaintext
    pub tls: Option<TlsSettings>,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Per-request timeout applied to every RPC
    pub request_timeout: Option<Duration>,
}

impl EndpointConfig {
    /// Create plaintext endpoint parameters with a 30 second connect timeout.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
            connect_timeout: Duration::from_secs(30),
            request_timeout: None,
        }
    }

    /// Set TLS settings.
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Set connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// The channel URI.
    ///
    /// TLS is layered by the connector, so the scheme stays `http` either way.
    pub fn uri(&self) -> String {
        if self.host.contains(':') {
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    /// `host:port` label used in errors and logs.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Outcome of a successful handshake.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// Bearer token returned in the response `authorization` header
    pub bearer: Option<String>,
    /// Handshake response payload
    pub payload: Bytes,
}

impl fmt::Debug for HandshakeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeInfo")
            .field("bearer", &self.bearer.as_ref().map(|_| "<redacted>"))
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Transport trait for Flight communication.
///
/// The transport owns the wire connection. Headers are supplied per call;
/// the transport never remembers credentials on its own.
#[async_trait]
pub trait FlightTransport: Send {
    /// Open the connection to the endpoint.
    ///
    /// # Errors
    ///
    /// `ConnectFailed` when the server cannot be reached,
    /// `CertificateRejected` when TLS validation fails, `TlsError` when the
    /// local TLS configuration is unusable.
    async fn connect(&mut self, endpoint: &EndpointConfig) -> Result<(), TransportError>;

    /// Run the Flight handshake with the given request headers.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Status` with the server's code when the
    /// handshake is rejected.
    async fn handshake(&mut self, headers: &CallMetadata) -> Result<HandshakeInfo, TransportError>;

    /// Submit a command and return the endpoint tickets in order.
    async fn get_flight_info(
        &mut self,
        command: &str,
        headers: &CallMetadata,
    ) -> Result<Vec<Bytes>, TransportError>;

    /// Open the batch stream for one ticket.
    async fn do_get(
        &mut self,
        ticket: Bytes,
        headers: &CallMetadata,
    ) -> Result<BatchStream, TransportError>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mockall::mock! {
    pub Transport {}

    #[async_trait]
    impl FlightTransport for Transport {
        async fn connect(&mut self, endpoint: &EndpointConfig) -> Result<(), TransportError>;
        async fn handshake(
            &mut self,
            headers: &CallMetadata,
        ) -> Result<HandshakeInfo, TransportError>;
        async fn get_flight_info(
            &mut self,
            command: &str,
            headers: &CallMetadata,
        ) -> Result<Vec<Bytes>, TransportError>;
        async fn do_get(
            &mut self,
            ticket: Bytes,
            headers: &CallMetadata,
        ) -> Result<BatchStream, TransportError>;
        async fn close(&mut self) -> Result<(), TransportError>;
        fn is_connected(&self) -> bool;
    }
}
