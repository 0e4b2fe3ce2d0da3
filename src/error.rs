//! Error types for adhoc-flight.
//!
//! This module defines domain-specific error types organized by functional area.
//! Every error can be classified by [`ErrorKind`] and carries a [`StatusCode`]
//! compatible with Arrow Flight status codes.

use std::fmt;
use thiserror::Error;

/// Top-level error type encompassing all possible errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Construction-time configuration errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Connection and authentication errors
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Query execution errors
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Transport faults during an operation
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors raised while validating caller-supplied configuration.
///
/// None of these ever reach the network.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid connection or call parameter
    #[error("Invalid parameter '{parameter}': {message}")]
    InvalidParameter { parameter: String, message: String },

    /// Session property token without a `key:value` shape
    #[error("Malformed session property '{token}': expected key:value")]
    MalformedProperty { token: String },

    /// Connection string parsing error
    #[error("Failed to parse connection string: {0}")]
    ParseError(String),
}

/// Errors related to establishing and using a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The server could not be reached
    #[error("Failed to connect to {host}:{port}: {message}")]
    Unavailable {
        host: String,
        port: u16,
        message: String,
    },

    /// The server rejected the credentials or token
    #[error("Authentication failed: {0}")]
    Unauthenticated(String),

    /// The server certificate chain failed validation
    #[error("TLS verification failed: {0}")]
    TlsVerification(String),

    /// The session has been closed
    #[error("Session is closed")]
    SessionClosed,
}

/// Errors related to query execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Query text rejected before any network call
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The server rejected or failed the query
    #[error("Query execution failed ({code}): {message}")]
    ExecutionFailed { code: StatusCode, message: String },

    /// Writing a batch to the output sink failed
    #[error("Output sink error: {0}")]
    SinkError(String),
}

/// Errors reported by the transport layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection could not be opened
    #[error("Failed to connect to {endpoint}: {message}")]
    ConnectFailed { endpoint: String, message: String },

    /// The peer certificate was rejected during the TLS handshake
    #[error("Server certificate rejected: {0}")]
    CertificateRejected(String),

    /// Local TLS configuration could not be built
    #[error("TLS error: {0}")]
    TlsError(String),

    /// A call completed with a server-reported status
    #[error("Server returned {code}: {message}")]
    Status { code: StatusCode, message: String },

    /// The connection broke while a response was in flight
    #[error("Stream interrupted: {0}")]
    Interrupted(String),

    /// Call metadata could not be encoded as request headers
    #[error("Invalid call metadata: {0}")]
    InvalidMetadata(String),

    /// A response could not be decoded
    #[error("Failed to decode response: {0}")]
    DecodeError(String),

    /// Operation not valid in the current transport state
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The transport has been closed
    #[error("Transport is closed")]
    Closed,
}

/// Classification of a failure, one entry per error taxonomy kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidConfig,
    MalformedProperty,
    Unavailable,
    Unauthenticated,
    TlsVerification,
    InvalidQuery,
    QueryExecution,
    Transport,
    SessionClosed,
    Sink,
}

/// Arrow Flight status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Unknown,
    Internal,
    InvalidArgument,
    TimedOut,
    NotFound,
    AlreadyExists,
    Cancelled,
    Unauthenticated,
    Unauthorized,
    Unimplemented,
    Unavailable,
    ResourceExhausted,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Ok => "OK",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::Internal => "INTERNAL",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::TimedOut => "TIMED_OUT",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
            StatusCode::Unauthorized => "UNAUTHORIZED",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
        };
        f.write_str(name)
    }
}

impl From<tonic::Code> for StatusCode {
    fn from(code: tonic::Code) -> Self {
        use tonic::Code;

        match code {
            Code::Ok => StatusCode::Ok,
            Code::Cancelled => StatusCode::Cancelled,
            Code::Unknown => StatusCode::Unknown,
            Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
                StatusCode::InvalidArgument
            }
            Code::DeadlineExceeded => StatusCode::TimedOut,
            Code::NotFound => StatusCode::NotFound,
            Code::AlreadyExists => StatusCode::AlreadyExists,
            Code::PermissionDenied => StatusCode::Unauthorized,
            Code::ResourceExhausted => StatusCode::ResourceExhausted,
            Code::Aborted | Code::Internal | Code::DataLoss => StatusCode::Internal,
            Code::Unimplemented => StatusCode::Unimplemented,
            Code::Unavailable => StatusCode::Unavailable,
            Code::Unauthenticated => StatusCode::Unauthenticated,
        }
    }
}

impl ClientError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Config(e) => e.kind(),
            ClientError::Connection(e) => e.kind(),
            ClientError::Query(e) => e.kind(),
            ClientError::Transport(_) => ErrorKind::Transport,
        }
    }

    /// Map to a Flight status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ClientError::Config(_) => StatusCode::InvalidArgument,
            ClientError::Connection(e) => e.status_code(),
            ClientError::Query(e) => e.status_code(),
            ClientError::Transport(e) => e.status_code(),
        }
    }
}

impl ConfigError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::MalformedProperty { .. } => ErrorKind::MalformedProperty,
            _ => ErrorKind::InvalidConfig,
        }
    }

    pub(crate) fn invalid(parameter: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidParameter {
            parameter: parameter.to_string(),
            message: message.into(),
        }
    }
}

impl ConnectionError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectionError::Unavailable { .. } => ErrorKind::Unavailable,
            ConnectionError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            ConnectionError::TlsVerification(_) => ErrorKind::TlsVerification,
            ConnectionError::SessionClosed => ErrorKind::SessionClosed,
        }
    }

    /// Map to a Flight status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ConnectionError::Unauthenticated(_) => StatusCode::Unauthenticated,
            _ => StatusCode::Unavailable,
        }
    }
}

impl QueryError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::InvalidQuery(_) => ErrorKind::InvalidQuery,
            QueryError::ExecutionFailed { .. } => ErrorKind::QueryExecution,
            QueryError::SinkError(_) => ErrorKind::Sink,
        }
    }

    /// Map to a Flight status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            QueryError::InvalidQuery(_) => StatusCode::InvalidArgument,
            QueryError::ExecutionFailed { code, .. } => *code,
            QueryError::SinkError(_) => StatusCode::Internal,
        }
    }
}

impl TransportError {
    /// Map to a Flight status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            TransportError::Status { code, .. } => *code,
            TransportError::InvalidMetadata(_) | TransportError::TlsError(_) => {
                StatusCode::InvalidArgument
            }
            TransportError::DecodeError(_) | TransportError::ProtocolError(_) => {
                StatusCode::Internal
            }
            TransportError::ConnectFailed { .. }
            | TransportError::CertificateRejected(_)
            | TransportError::Interrupted(_)
            | TransportError::Closed => StatusCode::Unavailable,
        }
    }

    /// Build from a gRPC status returned for a unary or handshake call.
    pub(crate) fn from_status(status: &tonic::Status) -> Self {
        TransportError::Status {
            code: status.code().into(),
            message: status.message().to_string(),
        }
    }

    /// Build from a gRPC status observed while reading a response stream.
    ///
    /// Statuses that carry an underlying connection error, or that report the
    /// peer as gone, mean the stream was cut rather than failed by the server.
    pub(crate) fn from_stream_status(status: &tonic::Status) -> Self {
        use std::error::Error as _;

        let broken = status.source().is_some()
            || matches!(status.code(), tonic::Code::Unavailable | tonic::Code::Cancelled);
        if broken {
            TransportError::Interrupted(status.message().to_string())
        } else {
            Self::from_status(status)
        }
    }
}

// Conversions from external error types
impl From<arrow::error::ArrowError> for QueryError {
    fn from(err: arrow::error::ArrowError) -> Self {
        QueryError::SinkError(err.to_string())
    }
}

impl From<std::io::Error> for QueryError {
    fn from(err: std::io::Error) -> Self {
        QueryError::SinkError(err.to_string())
    }
}

impl From<arrow_flight::error::FlightError> for TransportError {
    fn from(err: arrow_flight::error::FlightError) -> Self {
        use arrow_flight::error::FlightError;

        match err {
            FlightError::Tonic(status) => TransportError::from_stream_status(&status),
            other => TransportError::DecodeError(other.to_string()),
        }
    }
}
