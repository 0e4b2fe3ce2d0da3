//! Session lifecycle for Flight connections.
//!
//! A [`Session`] owns the authenticated transport and the auth headers that
//! accompany every call. Results produced from a session observe its closed
//! flag, so closing the session stops them at their next advancement.

use crate::connection::params::ConnectionTarget;
use crate::error::{ClientError, ConnectionError};
use crate::query::headers::CallMetadata;
use crate::transport::FlightTransport;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::info;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session is authenticated and can run queries
    Active,

    /// Session is closed
    Closed,
}

/// An authenticated connection to a Flight endpoint.
///
/// A session is meant to be driven by one caller at a time; queries issued
/// concurrently on the same session are serialized on the transport.
pub struct Session {
    /// Process-unique session id
    id: u64,

    /// Endpoint this session is connected to
    target: ConnectionTarget,

    /// Authenticated transport
    transport: Arc<Mutex<dyn FlightTransport>>,

    /// Headers attached to every call
    auth_metadata: CallMetadata,

    /// Closed flag shared with open results
    closed: Arc<AtomicBool>,

    /// Default timeout for queries
    query_timeout: Option<Duration>,

    /// Query execution counter
    query_count: AtomicU64,

    /// Creation time
    created_at: Instant,
}

impl Session {
    /// Create a session over an authenticated transport.
    pub(crate) fn new(
        target: ConnectionTarget,
        transport: Arc<Mutex<dyn FlightTransport>>,
        auth_metadata: CallMetadata,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            target,
            transport,
            auth_metadata,
            closed: Arc::new(AtomicBool::new(false)),
            query_timeout: None,
            query_count: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    /// Set the default query timeout.
    pub(crate) fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    /// Get the session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the connection target.
    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    /// Get the default query timeout.
    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout
    }

    /// Get current session state.
    pub fn state(&self) -> SessionState {
        if self.is_closed() {
            SessionState::Closed
        } else {
            SessionState::Active
        }
    }

    /// Check if session is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Time since the session was established.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Increment query counter.
    pub(crate) fn increment_query_count(&self) -> u64 {
        self.query_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Get total query count.
    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::SeqCst)
    }

    /// Validate session is open for operations.
    pub fn validate_open(&self) -> Result<(), ConnectionError> {
        if self.is_closed() {
            Err(ConnectionError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Headers for one call: the session auth headers, then `per_call`.
    ///
    /// Later entries win, so per-call headers may override session ones.
    pub(crate) fn call_metadata(&self, per_call: Option<&CallMetadata>) -> CallMetadata {
        let mut metadata = self.auth_metadata.clone();
        if let Some(per_call) = per_call {
            metadata.merge(per_call);
        }
        metadata
    }

    pub(crate) fn transport(&self) -> Arc<Mutex<dyn FlightTransport>> {
        Arc::clone(&self.transport)
    }

    pub(crate) fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    /// Close the session.
    ///
    /// Closing an already closed session is a no-op.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.transport.lock().await.close().await?;

        info!(
            session_id = self.id,
            queries = self.query_count(),
            "Session closed"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("state", &self.state())
            .field("query_count", &self.query_count())
            .finish()
    }
}
