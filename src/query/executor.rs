//! Query submission.
//!
//! [`QueryExecutor::run_query`] validates a [`QueryRequest`], submits it over
//! the session's transport and hands back a lazy [`QueryResult`].

use crate::connection::session::Session;
use crate::error::{
    ClientError, ConfigError, ConnectionError, QueryError, StatusCode, TransportError,
};
use crate::query::headers::CallMetadata;
use crate::query::results::{within, QueryResult};
use crate::query::sink::BatchSink;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A query plus its per-call options.
pub struct QueryRequest {
    text: String,
    call_metadata: Option<CallMetadata>,
    sink: Option<Box<dyn BatchSink>>,
    save_results: bool,
    timeout: Option<Duration>,
}

impl QueryRequest {
    /// Create a request for the given query text.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            call_metadata: None,
            sink: None,
            save_results: false,
            timeout: None,
        }
    }

    /// Attach headers to this call.
    pub fn call_metadata(mut self, metadata: CallMetadata) -> Self {
        self.call_metadata = Some(metadata);
        self
    }

    /// Set the output sink.
    pub fn sink(mut self, sink: impl BatchSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Set an already boxed output sink.
    pub fn boxed_sink(mut self, sink: Box<dyn BatchSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Write every batch to the sink. Requires a sink.
    pub fn save_results(mut self, save: bool) -> Self {
        self.save_results = save;
        self
    }

    /// Bound the whole query, including reading its results.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Get the query text.
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl std::fmt::Debug for QueryRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRequest")
            .field("text", &self.text)
            .field("call_metadata", &self.call_metadata)
            .field("has_sink", &self.sink.is_some())
            .field("save_results", &self.save_results)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Runs queries on a session.
///
/// A session must not run two queries concurrently; callers needing
/// parallelism open one session per task.
#[derive(Debug)]
pub struct QueryExecutor<'a> {
    session: &'a Session,
}

impl<'a> QueryExecutor<'a> {
    pub fn new(session: &'a Session) -> Self {
        Self { session }
    }

    /// Submit a query and return its lazy result.
    ///
    /// Validation happens before any network call: empty text fails with
    /// `InvalidQuery`, saving without a sink fails with `InvalidConfig`, and a
    /// closed session fails with `SessionClosed`. A sink supplied without the
    /// save flag is ignored.
    ///
    /// # Errors
    ///
    /// `QueryExecution` carrying the server's code and message when the query
    /// is rejected, `Transport` when the connection breaks.
    pub async fn run_query(&self, request: QueryRequest) -> Result<QueryResult, ClientError> {
        let QueryRequest {
            text,
            call_metadata,
            sink,
            save_results,
            timeout,
        } = request;

        if text.trim().is_empty() {
            return Err(QueryError::InvalidQuery("Query text is empty".to_string()).into());
        }

        if save_results && sink.is_none() {
            return Err(ConfigError::invalid(
                "save_results",
                "Saving results requires an output sink",
            )
            .into());
        }

        self.session.validate_open()?;

        let deadline = timeout
            .or(self.session.query_timeout())
            .map(|t| Instant::now() + t);
        let metadata = self.session.call_metadata(call_metadata.as_ref());
        let query_id = self.session.increment_query_count();

        debug!(
            session_id = self.session.id(),
            query_id,
            save_results,
            "Submitting query"
        );

        let transport = self.session.transport();
        let submitted = within(deadline, async {
            transport.lock().await.get_flight_info(&text, &metadata).await
        })
        .await?;
        let tickets = submitted.map_err(query_failure)?;

        debug!(query_id, endpoints = tickets.len(), "Query accepted");

        Ok(QueryResult::new(
            query_id,
            transport,
            metadata,
            tickets,
            if save_results { sink } else { None },
            self.session.closed_flag(),
            deadline,
        ))
    }
}

/// Classify a transport failure observed while running a query.
///
/// Server-reported statuses become `QueryExecution` (or `Unauthenticated`
/// for rejected credentials); broken connections stay `Transport`.
pub(crate) fn query_failure(err: TransportError) -> ClientError {
    match err {
        TransportError::Status {
            code: StatusCode::Unavailable | StatusCode::Cancelled,
            ..
        } => err.into(),
        TransportError::Status {
            code: StatusCode::Unauthenticated,
            message,
        } => ConnectionError::Unauthenticated(message).into(),
        TransportError::Status { code, message } => {
            QueryError::ExecutionFailed { code, message }.into()
        }
        TransportError::InvalidMetadata(message) => {
            ConfigError::invalid("call_metadata", message).into()
        }
        other => other.into(),
    }
}
