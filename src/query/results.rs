//! Lazy query results.
//!
//! A [`QueryResult`] pulls one record batch at a time from the session's
//! transport, walking the query's endpoint tickets in order. It is
//! forward-only and cannot be restarted.

use crate::error::{ClientError, ConnectionError, QueryError, StatusCode};
use crate::query::executor::query_failure;
use crate::query::headers::CallMetadata;
use crate::query::sink::BatchSink;
use crate::transport::{BatchStream, FlightPayload, FlightTransport};
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Result state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultState {
    /// More batches may follow
    Streaming,
    /// Every batch was read
    Completed,
    /// The stream ended with an error
    Failed,
    /// Closed by the caller
    Closed,
}

/// Counts reported after a result has been drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuerySummary {
    /// Number of batches read
    pub batches: usize,
    /// Number of rows read
    pub rows: usize,
}

/// Forward-only sequence of record batches for one query.
pub struct QueryResult {
    query_id: u64,
    transport: Arc<Mutex<dyn FlightTransport>>,
    metadata: CallMetadata,
    tickets: VecDeque<Bytes>,
    current: Option<BatchStream>,
    sink: Option<Box<dyn BatchSink>>,
    session_closed: Arc<AtomicBool>,
    deadline: Option<Instant>,
    schema: Option<SchemaRef>,
    state: ResultState,
    batches_read: usize,
    rows_read: usize,
}

impl QueryResult {
    pub(crate) fn new(
        query_id: u64,
        transport: Arc<Mutex<dyn FlightTransport>>,
        metadata: CallMetadata,
        tickets: Vec<Bytes>,
        sink: Option<Box<dyn BatchSink>>,
        session_closed: Arc<AtomicBool>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            query_id,
            transport,
            metadata,
            tickets: tickets.into(),
            current: None,
            sink,
            session_closed,
            deadline,
            schema: None,
            state: ResultState::Streaming,
            batches_read: 0,
            rows_read: 0,
        }
    }

    /// Schema of the result.
    ///
    /// Known once the server has sent a schema message or the first batch,
    /// so a zero-row result still reports its columns after it completes.
    pub fn schema(&self) -> Option<SchemaRef> {
        self.schema.clone()
    }

    /// Current state.
    pub fn state(&self) -> ResultState {
        self.state
    }

    /// Number of batches read so far.
    pub fn batches_read(&self) -> usize {
        self.batches_read
    }

    /// Number of rows read so far.
    pub fn rows_read(&self) -> usize {
        self.rows_read
    }

    /// Pull the next batch.
    ///
    /// Returns `Ok(None)` once the result is exhausted, closed or failed.
    /// When a sink is attached the batch is written to it first.
    ///
    /// # Errors
    ///
    /// `QueryExecution` for server-reported failures, `Transport` when the
    /// stream is cut, `SessionClosed` when the owning session was closed.
    /// After an error the result is `Failed` and yields no more batches.
    pub async fn next_batch(&mut self) -> Result<Option<RecordBatch>, ClientError> {
        if self.state != ResultState::Streaming {
            return Ok(None);
        }

        if self.session_closed.load(Ordering::SeqCst) {
            return Err(self.fail(ConnectionError::SessionClosed.into()));
        }

        loop {
            if self.current.is_none() {
                let Some(ticket) = self.tickets.pop_front() else {
                    self.complete()?;
                    return Ok(None);
                };

                let transport = Arc::clone(&self.transport);
                let opened = within(self.deadline, async {
                    transport.lock().await.do_get(ticket, &self.metadata).await
                })
                .await;

                match opened {
                    Ok(Ok(stream)) => self.current = Some(stream),
                    Ok(Err(e)) => return Err(self.fail(query_failure(e))),
                    Err(e) => return Err(self.fail(e)),
                }
            }

            let Some(stream) = self.current.as_mut() else {
                continue;
            };

            match within(self.deadline, stream.next()).await {
                Ok(Some(Ok(FlightPayload::Schema(schema)))) => {
                    self.schema.get_or_insert(schema);
                }
                Ok(Some(Ok(FlightPayload::Batch(batch)))) => {
                    self.accept(&batch)?;
                    return Ok(Some(batch));
                }
                Ok(Some(Err(e))) => return Err(self.fail(query_failure(e))),
                Ok(None) => self.current = None,
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    /// Read every remaining batch.
    pub async fn collect(&mut self) -> Result<Vec<RecordBatch>, ClientError> {
        let mut batches = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            batches.push(batch);
        }
        Ok(batches)
    }

    /// Read and discard every remaining batch (writing them to the sink, if
    /// any), returning the totals.
    pub async fn drain(&mut self) -> Result<QuerySummary, ClientError> {
        while self.next_batch().await?.is_some() {}

        Ok(QuerySummary {
            batches: self.batches_read,
            rows: self.rows_read,
        })
    }

    /// Stop reading and release the stream.
    ///
    /// Closing twice is a no-op. An attached sink is finished.
    pub fn close(&mut self) -> Result<(), ClientError> {
        if self.state == ResultState::Closed {
            return Ok(());
        }

        self.current = None;
        self.tickets.clear();
        self.state = ResultState::Closed;

        debug!(query_id = self.query_id, "Query result closed");
        self.finish_sink()
    }

    fn accept(&mut self, batch: &RecordBatch) -> Result<(), ClientError> {
        if self.schema.is_none() {
            self.schema = Some(batch.schema());
        }

        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.write_batch(batch) {
                return Err(self.fail(e.into()));
            }
        }

        self.batches_read += 1;
        self.rows_read += batch.num_rows();
        Ok(())
    }

    fn complete(&mut self) -> Result<(), ClientError> {
        self.state = ResultState::Completed;
        debug!(
            query_id = self.query_id,
            batches = self.batches_read,
            rows = self.rows_read,
            "Query result completed"
        );
        self.finish_sink()
    }

    fn finish_sink(&mut self) -> Result<(), ClientError> {
        match self.sink.take() {
            Some(mut sink) => sink.finish().map_err(ClientError::from),
            None => Ok(()),
        }
    }

    fn fail(&mut self, err: ClientError) -> ClientError {
        debug!(query_id = self.query_id, error = %err, "Query result failed");
        self.current = None;
        self.tickets.clear();
        self.sink = None;
        self.state = ResultState::Failed;
        err
    }
}

impl std::fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResult")
            .field("query_id", &self.query_id)
            .field("state", &self.state)
            .field("pending_endpoints", &self.tickets.len())
            .field("batches_read", &self.batches_read)
            .field("rows_read", &self.rows_read)
            .finish()
    }
}

/// Run `fut` against an optional deadline.
pub(crate) async fn within<F: Future>(
    deadline: Option<Instant>,
    fut: F,
) -> Result<F::Output, ClientError> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.map_err(|_| {
            QueryError::ExecutionFailed {
                code: StatusCode::TimedOut,
                message: "Query exceeded its timeout".to_string(),
            }
            .into()
        }),
        None => Ok(fut.await),
    }
}
