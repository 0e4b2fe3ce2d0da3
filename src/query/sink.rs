//! Output sinks for query results.
//!
//! A sink receives every batch of a saved query in arrival order, before the
//! batch is handed to the caller.

use crate::error::QueryError;
use arrow::csv::{Writer, WriterBuilder};
use arrow::record_batch::RecordBatch;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Destination for saved result batches.
pub trait BatchSink: Send {
    /// Write one batch.
    fn write_batch(&mut self, batch: &RecordBatch) -> Result<(), QueryError>;

    /// Flush and release the destination. Called once, after the last batch
    /// or when the result is closed early.
    fn finish(&mut self) -> Result<(), QueryError> {
        Ok(())
    }
}

/// Writes batches as CSV with a header row.
pub struct CsvSink<W: Write + Send> {
    writer: Option<Writer<W>>,
}

impl<W: Write + Send> CsvSink<W> {
    /// Create a CSV sink over any writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(WriterBuilder::new().with_header(true).build(writer)),
        }
    }
}

impl CsvSink<BufWriter<File>> {
    /// Create (or truncate) a CSV file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, QueryError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| {
            QueryError::SinkError(format!("Failed to create {}: {}", path.display(), e))
        })?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> BatchSink for CsvSink<W> {
    fn write_batch(&mut self, batch: &RecordBatch) -> Result<(), QueryError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| QueryError::SinkError("CSV sink is already finished".to_string()))?;
        writer.write(batch)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), QueryError> {
        if let Some(writer) = self.writer.take() {
            writer.into_inner().flush()?;
        }
        Ok(())
    }
}

impl<W: Write + Send> std::fmt::Debug for CsvSink<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvSink")
            .field("finished", &self.writer.is_none())
            .finish()
    }
}

/// Keeps batches in memory behind a shared handle.
///
/// Clones share the same buffer, so a clone kept by the caller sees every
/// batch written through the sink handed to a query.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    batches: Arc<Mutex<Vec<RecordBatch>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the batches written so far.
    pub fn batches(&self) -> Vec<RecordBatch> {
        match self.batches.lock() {
            Ok(batches) => batches.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Total rows written so far.
    pub fn row_count(&self) -> usize {
        self.batches().iter().map(RecordBatch::num_rows).sum()
    }
}

impl BatchSink for MemorySink {
    fn write_batch(&mut self, batch: &RecordBatch) -> Result<(), QueryError> {
        self.batches
            .lock()
            .map_err(|_| QueryError::SinkError("Memory sink lock poisoned".to_string()))?
            .push(batch.clone());
        Ok(())
    }
}
