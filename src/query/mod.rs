//! Query execution and result handling.
//!
//! This module provides call metadata assembly, query submission, lazy
//! result iteration and output sinks.
//!
//! # Overview
//!
//! The query module is organized into:
//! - `headers` - Per-call metadata and routing directives
//! - `executor` - Query validation and submission
//! - `results` - Lazy, closable result sequences
//! - `sink` - Destinations for saved results
//!
//! # Example
//!
//! ```no_run
//! use adhoc_flight::connection::{AuthNegotiator, ConnectionTarget, Credentials};
//! use adhoc_flight::query::{CsvSink, HeaderBuilder, QueryExecutor, QueryRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let target = ConnectionTarget::new("localhost", 32010)?;
//! let session = AuthNegotiator::new()
//!     .connect_basic(&target, &Credentials::new("dremio", "dremio123"), None)
//!     .await?;
//!
//! let metadata = HeaderBuilder::new().default_schema("$scratch").build();
//! let request = QueryRequest::new("SELECT * FROM simple_table")
//!     .call_metadata(metadata)
//!     .sink(CsvSink::create("results.csv")?)
//!     .save_results(true);
//!
//! let mut result = QueryExecutor::new(&session).run_query(request).await?;
//! while let Some(batch) = result.next_batch().await? {
//!     println!("Batch rows: {}", batch.num_rows());
//! }
//!
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod executor;
pub mod headers;
pub mod results;
pub mod sink;

// Re-export commonly used types
pub use executor::{QueryExecutor, QueryRequest};
pub use headers::{CallMetadata, HeaderBuilder, RoutingDirective};
pub use results::{QueryResult, QuerySummary, ResultState};
pub use sink::{BatchSink, CsvSink, MemorySink};
