//! High-level client facade.
//!
//! [`AdhocFlightClient`] bundles a session with query execution, mirroring
//! the one-call-per-step shape a command line front end needs.

use crate::connection::auth::{AuthMode, AuthNegotiator, Credentials};
use crate::connection::params::{ConnectionParams, ConnectionTarget, TrustConfig};
use crate::connection::session::Session;
use crate::error::ClientError;
use crate::query::executor::{QueryExecutor, QueryRequest};
use crate::query::headers::CallMetadata;
use crate::query::results::{QueryResult, QuerySummary};
use crate::query::sink::BatchSink;
use tracing::info;

/// Flight client bound to one authenticated session.
///
/// # Example
///
/// ```no_run
/// use adhoc_flight::AdhocFlightClient;
/// use adhoc_flight::query::HeaderBuilder;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client =
///     AdhocFlightClient::get_basic_client("localhost", 32010, "dremio", "dremio123", None, None)
///         .await?;
///
/// let summary = client
///     .run_query("select * from (VALUES(1,2,3),(4,5,6))", None, None, false)
///     .await?;
/// println!("{} rows", summary.rows);
///
/// let metadata = HeaderBuilder::new().default_schema("$scratch").build();
/// let mut result = client.query("SELECT * FROM simple_table", Some(metadata)).await?;
/// while let Some(batch) = result.next_batch().await? {
///     println!("Batch rows: {}", batch.num_rows());
/// }
///
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct AdhocFlightClient {
    session: Session,
}

impl AdhocFlightClient {
    /// Connect using fully specified connection parameters.
    pub async fn connect(params: &ConnectionParams) -> Result<Self, ClientError> {
        let mut negotiator = AuthNegotiator::new().with_connect_timeout(params.connection_timeout);
        if let Some(timeout) = params.query_timeout {
            negotiator = negotiator.with_query_timeout(timeout);
        }

        let mode = match &params.tls {
            Some(trust) => AuthMode::Encrypted(trust.clone()),
            None => AuthMode::Basic,
        };
        let properties = params.client_properties();
        let client_properties = (!properties.is_empty()).then_some(&properties);

        let session = negotiator
            .connect(&params.target, &params.credentials, &mode, client_properties)
            .await?;

        info!(
            client_name = %params.client_name,
            client_version = %params.client_version,
            target = %params.target,
            "Client connected"
        );
        Ok(Self { session })
    }

    /// Connect over plaintext.
    ///
    /// `token` takes precedence over the password when given.
    /// `client_properties` are sent with the handshake.
    pub async fn get_basic_client(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        token: Option<&str>,
        client_properties: Option<&CallMetadata>,
    ) -> Result<Self, ClientError> {
        let target = ConnectionTarget::new(host, port)?;
        let credentials = credentials(username, password, token);

        let session = AuthNegotiator::new()
            .connect_basic(&target, &credentials, client_properties)
            .await?;

        Ok(Self { session })
    }

    /// Connect over TLS.
    ///
    /// With `disable_server_verification` set the CA material is ignored and
    /// any server certificate is accepted. Otherwise the server is verified
    /// against `ca_pem`, or the bundled roots when none is given.
    #[allow(clippy::too_many_arguments)]
    pub async fn get_encrypted_client(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        token: Option<&str>,
        ca_pem: Option<&[u8]>,
        disable_server_verification: bool,
        client_properties: Option<&CallMetadata>,
    ) -> Result<Self, ClientError> {
        let target = ConnectionTarget::new(host, port)?;
        let credentials = credentials(username, password, token);

        let trust = match (disable_server_verification, ca_pem) {
            (true, _) => TrustConfig::disable_server_verification(),
            (false, Some(pem)) => TrustConfig::with_ca_pem(pem)?,
            (false, None) => TrustConfig::system_roots(),
        };

        let session = AuthNegotiator::new()
            .connect_encrypted(&target, &credentials, &trust, client_properties)
            .await?;

        Ok(Self { session })
    }

    /// Run a query to completion, returning batch and row totals.
    ///
    /// When `save` is set every batch is written to `sink`, which must then
    /// be present.
    pub async fn run_query(
        &self,
        query: &str,
        call_metadata: Option<CallMetadata>,
        sink: Option<Box<dyn BatchSink>>,
        save: bool,
    ) -> Result<QuerySummary, ClientError> {
        let mut request = QueryRequest::new(query).save_results(save);
        if let Some(metadata) = call_metadata {
            request = request.call_metadata(metadata);
        }
        if let Some(sink) = sink {
            request = request.boxed_sink(sink);
        }

        let mut result = QueryExecutor::new(&self.session).run_query(request).await?;
        result.drain().await
    }

    /// Submit a query and return its lazy result.
    pub async fn query(
        &self,
        query: &str,
        call_metadata: Option<CallMetadata>,
    ) -> Result<QueryResult, ClientError> {
        let mut request = QueryRequest::new(query);
        if let Some(metadata) = call_metadata {
            request = request.call_metadata(metadata);
        }

        QueryExecutor::new(&self.session).run_query(request).await
    }

    /// Submit a fully specified request.
    pub async fn execute(&self, request: QueryRequest) -> Result<QueryResult, ClientError> {
        QueryExecutor::new(&self.session).run_query(request).await
    }

    /// The underlying session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Check if the client is closed.
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Close the session. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.session.close().await
    }
}

fn credentials(username: &str, password: &str, token: Option<&str>) -> Credentials {
    match token {
        Some(token) => Credentials::with_token(username, password, token),
        None => Credentials::new(username, password),
    }
}
