//! Common test utilities for adhoc-flight integration tests.
//!
//! # In-process Flight server
//!
//! [`TestServer`] runs a small Arrow Flight service on `127.0.0.1` with an
//! ephemeral port, so the integration tests need no external database. It
//! understands just enough SQL to exercise the client:
//!
//! | Statement                                   | Result                         |
//! |---------------------------------------------|--------------------------------|
//! | `SELECT * FROM (VALUES(1,2,3),(4,5,6))`     | one batch of `Int64` columns   |
//! | `CREATE TABLE <name> AS SELECT * FROM (...)`| stores the rows, returns count |
//! | `SELECT * FROM <name>`                      | stored rows or `NOT_FOUND`     |
//! | `DROP TABLE <name>`                         | removes the table              |
//! | `SELECT * FROM split`                       | two endpoints, one batch each  |
//! | `SELECT * FROM flaky`                       | one batch, then `UNAVAILABLE`  |
//! | `SELECT * FROM empty`                       | schema only, no batches        |
//!
//! Unqualified table names resolve through the `schema` header of the call,
//! falling back to the `schema` bound to the session at handshake time.
//!
//! Users are `dremio`/`dremio123` with basic credentials, or any username
//! with [`ACCESS_TOKEN`] as a bearer token.
//!
//! # Running Integration Tests
//!
//! ```bash
//! cargo test --test integration_tests
//!
//! # With client logs
//! RUST_LOG=adhoc_flight=debug cargo test --test integration_tests -- --nocapture
//! ```

#![allow(dead_code)]

use arrow::array::{ArrayRef, Int64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use arrow_flight::encode::FlightDataEncoderBuilder;
use arrow_flight::error::FlightError;
use arrow_flight::flight_service_server::{FlightService, FlightServiceServer};
use arrow_flight::{
    Action, ActionType, Criteria, Empty, FlightData, FlightDescriptor, FlightEndpoint, FlightInfo,
    HandshakeRequest, HandshakeResponse, PollInfo, PutResult, SchemaResult, Ticket,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::{StreamExt, TryStreamExt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Connected;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

// ============================================================================
// Credentials
// ============================================================================

/// Username accepted with [`PASSWORD`].
pub const USERNAME: &str = "dremio";

/// Password for [`USERNAME`].
pub const PASSWORD: &str = "dremio123";

/// Personal access token accepted for any username.
pub const ACCESS_TOKEN: &str = "pat-2f6c0f3e9a";

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A local port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Certificates
// ============================================================================

/// A CA and a `localhost` certificate signed by it.
pub struct TestIdentity {
    pub ca_pem: String,
    cert: CertificateDer<'static>,
    key: Vec<u8>,
}

impl TestIdentity {
    pub fn generate() -> Self {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .signed_by(&key, &ca, &ca_key)
            .unwrap();

        Self {
            ca_pem: ca.pem(),
            cert: cert.der().clone(),
            key: key.serialize_der(),
        }
    }

    fn acceptor(&self) -> TlsAcceptor {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(
                vec![self.cert.clone()],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.clone())),
            )
            .unwrap();
        config.alpn_protocols = vec![b"h2".to_vec()];
        TlsAcceptor::from(Arc::new(config))
    }
}

/// Server side of an accepted TLS connection.
struct TlsIo(tokio_rustls::server::TlsStream<TcpStream>);

impl Connected for TlsIo {
    type ConnectInfo = ();

    fn connect_info(&self) -> Self::ConnectInfo {}
}

impl AsyncRead for TlsIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

// ============================================================================
// Server
// ============================================================================

/// Headers seen by the server, lower-cased names.
pub type Headers = HashMap<String, String>;

/// Handle to a running in-process Flight server. Dropping it stops the server.
pub struct TestServer {
    addr: SocketAddr,
    state: Arc<EngineState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    /// Start a plaintext server.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let engine = FlightEngine::default();
        let state = Arc::clone(&engine.state);
        let (tx, rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let _ = Server::builder()
                .add_service(FlightServiceServer::new(engine))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = rx.await;
                })
                .await;
        });

        Self {
            addr,
            state,
            shutdown: Some(tx),
        }
    }

    /// Start a TLS server presenting the identity's `localhost` certificate.
    pub async fn start_tls(identity: &TestIdentity) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let engine = FlightEngine::default();
        let state = Arc::clone(&engine.state);
        let (tx, rx) = oneshot::channel::<()>();
        let acceptor = identity.acceptor();

        // Failed TLS handshakes are dropped instead of ending the accept loop
        let incoming = TcpListenerStream::new(listener)
            .filter_map(move |tcp| {
                let acceptor = acceptor.clone();
                async move {
                    let tcp = tcp.ok()?;
                    let tls = acceptor.accept(tcp).await.ok()?;
                    Some(Ok::<_, io::Error>(TlsIo(tls)))
                }
            })
            .boxed();

        tokio::spawn(async move {
            let _ = Server::builder()
                .add_service(FlightServiceServer::new(engine))
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = rx.await;
                })
                .await;
        });

        Self {
            addr,
            state,
            shutdown: Some(tx),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Headers received with each handshake, authorization removed.
    pub fn handshake_headers(&self) -> Vec<Headers> {
        self.state.handshakes.lock().unwrap().clone()
    }

    /// Headers received with each query submission.
    pub fn query_headers(&self) -> Vec<Headers> {
        self.state.queries.lock().unwrap().clone()
    }

    /// Whether a table exists under its qualified name.
    pub fn has_table(&self, name: &str) -> bool {
        self.state.tables.lock().unwrap().contains_key(name)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Result data behind one ticket.
enum Plan {
    Batches(Vec<RecordBatch>),
    FailAfter(RecordBatch),
    SchemaOnly(SchemaRef),
}

#[derive(Default)]
struct EngineState {
    next_id: AtomicU64,
    /// Bearer token to the properties bound at handshake time
    sessions: Mutex<HashMap<String, Headers>>,
    tables: Mutex<HashMap<String, RecordBatch>>,
    plans: Mutex<HashMap<String, Plan>>,
    handshakes: Mutex<Vec<Headers>>,
    queries: Mutex<Vec<Headers>>,
}

#[derive(Clone, Default)]
struct FlightEngine {
    state: Arc<EngineState>,
}

fn headers<T>(request: &Request<T>) -> Headers {
    request
        .metadata()
        .clone()
        .into_headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn basic_user(authorization: &str) -> Option<(String, String)> {
    let encoded = authorization.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded).ok()?).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

impl FlightEngine {
    fn authenticate(&self, headers: &Headers) -> Result<(), Status> {
        let authorization = headers
            .get("authorization")
            .ok_or_else(|| Status::unauthenticated("Missing authorization header"))?;

        if authorization == &format!("Bearer {}", ACCESS_TOKEN) {
            return Ok(());
        }
        match basic_user(authorization) {
            Some((user, pass)) if user == USERNAME && pass == PASSWORD => Ok(()),
            Some((user, _)) if user == USERNAME => {
                Err(Status::unauthenticated("Unable to authenticate user dremio"))
            }
            Some((user, _)) => Err(Status::unauthenticated(format!(
                "Unable to authenticate user {}",
                user
            ))),
            None => Err(Status::unauthenticated("Unsupported authorization scheme")),
        }
    }

    /// Look up the session behind a bearer token.
    fn session(&self, headers: &Headers) -> Result<Headers, Status> {
        let token = headers
            .get("authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| Status::unauthenticated("Missing bearer token"))?;

        self.state
            .sessions
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or_else(|| Status::unauthenticated("Unknown session token"))
    }

    fn next_id(&self) -> u64 {
        self.state.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn plan(&self, sql: &str, schema: Option<&str>) -> Result<Vec<Plan>, Status> {
        let statement = sql.trim().trim_end_matches(';').to_ascii_lowercase();
        let mut tables = self.state.tables.lock().unwrap();

        if let Some(rest) = statement.strip_prefix("create table ") {
            let (name, select) = rest
                .split_once(" as ")
                .ok_or_else(|| Status::invalid_argument("Expected CREATE TABLE ... AS SELECT"))?;
            let batch = select_values(select)?;
            let rows = batch.num_rows() as i64;
            tables.insert(qualify(name.trim(), schema)?, batch);
            return Ok(vec![Plan::Batches(vec![count_batch("records", rows)])]);
        }

        if let Some(name) = statement.strip_prefix("drop table ") {
            let name = qualify(name.trim(), schema)?;
            tables
                .remove(&name)
                .ok_or_else(|| Status::not_found(format!("Table '{}' not found", name)))?;
            return Ok(vec![Plan::Batches(vec![count_batch("dropped", 1)])]);
        }

        if let Some(source) = statement.strip_prefix("select * from ") {
            let source = source.trim();
            if source.starts_with('(') {
                return Ok(vec![Plan::Batches(vec![select_values(&statement)?])]);
            }
            match source {
                "split" => {
                    return Ok(vec![
                        Plan::Batches(vec![int_batch(&[vec![1, 2]])?]),
                        Plan::Batches(vec![int_batch(&[vec![3, 4], vec![5, 6]])?]),
                    ])
                }
                "flaky" => return Ok(vec![Plan::FailAfter(int_batch(&[vec![1, 2, 3]])?)]),
                "empty" => return Ok(vec![Plan::SchemaOnly(empty_schema())]),
                _ => {}
            }

            let name = qualify(source, schema)?;
            let batch = tables.get(&name).cloned().ok_or_else(|| {
                Status::not_found(format!("Object '{}' not found within '{}'", source, name))
            })?;
            return Ok(vec![Plan::Batches(vec![batch])]);
        }

        Err(Status::invalid_argument(format!(
            "Unsupported statement: {}",
            sql
        )))
    }
}

fn qualify(name: &str, schema: Option<&str>) -> Result<String, Status> {
    if name.contains('.') {
        return Ok(name.to_string());
    }
    match schema {
        Some(schema) => Ok(format!("{}.{}", schema.to_ascii_lowercase(), name)),
        None => Err(Status::not_found(format!(
            "Object '{}' not found: no default schema",
            name
        ))),
    }
}

/// Evaluate `... (VALUES(1,2),(3,4))`.
fn select_values(select: &str) -> Result<RecordBatch, Status> {
    let start = select
        .find("values")
        .ok_or_else(|| Status::invalid_argument("Expected a VALUES list"))?;
    let body = select[start + "values".len()..].trim();
    let body = body
        .strip_suffix(')')
        .ok_or_else(|| Status::invalid_argument("Unbalanced parentheses"))?;

    let mut rows = Vec::new();
    for group in body.split(')') {
        let group = group.trim().trim_start_matches(',').trim();
        if group.is_empty() {
            continue;
        }
        let inner = group
            .strip_prefix('(')
            .ok_or_else(|| Status::invalid_argument("Expected '(' in VALUES list"))?;
        let row = inner
            .split(',')
            .map(|v| {
                v.trim()
                    .parse::<i64>()
                    .map_err(|_| Status::invalid_argument(format!("Not an integer: {}", v)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        rows.push(row);
    }

    int_batch(&rows)
}

fn int_batch(rows: &[Vec<i64>]) -> Result<RecordBatch, Status> {
    let width = rows.first().map(Vec::len).unwrap_or(0);
    if width == 0 || rows.iter().any(|r| r.len() != width) {
        return Err(Status::invalid_argument("VALUES rows must have equal width"));
    }

    let fields: Vec<Field> = (0..width)
        .map(|c| Field::new(format!("EXPR${}", c), DataType::Int64, false))
        .collect();
    let columns: Vec<ArrayRef> = (0..width)
        .map(|c| Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r[c]))) as ArrayRef)
        .collect();

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .map_err(|e| Status::internal(e.to_string()))
}

fn count_batch(name: &str, count: i64) -> RecordBatch {
    let schema = Schema::new(vec![Field::new(name, DataType::Int64, false)]);
    RecordBatch::try_new(
        Arc::new(schema),
        vec![Arc::new(Int64Array::from(vec![count]))],
    )
    .unwrap()
}

/// Columns of the `empty` table.
pub fn empty_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
    ]))
}

/// A stream holding the schema message and nothing else.
fn encode_schema(schema: SchemaRef) -> BoxStream<'static, Result<FlightData, Status>> {
    FlightDataEncoderBuilder::new()
        .with_schema(schema)
        .build(stream::iter(Vec::<Result<RecordBatch, FlightError>>::new()))
        .map_err(|e| Status::internal(format!("Encoding error: {}", e)))
        .boxed()
}

fn encode(batches: Vec<RecordBatch>) -> BoxStream<'static, Result<FlightData, Status>> {
    FlightDataEncoderBuilder::new()
        .build(stream::iter(batches.into_iter().map(Ok)))
        .map_err(|e| Status::internal(format!("Encoding error: {}", e)))
        .boxed()
}

#[tonic::async_trait]
impl FlightService for FlightEngine {
    type HandshakeStream = BoxStream<'static, Result<HandshakeResponse, Status>>;
    type ListFlightsStream = BoxStream<'static, Result<FlightInfo, Status>>;
    type DoGetStream = BoxStream<'static, Result<FlightData, Status>>;
    type DoPutStream = BoxStream<'static, Result<PutResult, Status>>;
    type DoActionStream = BoxStream<'static, Result<arrow_flight::Result, Status>>;
    type ListActionsStream = BoxStream<'static, Result<ActionType, Status>>;
    type DoExchangeStream = BoxStream<'static, Result<FlightData, Status>>;

    async fn handshake(
        &self,
        request: Request<Streaming<HandshakeRequest>>,
    ) -> Result<Response<Self::HandshakeStream>, Status> {
        let mut headers = headers(&request);
        self.authenticate(&headers)?;
        headers.remove("authorization");

        let token = format!("session-{}", self.next_id());
        self.state
            .sessions
            .lock()
            .unwrap()
            .insert(token.clone(), headers.clone());
        self.state.handshakes.lock().unwrap().push(headers);

        let reply = HandshakeResponse {
            protocol_version: 0,
            payload: Bytes::new(),
        };
        let mut response = Response::new(stream::iter(vec![Ok::<_, Status>(reply)]).boxed());
        let bearer = format!("Bearer {}", token)
            .parse()
            .map_err(|_| Status::internal("Invalid bearer token"))?;
        response.metadata_mut().insert("authorization", bearer);
        Ok(response)
    }

    async fn list_flights(
        &self,
        _request: Request<Criteria>,
    ) -> Result<Response<Self::ListFlightsStream>, Status> {
        Err(Status::unimplemented("list_flights"))
    }

    async fn get_flight_info(
        &self,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        let headers = headers(&request);
        let session = self.session(&headers)?;
        self.state.queries.lock().unwrap().push(headers.clone());

        let descriptor = request.into_inner();
        let sql = String::from_utf8(descriptor.cmd.to_vec())
            .map_err(|_| Status::invalid_argument("Command is not UTF-8"))?;
        let schema = headers
            .get("schema")
            .or_else(|| session.get("schema"))
            .map(String::as_str);

        let plans = self.plan(&sql, schema)?;

        let mut info = FlightInfo::new().with_descriptor(descriptor);
        let mut plans_by_ticket = self.state.plans.lock().unwrap();
        for plan in plans {
            let ticket = format!("ticket-{}", self.next_id());
            plans_by_ticket.insert(ticket.clone(), plan);
            info = info.with_endpoint(FlightEndpoint::new().with_ticket(Ticket::new(ticket)));
        }

        Ok(Response::new(info))
    }

    async fn poll_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<PollInfo>, Status> {
        Err(Status::unimplemented("poll_flight_info"))
    }

    async fn get_schema(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<SchemaResult>, Status> {
        Err(Status::unimplemented("get_schema"))
    }

    async fn do_get(
        &self,
        request: Request<Ticket>,
    ) -> Result<Response<Self::DoGetStream>, Status> {
        self.session(&headers(&request))?;

        let ticket = String::from_utf8(request.into_inner().ticket.to_vec())
            .map_err(|_| Status::invalid_argument("Ticket is not UTF-8"))?;
        let plan = self
            .state
            .plans
            .lock()
            .unwrap()
            .remove(&ticket)
            .ok_or_else(|| Status::not_found(format!("Unknown ticket {}", ticket)))?;

        let stream = match plan {
            Plan::Batches(batches) => encode(batches),
            Plan::SchemaOnly(schema) => encode_schema(schema),
            Plan::FailAfter(batch) => encode(vec![batch])
                .chain(stream::once(async {
                    Err(Status::unavailable("Executor node lost"))
                }))
                .boxed(),
        };

        Ok(Response::new(stream))
    }

    async fn do_put(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoPutStream>, Status> {
        Err(Status::unimplemented("do_put"))
    }

    async fn do_action(
        &self,
        _request: Request<Action>,
    ) -> Result<Response<Self::DoActionStream>, Status> {
        Err(Status::unimplemented("do_action"))
    }

    async fn list_actions(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListActionsStream>, Status> {
        Err(Status::unimplemented("list_actions"))
    }

    async fn do_exchange(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoExchangeStream>, Status> {
        Err(Status::unimplemented("do_exchange"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_values() {
        let batch = select_values("select * from (values(1,2,3),(4,5,6))").unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 3);
    }

    #[test]
    fn test_qualify() {
        assert_eq!(qualify("a.t", None).unwrap(), "a.t");
        assert_eq!(qualify("t", Some("$Scratch")).unwrap(), "$scratch.t");
        assert_eq!(qualify("t", None).unwrap_err().code(), tonic::Code::NotFound);
    }

    #[test]
    fn test_basic_user() {
        let header = format!("Basic {}", STANDARD.encode("dremio:dremio123"));
        assert_eq!(
            basic_user(&header),
            Some(("dremio".to_string(), "dremio123".to_string()))
        );
        assert_eq!(basic_user("Bearer x"), None);
    }
}
