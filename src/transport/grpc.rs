//! Arrow Flight transport over tonic.
//!
//! Plaintext connections use a regular tonic channel. Encrypted connections
//! drive TLS through `tokio-rustls` inside a custom connector so that a
//! rejected server certificate can be told apart from an unreachable server.

use crate::error::TransportError;
use crate::query::headers::{CallMetadata, AUTHORIZATION_HEADER};
use crate::transport::protocol::{
    BatchStream, EndpointConfig, FlightPayload, FlightTransport, HandshakeInfo,
};
use crate::transport::tls;
use arrow_flight::decode::{DecodedPayload, FlightDataDecoder};
use arrow_flight::error::FlightError;
use arrow_flight::flight_service_client::FlightServiceClient;
use arrow_flight::{FlightDescriptor, HandshakeRequest, Ticket};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{future, StreamExt, TryStreamExt};
use hyper_util::rt::TokioIo;
use std::sync::{Arc, OnceLock};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::Request;
use tracing::debug;

/// gRPC transport implementation.
pub struct GrpcTransport {
    /// Flight client (None if not connected)
    client: Option<FlightServiceClient<Channel>>,
    /// Connection state
    state: ConnectionState,
}

/// Connection state tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Unconnected,
    /// Opening the channel
    Connecting,
    /// Channel open, handshake pending
    Authenticating,
    /// Handshake completed
    Authenticated,
    /// Connect or handshake failed
    Failed,
    /// Connection closed
    Closed,
}

impl GrpcTransport {
    /// Create a new gRPC transport.
    pub fn new() -> Self {
        Self {
            client: None,
            state: ConnectionState::Unconnected,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(from = ?self.state, to = ?next, "Transport state change");
        self.state = next;
    }

    fn client(&mut self) -> Result<&mut FlightServiceClient<Channel>, TransportError> {
        match self.state {
            ConnectionState::Authenticated => self
                .client
                .as_mut()
                .ok_or_else(|| TransportError::ProtocolError("Not connected".to_string())),
            ConnectionState::Closed => Err(TransportError::Closed),
            other => Err(TransportError::ProtocolError(format!(
                "Transport is not authenticated (state: {:?})",
                other
            ))),
        }
    }

    async fn open_channel(endpoint: &EndpointConfig) -> Result<Channel, TransportError> {
        let mut channel = Endpoint::from_shared(endpoint.uri())
            .map_err(|e| TransportError::ConnectFailed {
                endpoint: endpoint.authority(),
                message: e.to_string(),
            })?
            .connect_timeout(endpoint.connect_timeout);

        if let Some(timeout) = endpoint.request_timeout {
            channel = channel.timeout(timeout);
        }

        let Some(settings) = &endpoint.tls else {
            // The deadline covers name resolution as well as the TCP connect
            return match tokio::time::timeout(endpoint.connect_timeout, channel.connect()).await {
                Ok(result) => result.map_err(|e| connect_failed(endpoint, &e)),
                Err(_) => Err(connect_timed_out(endpoint)),
            };
        };

        let connector = TlsConnector::from(tls::client_config(settings)?);
        let server_name = tls::server_name(&endpoint.host)?;
        let address = (endpoint.host.clone(), endpoint.port);
        let rejection: Arc<OnceLock<String>> = Arc::new(OnceLock::new());
        let rejected = rejection.clone();

        let service = tower::service_fn(move |_: Uri| {
            let connector = connector.clone();
            let server_name = server_name.clone();
            let address = address.clone();
            let rejected = rejected.clone();

            async move {
                let tcp = TcpStream::connect(address).await?;
                let stream = connector.connect(server_name, tcp).await.map_err(|e| {
                    if let Some(reason) = tls::certificate_rejection(&e) {
                        let _ = rejected.set(reason);
                    }
                    e
                })?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        });

        let connecting = channel.connect_with_connector(service);
        let connected = tokio::time::timeout(endpoint.connect_timeout, connecting).await;

        if let Some(reason) = rejection.get() {
            return Err(TransportError::CertificateRejected(reason.clone()));
        }

        match connected {
            Ok(result) => result.map_err(|e| connect_failed(endpoint, &e)),
            Err(_) => Err(connect_timed_out(endpoint)),
        }
    }
}

impl Default for GrpcTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GrpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcTransport")
            .field("state", &self.state)
            .finish()
    }
}

#[async_trait]
impl FlightTransport for GrpcTransport {
    async fn connect(&mut self, endpoint: &EndpointConfig) -> Result<(), TransportError> {
        if self.state != ConnectionState::Unconnected {
            return Err(TransportError::ProtocolError(
                "Already connected".to_string(),
            ));
        }

        self.transition(ConnectionState::Connecting);

        match Self::open_channel(endpoint).await {
            Ok(channel) => {
                self.client = Some(FlightServiceClient::new(channel));
                self.transition(ConnectionState::Authenticating);
                Ok(())
            }
            Err(e) => {
                self.transition(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    async fn handshake(&mut self, headers: &CallMetadata) -> Result<HandshakeInfo, TransportError> {
        if self.state != ConnectionState::Authenticating {
            return Err(TransportError::ProtocolError(
                "Must connect before the handshake".to_string(),
            ));
        }

        let client = self
            .client
            .as_mut()
            .ok_or_else(|| TransportError::ProtocolError("Not connected".to_string()))?;

        let message = HandshakeRequest {
            protocol_version: 0,
            payload: Bytes::new(),
        };
        let request = with_metadata(futures_util::stream::iter(vec![message]), headers)?;

        let result = run_handshake(client, request).await;

        match result {
            Ok(info) => {
                self.transition(ConnectionState::Authenticated);
                debug!(bearer_returned = info.bearer.is_some(), "Handshake completed");
                Ok(info)
            }
            Err(e) => {
                self.transition(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    async fn get_flight_info(
        &mut self,
        command: &str,
        headers: &CallMetadata,
    ) -> Result<Vec<Bytes>, TransportError> {
        let request = with_metadata(FlightDescriptor::new_cmd(command.to_string()), headers)?;
        let client = self.client()?;

        let info = client
            .get_flight_info(request)
            .await
            .map_err(|status| TransportError::from_status(&status))?
            .into_inner();

        let tickets = info
            .endpoint
            .into_iter()
            .map(|endpoint| {
                endpoint.ticket.map(|t| t.ticket).ok_or_else(|| {
                    TransportError::ProtocolError("Flight endpoint without ticket".to_string())
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(endpoints = tickets.len(), "Received flight info");
        Ok(tickets)
    }

    async fn do_get(
        &mut self,
        ticket: Bytes,
        headers: &CallMetadata,
    ) -> Result<BatchStream, TransportError> {
        let request = with_metadata(Ticket { ticket }, headers)?;
        let client = self.client()?;

        let data = client
            .do_get(request)
            .await
            .map_err(|status| TransportError::from_status(&status))?
            .into_inner()
            .map_err(FlightError::from);

        // Dictionary and empty messages carry nothing for the caller
        let payloads = FlightDataDecoder::new(data).filter_map(|decoded| {
            let item = match decoded {
                Ok(decoded) => match decoded.payload {
                    DecodedPayload::Schema(schema) => Some(Ok(FlightPayload::Schema(schema))),
                    DecodedPayload::RecordBatch(batch) => Some(Ok(FlightPayload::Batch(batch))),
                    DecodedPayload::None => None,
                },
                Err(e) => Some(Err(TransportError::from(e))),
            };
            future::ready(item)
        });

        Ok(payloads.boxed())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }

        // Dropping the client releases the channel
        self.client = None;
        self.transition(ConnectionState::Closed);

        Ok(())
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Authenticating | ConnectionState::Authenticated
        )
    }
}

/// Send the handshake and read the server's reply.
async fn run_handshake<S>(
    client: &mut FlightServiceClient<Channel>,
    request: Request<S>,
) -> Result<HandshakeInfo, TransportError>
where
    S: futures_util::Stream<Item = HandshakeRequest> + Send + 'static,
{
    let response = client
        .handshake(request)
        .await
        .map_err(|status| TransportError::from_status(&status))?;

    let bearer = response
        .metadata()
        .get(AUTHORIZATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut stream = response.into_inner();
    let payload = match stream.message().await {
        Ok(Some(reply)) => reply.payload,
        Ok(None) => Bytes::new(),
        Err(status) => return Err(TransportError::from_status(&status)),
    };

    Ok(HandshakeInfo { bearer, payload })
}

/// Wrap a message in a request carrying the given headers.
fn with_metadata<T>(message: T, headers: &CallMetadata) -> Result<Request<T>, TransportError> {
    let mut request = Request::new(message);

    for (name, value) in headers.iter() {
        // Binary (`-bin`) keys are rejected by the ASCII key parser
        let key = AsciiMetadataKey::from_bytes(name.as_bytes()).map_err(|e| {
            TransportError::InvalidMetadata(format!("Invalid header name '{}': {}", name, e))
        })?;
        let value: AsciiMetadataValue = value.parse().map_err(|e| {
            TransportError::InvalidMetadata(format!("Invalid value for header '{}': {}", name, e))
        })?;
        request.metadata_mut().insert(key, value);
    }

    Ok(request)
}

fn connect_failed(endpoint: &EndpointConfig, err: &tonic::transport::Error) -> TransportError {
    use std::error::Error as _;

    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    TransportError::ConnectFailed {
        endpoint: endpoint.authority(),
        message,
    }
}

fn connect_timed_out(endpoint: &EndpointConfig) -> TransportError {
    TransportError::ConnectFailed {
        endpoint: endpoint.authority(),
        message: format!(
            "Connection timeout after {}ms",
            endpoint.connect_timeout.as_millis()
        ),
    }
}
