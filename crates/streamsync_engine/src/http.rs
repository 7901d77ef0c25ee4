//! Production transports: reqwest for data channels, tokio-tungstenite for
//! the control channel.

use crate::error::{EngineError, EngineResult};
use crate::transport::{
    ControlConnection, ControlRequest, ControlTransport, StreamRequest, StreamResponse,
    StreamTransport,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Data-channel transport over HTTP/1.1 or HTTP/2.
#[derive(Debug, Clone)]
pub struct HttpStreamTransport {
    client: reqwest::Client,
}

impl HttpStreamTransport {
    /// Creates a transport. `accept_invalid_certs` disables TLS verification.
    pub fn new(accept_invalid_certs: bool) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Builds the full URL for a data-channel request.
pub fn request_url(request: &StreamRequest) -> EngineResult<reqwest::Url> {
    let base = request.base_url.trim_end_matches('/');
    let mut url = reqwest::Url::parse(&format!("{base}{}", request.path))
        .map_err(|e| EngineError::Config(format!("invalid url {base}{}: {e}", request.path)))?;
    if !request.query.is_empty() {
        url.query_pairs_mut().extend_pairs(
            request
                .query
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
    }
    Ok(url)
}

#[async_trait]
impl StreamTransport for HttpStreamTransport {
    async fn open(&self, request: StreamRequest) -> EngineResult<StreamResponse> {
        let url = request_url(&request)?;
        let mut builder = self.client.get(url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_builder() {
                EngineError::transport_fatal(e.to_string())
            } else {
                EngineError::transport_retryable(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let content_length = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| EngineError::transport_retryable(e.to_string())))
            .boxed();

        Ok(StreamResponse {
            status,
            content_length,
            body,
        })
    }
}

/// Options for [`WebSocketControlTransport`].
#[derive(Debug, Clone)]
pub struct WebSocketOptions {
    /// Interval between keepalive pings. Zero disables them.
    pub keepalive_interval: Duration,
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// Skip TLS certificate verification.
    pub accept_invalid_certs: bool,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            connect_timeout: CONNECT_TIMEOUT,
            accept_invalid_certs: false,
        }
    }
}

/// Control-channel transport over a WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketControlTransport {
    options: WebSocketOptions,
    tls: Arc<rustls::ClientConfig>,
}

impl WebSocketControlTransport {
    /// Creates a transport.
    pub fn new(options: WebSocketOptions) -> EngineResult<Self> {
        let tls = tls_config(options.accept_invalid_certs)?;
        Ok(Self { options, tls })
    }
}

#[async_trait]
impl ControlTransport for WebSocketControlTransport {
    async fn open(&self, request: ControlRequest) -> EngineResult<ControlConnection> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| EngineError::Config(format!("invalid control url: {e}")))?;
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| EngineError::Config(format!("invalid header name: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| EngineError::Config(format!("invalid header value: {e}")))?;
            ws_request.headers_mut().insert(name, value);
        }

        let connector = Connector::Rustls(self.tls.clone());
        let handshake = connect_async_tls_with_config(ws_request, None, false, Some(connector));
        let (socket, _response) =
            match tokio::time::timeout(self.options.connect_timeout, handshake).await {
                Err(_) => {
                    return Err(EngineError::transport_retryable(
                        "control handshake timed out",
                    ))
                }
                Ok(Err(WsError::Http(response))) => {
                    let status = response.status().as_u16();
                    let body = response
                        .body()
                        .as_ref()
                        .map(|b| String::from_utf8_lossy(b).into_owned())
                        .unwrap_or_default();
                    return Err(EngineError::Http { status, body });
                }
                Ok(Err(e)) => return Err(EngineError::transport_retryable(e.to_string())),
                Ok(Ok(pair)) => pair,
            };

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        tokio::spawn(pump(
            socket,
            outbound_rx,
            inbound_tx,
            self.options.keepalive_interval,
        ));
        Ok(ControlConnection { outbound, inbound })
    }
}

async fn pump(
    mut socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<String>,
    keepalive: Duration,
) {
    let ping_enabled = !keepalive.is_zero();
    let mut ticker = tokio::time::interval(keepalive.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if let Err(e) = socket.send(Message::Text(text)).await {
                        warn!(error = %e, "control send failed");
                        break;
                    }
                }
                None => {
                    let _ = socket.close(None).await;
                    break;
                }
            },
            incoming = socket.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(text.to_string()).is_err() {
                        let _ = socket.close(None).await;
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => {
                        if inbound.send(text).is_err() {
                            let _ = socket.close(None).await;
                            break;
                        }
                    }
                    Err(_) => warn!("dropping non-utf8 control frame"),
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = socket.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "control socket closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "control socket error");
                    break;
                }
                None => break,
            },
            _ = ticker.tick(), if ping_enabled => {
                if let Err(e) = socket.send(Message::Ping(Default::default())).await {
                    warn!(error = %e, "keepalive ping failed");
                    break;
                }
            }
        }
    }
}

fn tls_config(accept_invalid_certs: bool) -> EngineResult<Arc<rustls::ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| EngineError::Config(format!("tls setup failed: {e}")))?;

    let config = if accept_invalid_certs {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(Arc::new(config))
}

/// Accepts any server certificate while still checking handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(base: &str, path: &str, query: &[(&str, &str)]) -> StreamRequest {
        StreamRequest {
            base_url: base.into(),
            path: path.into(),
            query: query
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            headers: Vec::new(),
        }
    }

    #[test]
    fn url_appends_encoded_query() {
        let url = request_url(&request(
            "https://eda.local:9443/",
            "/core/query/v1/eql",
            &[("eventclient", "ec 1"), ("stream", "q1"), ("query", ".x where (a = \"b\")")],
        ))
        .unwrap();
        assert_eq!(url.path(), "/core/query/v1/eql");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs[0], ("eventclient".into(), "ec 1".into()));
        assert_eq!(pairs[2].1, ".x where (a = \"b\")");
    }

    #[test]
    fn url_keeps_existing_path_query() {
        let url = request_url(&request("http://h", "/summary?size=5", &[("stream", "s")])).unwrap();
        assert_eq!(url.query(), Some("size=5&stream=s"));
    }

    #[test]
    fn invalid_base_is_config_error() {
        let err = request_url(&request("not a url", "/x", &[])).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn transports_build() {
        assert!(HttpStreamTransport::new(false).is_ok());
        assert!(WebSocketControlTransport::new(WebSocketOptions {
            accept_invalid_certs: true,
            ..WebSocketOptions::default()
        })
        .is_ok());
    }
}
