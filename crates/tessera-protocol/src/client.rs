// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC client helpers for connecting to tessera services.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use quinn::{ClientConfig, Connection, Endpoint, TransportConfig};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::frame::{Frame, FrameError, FramedStream, MessageType, read_frame, write_frame};

/// Errors that can occur in the QUIC client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream closed: {0}")]
    ClosedStream(#[from] quinn::ClosedStream),

    #[error("no connection established")]
    NotConnected,

    #[error("connection timed out after {0}ms")]
    Timeout(u64),

    #[error("service error: {0}")]
    Service(String),
}

/// Configuration for the QUIC client.
#[derive(Debug, Clone)]
pub struct TesseraClientConfig {
    /// Server address to connect to.
    pub server_addr: SocketAddr,
    /// Server name for TLS verification (use "localhost" for local dev).
    pub server_name: String,
    /// Skip certificate verification (for development only!).
    pub dangerous_skip_cert_verification: bool,
    /// Keep-alive interval in milliseconds (0 to disable).
    pub keep_alive_interval_ms: u64,
    /// Idle timeout in milliseconds.
    pub idle_timeout_ms: u64,
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for TesseraClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:8892".parse().unwrap(),
            server_name: "localhost".to_string(),
            dangerous_skip_cert_verification: false,
            keep_alive_interval_ms: 10_000,
            idle_timeout_ms: 300_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// QUIC client for tessera services.
pub struct TesseraClient {
    endpoint: Endpoint,
    connection: Mutex<Option<Connection>>,
    config: TesseraClientConfig,
}

impl TesseraClient {
    /// Create a new client with the given configuration.
    pub fn new(config: TesseraClientConfig) -> Result<Self, ClientError> {
        let mut endpoint = Endpoint::client("0.0.0.0:0".parse().unwrap())?;
        endpoint.set_default_client_config(Self::build_client_config(&config)?);
        Ok(Self {
            endpoint,
            connection: Mutex::new(None),
            config,
        })
    }

    /// Create a client for a local dev server with a self-signed certificate.
    pub fn dev(server_addr: SocketAddr) -> Result<Self, ClientError> {
        Self::new(TesseraClientConfig {
            server_addr,
            dangerous_skip_cert_verification: true,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &TesseraClientConfig {
        &self.config
    }

    fn build_client_config(config: &TesseraClientConfig) -> Result<ClientConfig, ClientError> {
        let crypto = if config.dangerous_skip_cert_verification {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        let mut transport = TransportConfig::default();
        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }
        transport.max_idle_timeout(Some(
            Duration::from_millis(config.idle_timeout_ms)
                .try_into()
                .unwrap(),
        ));

        let mut client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto).unwrap(),
        ));
        client_config.transport_config(Arc::new(transport));
        Ok(client_config)
    }

    /// Connect to the server, reusing a live connection when one exists.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut conn_guard = self.connection.lock().await;

        if let Some(ref conn) = *conn_guard
            && conn.close_reason().is_none()
        {
            debug!("reusing existing connection");
            return Ok(());
        }

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let connecting = self
            .endpoint
            .connect(self.config.server_addr, &self.config.server_name)?;
        let connection = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| ClientError::Timeout(self.config.connect_timeout_ms))??;

        debug!(addr = %self.config.server_addr, "connected");
        *conn_guard = Some(connection);
        Ok(())
    }

    async fn get_connection(&self) -> Result<Connection, ClientError> {
        self.connect().await?;
        let conn_guard = self.connection.lock().await;
        conn_guard.clone().ok_or(ClientError::NotConnected)
    }

    /// Open a new bidirectional framed stream.
    pub async fn open_stream(
        &self,
    ) -> Result<FramedStream<(quinn::SendStream, quinn::RecvStream)>, ClientError> {
        let conn = self.get_connection().await?;
        let (send, recv) = conn.open_bi().await?;
        Ok(FramedStream::new((send, recv)))
    }

    /// Send a request and receive one response on a fresh stream.
    pub async fn request<Req: Message, Resp: Message + Default>(
        &self,
        request: &Req,
    ) -> Result<Resp, ClientError> {
        let conn = self.get_connection().await?;
        let (mut send, mut recv) = conn.open_bi().await?;

        write_frame(&mut send, &Frame::request(request)?).await?;
        send.finish()?;

        let frame = read_frame(&mut recv).await?;
        match frame.message_type {
            MessageType::Response => Ok(frame.decode()?),
            MessageType::Error => Err(ClientError::Service(
                String::from_utf8_lossy(&frame.payload).into_owned(),
            )),
            other => Err(FrameError::InvalidMessageType(other as u16).into()),
        }
    }

    /// Open a server stream: send the request, then hand back the framed
    /// stream positioned at the first `StreamData` frame.
    pub async fn server_stream<Req: Message>(
        &self,
        request: &Req,
    ) -> Result<FramedStream<(quinn::SendStream, quinn::RecvStream)>, ClientError> {
        let conn = self.get_connection().await?;
        let (mut send, recv) = conn.open_bi().await?;
        write_frame(&mut send, &Frame::request(request)?).await?;
        Ok(FramedStream::new((send, recv)))
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut conn_guard = self.connection.lock().await;
        if let Some(conn) = conn_guard.take() {
            conn.close(0u32.into(), b"client closing");
        }
    }

    pub async fn is_connected(&self) -> bool {
        let conn_guard = self.connection.lock().await;
        match *conn_guard {
            Some(ref conn) => conn.close_reason().is_none(),
            None => false,
        }
    }
}

impl Drop for TesseraClient {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.connection.try_lock()
            && let Some(conn) = guard.take()
        {
            conn.close(0u32.into(), b"client dropped");
        }
    }
}

/// Exponential reconnect backoff, capped.
///
/// Used by long-lived server streams: the delay doubles from `initial` on
/// consecutive failures up to `max`, and resets once a stream yields a
/// message.
#[derive(Debug, Clone)]
pub struct StreamBackoff {
    pub initial: Duration,
    pub max: Duration,
    current: Duration,
}

impl Default for StreamBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(1))
    }
}

impl StreamBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Next delay to wait before reconnecting.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Consume a server stream forever, reconnecting on any error.
///
/// Each decoded item is passed to `handler`; a handler error tears the stream
/// down and reconnects like a transport error would. Returns only when
/// `shutdown` fires.
pub async fn retry_server_stream<Req, Item, H, Fut>(
    client: Arc<TesseraClient>,
    request: Req,
    shutdown: Arc<tokio::sync::Notify>,
    mut handler: H,
) where
    Req: Message + Clone,
    Item: Message + Default,
    H: FnMut(Item) -> Fut,
    Fut: Future<Output = Result<(), ClientError>>,
{
    let mut backoff = StreamBackoff::default();
    loop {
        let attempt = async {
            let mut stream = client.server_stream(&request).await?;
            loop {
                let item: Option<Item> = stream.read_stream_item().await?;
                match item {
                    Some(item) => {
                        backoff.reset();
                        handler(item).await?;
                    }
                    None => return Ok::<(), ClientError>(()),
                }
            }
        };

        tokio::select! {
            _ = shutdown.notified() => {
                info!("server stream shutting down");
                return;
            }
            result = attempt => {
                if let Err(e) = result {
                    debug!(error = %e, "server stream interrupted");
                } else {
                    warn!("server stream ended, reconnecting");
                }
            }
        }

        let delay = backoff.next();
        tokio::select! {
            _ = shutdown.notified() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Certificate verifier that skips all verification (for development only!).
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TesseraClientConfig::default();
        assert_eq!(config.server_name, "localhost");
        assert!(!config.dangerous_skip_cert_verification);
        assert_eq!(config.keep_alive_interval_ms, 10_000);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = StreamBackoff::default();
        assert_eq!(backoff.next(), Duration::from_millis(100));
        assert_eq!(backoff.next(), Duration::from_millis(200));
        assert_eq!(backoff.next(), Duration::from_millis(400));
        assert_eq!(backoff.next(), Duration::from_millis(800));
        assert_eq!(backoff.next(), Duration::from_secs(1));
        assert_eq!(backoff.next(), Duration::from_secs(1));
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn client_creation() {
        let client = TesseraClient::dev("127.0.0.1:8892".parse().unwrap());
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn initial_state_is_disconnected() {
        let client = TesseraClient::dev("127.0.0.1:8892".parse().unwrap()).unwrap();
        assert!(!client.is_connected().await);
        client.close().await;
    }

    #[tokio::test]
    async fn connect_times_out_without_server() {
        let client = TesseraClient::new(TesseraClientConfig {
            server_addr: "127.0.0.1:59901".parse().unwrap(),
            dangerous_skip_cert_verification: true,
            connect_timeout_ms: 100,
            ..Default::default()
        })
        .unwrap();
        assert!(client.connect().await.is_err());
    }
}
