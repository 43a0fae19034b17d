// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC server helpers for the controller and runner daemons.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::{Endpoint, Incoming, RecvStream, SendStream, ServerConfig, TransportConfig};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::frame::{Frame, FrameError, read_frame, write_frame};

/// Errors that can occur in the QUIC server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("TLS error: {0}")]
    Tls(String),
}

/// Configuration for the QUIC server.
#[derive(Debug, Clone)]
pub struct TesseraServerConfig {
    pub bind_addr: SocketAddr,
    /// TLS certificate chain (PEM format).
    pub cert_pem: Vec<u8>,
    /// TLS private key (PEM format).
    pub key_pem: Vec<u8>,
    /// Maximum pending incoming connections (handshakes in progress).
    pub max_incoming: u32,
    /// Maximum concurrent bidirectional streams per connection.
    pub max_bi_streams: u32,
    /// Idle timeout in milliseconds.
    pub idle_timeout_ms: u64,
    /// Server-side keep-alive interval in milliseconds (0 to disable).
    pub keep_alive_interval_ms: u64,
    /// UDP socket buffer size in bytes (0 for OS default).
    pub udp_buffer_size: usize,
}

impl Default for TesseraServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8892".parse().unwrap(),
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
            max_incoming: 10_000,
            max_bi_streams: 1_000,
            idle_timeout_ms: 300_000,
            keep_alive_interval_ms: 15_000,
            udp_buffer_size: 2 * 1024 * 1024,
        }
    }
}

/// QUIC server endpoint.
pub struct TesseraServer {
    endpoint: Endpoint,
}

impl TesseraServer {
    /// Create a new server with the given configuration.
    pub fn new(config: TesseraServerConfig) -> Result<Self, ServerError> {
        use socket2::{Domain, Protocol, Socket, Type};

        let server_config = Self::build_server_config(&config)?;

        let domain = if config.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if config.udp_buffer_size > 0 {
            if let Err(e) = socket.set_recv_buffer_size(config.udp_buffer_size) {
                warn!(size = config.udp_buffer_size, error = %e, "failed to set UDP receive buffer size");
            }
            if let Err(e) = socket.set_send_buffer_size(config.udp_buffer_size) {
                warn!(size = config.udp_buffer_size, error = %e, "failed to set UDP send buffer size");
            }
        }
        socket.bind(&config.bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();

        let runtime = quinn::default_runtime()
            .ok_or_else(|| ServerError::Bind(std::io::Error::other("no async runtime found")))?;
        let endpoint = Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(server_config),
            runtime.wrap_udp_socket(std_socket)?,
            runtime,
        )?;

        info!(
            addr = %config.bind_addr,
            max_incoming = config.max_incoming,
            idle_timeout_ms = config.idle_timeout_ms,
            "QUIC server bound"
        );

        Ok(Self { endpoint })
    }

    /// Create a server with a self-signed certificate for local development.
    pub fn dev(bind_addr: SocketAddr) -> Result<Self, ServerError> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| ServerError::Tls(e.to_string()))?;
        Self::new(TesseraServerConfig {
            bind_addr,
            cert_pem: cert.cert.pem().into_bytes(),
            key_pem: cert.key_pair.serialize_pem().into_bytes(),
            ..Default::default()
        })
    }

    fn build_server_config(config: &TesseraServerConfig) -> Result<ServerConfig, ServerError> {
        let certs = rustls_pemfile::certs(&mut config.cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServerError::Tls(format!("failed to parse certificates: {e}")))?;
        let key = rustls_pemfile::private_key(&mut config.key_pem.as_slice())
            .map_err(|e| ServerError::Tls(format!("failed to parse private key: {e}")))?
            .ok_or_else(|| ServerError::Tls("no private key found".to_string()))?;

        let crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(
            std::time::Duration::from_millis(config.idle_timeout_ms)
                .try_into()
                .unwrap(),
        ));
        transport.max_concurrent_bidi_streams(config.max_bi_streams.into());
        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(std::time::Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
                .map_err(|e| ServerError::Tls(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(transport));
        server_config.max_incoming(config.max_incoming as usize);
        Ok(server_config)
    }

    /// Accept the next incoming connection.
    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server closing");
    }

    /// Accept connections forever, spawning `handler` per stream.
    pub async fn run<H, Fut>(&self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(StreamHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        while let Some(incoming) = self.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                let connection = match incoming.await {
                    Ok(connection) => connection,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        return;
                    }
                };
                let remote_addr = connection.remote_address();
                debug!(%remote_addr, "accepted connection");

                loop {
                    match connection.accept_bi().await {
                        Ok((send, recv)) => {
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                handler(StreamHandler::new(send, recv)).await;
                            });
                        }
                        Err(
                            quinn::ConnectionError::ApplicationClosed(_)
                            | quinn::ConnectionError::LocallyClosed,
                        ) => {
                            debug!(%remote_addr, "connection closed");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "error accepting stream");
                            break;
                        }
                    }
                }
            });
        }
        Ok(())
    }
}

/// Handler for one bidirectional QUIC stream.
pub struct StreamHandler {
    send: SendStream,
    recv: RecvStream,
}

impl StreamHandler {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    /// Read the next frame from the stream.
    pub async fn read_frame(&mut self) -> Result<Frame, ServerError> {
        Ok(read_frame(&mut self.recv).await?)
    }

    /// Write a frame to the stream.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ServerError> {
        Ok(write_frame(&mut self.send, frame).await?)
    }

    /// Send a single response message.
    pub async fn respond<M: prost::Message>(&mut self, msg: &M) -> Result<(), ServerError> {
        let frame = Frame::response(msg)?;
        self.write_frame(&frame).await
    }

    /// Send one item of a server stream.
    pub async fn send_stream_item<M: prost::Message>(&mut self, msg: &M) -> Result<(), ServerError> {
        let frame = Frame::stream_data(msg)?;
        self.write_frame(&frame).await
    }

    /// Terminate a finite server stream.
    pub async fn end_stream(&mut self) -> Result<(), ServerError> {
        self.write_frame(&Frame::stream_end()).await
    }

    /// Finish the send side (signal no more data).
    pub fn finish(&mut self) -> Result<(), ServerError> {
        self.send
            .finish()
            .map_err(|e| ServerError::Frame(FrameError::Io(std::io::Error::other(e))))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TesseraServerConfig::default();
        assert_eq!(config.max_incoming, 10_000);
        assert_eq!(config.max_bi_streams, 1_000);
        assert!(config.cert_pem.is_empty());
    }

    #[tokio::test]
    async fn dev_server_binds_ephemeral_port() {
        let server = TesseraServer::dev("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(server.local_addr().unwrap().port() > 0);
        server.close();
    }

    #[tokio::test]
    async fn accept_after_close_returns_none() {
        let server = TesseraServer::dev("127.0.0.1:0".parse().unwrap()).unwrap();
        server.close();
        assert!(server.accept().await.is_none());
    }

    #[test]
    fn server_rejects_garbage_certificates() {
        let config = TesseraServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            cert_pem: b"not a cert".to_vec(),
            key_pem: b"not a key".to_vec(),
            ..Default::default()
        };
        assert!(TesseraServer::new(config).is_err());
    }

    #[test]
    fn build_server_config_with_generated_cert() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let config = TesseraServerConfig {
            cert_pem: cert.cert.pem().into_bytes(),
            key_pem: cert.key_pair.serialize_pem().into_bytes(),
            ..Default::default()
        };
        assert!(TesseraServer::build_server_config(&config).is_ok());
    }
}
