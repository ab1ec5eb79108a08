//! `quinn`-backed [`Transport`], gated behind the `quinn-transport` feature
//! (off by default) — the same "real but optional backend" pattern
//! `rt-eink`'s `hardware` feature gates a concrete hardware driver behind.
//!
//! Every connection carries one unidirectional QUIC stream per
//! [`crate::ProtocolConnectionSubstrate`] stream: writes are buffered
//! through a channel into a task that owns the `quinn::SendStream`, and
//! inbound uni streams are read to completion and reported as one
//! [`QuinnEvent::StreamData`] event, mirroring how CBOR messages are
//! already whole values by the time they reach [`osp_demux`].
//!
//! Certificate verification here is a self-signed, any-cert-accepted setup
//! suitable for the same-process/local-network use this corpus exercises
//! elsewhere (e.g. `rt-eink`'s hardware feature, gated rather than default).
//! A production embedder is expected to supply its own `rustls` configs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use osp_wire::Endpoint;
use tokio::sync::mpsc;

use crate::traits::Transport;
use crate::types::{ConnectionHandle, StreamHandle, TransportError};

const SERVER_NAME: &str = "osp-endpoint.local";
const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Events the background connection/stream tasks report. The owner of a
/// [`QuinnTransport`] drains these (typically inside an
/// `osp_time::TaskRunner` loop) and calls the matching
/// `ProtocolConnectionSubstrate::on_*` method for each.
pub enum QuinnEvent {
    ConnectionEstablished {
        attempt_id: u64,
        endpoint: Endpoint,
        connection: ConnectionHandle,
    },
    ConnectionFailed {
        attempt_id: u64,
        endpoint: Endpoint,
    },
    IncomingStream {
        connection: ConnectionHandle,
        stream: StreamHandle,
    },
    StreamData {
        stream: StreamHandle,
        bytes: Vec<u8>,
    },
    StreamClosed {
        stream: StreamHandle,
    },
    ConnectionClosed {
        connection: ConnectionHandle,
    },
}

pub struct QuinnTransport {
    endpoint: quinn::Endpoint,
    events_tx: mpsc::UnboundedSender<QuinnEvent>,
    connections: Arc<Mutex<HashMap<ConnectionHandle, quinn::Connection>>>,
    send_senders: Arc<Mutex<HashMap<StreamHandle, mpsc::UnboundedSender<Vec<u8>>>>>,
    connect_tasks: Mutex<HashMap<u64, tokio::task::JoinHandle<()>>>,
    next_connection_id: Arc<AtomicU64>,
    next_stream_id: Arc<AtomicU64>,
}

impl QuinnTransport {
    /// A client-only endpoint: can dial out via `start_connect`, cannot
    /// accept inbound connections.
    pub fn client(events_tx: mpsc::UnboundedSender<QuinnEvent>) -> Result<Self, TransportError> {
        let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().expect("valid addr"))
            .map_err(|e| TransportError::Other(e.to_string()))?;
        endpoint.set_default_client_config(insecure_client_config()?);
        Ok(Self::from_endpoint(endpoint, events_tx))
    }

    /// A server endpoint bound to `bind_addr`, self-signed for `SERVER_NAME`.
    /// Spawns the accept loop immediately.
    pub fn server(
        bind_addr: SocketAddr,
        events_tx: mpsc::UnboundedSender<QuinnEvent>,
    ) -> Result<Self, TransportError> {
        let server_config = self_signed_server_config()?;
        let endpoint = quinn::Endpoint::server(server_config, bind_addr)
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let transport = Self::from_endpoint(endpoint.clone(), events_tx.clone());
        transport.spawn_accept_loop(endpoint, events_tx);
        Ok(transport)
    }

    fn from_endpoint(endpoint: quinn::Endpoint, events_tx: mpsc::UnboundedSender<QuinnEvent>) -> Self {
        Self {
            endpoint,
            events_tx,
            connections: Arc::new(Mutex::new(HashMap::new())),
            send_senders: Arc::new(Mutex::new(HashMap::new())),
            connect_tasks: Mutex::new(HashMap::new()),
            next_connection_id: Arc::new(AtomicU64::new(1)),
            next_stream_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn spawn_accept_loop(&self, endpoint: quinn::Endpoint, events_tx: mpsc::UnboundedSender<QuinnEvent>) {
        let connections = self.connections.clone();
        let next_connection_id = self.next_connection_id.clone();
        let next_stream_id = self.next_stream_id.clone();
        tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let events_tx = events_tx.clone();
                let connections = connections.clone();
                let next_connection_id = next_connection_id.clone();
                let next_stream_id = next_stream_id.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(connection) => {
                            let handle = ConnectionHandle(next_connection_id.fetch_add(1, Ordering::Relaxed));
                            connections.lock().expect("poisoned").insert(handle, connection.clone());
                            spawn_read_loop(connection, handle, events_tx, next_stream_id);
                        }
                        Err(err) => tracing::warn!(%err, "incoming QUIC handshake failed"),
                    }
                });
            }
        });
    }
}

impl Transport for QuinnTransport {
    fn start_connect(&mut self, endpoint: Endpoint, attempt_id: u64) {
        let addr = SocketAddr::new(endpoint.addr, endpoint.port);
        let quinn_endpoint = self.endpoint.clone();
        let events_tx = self.events_tx.clone();
        let connections = self.connections.clone();
        let next_connection_id = self.next_connection_id.clone();
        let next_stream_id = self.next_stream_id.clone();

        let task = tokio::spawn(async move {
            let connecting = match quinn_endpoint.connect(addr, SERVER_NAME) {
                Ok(c) => c,
                Err(err) => {
                    tracing::warn!(%err, %addr, "quic connect setup failed");
                    let _ = events_tx.send(QuinnEvent::ConnectionFailed { attempt_id, endpoint });
                    return;
                }
            };
            match connecting.await {
                Ok(connection) => {
                    let handle = ConnectionHandle(next_connection_id.fetch_add(1, Ordering::Relaxed));
                    connections.lock().expect("poisoned").insert(handle, connection.clone());
                    let _ = events_tx.send(QuinnEvent::ConnectionEstablished {
                        attempt_id,
                        endpoint,
                        connection: handle,
                    });
                    spawn_read_loop(connection, handle, events_tx, next_stream_id);
                }
                Err(err) => {
                    tracing::warn!(%err, %addr, "quic handshake failed");
                    let _ = events_tx.send(QuinnEvent::ConnectionFailed { attempt_id, endpoint });
                }
            }
        });
        self.connect_tasks.lock().expect("poisoned").insert(attempt_id, task);
    }

    fn cancel_connect(&mut self, attempt_id: u64) {
        if let Some(task) = self.connect_tasks.lock().expect("poisoned").remove(&attempt_id) {
            task.abort();
        }
    }

    fn open_stream(&mut self, connection: ConnectionHandle) -> Option<StreamHandle> {
        let conn = self.connections.lock().expect("poisoned").get(&connection)?.clone();
        let stream = StreamHandle(self.next_stream_id.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.send_senders.lock().expect("poisoned").insert(stream, tx);
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            let mut send_stream = match conn.open_uni().await {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!(%err, "failed to open outbound quic stream");
                    return;
                }
            };
            while let Some(bytes) = rx.recv().await {
                if let Err(err) = send_stream.write_all(&bytes).await {
                    tracing::warn!(%err, "quic stream write failed");
                    break;
                }
            }
            let _ = send_stream.finish();
            let _ = events_tx.send(QuinnEvent::StreamClosed { stream });
        });
        Some(stream)
    }

    fn write(&mut self, stream: StreamHandle, bytes: &[u8]) -> Result<(), TransportError> {
        self.send_senders
            .lock()
            .expect("poisoned")
            .get(&stream)
            .ok_or(TransportError::StreamClosed)?
            .send(bytes.to_vec())
            .map_err(|_| TransportError::StreamClosed)
    }

    fn close_stream(&mut self, stream: StreamHandle) {
        self.send_senders.lock().expect("poisoned").remove(&stream);
    }
}

fn spawn_read_loop(
    connection: quinn::Connection,
    connection_handle: ConnectionHandle,
    events_tx: mpsc::UnboundedSender<QuinnEvent>,
    next_stream_id: Arc<AtomicU64>,
) {
    tokio::spawn(async move {
        loop {
            match connection.accept_uni().await {
                Ok(mut recv_stream) => {
                    let stream = StreamHandle(next_stream_id.fetch_add(1, Ordering::Relaxed));
                    let _ = events_tx.send(QuinnEvent::IncomingStream {
                        connection: connection_handle,
                        stream,
                    });
                    let events_tx = events_tx.clone();
                    tokio::spawn(async move {
                        match recv_stream.read_to_end(MAX_MESSAGE_BYTES).await {
                            Ok(bytes) => {
                                let _ = events_tx.send(QuinnEvent::StreamData { stream, bytes });
                            }
                            Err(err) => tracing::warn!(%err, "quic stream read failed"),
                        }
                        let _ = events_tx.send(QuinnEvent::StreamClosed { stream });
                    });
                }
                Err(err) => {
                    tracing::debug!(%err, "quic connection no longer accepting streams");
                    let _ = events_tx.send(QuinnEvent::ConnectionClosed {
                        connection: connection_handle,
                    });
                    break;
                }
            }
        }
    });
}

fn insecure_client_config() -> Result<quinn::ClientConfig, TransportError> {
    let crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| TransportError::Other(e.to_string()))?;
    Ok(quinn::ClientConfig::new(Arc::new(quic_crypto)))
}

fn self_signed_server_config() -> Result<quinn::ServerConfig, TransportError> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_owned()])
            .map_err(|e| TransportError::Other(e.to_string()))?;
    let cert_der = cert.der().clone();
    let key_der = rustls::pki_types::PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| TransportError::Other(e.to_string()))?;
    quinn::ServerConfig::with_single_cert(vec![cert_der], key_der)
        .map_err(|e| TransportError::Other(e.to_string()))
}

/// Accepts any server certificate. There is no PKI to validate against for
/// a same-process/local-network endpoint substrate (spec §1 non-goal: a
/// concrete TLS implementation is out of scope) — a production embedder
/// supplies its own `rustls::ClientConfig` instead of this one.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
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
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
