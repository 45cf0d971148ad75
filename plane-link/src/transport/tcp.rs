//! TCP transport.
//!
//! Before any frame is exchanged the dialing side sends a service preface
//! (`u16` big-endian length + UTF-8 service id) and the listener answers with
//! one byte: [`ACK_ACCEPT`] if it serves that id, [`ACK_REJECT`] otherwise.
//! A rejected stream is closed by both sides.
//!
//! The listener accepts sockets on a background task and runs each preface
//! exchange on its own task, so a client that never sends its preface only
//! holds up itself.

use std::time::Duration;

use async_trait::async_trait;
use plane_types::ServiceId;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::{Accepted, BoxStream, Listener, Transport, TransportError};

const ACK_ACCEPT: u8 = 0x01;
const ACK_REJECT: u8 = 0x00;

/// Longest service id accepted in a preface.
const MAX_SERVICE_LEN: usize = 256;

/// How long the listener waits for a new connection's preface.
const PREFACE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Handshaken connections waiting for `Listener::accept`.
const ACCEPT_BACKLOG: usize = 32;

/// Transport over plain TCP sockets.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    bind_address: String,
}

impl TcpTransport {
    /// Create a transport whose listeners bind to `bind_address`
    /// (e.g. `0.0.0.0:7117`, or port 0 for an ephemeral port).
    pub fn new(bind_address: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, service: &ServiceId) -> Result<Box<dyn Listener>, TransportError> {
        let listener = TcpListener::bind(&self.bind_address)
            .await
            .map_err(|e| TransportError::ListenFailed(format!("{}: {e}", self.bind_address)))?;
        let local = listener.local_addr()?;
        tracing::debug!(address = %local, service = %service, "TCP listener bound");

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let cancel = CancellationToken::new();
        tokio::spawn(accept_loop(listener, service.clone(), tx, cancel.clone()));

        Ok(Box::new(TcpServiceListener {
            local_address: local.to_string(),
            incoming: rx,
            _stop: cancel.drop_guard(),
        }))
    }

    async fn connect(&self, address: &str, service: &ServiceId) -> Result<BoxStream, TransportError> {
        let mut stream = TcpStream::connect(address)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{address}: {e}")))?;
        stream.set_nodelay(true)?;

        write_preface(&mut stream, service).await?;
        let mut ack = [0u8; 1];
        stream
            .read_exact(&mut ack)
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        if ack[0] != ACK_ACCEPT {
            return Err(TransportError::ServiceMismatch {
                expected: service.to_string(),
                actual: "<rejected>".to_string(),
            });
        }
        Ok(Box::new(stream))
    }
}

struct TcpServiceListener {
    local_address: String,
    incoming: mpsc::Receiver<Result<Accepted, TransportError>>,
    /// Stops the accept task and pending handshakes when the listener drops.
    _stop: DropGuard,
}

#[async_trait]
impl Listener for TcpServiceListener {
    fn local_address(&self) -> String {
        self.local_address.clone()
    }

    async fn accept(&mut self) -> Result<Accepted, TransportError> {
        self.incoming
            .recv()
            .await
            .unwrap_or(Err(TransportError::ConnectionClosed))
    }
}

async fn accept_loop(
    listener: TcpListener,
    service: ServiceId,
    incoming: mpsc::Sender<Result<Accepted, TransportError>>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote)) => {
                tokio::spawn(handshake(
                    stream,
                    remote.to_string(),
                    service.clone(),
                    incoming.clone(),
                    cancel.child_token(),
                ));
            }
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept failed");
                if incoming.send(Err(e.into())).await.is_err() {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
}

/// Check one inbound socket's preface and hand it to the listener.
async fn handshake(
    mut stream: TcpStream,
    remote: String,
    service: ServiceId,
    incoming: mpsc::Sender<Result<Accepted, TransportError>>,
    cancel: CancellationToken,
) {
    let result = tokio::select! {
        _ = cancel.cancelled() => return,
        result = check_preface(&mut stream, &service) => result,
    };
    let accepted = result.map(|()| Accepted {
        address: remote,
        stream: Box::new(stream),
    });
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = incoming.send(accepted) => {}
    }
}

async fn check_preface(stream: &mut TcpStream, service: &ServiceId) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let offered = tokio::time::timeout(PREFACE_TIMEOUT, read_preface(stream))
        .await
        .map_err(|_| TransportError::Timeout)??;
    if offered != service.as_str() {
        let _ = stream.write_all(&[ACK_REJECT]).await;
        return Err(TransportError::ServiceMismatch {
            expected: service.to_string(),
            actual: offered,
        });
    }
    stream.write_all(&[ACK_ACCEPT]).await?;
    Ok(())
}

async fn write_preface<W>(writer: &mut W, service: &ServiceId) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = service.as_str().as_bytes();
    if bytes.len() > MAX_SERVICE_LEN {
        return Err(TransportError::ConnectionFailed(format!(
            "service id too long: {} bytes",
            bytes.len()
        )));
    }
    let mut preface = Vec::with_capacity(2 + bytes.len());
    preface.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    preface.extend_from_slice(bytes);
    writer.write_all(&preface).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_preface<R>(reader: &mut R) -> Result<String, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_SERVICE_LEN {
        return Err(TransportError::ConnectionFailed(format!(
            "service id too long: {len} bytes"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map_err(|_| TransportError::ConnectionFailed("service id is not utf-8".to_string()))
}
