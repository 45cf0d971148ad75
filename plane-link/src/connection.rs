//! Per-peer connection tasks.
//!
//! Every open stream gets exactly two tasks:
//!
//! - a reader that blocks on [`read_frame`], decodes each body and forwards
//!   it as a [`BrokerEvent`]. A body that fails to decode is reported and
//!   dropped; the loop keeps reading.
//! - a writer that drains the peer's outbound queue. It is the only task
//!   that writes to the stream, so frames never interleave.
//!
//! Both stop on the peer's [`CancellationToken`]. When the reader exits
//! (EOF, I/O error, writer failure or cancellation) it reports the close to
//! the broker exactly once.

use std::sync::Arc;
use std::time::Duration;

use plane_types::frame::{decode_body, read_frame, write_frame};
use plane_types::{PeerId, ReadOutcome, MAX_FRAME_SIZE};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerEvent, PeerSlot, Shared};
use crate::transport::BoxStream;

/// Time allowed to flush queued frames when a connection is closed locally.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

/// Broker-side handle to a running connection.
#[derive(Debug, Clone)]
pub(crate) struct PeerHandle {
    /// Distinguishes successive connections from the same peer id.
    pub serial: u64,
    /// Encoded frames waiting for the writer task.
    pub outbound: mpsc::Sender<Arc<Vec<u8>>>,
    /// Cancels both tasks.
    pub cancel: CancellationToken,
}

/// Start the reader and writer tasks for `stream`.
pub(crate) fn spawn(
    shared: Arc<Shared>,
    slot: PeerSlot,
    peer: PeerId,
    serial: u64,
    stream: BoxStream,
    cancel: CancellationToken,
) -> PeerHandle {
    let (outbound_tx, outbound_rx) = mpsc::channel(shared.outbound_capacity());
    let (failed_tx, failed_rx) = oneshot::channel();
    let (reader, writer) = tokio::io::split(stream);

    tokio::spawn(write_loop(
        peer.clone(),
        writer,
        outbound_rx,
        failed_tx,
        cancel.clone(),
    ));
    tokio::spawn(read_loop(
        shared,
        slot,
        peer,
        serial,
        reader,
        failed_rx,
        cancel.clone(),
    ));

    PeerHandle {
        serial,
        outbound: outbound_tx,
        cancel,
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    slot: PeerSlot,
    peer: PeerId,
    serial: u64,
    mut reader: ReadHalf<BoxStream>,
    mut writer_failed: oneshot::Receiver<String>,
    cancel: CancellationToken,
) {
    let reason = loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                break writer_failed
                    .try_recv()
                    .unwrap_or_else(|_| "closed locally".to_string());
            }
            outcome = read_frame(&mut reader, MAX_FRAME_SIZE) => outcome,
        };

        match outcome {
            Ok(ReadOutcome::Frame(body)) => match decode_body(&body) {
                Ok(record) => {
                    tracing::trace!(peer = %peer, kind = record.kind(), "record received");
                    let event = BrokerEvent::Record {
                        from: peer.clone(),
                        record,
                    };
                    if shared.emit(event).await.is_err() {
                        break "broker gone".to_string();
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "dropping undecodable record");
                    let _ = shared
                        .emit(BrokerEvent::ProtocolError {
                            peer: peer.clone(),
                            error: e.to_string(),
                        })
                        .await;
                }
            },
            Ok(ReadOutcome::Oversized { len }) => {
                tracing::warn!(peer = %peer, len, "dropping oversized frame");
                let _ = shared
                    .emit(BrokerEvent::ProtocolError {
                        peer: peer.clone(),
                        error: format!("frame of {len} bytes exceeds {MAX_FRAME_SIZE}"),
                    })
                    .await;
            }
            Ok(ReadOutcome::Eof) => break "end of stream".to_string(),
            Err(e) => break format!("read failed: {e}"),
        }
    };

    cancel.cancel();
    tracing::debug!(peer = %peer, serial, reason = %reason, "connection closed");
    shared.connection_closed(slot, &peer, serial, reason).await;
}

async fn write_loop(
    peer: PeerId,
    mut writer: WriteHalf<BoxStream>,
    mut outbound: mpsc::Receiver<Arc<Vec<u8>>>,
    failed: oneshot::Sender<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        tracing::debug!(peer = %peer, error = %e, "write failed");
                        let _ = failed.send(format!("write failed: {e}"));
                        cancel.cancel();
                        return;
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }

    // Closed locally: push out whatever is already queued (e.g. a Bye).
    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
        while let Ok(frame) = outbound.try_recv() {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    })
    .await;
    cancel.cancel();
}
