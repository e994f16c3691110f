use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::protocol::Envelope;

const FRAME_BUFFER: usize = 64;

/// One inbound frame from the agent.
#[derive(Debug)]
pub enum Frame {
    Message(Envelope),
    /// Bytes that did not decode as an envelope; carries the decode error
    Malformed(String),
}

/// Engine-facing view of one agent connection.
///
/// The engine only ever sees envelope queues; the wire framing lives in
/// whichever adapter produced the pair. Dropping the connection (or the
/// peer going away) surfaces as `inbound` returning `None`.
pub struct Connection {
    pub inbound: mpsc::Receiver<Frame>,
    pub outbound: mpsc::Sender<Envelope>,
}

/// Adapt an accepted TCP stream into a [`Connection`] using
/// newline-delimited JSON frames.
pub fn spawn_tcp(stream: TcpStream) -> Connection {
    let (read_half, mut write_half) = stream.into_split();
    let (in_tx, in_rx) = mpsc::channel(FRAME_BUFFER);
    let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(FRAME_BUFFER);
    let closed = CancellationToken::new();

    let reader_closed = closed.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let frame = match serde_json::from_str::<Envelope>(&line) {
                        Ok(envelope) => Frame::Message(envelope),
                        Err(e) => Frame::Malformed(e.to_string()),
                    };
                    if in_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "agent connection read failed");
                    break;
                }
            }
        }
        // Wake the writer so the socket fully closes when the peer is gone
        reader_closed.cancel();
    });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                maybe = out_rx.recv() => {
                    let Some(envelope) = maybe else { break };
                    let mut line = match serde_json::to_string(&envelope) {
                        Ok(line) => line,
                        Err(e) => {
                            debug!(error = %e, "failed to encode outbound envelope");
                            continue;
                        }
                    };
                    line.push('\n');
                    if write_half.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    Connection {
        inbound: in_rx,
        outbound: out_tx,
    }
}

/// In-memory duplex pair: each side's outbound envelopes surface on the
/// other side's inbound queue. Used by tests and embedders.
pub fn memory_pair() -> (Connection, Connection) {
    let (a_in_tx, a_in_rx) = mpsc::channel(FRAME_BUFFER);
    let (b_in_tx, b_in_rx) = mpsc::channel(FRAME_BUFFER);
    let (a_out_tx, mut a_out_rx) = mpsc::channel::<Envelope>(FRAME_BUFFER);
    let (b_out_tx, mut b_out_rx) = mpsc::channel::<Envelope>(FRAME_BUFFER);

    tokio::spawn(async move {
        while let Some(envelope) = a_out_rx.recv().await {
            if b_in_tx.send(Frame::Message(envelope)).await.is_err() {
                break;
            }
        }
    });
    tokio::spawn(async move {
        while let Some(envelope) = b_out_rx.recv().await {
            if a_in_tx.send(Frame::Message(envelope)).await.is_err() {
                break;
            }
        }
    });

    (
        Connection {
            inbound: a_in_rx,
            outbound: a_out_tx,
        },
        Connection {
            inbound: b_in_rx,
            outbound: b_out_tx,
        },
    )
}
