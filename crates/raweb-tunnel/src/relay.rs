//! Byte pumps between the browser and guacd, plus the pre-connect keep-alive.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::SplitStream;
use raweb_protocol::{Instruction, InstructionReader};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::{JoinError, JoinHandle};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::channel::{ClientSink, WsStream};

const READ_BUFFER: usize = 8 * 1024;
/// How long the losing pump may keep running after the session is decided.
const ABANDON_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Keep-alive
// ---------------------------------------------------------------------------

/// Sends `nop` to the browser on an interval until stopped or dropped, so
/// the browser does not time out while guacd is being installed or started.
pub struct KeepAlive {
    guard: DropGuard,
    handle: JoinHandle<()>,
}

impl KeepAlive {
    pub fn spawn(sink: ClientSink, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            let nop = Instruction::bare("nop");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = sink.send(&nop).await {
                            tracing::debug!(error = %e, "keep-alive send failed");
                            break;
                        }
                    }
                }
            }
        });
        Self {
            guard: cancel.drop_guard(),
            handle,
        }
    }

    /// Stop sending and wait until no keep-alive is in flight.
    pub async fn stop(self) {
        let Self { guard, handle } = self;
        guard.disarm().cancel();
        if let Err(e) = handle.await {
            tracing::debug!(error = %e, "keep-alive task ended abnormally");
        }
    }
}

// ---------------------------------------------------------------------------
// Pumps
// ---------------------------------------------------------------------------

/// How a pump ended.
#[derive(Debug)]
pub enum PumpOutcome {
    ClientClosed,
    DaemonClosed,
    ClientError(String),
    DaemonError(String),
    /// The pump task panicked or was aborted.
    Aborted(String),
}

impl PumpOutcome {
    fn joined(result: Result<PumpOutcome, JoinError>) -> Self {
        result.unwrap_or_else(|e| PumpOutcome::Aborted(e.to_string()))
    }
}

/// Browser → guacd. Payload bytes are written verbatim.
pub async fn client_to_daemon(
    mut ws: SplitStream<WsStream>,
    mut daemon: OwnedWriteHalf,
    leftover: Bytes,
) -> PumpOutcome {
    if !leftover.is_empty() {
        if let Err(e) = daemon.write_all(&leftover).await {
            return PumpOutcome::DaemonError(e.to_string());
        }
    }
    loop {
        let payload = match ws.next().await {
            None | Some(Ok(Message::Close(_))) => return PumpOutcome::ClientClosed,
            Some(Err(e)) => return PumpOutcome::ClientError(e.to_string()),
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(_)) => continue,
        };
        if let Err(e) = daemon.write_all(&payload).await {
            return PumpOutcome::DaemonError(e.to_string());
        }
    }
}

/// guacd → browser. One text message per run of complete instructions, so
/// the browser never sees half an instruction.
pub async fn daemon_to_client(
    mut daemon: OwnedReadHalf,
    sink: ClientSink,
    leftover: Bytes,
) -> PumpOutcome {
    let mut reader = InstructionReader::new();
    if let Err(outcome) = forward(&mut reader, &leftover, &sink).await {
        return outcome;
    }
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = match daemon.read(&mut buf).await {
            Ok(0) => return PumpOutcome::DaemonClosed,
            Ok(n) => n,
            Err(e) => return PumpOutcome::DaemonError(e.to_string()),
        };
        if let Err(outcome) = forward(&mut reader, &buf[..n], &sink).await {
            return outcome;
        }
    }
}

async fn forward(
    reader: &mut InstructionReader,
    data: &[u8],
    sink: &ClientSink,
) -> Result<(), PumpOutcome> {
    match reader.push_raw(data) {
        Ok(Some(chunk)) => sink
            .send_text(String::from_utf8_lossy(&chunk).into_owned())
            .await
            .map_err(|e| PumpOutcome::ClientError(e.to_string())),
        Ok(None) => Ok(()),
        Err(e) => Err(PumpOutcome::DaemonError(e.to_string())),
    }
}

/// Run both pumps until one ends and return that pump's outcome.
///
/// The other pump keeps running detached until its own side closes, which
/// normally follows from the caller closing the browser socket and dropping
/// guacd. Its outcome is only logged. After [`ABANDON_GRACE`] it is aborted.
pub async fn run(
    session: u64,
    ws: SplitStream<WsStream>,
    leftover: Bytes,
    sink: ClientSink,
    daemon: tokio::net::TcpStream,
    daemon_leftover: Bytes,
) -> PumpOutcome {
    let (read_half, write_half) = daemon.into_split();
    let mut upstream = tokio::spawn(client_to_daemon(ws, write_half, leftover));
    let mut downstream = tokio::spawn(daemon_to_client(read_half, sink, daemon_leftover));

    let (outcome, loser, direction) = tokio::select! {
        result = &mut upstream => (result, downstream, "daemon→client"),
        result = &mut downstream => (result, upstream, "client→daemon"),
    };
    tokio::spawn(drain_abandoned(session, direction, loser));
    PumpOutcome::joined(outcome)
}

async fn drain_abandoned(session: u64, direction: &'static str, mut pump: JoinHandle<PumpOutcome>) {
    match tokio::time::timeout(ABANDON_GRACE, &mut pump).await {
        Ok(result) => match PumpOutcome::joined(result) {
            outcome @ (PumpOutcome::ClientClosed | PumpOutcome::DaemonClosed) => {
                tracing::debug!(session, direction, ?outcome, "abandoned pump finished");
            }
            outcome => {
                tracing::warn!(session, direction, ?outcome, "abandoned pump faulted");
            }
        },
        Err(_) => {
            pump.abort();
            tracing::debug!(session, direction, "abandoned pump aborted after grace period");
        }
    }
}
