//! The browser side of a session: a shareable sender and an instruction
//! reader over the WebSocket.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use raweb_protocol::{Instruction, InstructionReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TunnelError;

pub type WsStream = WebSocketStream<TcpStream>;

// ---------------------------------------------------------------------------
// ClientSink
// ---------------------------------------------------------------------------

/// Sending half, shared between the session task and the keep-alive task.
#[derive(Clone)]
pub struct ClientSink {
    inner: Arc<Mutex<SplitSink<WsStream, Message>>>,
}

impl ClientSink {
    pub fn new(sink: SplitSink<WsStream, Message>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sink)),
        }
    }

    pub async fn send(&self, instruction: &Instruction) -> Result<(), TunnelError> {
        self.send_text(instruction.encode()).await
    }

    /// Send already-encoded instruction text as one message.
    pub async fn send_text(&self, text: String) -> Result<(), TunnelError> {
        self.inner.lock().await.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Report a fatal failure: `error`, then `disconnect`, then close.
    pub async fn fail(&self, error: &TunnelError) {
        let code = error.code().to_string();
        let messages = [
            Instruction::new("error", [error.client_message(), code]),
            Instruction::bare("disconnect"),
        ];
        for instruction in &messages {
            if let Err(e) = self.send(instruction).await {
                tracing::debug!(error = %e, "could not deliver failure to client");
                return;
            }
        }
        self.close().await;
    }

    pub async fn close(&self) {
        if let Err(e) = self.inner.lock().await.close().await {
            tracing::trace!(error = %e, "websocket close failed");
        }
    }
}

// ---------------------------------------------------------------------------
// ClientSource
// ---------------------------------------------------------------------------

/// Receiving half during negotiation.
pub struct ClientSource {
    stream: SplitStream<WsStream>,
    reader: InstructionReader,
    queue: VecDeque<Instruction>,
}

impl ClientSource {
    pub fn new(stream: SplitStream<WsStream>) -> Self {
        Self {
            stream,
            reader: InstructionReader::new(),
            queue: VecDeque::new(),
        }
    }

    /// Next meaningful client instruction, or `None` once the client is gone.
    /// Keep-alives (`nop`) and internal instructions (empty opcode) are skipped.
    pub async fn next_instruction(&mut self) -> Result<Option<Instruction>, TunnelError> {
        loop {
            while let Some(instruction) = self.queue.pop_front() {
                if instruction.opcode().is_empty() || instruction.opcode() == "nop" {
                    continue;
                }
                return Ok(Some(instruction));
            }

            let data = match self.stream.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => Bytes::from(text),
                Some(Ok(Message::Binary(data))) => Bytes::from(data),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
            };
            self.queue.extend(self.reader.push(&data)?);
        }
    }

    /// Hand over the stream plus whatever the client sent that negotiation
    /// did not consume, re-encoded so the relay can forward it verbatim.
    pub fn into_relay(mut self) -> (SplitStream<WsStream>, Bytes) {
        let mut leftover = BytesMut::new();
        for instruction in self.queue.drain(..) {
            leftover.extend_from_slice(instruction.encode().as_bytes());
        }
        leftover.extend_from_slice(&self.reader.take_pending());
        (self.stream, leftover.freeze())
    }
}
