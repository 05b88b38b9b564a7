//! guacd side of the Guacamole handshake.
//!
//! ```text
//! tunnel → guacd   select,rdp
//! guacd  → tunnel  args,VERSION_1_5_0,<name>...
//! tunnel → guacd   size / audio / video / image / timezone
//! tunnel → guacd   connect,VERSION_1_5_0,<value>...
//! guacd  → tunnel  ready,<connection id>
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use raweb_protocol::{ArgsAdvert, Instruction, InstructionReader, MappingContext};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::TunnelError;

const AUDIO_MIMETYPES: [&str; 2] = ["audio/L8", "audio/L16"];
const IMAGE_MIMETYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];

/// An established guacd connection after `ready`.
pub struct DaemonLink {
    pub stream: TcpStream,
    pub connection_id: String,
    /// Bytes guacd sent after `ready`, not yet relayed.
    pub leftover: Bytes,
}

/// Open the TCP connection to guacd, classifying failures.
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, TunnelError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Err(_) => Err(TunnelError::DaemonUnreachable {
            addr: addr.to_string(),
            detail: format!("no answer within {timeout:?}"),
        }),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            Err(TunnelError::DaemonRefused {
                addr: addr.to_string(),
            })
        }
        Ok(Err(e)) => Err(TunnelError::DaemonUnreachable {
            addr: addr.to_string(),
            detail: e.to_string(),
        }),
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(error = %e, "failed to set TCP_NODELAY on daemon socket");
            }
            Ok(stream)
        }
    }
}

struct DaemonConn {
    stream: TcpStream,
    reader: InstructionReader,
    pending: VecDeque<Instruction>,
}

impl DaemonConn {
    async fn send(&mut self, instruction: &Instruction) -> Result<(), TunnelError> {
        self.stream
            .write_all(instruction.encode().as_bytes())
            .await
            .map_err(TunnelError::DaemonSocket)
    }

    async fn wait_for(&mut self, opcode: &str) -> Result<Instruction, TunnelError> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(instruction) = self.pending.pop_front() {
                if instruction.opcode() == opcode {
                    return Ok(instruction);
                }
                if instruction.opcode() == "error" {
                    return Err(TunnelError::DaemonHandshake(format!(
                        "guacd reported: {}",
                        instruction.arg(0).unwrap_or_default()
                    )));
                }
                tracing::debug!(opcode = %instruction.opcode(), expected = opcode, "skipping daemon instruction");
                continue;
            }
            let n = self
                .stream
                .read(&mut buf)
                .await
                .map_err(TunnelError::DaemonSocket)?;
            if n == 0 {
                return Err(TunnelError::DaemonHandshake(format!(
                    "guacd closed the connection while waiting for {opcode}"
                )));
            }
            let decoded = self
                .reader
                .push(&buf[..n])
                .map_err(|e| TunnelError::DaemonHandshake(e.to_string()))?;
            self.pending.extend(decoded);
        }
    }
}

/// Run the handshake on `stream`. Nothing past `select` is sent if the
/// advertised version is unsupported or the descriptor is rejected.
pub async fn perform(stream: TcpStream, mapping: &MappingContext<'_>) -> Result<DaemonLink, TunnelError> {
    let mut conn = DaemonConn {
        stream,
        reader: InstructionReader::new(),
        pending: VecDeque::new(),
    };

    conn.send(&Instruction::new("select", ["rdp"])).await?;
    let args = conn.wait_for("args").await?;
    let advert = ArgsAdvert::from_instruction(&args)?;
    let connect = mapping.connect_instruction(&advert)?;
    tracing::debug!(version = %advert.version, params = advert.names.len(), "guacd accepted select");

    let session = mapping.session;
    let display = &session.display;
    conn.send(&Instruction::new(
        "size",
        [
            display.width.to_string(),
            display.height.to_string(),
            display.dpi.to_string(),
        ],
    ))
    .await?;
    conn.send(&Instruction::new("audio", AUDIO_MIMETYPES)).await?;
    conn.send(&Instruction::bare("video")).await?;
    conn.send(&Instruction::new("image", IMAGE_MIMETYPES)).await?;
    conn.send(&Instruction::new("timezone", [session.timezone.as_str()]))
        .await?;
    conn.send(&connect).await?;

    let ready = conn.wait_for("ready").await?;
    let connection_id = ready
        .arg(0)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| TunnelError::DaemonHandshake("ready without connection id".into()))?
        .to_string();

    // Instructions decoded alongside `ready` go in front of the undecoded
    // tail so the relay forwards them in order.
    let mut leftover = BytesMut::new();
    for instruction in conn.pending.drain(..) {
        leftover.extend_from_slice(instruction.encode().as_bytes());
    }
    leftover.extend_from_slice(&conn.reader.take_pending());

    Ok(DaemonLink {
        stream: conn.stream,
        connection_id,
        leftover: leftover.freeze(),
    })
}
