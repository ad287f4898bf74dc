//! The real kernel ↔ vat-worker transport (§6): newline-delimited JSON over
//! a bidirectional byte stream, framed with `tokio_util::codec::LinesCodec`
//! the way `ethrex_rpc` frames its JSON-RPC traffic.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use crate::endpoint::{DeliveryReply, Endpoint, EndpointError};
use crate::wire::{CrankOutcome, Delivery, SyscallRequest};

/// One line of the wire protocol in either direction after the initial
/// delivery: the worker emits zero or more `Syscall` lines, then exactly
/// one `Reply`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "line", rename_all = "camelCase")]
enum WireLine {
    Syscall(SyscallRequest),
    Reply(CrankOutcome),
}

impl From<LinesCodecError> for EndpointError {
    fn from(e: LinesCodecError) -> Self {
        EndpointError::Protocol(e.to_string())
    }
}

/// An `Endpoint` backed by a framed byte stream (a Unix socket, a
/// subprocess's stdio pipes, a TCP connection to a remote kernel). `R`/`W`
/// are the split halves of whatever transport the caller constructed. Each
/// direction is wrapped in its own `Mutex` — one exclusive reader and one
/// exclusive writer per endpoint, as §5 requires — rather than relying on
/// the crank loop to never call concurrently.
pub struct FramedEndpoint<R, W> {
    reader: Mutex<FramedRead<R, LinesCodec>>,
    writer: Mutex<FramedWrite<W, LinesCodec>>,
}

impl<R, W> FramedEndpoint<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(read_half: R, write_half: W) -> Self {
        FramedEndpoint {
            reader: Mutex::new(FramedRead::new(read_half, LinesCodec::new())),
            writer: Mutex::new(FramedWrite::new(write_half, LinesCodec::new())),
        }
    }
}

#[async_trait::async_trait]
impl<R, W> Endpoint for FramedEndpoint<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Writes the delivery as one JSON line, then reads `WireLine`s until
    /// the terminal `Reply`.
    async fn deliver(&self, delivery: Delivery) -> Result<DeliveryReply, EndpointError> {
        let line = serde_json::to_string(&delivery)
            .map_err(|e| EndpointError::Protocol(e.to_string()))?;
        self.writer.lock().await.send(line).await?;

        let mut reader = self.reader.lock().await;
        let mut syscalls = Vec::new();
        loop {
            let line = reader.next().await.ok_or(EndpointError::Closed)??;
            let parsed: WireLine = serde_json::from_str(&line)
                .map_err(|e| EndpointError::Protocol(e.to_string()))?;
            match parsed {
                WireLine::Syscall(s) => syscalls.push(s),
                WireLine::Reply(outcome) => {
                    return Ok(DeliveryReply { syscalls, outcome });
                }
            }
        }
    }
}
