//! I/O owner task.
//!
//! The task is the only holder of the socket. Envelopes to send arrive on
//! one channel, decoded envelopes leave on another. Closing the outbound
//! channel makes the task flush, shut down its write side and finish.

use crate::error::ClientError;
use bytes::BytesMut;
use jim_protocol::{codec, Envelope, MAX_FRAME_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Channel capacity in each direction.
const CHANNEL_CAPACITY: usize = 64;

/// Handles to a running I/O task.
pub struct IoHandle {
    /// Envelopes to write.
    pub outbound: mpsc::Sender<Envelope>,
    /// Envelopes read from the server.
    pub inbound: mpsc::Receiver<Envelope>,
    /// The task itself.
    pub task: JoinHandle<Result<(), ClientError>>,
}

/// Start the I/O task for a connected stream.
#[must_use]
pub fn spawn(stream: TcpStream) -> IoHandle {
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let task = tokio::spawn(async move {
        let result = run(stream, outbound_rx, inbound_tx).await;
        match &result {
            Ok(()) => debug!("I/O task finished"),
            Err(e) => debug!(error = %e, "I/O task stopped"),
        }
        result
    });

    IoHandle {
        outbound: outbound_tx,
        inbound: inbound_rx,
        task,
    }
}

async fn run(
    stream: TcpStream,
    mut outbound: mpsc::Receiver<Envelope>,
    inbound: mpsc::Sender<Envelope>,
) -> Result<(), ClientError> {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(MAX_FRAME_SIZE);

    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(envelope) => match codec::encode(&envelope) {
                    Ok(bytes) => writer.write_all(&bytes).await?,
                    Err(e) => warn!(label = envelope.label(), error = %e, "Dropping unencodable envelope"),
                },
                None => {
                    writer.flush().await?;
                    writer.shutdown().await?;
                    return Ok(());
                }
            },
            read = reader.read_buf(&mut buf) => {
                if read? == 0 {
                    return Err(ClientError::ConnectionLost);
                }
                if !forward(&mut buf, &inbound).await? {
                    debug!("Inbound receiver dropped");
                    return Ok(());
                }
            }
        }
    }
}

/// Pass every complete frame on. Returns `false` once the receiver is gone.
async fn forward(buf: &mut BytesMut, inbound: &mpsc::Sender<Envelope>) -> Result<bool, ClientError> {
    loop {
        match codec::decode_from(buf) {
            Ok(Some(envelope)) => {
                if inbound.send(envelope).await.is_err() {
                    return Ok(false);
                }
            }
            Ok(None) => return Ok(true),
            Err(e) if e.is_recoverable() => warn!(error = %e, "Skipping invalid frame from server"),
            Err(e) => return Err(e.into()),
        }
    }
}
