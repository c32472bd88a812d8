//! Dedicated writer task for a connection.
//!
//! All commands for a connection go through one [`Channel`] into a single
//! task that owns the socket's write half, so command bytes never interleave
//! on the wire.
//!
//! # Architecture
//!
//! ```text
//! Message::finish ─┐
//! heartbeat NOP   ─┼─► Channel<OutboundFrame> ─► Writer Task ─► socket
//! Producer::publish┘          (reply slot queued in wire order)
//! ```
//!
//! Queued frames are drained in batches and written with one vectored write
//! (or one compressed block when deflate is on). A frame that expects a
//! reply has its reply slot appended to the shared [`ReplyQueue`] right
//! before its bytes are written, so the read loop can pair responses with
//! requests purely by order.

use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::compress::Deflater;
use crate::chan::Channel;
use crate::error::{NsqError, Result};
use crate::protocol::{Command, Frame};

/// Default queue capacity between callers and the writer task.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Where a command's response is delivered.
pub(crate) type ReplySender = oneshot::Sender<Result<Frame>>;

/// Reply slots in the order their commands hit the wire.
pub(crate) type ReplyQueue = Arc<Mutex<VecDeque<ReplySender>>>;

/// A command ready to be written.
#[derive(Debug)]
pub(crate) struct OutboundFrame {
    /// Command line plus body size prefix.
    pub head: Bytes,
    /// Body bytes (empty for line-only commands).
    pub body: Bytes,
    pub reply: Option<ReplySender>,
}

impl OutboundFrame {
    /// A command whose response (if any) is not awaited.
    pub(crate) fn new(command: Command) -> Self {
        let (head, body) = command.into_parts();
        Self {
            head,
            body,
            reply: None,
        }
    }

    /// A command whose response is delivered to `reply`.
    pub(crate) fn with_reply(command: Command, reply: ReplySender) -> Self {
        let (head, body) = command.into_parts();
        Self {
            head,
            body,
            reply: Some(reply),
        }
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.head.len() + self.body.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub(crate) struct WriterConfig {
    pub channel_capacity: usize,
    /// Deadline for writing one batch.
    pub write_timeout: Duration,
}

/// Handle for queueing frames to the writer task.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    chan: Channel<OutboundFrame>,
}

impl WriterHandle {
    /// Queue a frame, waiting while the queue is full.
    pub(crate) async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.chan
            .send(frame)
            .await
            .map_err(|_| NsqError::ConnectionClosed)
    }

    /// Stop accepting frames; the task exits once the queue is drained.
    pub(crate) fn close(&self) {
        self.chan.close();
    }
}

/// Spawn the writer task.
///
/// Returns a handle for queueing frames and the task's `JoinHandle`; the
/// task finishes with an error if a write fails or times out.
pub(crate) fn spawn_writer_task<W>(
    writer: W,
    deflater: Option<Deflater>,
    replies: ReplyQueue,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let chan = Channel::new(config.channel_capacity);
    let handle = WriterHandle { chan: chan.clone() };
    let task = tokio::spawn(writer_loop(chan, writer, deflater, replies, config.write_timeout));
    (handle, task)
}

async fn writer_loop<W>(
    rx: Channel<OutboundFrame>,
    mut writer: W,
    mut deflater: Option<Deflater>,
    replies: ReplyQueue,
    write_timeout: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => {
                // closed and drained
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        {
            let mut queue = replies.lock().unwrap_or_else(|e| e.into_inner());
            for frame in &mut batch {
                if let Some(reply) = frame.reply.take() {
                    queue.push_back(reply);
                }
            }
        }

        let write = write_batch(&mut writer, deflater.as_mut(), &batch);
        match tokio::time::timeout(write_timeout, write).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(NsqError::Timeout(format!(
                    "writing {} commands took longer than {:?}",
                    batch.len(),
                    write_timeout
                )))
            }
        }
    }
}

async fn write_batch<W>(writer: &mut W, deflater: Option<&mut Deflater>, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    if let Some(deflater) = deflater {
        let chunks: Vec<&[u8]> = batch
            .iter()
            .flat_map(|f| [&f.head[..], &f.body[..]])
            .collect();
        let compressed = deflater.deflate(&chunks)?;
        writer.write_all(&compressed).await?;
        writer.flush().await?;
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(NsqError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlices for whatever is left after `skip_bytes` have been written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        for part in [&frame.head, &frame.body] {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}
