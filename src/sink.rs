//! Record sinks
//!
//! Task bodies hand records to a sink and move on. Persisting them is somebody
//! else's job: `ChannelSink` forwards records to a channel and `JsonLinesWriter`
//! drains that channel into newline-delimited JSON.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::Record;

/// Fire-and-forget consumer of extracted records
pub trait RecordSink: Send + Sync {
    fn accept(&self, record: Record);
}

/// Drops every record
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl RecordSink for NullSink {
    fn accept(&self, record: Record) {
        debug!(kind = record.kind(), "Discarding record");
    }
}

/// Forwards records to an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Record>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Record>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RecordSink for ChannelSink {
    fn accept(&self, record: Record) {
        if let Err(e) = self.tx.send(record) {
            warn!(kind = e.0.kind(), "Record receiver is gone, dropping record");
        }
    }
}

/// Writes records as JSON lines until every sender is dropped
pub struct JsonLinesWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> JsonLinesWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Drain `rx` into the writer. Returns the number of records written.
    pub async fn run(&mut self, rx: mpsc::UnboundedReceiver<Record>) -> Result<u64> {
        let mut stream = UnboundedReceiverStream::new(rx);
        let mut written = 0u64;

        while let Some(record) = stream.next().await {
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            self.writer.write_all(&line).await?;
            written += 1;
        }

        self.writer.flush().await?;
        info!(records = written, "Record output closed");
        Ok(written)
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
