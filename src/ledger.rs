//! Append-only CSV of successful measurements.
//!
//! One mutex guards the file for the header check and for every row, so rows
//! from concurrent workers never interleave. Existing content is never
//! rewritten, which lets an interrupted run resume into the same file.

use crate::error::Result;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

pub const HEADER: &str = "domain,latency_ms";

type Sink = Box<dyn AsyncWrite + Send + Unpin>;

struct LedgerSink {
    writer: Sink,
    len: u64,
}

pub struct ResultLedger {
    path: PathBuf,
    sink: Mutex<LedgerSink>,
}

impl ResultLedger {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let len = file.metadata().await?.len();

        Ok(Self::from_writer(path, file, len))
    }

    /// Ledger over an arbitrary sink that already holds `len` bytes.
    pub fn from_writer<W>(path: impl Into<PathBuf>, writer: W, len: u64) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            path: path.into(),
            sink: Mutex::new(LedgerSink {
                writer: Box::new(writer),
                len,
            }),
        }
    }

    /// Writes the header when the ledger is empty. Returns whether it did.
    pub async fn ensure_header(&self) -> Result<bool> {
        let mut sink = self.sink.lock().await;
        if sink.len > 0 {
            return Ok(false);
        }

        sink.write_line(&format!("{HEADER}\n")).await?;
        debug!(path = %self.path.display(), "ledger header written");
        Ok(true)
    }

    pub async fn append(&self, domain: &str, latency_ms: u64) -> Result<()> {
        let line = format!("{domain},{latency_ms}\n");
        self.sink.lock().await.write_line(&line).await?;
        Ok(())
    }
}

impl LedgerSink {
    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        self.len += line.len() as u64;
        Ok(())
    }
}

impl fmt::Debug for ResultLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultLedger")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
