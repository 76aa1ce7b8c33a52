//! JSON-lines audit sink for `tollgate`. Writes one security event or alert per line.
//! Always appends; bring your own path.
//!
//! The security monitor delivers through its own background queue, so the sink
//! can be passed to `SecurityMonitor::with_sink` as is; file I/O never sits on
//! the request path.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Mutex;
use tollgate::security::{AuditEntry, SecuritySink};

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
    // Serializes appends from clones so lines never interleave.
    write_lock: Arc<Mutex<()>>,
}

impl JsonlSink {
    /// Append to `path`, creating it on first write.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into(), write_lock: Arc::new(Mutex::new(())) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl tower_service::Service<AuditEntry> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, entry: AuditEntry) -> Self::Future {
        let path = self.path.clone();
        let write_lock = self.write_lock.clone();
        let line = serde_json::to_string(&entry).map(|json| json + "\n");
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let line = line.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let _guard = write_lock.lock().await;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            tracing::trace!(
                target: "tollgate::security",
                path = %path.display(),
                "audit entry appended"
            );
            Ok(())
        })
    }
}

impl SecuritySink for JsonlSink {
    type SinkError = io::Error;
}

/// Read a file written by [`JsonlSink`], skipping blank lines.
pub fn read_entries(path: impl AsRef<Path>) -> io::Result<Vec<AuditEntry>> {
    let contents = std::fs::read_to_string(path)?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        })
        .collect()
}
