use super::events::{AuditEntry, Severity};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tower::Service;

/// Boxed error produced by type-erased sinks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased sink held by the monitor.
pub type BoxedSink = tower::util::BoxCloneService<AuditEntry, (), BoxError>;

type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// An audit sink that consumes security events and alerts.
pub trait SecuritySink:
    tower::Service<AuditEntry, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + Sync + 'static;
}

/// Erase a sink's concrete type so it can be stored behind the monitor.
pub fn boxed<S>(sink: S) -> BoxedSink
where
    S: SecuritySink,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;
    BoxedSink::new(sink.map_err(|e| Box::new(e) as BoxError))
}

/// Deliver one entry, honoring `poll_ready` and swallowing errors.
///
/// Sink failures must never influence an access decision.
pub async fn emit_best_effort<S>(sink: S, entry: AuditEntry)
where
    S: tower::Service<AuditEntry, Response = ()> + Send + 'static,
    S::Error: std::fmt::Display + Send,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    match sink.ready_oneshot().await {
        Ok(mut ready) => {
            if let Err(e) = ready.call(entry).await {
                tracing::debug!(
                    target: "tollgate::security",
                    error = %e,
                    "audit sink rejected entry"
                );
            }
        }
        Err(e) => {
            tracing::debug!(target: "tollgate::security", error = %e, "audit sink not ready");
        }
    }
}

/// Discards everything.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<AuditEntry> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _entry: AuditEntry) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl SecuritySink for NullSink {
    type SinkError = Infallible;
}

/// Writes each entry as a structured `tracing` record, leveled by severity.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<AuditEntry> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, entry: AuditEntry) -> Self::Future {
        let kind = entry.kind();
        match entry.severity() {
            Severity::Critical => tracing::error!(
                target: "tollgate::security",
                kind = %kind,
                entry = %entry,
                "security_audit"
            ),
            Severity::High => tracing::warn!(
                target: "tollgate::security",
                kind = %kind,
                entry = %entry,
                "security_audit"
            ),
            Severity::Medium | Severity::Low => tracing::info!(
                target: "tollgate::security",
                kind = %kind,
                entry = %entry,
                "security_audit"
            ),
        }
        Box::pin(async { Ok(()) })
    }
}

impl SecuritySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps the newest entries in memory, evicting the oldest past `capacity`.
#[derive(Clone, Debug)]
pub struct MemorySink {
    entries: Arc<Mutex<VecDeque<AuditEntry>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Keep at most `capacity` entries, evicting the oldest.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Retained entries, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Entries pushed out by the capacity bound.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AuditEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<AuditEntry> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, entry: AuditEntry) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(entry);
        Box::pin(async { Ok(()) })
    }
}

impl SecuritySink for MemorySink {
    type SinkError = Infallible;
}

/// Hands entries to a bounded queue drained by a background task.
///
/// The monitor already queues delivery; this is for composed sinks, e.g. to
/// keep one slow branch of a [`MulticastSink`] from holding up the other.
/// When the queue is full the entry is dropped and counted. Must be
/// constructed inside a tokio runtime.
#[derive(Clone)]
pub struct NonBlockingSink {
    tx: tokio::sync::mpsc::Sender<AuditEntry>,
    dropped: Arc<AtomicU64>,
}

impl NonBlockingSink {
    pub fn with_capacity<S>(sink: S, capacity: usize) -> Self
    where
        S: tower::Service<AuditEntry, Response = ()> + Send + 'static,
        S::Error: std::fmt::Display + Send,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            use tower::ServiceExt;
            let mut sink = sink;
            while let Some(entry) = rx.recv().await {
                match sink.ready().await {
                    Ok(ready) => {
                        if let Err(e) = ready.call(entry).await {
                            tracing::debug!(
                                target: "tollgate::security",
                                error = %e,
                                "background audit sink failed"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            target: "tollgate::security",
                            error = %e,
                            "background audit sink closed"
                        );
                        break;
                    }
                }
            }
        });
        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Entries discarded because the queue was full or the worker stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for NonBlockingSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonBlockingSink").field("dropped", &self.dropped()).finish()
    }
}

impl Service<AuditEntry> for NonBlockingSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, entry: AuditEntry) -> Self::Future {
        if self.tx.try_send(entry).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl SecuritySink for NonBlockingSink {
    type SinkError = Infallible;
}

/// Error from a composed sink, wrapping whichever branch failed.
#[derive(Debug, thiserror::Error)]
#[error("audit sink error: {0}")]
pub struct ComposedSinkError(#[source] BoxError);

/// Delivers every entry to two sinks concurrently.
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    sink_a: A,
    sink_b: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(sink_a: A, sink_b: B) -> Self {
        Self { sink_a, sink_b }
    }
}

impl<A, B> Service<AuditEntry> for MulticastSink<A, B>
where
    A: SecuritySink,
    A::Future: Send + 'static,
    B: SecuritySink,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = ComposedSinkError;
    type Future = SinkFuture<ComposedSinkError>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, entry: AuditEntry) -> Self::Future {
        let sink_a = self.sink_a.clone();
        let sink_b = self.sink_b.clone();
        let copy = entry.clone();

        Box::pin(async move {
            use tower::ServiceExt;
            let (res_a, res_b) = tokio::join!(sink_a.oneshot(entry), sink_b.oneshot(copy));
            res_a.map_err(|e| ComposedSinkError(Box::new(e)))?;
            res_b.map_err(|e| ComposedSinkError(Box::new(e)))?;
            Ok(())
        })
    }
}

impl<A, B> SecuritySink for MulticastSink<A, B>
where
    A: SecuritySink,
    A::Future: Send + 'static,
    B: SecuritySink,
    B::Future: Send + 'static,
{
    type SinkError = ComposedSinkError;
}
