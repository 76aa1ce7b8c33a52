//! Security auditing and alerting.
//!
//! Every access decision is reported to the [`SecurityMonitor`] as a
//! [`SecurityEvent`]. The monitor keeps a rolling history, raises an
//! [`Alert`] when an event kind crosses its configured frequency threshold,
//! and forwards both to a [`SecuritySink`] through a bounded background queue.
//!
//! # Sinks
//!
//! Sinks are `tower::Service<AuditEntry>` implementations, so they compose like
//! any other tower service:
//!
//! - [`LogSink`]: structured `tracing` output (the default)
//! - [`MemorySink`]: bounded in-memory buffer for tests and diagnostics
//! - [`NonBlockingSink`]: bounded queue drained by a background task
//! - [`MulticastSink`]: fan-out to two sinks
//! - [`NullSink`]: discard

pub mod events;
pub mod monitor;
pub mod sinks;

pub use events::{Alert, AuditEntry, SecurityEvent, SecurityEventKind, Severity};
pub use monitor::{AlertRule, MonitorConfig, RiskAssessment, RiskLevel, RiskSignal, SecurityMonitor};
pub use sinks::{
    boxed, emit_best_effort, BoxError, BoxedSink, ComposedSinkError, LogSink, MemorySink,
    MulticastSink, NonBlockingSink, NullSink, SecuritySink,
};
