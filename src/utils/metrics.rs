//! Observability and Metrics
//!
//! Atomic counters for dispatch, task filtering and stage lifecycle activity.
//!
//! Every [`PacketInterceptor`](crate::intercept::PacketInterceptor) owns its own
//! [`Metrics`]; the process-wide instance from [`global_metrics`] collects
//! events that have no interceptor to report to, such as panicking event loop
//! tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Interception metrics collector
#[derive(Debug)]
pub struct Metrics {
    /// Dispatch passes that found at least one listener
    pub dispatches_total: AtomicU64,
    /// Dispatch passes that found no listener for the message type
    pub dispatch_fast_path: AtomicU64,
    /// Individual listener calls
    pub listener_invocations: AtomicU64,
    /// Messages cancelled by a listener
    pub cancellations: AtomicU64,
    /// Cancellations performed by a `Monitor` listener
    pub monitor_violations: AtomicU64,
    /// Listener calls that returned an error
    pub listener_errors: AtomicU64,
    /// Listener registrations
    pub listeners_registered: AtomicU64,
    /// Listener removals
    pub listeners_unregistered: AtomicU64,
    /// Submitted tasks recognised as message carriers
    pub tasks_filtered: AtomicU64,
    /// Carrier tasks replaced by a no-op because their message was cancelled
    pub tasks_suppressed: AtomicU64,
    /// Interception stages installed on connections
    pub stages_installed: AtomicU64,
    /// Interception stages removed from connections
    pub stages_removed: AtomicU64,
    /// Companion stages moved in front of the interception stage
    pub companion_redirects: AtomicU64,
    /// Synthetic outbound messages injected
    pub synthetic_sends: AtomicU64,
    /// Synthetic inbound messages injected
    pub synthetic_receives: AtomicU64,
    /// Event loop tasks that panicked
    pub task_panics: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            dispatches_total: AtomicU64::new(0),
            dispatch_fast_path: AtomicU64::new(0),
            listener_invocations: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            monitor_violations: AtomicU64::new(0),
            listener_errors: AtomicU64::new(0),
            listeners_registered: AtomicU64::new(0),
            listeners_unregistered: AtomicU64::new(0),
            tasks_filtered: AtomicU64::new(0),
            tasks_suppressed: AtomicU64::new(0),
            stages_installed: AtomicU64::new(0),
            stages_removed: AtomicU64::new(0),
            companion_redirects: AtomicU64::new(0),
            synthetic_sends: AtomicU64::new(0),
            synthetic_receives: AtomicU64::new(0),
            task_panics: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a dispatch pass, `fast_path` when no listener was registered
    pub fn dispatch(&self, fast_path: bool) {
        if fast_path {
            self.dispatch_fast_path.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dispatches_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn listener_invoked(&self) {
        self.listener_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cancelled(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn monitor_violation(&self) {
        self.monitor_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listener_error(&self) {
        self.listener_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listener_registered(&self) {
        self.listeners_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listener_unregistered(&self) {
        self.listeners_unregistered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a carrier task passing through the filter
    pub fn task_filtered(&self, suppressed: bool) {
        self.tasks_filtered.fetch_add(1, Ordering::Relaxed);
        if suppressed {
            self.tasks_suppressed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stage_installed(&self) {
        self.stages_installed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stage_removed(&self) {
        self.stages_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn companion_redirect(&self) {
        self.companion_redirects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn synthetic_send(&self) {
        self.synthetic_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn synthetic_receive(&self) {
        self.synthetic_receives.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_panicked(&self) {
        self.task_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatches_total: self.dispatches_total.load(Ordering::Relaxed),
            dispatch_fast_path: self.dispatch_fast_path.load(Ordering::Relaxed),
            listener_invocations: self.listener_invocations.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            monitor_violations: self.monitor_violations.load(Ordering::Relaxed),
            listener_errors: self.listener_errors.load(Ordering::Relaxed),
            listeners_registered: self.listeners_registered.load(Ordering::Relaxed),
            listeners_unregistered: self.listeners_unregistered.load(Ordering::Relaxed),
            tasks_filtered: self.tasks_filtered.load(Ordering::Relaxed),
            tasks_suppressed: self.tasks_suppressed.load(Ordering::Relaxed),
            stages_installed: self.stages_installed.load(Ordering::Relaxed),
            stages_removed: self.stages_removed.load(Ordering::Relaxed),
            companion_redirects: self.companion_redirects.load(Ordering::Relaxed),
            synthetic_sends: self.synthetic_sends.load(Ordering::Relaxed),
            synthetic_receives: self.synthetic_receives.load(Ordering::Relaxed),
            task_panics: self.task_panics.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            dispatches_total = snapshot.dispatches_total,
            dispatch_fast_path = snapshot.dispatch_fast_path,
            listener_invocations = snapshot.listener_invocations,
            cancellations = snapshot.cancellations,
            monitor_violations = snapshot.monitor_violations,
            listener_errors = snapshot.listener_errors,
            listeners_registered = snapshot.listeners_registered,
            listeners_unregistered = snapshot.listeners_unregistered,
            tasks_filtered = snapshot.tasks_filtered,
            tasks_suppressed = snapshot.tasks_suppressed,
            stages_installed = snapshot.stages_installed,
            stages_removed = snapshot.stages_removed,
            companion_redirects = snapshot.companion_redirects,
            synthetic_sends = snapshot.synthetic_sends,
            synthetic_receives = snapshot.synthetic_receives,
            task_panics = snapshot.task_panics,
            uptime_seconds = snapshot.uptime_seconds,
            "Interception metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub dispatches_total: u64,
    pub dispatch_fast_path: u64,
    pub listener_invocations: u64,
    pub cancellations: u64,
    pub monitor_violations: u64,
    pub listener_errors: u64,
    pub listeners_registered: u64,
    pub listeners_unregistered: u64,
    pub tasks_filtered: u64,
    pub tasks_suppressed: u64,
    pub stages_installed: u64,
    pub stages_removed: u64,
    pub companion_redirects: u64,
    pub synthetic_sends: u64,
    pub synthetic_receives: u64,
    pub task_panics: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the process-wide metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
