//! Task-filtering executor.
//!
//! Wraps a connection's event loop so that a task carrying a message which was
//! cancelled before the task was submitted runs as a no-op. The substitute
//! keeps the original task's place in the queue.
//!
//! Which task types carry a message is declared up front in a
//! [`CarrierRegistry`]; nothing is discovered at runtime.

use crate::error::Result;
use crate::protocol::message::PacketCell;
use crate::transport::{
    EventLoop, InboundTask, NoopTask, OutboundTask, ScheduledTask, Task, TaskCompletion,
};
use crate::utils::metrics::Metrics;
use parking_lot::RwLock;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// What a submitted task carries, as seen at submission time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CarrierState {
    /// The task type is not a declared carrier.
    NotCarrier,
    /// A carrier whose message is still present.
    Present,
    /// A carrier whose message was cancelled.
    Cancelled,
}

type Probe = dyn Fn(&(dyn Task + 'static)) -> Option<bool> + Send + Sync;

struct CarrierEntry {
    name: &'static str,
    probe: Arc<Probe>,
}

/// Task types known to carry exactly one message, with an accessor for it.
#[derive(Default)]
pub struct CarrierRegistry {
    entries: RwLock<HashMap<TypeId, CarrierEntry>>,
}

impl CarrierRegistry {
    /// A registry with no carriers.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that knows the transport's own message tasks.
    pub fn with_transport_defaults() -> Self {
        let registry = Self::new();
        registry.declare::<OutboundTask>(OutboundTask::cell);
        registry.declare::<InboundTask>(InboundTask::cell);
        registry
    }

    /// Declare `T` a carrier whose message lives in the cell `accessor` returns.
    /// Declaring the same type again replaces the accessor.
    pub fn declare<T: Task>(&self, accessor: fn(&T) -> &PacketCell) {
        let probe = move |task: &(dyn Task + 'static)| {
            task.downcast_ref::<T>()
                .map(|carrier| accessor(carrier).is_present())
        };
        let name = std::any::type_name::<T>();
        self.entries.write().insert(
            TypeId::of::<T>(),
            CarrierEntry {
                name,
                probe: Arc::new(probe),
            },
        );
        debug!(carrier = name, "Task carrier declared");
    }

    pub fn is_carrier<T: Task>(&self) -> bool {
        self.entries.read().contains_key(&TypeId::of::<T>())
    }

    /// Inspect `task`'s carried message without running it.
    pub fn probe(&self, task: &(dyn Task + 'static)) -> CarrierState {
        let type_id = std::any::Any::type_id(task.as_any());
        let probe = match self.entries.read().get(&type_id) {
            Some(entry) => Arc::clone(&entry.probe),
            None => return CarrierState::NotCarrier,
        };
        match probe(task) {
            Some(true) => CarrierState::Present,
            Some(false) => CarrierState::Cancelled,
            None => CarrierState::NotCarrier,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl fmt::Debug for CarrierRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        let mut names: Vec<_> = entries.values().map(|e| e.name).collect();
        names.sort_unstable();
        f.debug_struct("CarrierRegistry")
            .field("carriers", &names)
            .finish()
    }
}

/// Event loop wrapper that suppresses carrier tasks with cancelled messages.
///
/// The check happens once, when the task is handed over. A message cancelled
/// after submission but before the task runs is not caught here.
pub struct FilteringEventLoop {
    inner: Arc<dyn EventLoop>,
    carriers: Arc<CarrierRegistry>,
    metrics: Arc<Metrics>,
}

impl FilteringEventLoop {
    pub fn new(
        inner: Arc<dyn EventLoop>,
        carriers: Arc<CarrierRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner,
            carriers,
            metrics,
        }
    }

    /// The wrapped event loop.
    pub fn inner(&self) -> &Arc<dyn EventLoop> {
        &self.inner
    }

    fn filter(&self, task: Box<dyn Task>) -> Box<dyn Task> {
        match self.carriers.probe(&*task) {
            CarrierState::NotCarrier => task,
            CarrierState::Present => {
                self.metrics.task_filtered(false);
                task
            }
            CarrierState::Cancelled => {
                self.metrics.task_filtered(true);
                trace!(
                    event_loop = self.inner.name(),
                    task = task.name(),
                    "Replacing task whose message was cancelled"
                );
                Box::new(NoopTask::replacing(task.name()))
            }
        }
    }
}

impl EventLoop for FilteringEventLoop {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn execute(&self, task: Box<dyn Task>) -> Result<()> {
        self.inner.execute(self.filter(task))
    }

    fn submit(&self, task: Box<dyn Task>) -> Result<TaskCompletion> {
        self.inner.submit(self.filter(task))
    }

    fn schedule(&self, task: Box<dyn Task>, delay: Duration) -> Result<ScheduledTask> {
        self.inner.schedule(self.filter(task), delay)
    }

    fn schedule_at_fixed_rate(
        &self,
        task: Box<dyn Task>,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<ScheduledTask> {
        self.inner
            .schedule_at_fixed_rate(self.filter(task), initial_delay, period)
    }

    fn in_event_loop(&self) -> bool {
        self.inner.in_event_loop()
    }

    fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    fn shutdown(&self) {
        self.inner.shutdown()
    }
}
