//! Tasks the transport schedules on a channel's event loop.
//!
//! [`OutboundTask`] and [`InboundTask`] are the transport's message-carrying
//! tasks: each holds one [`PacketCell`] and, when run, pushes whatever the cell
//! still holds through the channel's pipeline.

use crate::protocol::message::PacketCell;
use crate::transport::{Pipeline, Task};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Runs a `FnOnce` closure the first time the task runs.
pub struct OnceTask<F> {
    f: Option<F>,
}

impl<F> OnceTask<F>
where
    F: FnOnce() + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f: Some(f) }
    }
}

impl<F> Task for OnceTask<F>
where
    F: FnOnce() + Send + 'static,
{
    fn run(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

/// Runs a `FnMut` closure every time the task runs. Suited to periodic work.
pub struct FnTask<F> {
    f: F,
}

impl<F> FnTask<F>
where
    F: FnMut() + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Task for FnTask<F>
where
    F: FnMut() + Send + 'static,
{
    fn run(&mut self) {
        (self.f)();
    }
}

/// Stand-in for a task whose carried message was cancelled before submission.
///
/// Occupies the original task's queue slot but has no side effects.
#[derive(Debug, Clone, Copy)]
pub struct NoopTask {
    replaced: &'static str,
}

impl NoopTask {
    pub fn replacing(replaced: &'static str) -> Self {
        Self { replaced }
    }

    /// Type name of the task this one stands in for.
    pub fn replaced(&self) -> &'static str {
        self.replaced
    }
}

impl Task for NoopTask {
    fn run(&mut self) {
        trace!(replaced = self.replaced, "Skipping task with cancelled message");
    }
}

/// Writes the carried message through a pipeline, tail to head.
pub struct OutboundTask {
    pipeline: Arc<dyn Pipeline>,
    cell: PacketCell,
    skip: Option<String>,
}

impl OutboundTask {
    pub fn new(pipeline: Arc<dyn Pipeline>, cell: PacketCell) -> Self {
        Self {
            pipeline,
            cell,
            skip: None,
        }
    }

    /// Like [`new`](Self::new), but the stage called `skip` is bypassed.
    pub fn bypassing(pipeline: Arc<dyn Pipeline>, cell: PacketCell, skip: impl Into<String>) -> Self {
        Self {
            pipeline,
            cell,
            skip: Some(skip.into()),
        }
    }

    pub fn cell(&self) -> &PacketCell {
        &self.cell
    }
}

impl Task for OutboundTask {
    fn run(&mut self) {
        if self.cell.is_cancelled() {
            return;
        }
        if let Err(e) = self.pipeline.fire_write(&self.cell, self.skip.as_deref()) {
            self.pipeline.fire_exception(e);
        }
    }
}

impl fmt::Debug for OutboundTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundTask")
            .field("cell", &self.cell)
            .field("skip", &self.skip)
            .finish()
    }
}

/// Reads the carried message through a pipeline, head to tail.
pub struct InboundTask {
    pipeline: Arc<dyn Pipeline>,
    cell: PacketCell,
    skip: Option<String>,
}

impl InboundTask {
    pub fn new(pipeline: Arc<dyn Pipeline>, cell: PacketCell) -> Self {
        Self {
            pipeline,
            cell,
            skip: None,
        }
    }

    /// Like [`new`](Self::new), but the stage called `skip` is bypassed.
    pub fn bypassing(pipeline: Arc<dyn Pipeline>, cell: PacketCell, skip: impl Into<String>) -> Self {
        Self {
            pipeline,
            cell,
            skip: Some(skip.into()),
        }
    }

    pub fn cell(&self) -> &PacketCell {
        &self.cell
    }
}

impl Task for InboundTask {
    fn run(&mut self) {
        if self.cell.is_cancelled() {
            return;
        }
        if let Err(e) = self.pipeline.fire_read(&self.cell, self.skip.as_deref()) {
            self.pipeline.fire_exception(e);
        }
    }
}

impl fmt::Debug for InboundTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundTask")
            .field("cell", &self.cell)
            .field("skip", &self.skip)
            .finish()
    }
}
