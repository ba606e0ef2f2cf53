//! # Transport Boundary
//!
//! The per-connection abstractions the interception layer consumes from the
//! transport: a [`Channel`] with its [`Pipeline`] of named [`Stage`]s, a
//! single-threaded [`EventLoop`] that runs all of the channel's work, and the
//! [`ChannelFuture`] completion handle produced when a connection is accepted.
//!
//! The interception layer wraps these traits; it never implements an accept
//! loop or touches wire bytes. [`local`] provides an in-process implementation
//! for embedders without a transport of their own, and for tests.
//!
//! ## Threading rules
//! - Everything that touches one channel's pipeline runs on that channel's
//!   event loop.
//! - Submissions to an event loop may come from any thread; they are queued
//!   and run in submission order.

pub mod local;
pub mod tasks;

use crate::error::{InterceptError, Result};
use crate::protocol::message::{Message, PacketCell};
use downcast_rs::{impl_downcast, Downcast, DowncastSync};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

pub use tasks::{FnTask, InboundTask, NoopTask, OnceTask, OutboundTask};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Lifecycle of a connection, driven entirely by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Pending,
    Open,
    Closed,
}

/// What a stage does, declared by the stage itself.
///
/// Pipeline delegates use this to recognise companion stages (compression)
/// that must sit on the wire side of the interception stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Decoder,
    Encoder,
    Compressor,
    Decompressor,
    Interceptor,
    Other,
}

impl StageKind {
    pub const ALL: [StageKind; 6] = [
        StageKind::Decoder,
        StageKind::Encoder,
        StageKind::Compressor,
        StageKind::Decompressor,
        StageKind::Interceptor,
        StageKind::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Decoder => "decoder",
            StageKind::Encoder => "encoder",
            StageKind::Compressor => "compressor",
            StageKind::Decompressor => "decompressor",
            StageKind::Interceptor => "interceptor",
            StageKind::Other => "other",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        StageKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Invalid stage kind: {s}"))
    }
}

/// One named unit of a channel's pipeline.
///
/// Inbound messages visit stages head to tail, outbound messages tail to head.
/// Returning `Ok(None)` drops the message at this stage.
///
/// Pipelines drive stages through the `*_cell` methods, which work on the
/// message's shared [`PacketCell`]. The defaults move the message out, run
/// [`inbound`](Self::inbound) or [`outbound`](Self::outbound), and put the
/// result back; a drop leaves the cell empty.
pub trait Stage: DowncastSync {
    fn kind(&self) -> StageKind {
        StageKind::Other
    }

    fn inbound(&self, message: Box<dyn Message>) -> Result<Option<Box<dyn Message>>> {
        Ok(Some(message))
    }

    fn outbound(&self, message: Box<dyn Message>) -> Result<Option<Box<dyn Message>>> {
        Ok(Some(message))
    }

    /// Returns whether the cell still holds a message afterwards.
    fn inbound_cell(&self, cell: &PacketCell) -> Result<bool> {
        step(cell, |message| self.inbound(message))
    }

    /// Returns whether the cell still holds a message afterwards.
    fn outbound_cell(&self, cell: &PacketCell) -> Result<bool> {
        step(cell, |message| self.outbound(message))
    }
}

fn step(
    cell: &PacketCell,
    f: impl FnOnce(Box<dyn Message>) -> Result<Option<Box<dyn Message>>>,
) -> Result<bool> {
    let Some(message) = cell.take() else {
        return Ok(false);
    };
    let out = f(message)?;
    let kept = out.is_some();
    cell.set(out);
    Ok(kept)
}

impl_downcast!(sync Stage);

pub type StageRef = Arc<dyn Stage>;

/// Concrete type of a stage, for remove/get by type.
pub fn stage_type_id(stage: &StageRef) -> TypeId {
    std::any::Any::type_id((**stage).as_any())
}

/// Outcome of running a message through a pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Reached the end of the pipeline and was handed to the sink.
    Delivered,
    /// Dropped by the named stage.
    Dropped { by: String },
    /// The cell was already empty; nothing ran.
    Empty,
}

/// A channel's ordered chain of named stages.
///
/// Mutations fail with [`InterceptError::DuplicateStage`] or
/// [`InterceptError::StageNotFound`]; nothing else.
pub trait Pipeline: Send + Sync {
    fn add_first(&self, name: &str, stage: StageRef) -> Result<()>;
    fn add_last(&self, name: &str, stage: StageRef) -> Result<()>;
    fn add_before(&self, base: &str, name: &str, stage: StageRef) -> Result<()>;
    fn add_after(&self, base: &str, name: &str, stage: StageRef) -> Result<()>;

    /// Remove by name.
    fn remove(&self, name: &str) -> Result<StageRef>;
    /// Remove by instance identity.
    fn remove_stage(&self, stage: &StageRef) -> Result<String>;
    /// Remove the first stage whose concrete type is `type_id`.
    fn remove_type(&self, type_id: TypeId) -> Result<(String, StageRef)>;
    fn remove_first(&self) -> Option<(String, StageRef)>;
    fn remove_last(&self) -> Option<(String, StageRef)>;

    /// Swap the stage called `old` for `stage` under `new_name`, keeping its position.
    fn replace(&self, old: &str, new_name: &str, stage: StageRef) -> Result<StageRef>;

    fn get(&self, name: &str) -> Option<StageRef>;
    fn get_by_type(&self, type_id: TypeId) -> Option<(String, StageRef)>;
    fn first(&self) -> Option<(String, StageRef)>;
    fn last(&self) -> Option<(String, StageRef)>;
    fn names(&self) -> Vec<String>;
    /// Ordered snapshot of every stage, head first.
    fn stages(&self) -> Vec<(String, StageRef)>;

    fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Run the inbound message held by `cell` head to tail, skipping the stage
    /// named `skip`.
    ///
    /// Stages work on the cell in place, so a drop is seen by every holder.
    /// A delivered message is moved out of the cell too: the cell is spent
    /// either way once this returns.
    fn fire_read(&self, cell: &PacketCell, skip: Option<&str>) -> Result<Delivery>;

    /// Run the outbound message held by `cell` tail to head, skipping the stage
    /// named `skip`. Same cell semantics as [`fire_read`](Self::fire_read).
    fn fire_write(&self, cell: &PacketCell, skip: Option<&str>) -> Result<Delivery>;

    /// Hand an error to the channel's error boundary.
    fn fire_exception(&self, error: InterceptError);
}

/// Typed conveniences over [`Pipeline`].
pub trait PipelineExt: Pipeline {
    fn get_of<S: Stage>(&self) -> Option<(String, Arc<S>)> {
        let (name, stage) = self.get_by_type(TypeId::of::<S>())?;
        stage.downcast_arc::<S>().ok().map(|s| (name, s))
    }

    fn remove_of<S: Stage>(&self) -> Result<(String, StageRef)> {
        self.remove_type(TypeId::of::<S>())
    }
}

impl<P: Pipeline + ?Sized> PipelineExt for P {}

/// A unit of work run by an [`EventLoop`].
pub trait Task: Downcast + Send {
    fn run(&mut self);

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl_downcast!(Task);

/// Completion signal for a task handed to [`EventLoop::submit`].
#[derive(Debug)]
pub struct TaskCompletion {
    rx: oneshot::Receiver<()>,
}

impl TaskCompletion {
    /// A completion together with the sender that resolves it.
    pub fn pair() -> (oneshot::Sender<()>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Wait for the task to run. Fails if it was dropped unrun.
    pub async fn wait(self) -> Result<()> {
        self.rx.await.map_err(|_| InterceptError::EventLoopShutdown)
    }
}

/// Handle to a delayed or periodic task.
#[derive(Clone, Debug)]
pub struct ScheduledTask {
    token: CancellationToken,
}

impl ScheduledTask {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Stop the task. A run already in progress finishes.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A single-threaded, strictly ordered executor bound to one or more channels.
pub trait EventLoop: Send + Sync {
    fn name(&self) -> &str;

    /// Queue a task for execution.
    fn execute(&self, task: Box<dyn Task>) -> Result<()>;

    /// Queue a task and get notified once it ran.
    fn submit(&self, task: Box<dyn Task>) -> Result<TaskCompletion>;

    /// Queue a task after `delay`.
    fn schedule(&self, task: Box<dyn Task>, delay: Duration) -> Result<ScheduledTask>;

    /// Run a task every `period`, first after `initial_delay`.
    fn schedule_at_fixed_rate(
        &self,
        task: Box<dyn Task>,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<ScheduledTask>;

    /// Whether the calling thread is this loop's thread.
    fn in_event_loop(&self) -> bool;

    fn is_shutdown(&self) -> bool;

    /// Stop accepting work. Already queued work still runs.
    fn shutdown(&self);
}

/// Closure conveniences over [`EventLoop`].
pub trait EventLoopExt: EventLoop {
    fn execute_fn<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute(Box::new(OnceTask::new(f)))
    }

    /// Run `f` on the loop and receive its result.
    fn call<T, F>(&self, f: F) -> Result<oneshot::Receiver<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(Box::new(OnceTask::new(move || {
            let _ = tx.send(f());
        })))?;
        Ok(rx)
    }
}

impl<E: EventLoop + ?Sized> EventLoopExt for E {}

/// One client's logical session.
pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;
    fn local_addr(&self) -> Option<SocketAddr>;
    fn remote_addr(&self) -> Option<SocketAddr>;
    fn state(&self) -> ChannelState;

    /// Not yet closed.
    fn is_open(&self) -> bool {
        self.state() != ChannelState::Closed
    }

    /// Open and usable.
    fn is_active(&self) -> bool {
        self.state() == ChannelState::Open
    }

    fn is_writable(&self) -> bool;
    fn pipeline(&self) -> Arc<dyn Pipeline>;
    fn event_loop(&self) -> Arc<dyn EventLoop>;

    /// Queue an outbound message through the whole pipeline.
    fn write(&self, message: Box<dyn Message>) -> Result<()>;

    /// Close the channel. Implementations drop their stages once closed.
    fn close(&self) -> Result<()>;
}

type FutureListener = Box<dyn FnOnce(&Arc<dyn Channel>) + Send>;

struct FutureState {
    done: bool,
    listeners: Vec<FutureListener>,
}

struct FutureInner {
    channel: Arc<dyn Channel>,
    state: Mutex<FutureState>,
}

/// Completion handle for an accepted connection that is not yet initialised.
///
/// Listeners run on the channel's event loop, never on the thread that
/// completes the future.
#[derive(Clone)]
pub struct ChannelFuture {
    inner: Arc<FutureInner>,
}

impl ChannelFuture {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            inner: Arc::new(FutureInner {
                channel,
                state: Mutex::new(FutureState {
                    done: false,
                    listeners: Vec::new(),
                }),
            }),
        }
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.inner.channel
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().done
    }

    /// Mark the connection initialised and notify listeners. Completing twice is a no-op.
    pub fn complete(&self) -> Result<()> {
        let listeners = {
            let mut state = self.inner.state.lock();
            if state.done {
                return Ok(());
            }
            state.done = true;
            std::mem::take(&mut state.listeners)
        };
        trace!(channel = %self.inner.channel.id(), listeners = listeners.len(), "Channel future completed");
        for listener in listeners {
            self.notify(listener)?;
        }
        Ok(())
    }

    /// Run `listener` once the future completes, or right away if it already has.
    pub fn add_listener<F>(&self, listener: F) -> Result<()>
    where
        F: FnOnce(&Arc<dyn Channel>) + Send + 'static,
    {
        let listener: FutureListener = Box::new(listener);
        {
            let mut state = self.inner.state.lock();
            if !state.done {
                state.listeners.push(listener);
                return Ok(());
            }
        }
        self.notify(listener)
    }

    /// Whether both handles refer to the same future.
    pub fn same_future(&self, other: &ChannelFuture) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn notify(&self, listener: FutureListener) -> Result<()> {
        let channel = Arc::clone(&self.inner.channel);
        self.inner
            .channel
            .event_loop()
            .execute_fn(move || listener(&channel))
    }
}

impl fmt::Debug for ChannelFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelFuture")
            .field("channel", &self.inner.channel.id())
            .field("done", &self.is_done())
            .finish()
    }
}
