//! In-process transport.
//!
//! A complete, socket-free implementation of the transport boundary:
//! - [`LocalEventLoop`]: one OS thread driving a tokio current-thread runtime,
//!   with a FIFO job queue. Delayed and periodic work is timed on the same
//!   runtime and re-enqueued onto the queue when due, so everything for a
//!   channel runs on one thread in submission order.
//! - [`EventLoopGroup`]: a fixed pool of loops handed out round-robin.
//! - [`LocalPipeline`]: copy-on-write stage chain; readers never block writers.
//! - [`LocalChannel`]: connection state plus the sinks that stand in for the
//!   wire and the application.

use crate::error::{constants, InterceptError, Result};
use crate::protocol::message::{Message, PacketCell};
use crate::transport::{
    stage_type_id, Channel, ChannelId, ChannelState, Delivery, EventLoop, InboundTask,
    OutboundTask, Pipeline, ScheduledTask, StageRef, Task, TaskCompletion,
};
use crate::utils::metrics::global_metrics;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::any::TypeId;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

type Job = Box<dyn FnOnce() + Send>;

/// Single-threaded executor backed by a dedicated thread.
pub struct LocalEventLoop {
    name: String,
    jobs: mpsc::UnboundedSender<Job>,
    runtime: tokio::runtime::Handle,
    thread_id: ThreadId,
    shutdown: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LocalEventLoop {
    /// Start a new loop on its own thread.
    #[instrument(skip(name), fields(event_loop = %name.as_ref()))]
    pub fn spawn(name: impl AsRef<str>) -> Result<Arc<Self>> {
        let name = name.as_ref().to_string();
        let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<Job>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let loop_name = name.clone();

        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(runtime.handle().clone()));

                runtime.block_on(async move {
                    loop {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            job = jobs_rx.recv() => match job {
                                Some(job) => run_job(&loop_name, job),
                                None => break,
                            },
                        }
                    }

                    // Work queued before shutdown still runs.
                    jobs_rx.close();
                    while let Ok(job) = jobs_rx.try_recv() {
                        run_job(&loop_name, job);
                    }
                    debug!(event_loop = %loop_name, "Event loop stopped");
                });
            })?;

        let runtime = ready_rx
            .recv()
            .map_err(|_| InterceptError::Custom(constants::ERR_EVENT_LOOP_START.to_string()))??;
        let thread_id = thread.thread().id();
        info!("Event loop started");

        Ok(Arc::new(Self {
            name,
            jobs: jobs_tx,
            runtime,
            thread_id,
            shutdown,
            thread: Mutex::new(Some(thread)),
        }))
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(InterceptError::EventLoopShutdown);
        }
        self.jobs
            .send(job)
            .map_err(|_| InterceptError::EventLoopShutdown)
    }

    /// Block until the loop thread has exited. Returns immediately when called
    /// from the loop itself.
    pub fn join(&self) {
        if self.in_event_loop() {
            return;
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!(event_loop = %self.name, "Event loop thread panicked");
            }
        }
    }
}

fn run_job(loop_name: &str, job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        global_metrics().task_panicked();
        error!(event_loop = %loop_name, "Task panicked; event loop continues");
    }
}

impl EventLoop for LocalEventLoop {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, mut task: Box<dyn Task>) -> Result<()> {
        self.enqueue(Box::new(move || task.run()))
    }

    fn submit(&self, mut task: Box<dyn Task>) -> Result<TaskCompletion> {
        let (done, completion) = TaskCompletion::pair();
        self.enqueue(Box::new(move || {
            task.run();
            let _ = done.send(());
        }))?;
        Ok(completion)
    }

    fn schedule(&self, task: Box<dyn Task>, delay: Duration) -> Result<ScheduledTask> {
        if self.shutdown.is_cancelled() {
            return Err(InterceptError::EventLoopShutdown);
        }
        let token = self.shutdown.child_token();
        let cancel = token.clone();
        let jobs = self.jobs.clone();

        self.runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let mut task = task;
                    let _ = jobs.send(Box::new(move || {
                        if !cancel.is_cancelled() {
                            task.run();
                        }
                    }));
                }
            }
        });
        Ok(ScheduledTask::new(token))
    }

    fn schedule_at_fixed_rate(
        &self,
        task: Box<dyn Task>,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<ScheduledTask> {
        if period.is_zero() {
            return Err(InterceptError::Custom(
                "Periodic task period must be greater than zero".to_string(),
            ));
        }
        if self.shutdown.is_cancelled() {
            return Err(InterceptError::EventLoopShutdown);
        }
        let token = self.shutdown.child_token();
        let cancel = token.clone();
        let jobs = self.jobs.clone();
        let task = Arc::new(Mutex::new(task));

        self.runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let task = Arc::clone(&task);
                        let run_cancel = cancel.clone();
                        let sent = jobs.send(Box::new(move || {
                            if !run_cancel.is_cancelled() {
                                task.lock().run();
                            }
                        }));
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(ScheduledTask::new(token))
    }

    fn in_event_loop(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            debug!(event_loop = %self.name, "Shutting down event loop");
            self.shutdown.cancel();
        }
    }
}

impl Drop for LocalEventLoop {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Fixed pool of event loops, assigned to channels round-robin.
pub struct EventLoopGroup {
    loops: Vec<Arc<LocalEventLoop>>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(InterceptError::ConfigError(
                "Event loop group size must be greater than 0".to_string(),
            ));
        }
        let loops = (0..size)
            .map(|i| LocalEventLoop::spawn(format!("{name}-{i}")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            loops,
            next: AtomicUsize::new(0),
        })
    }

    /// The next loop in rotation.
    pub fn next(&self) -> Arc<dyn EventLoop> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        Arc::clone(&self.loops[index]) as Arc<dyn EventLoop>
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Shut down every loop and wait for their threads.
    pub fn shutdown(&self) {
        for event_loop in &self.loops {
            event_loop.shutdown();
        }
        for event_loop in &self.loops {
            event_loop.join();
        }
    }
}

/// Receiving ends of a local channel's sinks.
pub struct LocalEndpoint {
    /// Outbound messages that made it through the whole pipeline.
    pub wire: mpsc::UnboundedReceiver<Box<dyn Message>>,
    /// Inbound messages that made it through the whole pipeline.
    pub app: mpsc::UnboundedReceiver<Box<dyn Message>>,
    /// Errors raised while running the pipeline.
    pub errors: mpsc::UnboundedReceiver<InterceptError>,
}

#[derive(Clone)]
struct StageEntry {
    name: String,
    stage: StageRef,
}

impl StageEntry {
    fn pair(&self) -> (String, StageRef) {
        (self.name.clone(), Arc::clone(&self.stage))
    }
}

/// Copy-on-write pipeline. Mutations serialise on a lock; firing reads a snapshot.
pub struct LocalPipeline {
    stages: ArcSwap<Vec<StageEntry>>,
    mutation: Mutex<()>,
    wire: mpsc::UnboundedSender<Box<dyn Message>>,
    app: mpsc::UnboundedSender<Box<dyn Message>>,
    errors: mpsc::UnboundedSender<InterceptError>,
}

impl LocalPipeline {
    pub fn new() -> (Arc<Self>, LocalEndpoint) {
        let (wire_tx, wire_rx) = mpsc::unbounded_channel();
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(Self {
            stages: ArcSwap::from_pointee(Vec::new()),
            mutation: Mutex::new(()),
            wire: wire_tx,
            app: app_tx,
            errors: errors_tx,
        });
        let endpoint = LocalEndpoint {
            wire: wire_rx,
            app: app_rx,
            errors: errors_rx,
        };
        (pipeline, endpoint)
    }

    /// Apply `edit` to a copy of the chain and publish it if the edit succeeds.
    fn mutate<T>(&self, edit: impl FnOnce(&mut Vec<StageEntry>) -> Result<T>) -> Result<T> {
        let _guard = self.mutation.lock();
        let mut chain: Vec<StageEntry> = self.stages.load().iter().cloned().collect();
        let out = edit(&mut chain)?;
        self.stages.store(Arc::new(chain));
        Ok(out)
    }

    /// Drop every stage.
    pub fn clear(&self) -> usize {
        let _guard = self.mutation.lock();
        let removed = self.stages.load().len();
        self.stages.store(Arc::new(Vec::new()));
        removed
    }

    pub fn len(&self) -> usize {
        self.stages.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.load().is_empty()
    }
}

fn position(chain: &[StageEntry], name: &str) -> Result<usize> {
    chain
        .iter()
        .position(|e| e.name == name)
        .ok_or_else(|| InterceptError::StageNotFound(name.to_string()))
}

fn ensure_unique(chain: &[StageEntry], name: &str) -> Result<()> {
    if chain.iter().any(|e| e.name == name) {
        return Err(InterceptError::DuplicateStage(name.to_string()));
    }
    Ok(())
}

fn entry(name: &str, stage: StageRef) -> StageEntry {
    StageEntry {
        name: name.to_string(),
        stage,
    }
}

impl Pipeline for LocalPipeline {
    fn add_first(&self, name: &str, stage: StageRef) -> Result<()> {
        self.mutate(|chain| {
            ensure_unique(chain, name)?;
            chain.insert(0, entry(name, stage));
            Ok(())
        })
    }

    fn add_last(&self, name: &str, stage: StageRef) -> Result<()> {
        self.mutate(|chain| {
            ensure_unique(chain, name)?;
            chain.push(entry(name, stage));
            Ok(())
        })
    }

    fn add_before(&self, base: &str, name: &str, stage: StageRef) -> Result<()> {
        self.mutate(|chain| {
            ensure_unique(chain, name)?;
            let at = position(chain, base)?;
            chain.insert(at, entry(name, stage));
            Ok(())
        })
    }

    fn add_after(&self, base: &str, name: &str, stage: StageRef) -> Result<()> {
        self.mutate(|chain| {
            ensure_unique(chain, name)?;
            let at = position(chain, base)?;
            chain.insert(at + 1, entry(name, stage));
            Ok(())
        })
    }

    fn remove(&self, name: &str) -> Result<StageRef> {
        self.mutate(|chain| {
            let at = position(chain, name)?;
            Ok(chain.remove(at).stage)
        })
    }

    fn remove_stage(&self, stage: &StageRef) -> Result<String> {
        self.mutate(|chain| {
            let at = chain
                .iter()
                .position(|e| Arc::ptr_eq(&e.stage, stage))
                .ok_or_else(|| InterceptError::StageNotFound("<instance>".to_string()))?;
            Ok(chain.remove(at).name)
        })
    }

    fn remove_type(&self, type_id: TypeId) -> Result<(String, StageRef)> {
        self.mutate(|chain| {
            let at = chain
                .iter()
                .position(|e| stage_type_id(&e.stage) == type_id)
                .ok_or_else(|| InterceptError::StageNotFound(format!("{type_id:?}")))?;
            let removed = chain.remove(at);
            Ok((removed.name, removed.stage))
        })
    }

    fn remove_first(&self) -> Option<(String, StageRef)> {
        self.mutate(|chain| {
            if chain.is_empty() {
                return Err(InterceptError::StageNotFound("<first>".to_string()));
            }
            let removed = chain.remove(0);
            Ok((removed.name, removed.stage))
        })
        .ok()
    }

    fn remove_last(&self) -> Option<(String, StageRef)> {
        self.mutate(|chain| {
            let removed = chain
                .pop()
                .ok_or_else(|| InterceptError::StageNotFound("<last>".to_string()))?;
            Ok((removed.name, removed.stage))
        })
        .ok()
    }

    fn replace(&self, old: &str, new_name: &str, stage: StageRef) -> Result<StageRef> {
        self.mutate(|chain| {
            let at = position(chain, old)?;
            if new_name != old {
                ensure_unique(chain, new_name)?;
            }
            let previous = std::mem::replace(&mut chain[at], entry(new_name, stage));
            Ok(previous.stage)
        })
    }

    fn get(&self, name: &str) -> Option<StageRef> {
        self.stages
            .load()
            .iter()
            .find(|e| e.name == name)
            .map(|e| Arc::clone(&e.stage))
    }

    fn get_by_type(&self, type_id: TypeId) -> Option<(String, StageRef)> {
        self.stages
            .load()
            .iter()
            .find(|e| stage_type_id(&e.stage) == type_id)
            .map(StageEntry::pair)
    }

    fn first(&self) -> Option<(String, StageRef)> {
        self.stages.load().first().map(StageEntry::pair)
    }

    fn last(&self) -> Option<(String, StageRef)> {
        self.stages.load().last().map(StageEntry::pair)
    }

    fn names(&self) -> Vec<String> {
        self.stages.load().iter().map(|e| e.name.clone()).collect()
    }

    fn stages(&self) -> Vec<(String, StageRef)> {
        self.stages.load().iter().map(StageEntry::pair).collect()
    }

    fn fire_read(&self, cell: &PacketCell, skip: Option<&str>) -> Result<Delivery> {
        if cell.is_cancelled() {
            return Ok(Delivery::Empty);
        }
        let snapshot = self.stages.load_full();
        for e in snapshot.iter() {
            if skip == Some(e.name.as_str()) {
                continue;
            }
            if !e.stage.inbound_cell(cell)? {
                trace!(stage = %e.name, "Inbound message dropped");
                return Ok(Delivery::Dropped { by: e.name.clone() });
            }
        }
        let Some(current) = cell.take() else {
            return Ok(Delivery::Empty);
        };
        if self.app.send(current).is_err() {
            debug!("Application sink closed; inbound message discarded");
        }
        Ok(Delivery::Delivered)
    }

    fn fire_write(&self, cell: &PacketCell, skip: Option<&str>) -> Result<Delivery> {
        if cell.is_cancelled() {
            return Ok(Delivery::Empty);
        }
        let snapshot = self.stages.load_full();
        for e in snapshot.iter().rev() {
            if skip == Some(e.name.as_str()) {
                continue;
            }
            if !e.stage.outbound_cell(cell)? {
                trace!(stage = %e.name, "Outbound message dropped");
                return Ok(Delivery::Dropped { by: e.name.clone() });
            }
        }
        let Some(current) = cell.take() else {
            return Ok(Delivery::Empty);
        };
        if self.wire.send(current).is_err() {
            debug!("Wire sink closed; outbound message discarded");
        }
        Ok(Delivery::Delivered)
    }

    fn fire_exception(&self, error: InterceptError) {
        error!(error = %error, "Pipeline error");
        let _ = self.errors.send(error);
    }
}

/// A connection of the in-process transport.
pub struct LocalChannel {
    id: ChannelId,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    state: Mutex<ChannelState>,
    writable: AtomicBool,
    pipeline: Arc<LocalPipeline>,
    event_loop: Arc<dyn EventLoop>,
}

impl LocalChannel {
    /// A new pending channel bound to `event_loop`.
    pub fn new(event_loop: Arc<dyn EventLoop>) -> (Arc<Self>, LocalEndpoint) {
        Self::with_addrs(event_loop, None, None)
    }

    pub fn with_addrs(
        event_loop: Arc<dyn EventLoop>,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> (Arc<Self>, LocalEndpoint) {
        let (pipeline, endpoint) = LocalPipeline::new();
        let channel = Arc::new(Self {
            id: ChannelId::next(),
            local_addr,
            remote_addr,
            state: Mutex::new(ChannelState::Pending),
            writable: AtomicBool::new(true),
            pipeline,
            event_loop,
        });
        (channel, endpoint)
    }

    /// Move from pending to open.
    pub fn activate(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            ChannelState::Closed => Err(InterceptError::ChannelClosed),
            _ => {
                *state = ChannelState::Open;
                Ok(())
            }
        }
    }

    /// Hand a freshly decoded message to the pipeline, as the decode step would.
    pub fn receive(&self, message: Box<dyn Message>) -> Result<()> {
        self.receive_cell(PacketCell::new(message))
    }

    /// Like [`receive`](Self::receive), keeping a handle on the message's cell.
    pub fn receive_cell(&self, cell: PacketCell) -> Result<()> {
        self.ensure_open()?;
        let pipeline: Arc<dyn Pipeline> = self.pipeline.clone();
        self.event_loop
            .execute(Box::new(InboundTask::new(pipeline, cell)))
    }

    /// Queue a write of the message held by `cell`. The caller may keep a clone
    /// of the cell to see whether a stage dropped it.
    pub fn write_cell(&self, cell: PacketCell) -> Result<()> {
        self.ensure_open()?;
        let pipeline: Arc<dyn Pipeline> = self.pipeline.clone();
        self.event_loop
            .execute(Box::new(OutboundTask::new(pipeline, cell)))
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::Release);
    }

    /// The concrete pipeline, bypassing any delegate.
    pub fn local_pipeline(&self) -> &Arc<LocalPipeline> {
        &self.pipeline
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.state.lock() == ChannelState::Closed {
            return Err(InterceptError::ChannelClosed);
        }
        Ok(())
    }
}

impl Channel for LocalChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn is_writable(&self) -> bool {
        self.is_open() && self.writable.load(Ordering::Acquire)
    }

    fn pipeline(&self) -> Arc<dyn Pipeline> {
        self.pipeline.clone()
    }

    fn event_loop(&self) -> Arc<dyn EventLoop> {
        Arc::clone(&self.event_loop)
    }

    fn write(&self, message: Box<dyn Message>) -> Result<()> {
        self.write_cell(PacketCell::new(message))
    }

    #[instrument(skip(self), fields(channel = %self.id))]
    fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Closed {
                return Ok(());
            }
            *state = ChannelState::Closed;
        }
        let removed = self.pipeline.clear();
        debug!(stages = removed, "Channel closed");
        if removed > 0 && self.event_loop.is_shutdown() {
            warn!("Channel closed after its event loop shut down");
        }
        Ok(())
    }
}
