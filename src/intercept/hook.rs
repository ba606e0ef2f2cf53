//! Connection lifecycle hook.
//!
//! The hook is the list of "connection accepted" futures the interceptor
//! tracks. Each tracked future gets a completion listener that installs the
//! interception stage at the head of the connection's pipeline. Replacing,
//! removing or closing entries removes the stage again.
//!
//! Both install and removal run on the connection's own event loop. Install
//! checks for an existing stage first, so completing or tracking the same
//! connection twice still leaves exactly one stage.

use crate::error::{constants, InterceptError, Result};
use crate::intercept::channel::ChannelDelegate;
use crate::intercept::stage::InterceptionStage;
use crate::intercept::InterceptContext;
use crate::transport::{Channel, ChannelFuture, ChannelId, OnceTask, TaskCompletion};
use crate::utils::metrics::Timer;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

struct HookShared {
    ctx: Arc<InterceptContext>,
    delegates: Mutex<HashMap<ChannelId, Arc<ChannelDelegate>>>,
    closed: AtomicBool,
}

impl HookShared {
    fn delegate(&self, channel: &Arc<dyn Channel>) -> Arc<ChannelDelegate> {
        let mut delegates = self.delegates.lock();
        Arc::clone(
            delegates
                .entry(channel.id())
                .or_insert_with(|| ChannelDelegate::wrap(Arc::clone(channel), &self.ctx)),
        )
    }

    /// Runs on the channel's event loop.
    fn install(&self, channel: &Arc<dyn Channel>, released: &AtomicBool) {
        if released.load(Ordering::Acquire) {
            trace!(channel = %channel.id(), "Entry no longer tracked; skipping install");
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            trace!(channel = %channel.id(), "Hook closed; skipping install");
            return;
        }
        if !channel.is_open() {
            trace!(channel = %channel.id(), "Channel already closed; skipping install");
            return;
        }

        let delegate = self.delegate(channel);
        let pipeline = delegate.pipeline();
        let name = &self.ctx.settings.stage_name;
        if pipeline.contains(name) {
            trace!(channel = %channel.id(), stage = %name, "Interception stage already installed");
            return;
        }

        let stage = Arc::new(InterceptionStage::new(
            &delegate,
            Arc::clone(&self.ctx.registry),
        ));
        match pipeline.add_first(name, stage) {
            Ok(()) => {
                self.ctx.metrics.stage_installed();
                debug!(channel = %channel.id(), stage = %name, "Interception stage installed");
            }
            Err(e) => pipeline.fire_exception(e),
        }
    }

    /// Queue removal of the interception stage on the channel's event loop.
    fn uninstall(self: &Arc<Self>, channel: &Arc<dyn Channel>) -> Result<TaskCompletion> {
        let shared = Arc::clone(self);
        let target = Arc::clone(channel);
        let task = OnceTask::new(move || shared.remove_stage(&target));
        channel.event_loop().submit(Box::new(task))
    }

    /// Runs on the channel's event loop.
    fn remove_stage(&self, channel: &Arc<dyn Channel>) {
        self.delegates.lock().remove(&channel.id());

        let pipeline = channel.pipeline();
        let name = &self.ctx.settings.stage_name;
        let Some(stage) = pipeline.get(name) else {
            trace!(channel = %channel.id(), "No interception stage to remove");
            return;
        };
        if !stage.is::<InterceptionStage>() {
            warn!(channel = %channel.id(), stage = %name, "Stage name taken by a foreign stage; leaving it");
            return;
        }
        match pipeline.remove_stage(&stage) {
            Ok(_) => {
                self.ctx.metrics.stage_removed();
                debug!(channel = %channel.id(), stage = %name, "Interception stage removed");
            }
            Err(e) => trace!(channel = %channel.id(), error = %e, "Interception stage already gone"),
        }
    }
}

/// One tracked future. `released` is set once the entry leaves the hook, so a
/// completion that fires afterwards installs nothing.
struct Entry {
    future: ChannelFuture,
    released: Arc<AtomicBool>,
}

impl Entry {
    fn new(future: ChannelFuture) -> Self {
        Self {
            future,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    fn channel(&self) -> &Arc<dyn Channel> {
        self.future.channel()
    }
}

/// Tracked "connection accepted" futures.
pub struct ConnectionHook {
    shared: Arc<HookShared>,
    entries: Mutex<Vec<Entry>>,
}

impl ConnectionHook {
    pub fn new(ctx: Arc<InterceptContext>) -> Self {
        Self {
            shared: Arc::new(HookShared {
                ctx,
                delegates: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Track `future`. The interception stage is installed once it completes.
    pub fn push(&self, future: ChannelFuture) -> Result<()> {
        self.ensure_open()?;
        if self.shared.ctx.settings.prune_closed_on_push {
            self.prune_closed();
        }
        let entry = Entry::new(future);
        let released = Arc::clone(&entry.released);
        let future = entry.future.clone();
        self.entries.lock().push(entry);
        self.observe(&future, released)
    }

    /// Replace the entry at `index`, returning the old one.
    ///
    /// The old connection's stage removal is queued on its own event loop
    /// before the new entry is observed. Setting the same future again is a
    /// no-op for the stage.
    pub fn set(&self, index: usize, future: ChannelFuture) -> Result<ChannelFuture> {
        self.ensure_open()?;
        let (previous, released) = {
            let mut entries = self.entries.lock();
            let len = entries.len();
            let slot = entries
                .get_mut(index)
                .ok_or(InterceptError::IndexOutOfBounds { index, len })?;
            if slot.future.same_future(&future) {
                return Ok(future);
            }
            let entry = Entry::new(future.clone());
            let released = Arc::clone(&entry.released);
            (std::mem::replace(slot, entry), released)
        };
        self.release(&previous);
        self.observe(&future, released)?;
        Ok(previous.future)
    }

    /// Stop tracking the entry at `index` and remove its stage.
    pub fn remove(&self, index: usize) -> Result<ChannelFuture> {
        let removed = {
            let mut entries = self.entries.lock();
            let len = entries.len();
            if index >= len {
                return Err(InterceptError::IndexOutOfBounds { index, len });
            }
            entries.remove(index)
        };
        self.release(&removed);
        Ok(removed.future)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Real channels of every tracked entry, in tracking order.
    pub fn channels(&self) -> Vec<Arc<dyn Channel>> {
        self.entries
            .lock()
            .iter()
            .map(|e| Arc::clone(e.channel()))
            .collect()
    }

    /// The delegate of a tracked connection, once its stage was installed.
    pub fn delegate_for(&self, id: ChannelId) -> Option<Arc<ChannelDelegate>> {
        self.shared.delegates.lock().get(&id).cloned()
    }

    /// The cached delegate for `channel`, or a new one.
    pub fn delegate(&self, channel: &Arc<dyn Channel>) -> Arc<ChannelDelegate> {
        match self.delegate_for(channel.id()) {
            Some(delegate) => delegate,
            None => ChannelDelegate::wrap(Arc::clone(channel), &self.shared.ctx),
        }
    }

    /// Forget entries whose connection closed. Returns how many were dropped.
    pub fn prune_closed(&self) -> usize {
        let closed: Vec<ChannelId> = {
            let mut entries = self.entries.lock();
            let mut closed = Vec::new();
            entries.retain(|e| {
                let open = e.channel().is_open();
                if !open {
                    e.released.store(true, Ordering::Release);
                    closed.push(e.channel().id());
                }
                open
            });
            closed
        };
        if !closed.is_empty() {
            let mut delegates = self.shared.delegates.lock();
            for id in &closed {
                delegates.remove(id);
            }
            debug!(pruned = closed.len(), "Pruned closed connections");
        }
        closed.len()
    }

    /// Remove the interception stage from every tracked connection.
    ///
    /// Further pushes fail with [`InterceptError::HookClosed`]. Waits up to the
    /// configured close timeout for the removals to run. The delegate cache is
    /// emptied even when the wait times out.
    #[instrument(skip(self), fields(tracked = self.len()))]
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _timer = Timer::start("hook_close");
        let entries = std::mem::take(&mut *self.entries.lock());

        let mut pending = Vec::with_capacity(entries.len());
        let mut queued = HashSet::with_capacity(entries.len());
        for entry in &entries {
            entry.released.store(true, Ordering::Release);
            let channel = entry.channel();
            if !queued.insert(channel.id()) {
                continue;
            }
            match self.shared.uninstall(channel) {
                Ok(completion) => pending.push(completion.wait()),
                Err(e) => warn!(
                    channel = %channel.id(),
                    error = %e,
                    "Could not queue stage removal"
                ),
            }
        }

        let timeout = self.shared.ctx.settings.close_timeout;
        let outcome = tokio::time::timeout(timeout, join_all(pending)).await;
        self.shared.delegates.lock().clear();
        let results = outcome.map_err(|_| InterceptError::Timeout)?;
        for result in results {
            if let Err(e) = result {
                debug!(error = %e, "Stage removal dropped by a stopped event loop");
            }
        }
        debug!(connections = entries.len(), "Connection hook closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(InterceptError::HookClosed);
        }
        Ok(())
    }

    fn observe(&self, future: &ChannelFuture, released: Arc<AtomicBool>) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        future.add_listener(move |channel| shared.install(channel, &released))
    }

    /// Stop acting on a dropped entry. The stage belongs to the channel, so it
    /// only comes off once no remaining entry tracks that channel.
    fn release(&self, entry: &Entry) {
        entry.released.store(true, Ordering::Release);
        let channel = entry.channel();
        let still_tracked = self
            .entries
            .lock()
            .iter()
            .any(|e| e.channel().id() == channel.id());
        if still_tracked {
            trace!(channel = %channel.id(), "Channel still tracked by another entry; keeping stage");
            return;
        }
        if let Err(e) = self.shared.uninstall(channel) {
            warn!(
                channel = %channel.id(),
                error = %e,
                reason = constants::ERR_EVENT_LOOP_SHUTDOWN,
                "Could not queue stage removal"
            );
            self.shared.delegates.lock().remove(&channel.id());
        }
    }
}

impl std::fmt::Debug for ConnectionHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHook")
            .field("tracked", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
