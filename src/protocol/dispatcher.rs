use crate::error::{InterceptError, Result};
use crate::protocol::listener::{erase, fallible, ErasedListener, Listener, ListenerId};
use crate::protocol::message::{Message, MessageType, PacketCell};
use crate::protocol::priority::ListenerPriority;
use crate::transport::Channel;
use crate::utils::metrics::Metrics;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

struct Registration {
    id: ListenerId,
    message_type: MessageType,
    listener: Arc<ErasedListener>,
}

/// Listeners of one message type, by tier, each tier in registration order.
type TypeBuckets = BTreeMap<ListenerPriority, Vec<Arc<Registration>>>;
type Snapshot = HashMap<TypeId, TypeBuckets>;

/// Where each live listener is filed.
type Index = HashMap<ListenerId, (TypeId, ListenerPriority)>;

/// Per-message-type, per-priority listener registry and dispatcher.
///
/// Dispatch reads an immutable snapshot without locking, so the hot path never
/// contends with registration. Registration and removal serialise on one lock,
/// build a new snapshot and publish it. Empty buckets and empty type entries
/// are pruned as part of every removal.
pub struct ListenerRegistry {
    buckets: ArcSwap<Snapshot>,
    index: Mutex<Index>,
    next_id: AtomicU64,
    strict_monitor: bool,
    metrics: Arc<Metrics>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::with_settings(false, Arc::new(Metrics::new()))
    }

    /// `strict_monitor` turns a cancelling `Monitor` listener into a dispatch error.
    pub fn with_settings(strict_monitor: bool, metrics: Arc<Metrics>) -> Self {
        Self {
            buckets: ArcSwap::from_pointee(HashMap::new()),
            index: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            strict_monitor,
            metrics,
        }
    }

    /// Register a listener for `M` at [`ListenerPriority::Normal`].
    pub fn register<M, F>(&self, listener: F) -> ListenerId
    where
        M: Message,
        F: Fn(&dyn Channel, M) -> Option<M> + Send + Sync + 'static,
    {
        self.register_listener::<M, F>(ListenerPriority::Normal, listener)
    }

    pub fn register_with_priority<M, F>(&self, priority: ListenerPriority, listener: F) -> ListenerId
    where
        M: Message,
        F: Fn(&dyn Channel, M) -> Option<M> + Send + Sync + 'static,
    {
        self.register_listener::<M, F>(priority, listener)
    }

    /// Register a listener whose errors abort the dispatch pass.
    pub fn register_fallible<M, F>(&self, priority: ListenerPriority, listener: F) -> ListenerId
    where
        M: Message,
        F: Fn(&dyn Channel, M) -> Result<Option<M>> + Send + Sync + 'static,
    {
        self.register_listener::<M, _>(priority, fallible(listener))
    }

    /// Append `listener` to the `(M, priority)` bucket.
    pub fn register_listener<M, L>(&self, priority: ListenerPriority, listener: L) -> ListenerId
    where
        M: Message,
        L: Listener<M>,
    {
        let message_type = MessageType::of::<M>();
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let registration = Arc::new(Registration {
            id,
            message_type,
            listener: erase::<M, L>(listener),
        });

        let mut index = self.index.lock();
        let mut snapshot = Snapshot::clone(&self.buckets.load());
        snapshot
            .entry(message_type.id())
            .or_default()
            .entry(priority)
            .or_default()
            .push(registration);
        self.buckets.store(Arc::new(snapshot));
        index.insert(id, (message_type.id(), priority));
        drop(index);

        self.metrics.listener_registered();
        debug!(%id, message_type = %message_type, %priority, "Listener registered");
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut index = self.index.lock();
        let Some((type_id, priority)) = index.remove(&id) else {
            return false;
        };

        let mut snapshot = Snapshot::clone(&self.buckets.load());
        if let Some(tiers) = snapshot.get_mut(&type_id) {
            if let Some(bucket) = tiers.get_mut(&priority) {
                bucket.retain(|r| r.id != id);
                if bucket.is_empty() {
                    tiers.remove(&priority);
                }
            }
            if tiers.is_empty() {
                snapshot.remove(&type_id);
            }
        }
        self.buckets.store(Arc::new(snapshot));
        drop(index);

        self.metrics.listener_unregistered();
        debug!(%id, %priority, "Listener unregistered");
        true
    }

    /// Remove every listener.
    pub fn clear(&self) -> usize {
        let mut index = self.index.lock();
        let removed = index.len();
        index.clear();
        self.buckets.store(Arc::new(HashMap::new()));
        debug!(removed, "Listener registry cleared");
        removed
    }

    /// Run every listener registered for the message's runtime type.
    ///
    /// Tiers run in [`ListenerPriority`] order, listeners within a tier in
    /// registration order. The first listener returning `None` ends the pass
    /// and `Ok(None)` is returned. A listener error ends the pass and is
    /// returned unchanged.
    pub fn dispatch(
        &self,
        channel: &dyn Channel,
        message: Box<dyn Message>,
    ) -> Result<Option<Box<dyn Message>>> {
        let snapshot = self.buckets.load();
        let message_type = message.message_type();
        let Some(tiers) = snapshot.get(&message_type.id()) else {
            self.metrics.dispatch(true);
            return Ok(Some(message));
        };
        self.metrics.dispatch(false);

        let mut current = message;
        for (priority, bucket) in tiers {
            for registration in bucket {
                self.metrics.listener_invoked();
                let outcome = (registration.listener)(channel, current).map_err(|e| {
                    self.metrics.listener_error();
                    e
                })?;
                match outcome {
                    Some(next) => current = next,
                    None => {
                        self.metrics.cancelled();
                        trace!(
                            channel = %channel.id(),
                            message_type = %message_type,
                            listener = %registration.id,
                            %priority,
                            "Message cancelled"
                        );
                        if priority.is_observe_only() {
                            self.metrics.monitor_violation();
                            warn!(
                                listener = %registration.id,
                                message_type = %message_type,
                                "Monitor listener cancelled a message"
                            );
                            if self.strict_monitor {
                                return Err(InterceptError::MonitorCancelled(message_type.name()));
                            }
                        }
                        return Ok(None);
                    }
                }
            }
        }
        Ok(Some(current))
    }

    /// Dispatch the message held by `cell` in place.
    ///
    /// Returns `true` if the message survived. A cancelled message leaves the
    /// cell empty, which every other holder of the cell observes.
    pub fn dispatch_cell(&self, channel: &dyn Channel, cell: &PacketCell) -> Result<bool> {
        let Some(message) = cell.take() else {
            return Ok(false);
        };
        match self.dispatch(channel, message)? {
            Some(message) => {
                cell.set(Some(message));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Number of live registrations.
    pub fn listener_count(&self) -> usize {
        self.index.lock().len()
    }

    pub fn has_listeners(&self, message_type: MessageType) -> bool {
        self.buckets.load().contains_key(&message_type.id())
    }

    /// Whether a `(message_type, priority)` bucket exists.
    pub fn has_bucket(&self, message_type: MessageType, priority: ListenerPriority) -> bool {
        self.buckets
            .load()
            .get(&message_type.id())
            .is_some_and(|tiers| tiers.contains_key(&priority))
    }

    /// Message types with at least one listener.
    pub fn registered_types(&self) -> Vec<MessageType> {
        self.buckets
            .load()
            .values()
            .filter_map(|tiers| tiers.values().flatten().next().map(|r| r.message_type))
            .collect()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listener_count())
            .field("types", &self.buckets.load().len())
            .field("strict_monitor", &self.strict_monitor)
            .finish()
    }
}
