//! # Interception Layer
//!
//! Forwarding wrappers around a connection's channel, pipeline and event loop,
//! the interception stage that feeds messages to listeners, and the lifecycle
//! hook that installs that stage as connections arrive.
//!
//! ## Components
//! - **PipelineDelegate**: forwards every pipeline operation; moves companion
//!   stages (compression) to the wire side of the interception stage
//! - **ChannelDelegate**: forwards every channel operation; substitutes the two
//!   wrappers above
//! - **FilteringEventLoop**: replaces carrier tasks whose message was cancelled
//!   with a no-op
//! - **ConnectionHook**: tracks accepted connections; installs and removes the stage
//! - **PacketInterceptor**: the application-facing entry point
//!
//! ## Threading
//! Stage install, stage removal and dispatch all run on the connection's own
//! event loop. Listener registration may happen on any thread.

pub mod channel;
pub mod event_loop;
pub mod hook;
pub mod pipeline;
pub mod stage;

pub use channel::ChannelDelegate;
pub use event_loop::{CarrierRegistry, CarrierState, FilteringEventLoop};
pub use hook::ConnectionHook;
pub use pipeline::{CompanionTable, Placement, PipelineDelegate};
pub use stage::InterceptionStage;

use crate::config::{InterceptConfig, InterceptorConfig};
use crate::error::Result;
use crate::protocol::dispatcher::ListenerRegistry;
use crate::protocol::listener::{Listener, ListenerId};
use crate::protocol::message::{Message, PacketCell};
use crate::protocol::priority::ListenerPriority;
use crate::transport::{Channel, EventLoop, InboundTask, OutboundTask};
use crate::utils::metrics::Metrics;
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument, trace};

/// State shared by every delegate and stage one interceptor creates.
pub struct InterceptContext {
    pub(crate) settings: InterceptorConfig,
    pub(crate) registry: Arc<ListenerRegistry>,
    pub(crate) carriers: Arc<CarrierRegistry>,
    pub(crate) companions: CompanionTable,
    pub(crate) metrics: Arc<Metrics>,
}

impl InterceptContext {
    pub fn settings(&self) -> &InterceptorConfig {
        &self.settings
    }
}

/// Application entry point: listener registration, the lifecycle hook and
/// synthetic message injection.
pub struct PacketInterceptor {
    ctx: Arc<InterceptContext>,
    hook: ConnectionHook,
}

impl PacketInterceptor {
    /// An interceptor that recognises the transport's own message tasks.
    pub fn new(config: InterceptConfig) -> Result<Self> {
        Self::with_carriers(config, CarrierRegistry::with_transport_defaults())
    }

    /// An interceptor with an explicit set of task carriers.
    pub fn with_carriers(config: InterceptConfig, carriers: CarrierRegistry) -> Result<Self> {
        config.validate_strict()?;
        let settings = config.interceptor;
        let metrics = Arc::new(Metrics::new());
        let ctx = Arc::new(InterceptContext {
            registry: Arc::new(ListenerRegistry::with_settings(
                settings.strict_monitor,
                Arc::clone(&metrics),
            )),
            carriers: Arc::new(carriers),
            companions: CompanionTable::from_kinds(settings.companion_kinds.iter().copied()),
            metrics,
            settings,
        });
        info!(
            stage = %ctx.settings.stage_name,
            carriers = ctx.carriers.len(),
            "Packet interceptor created"
        );
        Ok(Self {
            hook: ConnectionHook::new(Arc::clone(&ctx)),
            ctx,
        })
    }

    /// Register a listener for `M` at [`ListenerPriority::Normal`].
    pub fn register<M, F>(&self, listener: F) -> ListenerId
    where
        M: Message,
        F: Fn(&dyn Channel, M) -> Option<M> + Send + Sync + 'static,
    {
        self.ctx.registry.register::<M, F>(listener)
    }

    pub fn register_with_priority<M, F>(&self, priority: ListenerPriority, listener: F) -> ListenerId
    where
        M: Message,
        F: Fn(&dyn Channel, M) -> Option<M> + Send + Sync + 'static,
    {
        self.ctx.registry.register_with_priority::<M, F>(priority, listener)
    }

    pub fn register_fallible<M, F>(&self, priority: ListenerPriority, listener: F) -> ListenerId
    where
        M: Message,
        F: Fn(&dyn Channel, M) -> Result<Option<M>> + Send + Sync + 'static,
    {
        self.ctx.registry.register_fallible::<M, F>(priority, listener)
    }

    pub fn register_listener<M, L>(&self, priority: ListenerPriority, listener: L) -> ListenerId
    where
        M: Message,
        L: Listener<M>,
    {
        self.ctx.registry.register_listener::<M, L>(priority, listener)
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        self.ctx.registry.unregister(id)
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.ctx.registry
    }

    pub fn carriers(&self) -> &Arc<CarrierRegistry> {
        &self.ctx.carriers
    }

    pub fn hook(&self) -> &ConnectionHook {
        &self.hook
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.ctx.metrics
    }

    pub fn settings(&self) -> &InterceptorConfig {
        &self.ctx.settings
    }

    /// Send `message` to the peer as if the application wrote it.
    ///
    /// The message skips the interception stage but is queued on the
    /// connection's event loop behind everything already written.
    pub fn send_message(&self, channel: &Arc<dyn Channel>, message: Box<dyn Message>) -> Result<()> {
        self.send_cell(channel, PacketCell::new(message))
    }

    /// Like [`send_message`](Self::send_message) for a message the caller may
    /// still cancel through `cell`.
    pub fn send_cell(&self, channel: &Arc<dyn Channel>, cell: PacketCell) -> Result<()> {
        let delegate = self.hook.delegate(channel);
        let task = OutboundTask::bypassing(delegate.pipeline(), cell, self.stage_name());
        delegate.filtering_loop().execute(Box::new(task))?;
        self.ctx.metrics.synthetic_send();
        trace!(channel = %channel.id(), "Synthetic outbound message queued");
        Ok(())
    }

    /// Deliver `message` to the application as if the peer sent it.
    pub fn receive_message(
        &self,
        channel: &Arc<dyn Channel>,
        message: Box<dyn Message>,
    ) -> Result<()> {
        self.receive_cell(channel, PacketCell::new(message))
    }

    pub fn receive_cell(&self, channel: &Arc<dyn Channel>, cell: PacketCell) -> Result<()> {
        let delegate = self.hook.delegate(channel);
        let task = InboundTask::bypassing(delegate.pipeline(), cell, self.stage_name());
        delegate.filtering_loop().execute(Box::new(task))?;
        self.ctx.metrics.synthetic_receive();
        trace!(channel = %channel.id(), "Synthetic inbound message queued");
        Ok(())
    }

    /// Remove the interception stage from every tracked connection.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        self.hook.close().await?;
        self.ctx.metrics.log_metrics();
        Ok(())
    }

    fn stage_name(&self) -> &str {
        &self.ctx.settings.stage_name
    }
}

impl fmt::Debug for PacketInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketInterceptor")
            .field("stage", &self.ctx.settings.stage_name)
            .field("registry", &self.ctx.registry)
            .field("carriers", &self.ctx.carriers)
            .field("hook", &self.hook)
            .finish()
    }
}
