//! Channel delegate.
//!
//! Presents a real channel unchanged except for two accessors: `pipeline()`
//! returns the [`PipelineDelegate`] built at wrap time, and `event_loop()`
//! returns a [`FilteringEventLoop`] built on first use and cached.

use crate::error::Result;
use crate::intercept::event_loop::FilteringEventLoop;
use crate::intercept::pipeline::PipelineDelegate;
use crate::intercept::InterceptContext;
use crate::protocol::message::Message;
use crate::transport::{Channel, ChannelId, ChannelState, EventLoop, Pipeline};
use once_cell::sync::OnceCell;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

pub struct ChannelDelegate {
    inner: Arc<dyn Channel>,
    pipeline: Arc<PipelineDelegate>,
    event_loop: OnceCell<Arc<FilteringEventLoop>>,
    ctx: Arc<InterceptContext>,
}

impl ChannelDelegate {
    pub fn wrap(inner: Arc<dyn Channel>, ctx: &Arc<InterceptContext>) -> Arc<Self> {
        let pipeline = Arc::new(PipelineDelegate::new(
            inner.pipeline(),
            ctx.settings.stage_name.clone(),
            ctx.settings.transport_decoder.clone(),
            ctx.companions.clone(),
            Arc::clone(&ctx.metrics),
        ));
        Arc::new(Self {
            inner,
            pipeline,
            event_loop: OnceCell::new(),
            ctx: Arc::clone(ctx),
        })
    }

    /// The real channel.
    pub fn inner(&self) -> &Arc<dyn Channel> {
        &self.inner
    }

    pub fn pipeline_delegate(&self) -> &Arc<PipelineDelegate> {
        &self.pipeline
    }

    /// The filtering event loop, created on first call.
    pub fn filtering_loop(&self) -> &Arc<FilteringEventLoop> {
        self.event_loop.get_or_init(|| {
            Arc::new(FilteringEventLoop::new(
                self.inner.event_loop(),
                Arc::clone(&self.ctx.carriers),
                Arc::clone(&self.ctx.metrics),
            ))
        })
    }
}

impl Channel for ChannelDelegate {
    fn id(&self) -> ChannelId {
        self.inner.id()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr()
    }

    fn state(&self) -> ChannelState {
        self.inner.state()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    fn pipeline(&self) -> Arc<dyn Pipeline> {
        self.pipeline.clone()
    }

    fn event_loop(&self) -> Arc<dyn EventLoop> {
        self.filtering_loop().clone()
    }

    fn write(&self, message: Box<dyn Message>) -> Result<()> {
        self.inner.write(message)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

impl fmt::Debug for ChannelDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelDelegate")
            .field("channel", &self.inner.id())
            .field("state", &self.inner.state())
            .field("event_loop_wrapped", &self.event_loop.get().is_some())
            .finish()
    }
}
