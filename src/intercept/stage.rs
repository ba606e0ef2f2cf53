//! The interception stage installed on every tracked connection.

use crate::error::Result;
use crate::intercept::channel::ChannelDelegate;
use crate::protocol::dispatcher::ListenerRegistry;
use crate::protocol::message::{Direction, Message, PacketCell};
use crate::transport::{Channel, Stage, StageKind};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Runs every message in both directions through the listener registry.
///
/// Listeners receive the connection's [`ChannelDelegate`]. A cancelled message
/// is dropped here and goes no further. When the pipeline hands over the
/// message's [`PacketCell`], cancelling empties that cell for every holder.
///
/// The stage only holds a weak reference to its delegate; the delegate owns
/// the pipeline this stage sits in. Once the hook forgets the delegate, the
/// stage lets messages through untouched.
pub struct InterceptionStage {
    channel: Weak<ChannelDelegate>,
    registry: Arc<ListenerRegistry>,
}

impl InterceptionStage {
    pub fn new(channel: &Arc<ChannelDelegate>, registry: Arc<ListenerRegistry>) -> Self {
        Self {
            channel: Arc::downgrade(channel),
            registry,
        }
    }

    /// The delegate listeners see, while it is still alive.
    pub fn channel(&self) -> Option<Arc<ChannelDelegate>> {
        self.channel.upgrade()
    }

    fn intercept(
        &self,
        direction: Direction,
        message: Box<dyn Message>,
    ) -> Result<Option<Box<dyn Message>>> {
        let Some(channel) = self.channel.upgrade() else {
            trace!(%direction, "Delegate gone; passing message through");
            return Ok(Some(message));
        };
        let message_type = message.message_type();
        let out = self.registry.dispatch(&*channel, message)?;
        if out.is_none() {
            trace!(
                channel = %channel.id(),
                %direction,
                message_type = %message_type,
                "Message cancelled by listener"
            );
        }
        Ok(out)
    }

    fn intercept_cell(&self, direction: Direction, cell: &PacketCell) -> Result<bool> {
        let Some(channel) = self.channel.upgrade() else {
            trace!(%direction, "Delegate gone; passing cell through");
            return Ok(cell.is_present());
        };
        let message_type = cell.message_type();
        let survived = self.registry.dispatch_cell(&*channel, cell)?;
        if !survived {
            if let Some(message_type) = message_type {
                trace!(
                    channel = %channel.id(),
                    %direction,
                    message_type = %message_type,
                    "Cell cancelled by listener"
                );
            }
        }
        Ok(survived)
    }
}

impl Stage for InterceptionStage {
    fn kind(&self) -> StageKind {
        StageKind::Interceptor
    }

    fn inbound(&self, message: Box<dyn Message>) -> Result<Option<Box<dyn Message>>> {
        self.intercept(Direction::Inbound, message)
    }

    fn outbound(&self, message: Box<dyn Message>) -> Result<Option<Box<dyn Message>>> {
        self.intercept(Direction::Outbound, message)
    }

    fn inbound_cell(&self, cell: &PacketCell) -> Result<bool> {
        self.intercept_cell(Direction::Inbound, cell)
    }

    fn outbound_cell(&self, cell: &PacketCell) -> Result<bool> {
        self.intercept_cell(Direction::Outbound, cell)
    }
}
