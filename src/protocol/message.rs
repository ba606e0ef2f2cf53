//! Already-decoded protocol messages.
//!
//! The interception layer never sees wire bytes. Messages arrive as typed
//! values behind `Box<dyn Message>` and are told apart at dispatch time by
//! their concrete runtime type.

use downcast_rs::{impl_downcast, DowncastSync};
use parking_lot::Mutex;
use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

/// A decoded, application-level protocol unit.
///
/// Implement it with [`impl_message!`](crate::impl_message) rather than by hand.
pub trait Message: DowncastSync + fmt::Debug {
    /// Human readable name of the concrete message type.
    fn type_name(&self) -> &'static str;
}

impl_downcast!(sync Message);

/// Implements [`Message`] for one or more message types.
///
/// ```
/// use channel_intercept::impl_message;
///
/// #[derive(Debug)]
/// struct Chat {
///     text: String,
/// }
/// impl_message!(Chat);
/// ```
#[macro_export]
macro_rules! impl_message {
    ($($type:ty),+ $(,)?) => {
        $(
            impl $crate::protocol::message::Message for $type {
                fn type_name(&self) -> &'static str {
                    stringify!($type)
                }
            }
        )+
    };
}

impl dyn Message {
    /// Runtime type key of this message.
    pub fn message_type(&self) -> MessageType {
        MessageType {
            id: std::any::Any::type_id(self.as_any()),
            name: self.type_name(),
        }
    }
}

/// Key identifying a concrete message type.
#[derive(Clone, Copy, Debug)]
pub struct MessageType {
    id: TypeId,
    name: &'static str,
}

impl MessageType {
    /// The key for message type `M`.
    pub fn of<M: Message>() -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: std::any::type_name::<M>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MessageType {}

impl std::hash::Hash for MessageType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Which way a message travels through a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Received from the remote peer, heading to the application.
    Inbound,
    /// Produced by the application, heading to the wire.
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, cancellable slot holding one message.
///
/// Scheduled work that will eventually deliver a message holds a clone of the
/// cell rather than the message itself. Emptying the cell (cancelling) is seen
/// by every holder, which is how a message cancelled after a task was built
/// but before the task was submitted gets suppressed.
#[derive(Clone, Default)]
pub struct PacketCell {
    slot: Arc<Mutex<Option<Box<dyn Message>>>>,
}

impl PacketCell {
    pub fn new(message: Box<dyn Message>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(message))),
        }
    }

    /// A cell that starts out cancelled.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the cell still holds a message.
    pub fn is_present(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        !self.is_present()
    }

    /// Empty the cell, returning what it held.
    pub fn cancel(&self) -> Option<Box<dyn Message>> {
        self.slot.lock().take()
    }

    /// Take the message out for delivery. Same effect as [`cancel`](Self::cancel).
    pub fn take(&self) -> Option<Box<dyn Message>> {
        self.slot.lock().take()
    }

    /// Store a message (or the absent marker) into the cell.
    pub fn set(&self, message: Option<Box<dyn Message>>) {
        *self.slot.lock() = message;
    }

    /// Type of the held message, if any.
    pub fn message_type(&self) -> Option<MessageType> {
        self.slot.lock().as_deref().map(|m| m.message_type())
    }

    /// Run `f` against the held message without taking it out.
    pub fn with<R>(&self, f: impl FnOnce(Option<&(dyn Message + 'static)>) -> R) -> R {
        let guard = self.slot.lock();
        f(guard.as_deref())
    }

    /// Whether two cells share the same slot.
    pub fn same_slot(&self, other: &PacketCell) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl From<Box<dyn Message>> for PacketCell {
    fn from(message: Box<dyn Message>) -> Self {
        Self::new(message)
    }
}

impl fmt::Debug for PacketCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message_type() {
            Some(ty) => write!(f, "PacketCell({ty})"),
            None => f.write_str("PacketCell(<cancelled>)"),
        }
    }
}
