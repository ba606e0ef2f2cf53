//! # Message Protocol
//!
//! Typed messages and the listeners that observe, rewrite, or cancel them.
//!
//! ## Components
//! - **Message**: decoded protocol units, told apart by runtime type
//! - **Priority**: six-tier listener ordering, `Lowest` first, `Monitor` last
//! - **Listener**: the `(channel, message) -> message | cancel` contract
//! - **Dispatcher**: per-type, per-priority registry with in-order, cancellable dispatch
//!
//! ## Dispatch Rules
//! - A message type with no listeners passes through untouched after a single
//!   hash lookup.
//! - The first listener that cancels ends the pass; no later listener, in any
//!   tier, sees the message.
//! - Listener errors are returned to the caller, never swallowed.

pub mod dispatcher;
pub mod listener;
pub mod message;
pub mod priority;

#[cfg(test)]
mod tests;

pub use dispatcher::ListenerRegistry;
pub use listener::{fallible, Fallible, Listener, ListenerId};
pub use message::{Direction, Message, MessageType, PacketCell};
pub use priority::ListenerPriority;
