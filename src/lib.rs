//! # channel-intercept
//!
//! Transparent per-connection message interception for pipeline-based
//! protocol servers.
//!
//! Application modules register listeners per message type and priority. The
//! interceptor installs one stage at the head of every tracked connection's
//! pipeline; each message passing through that stage, in either direction,
//! is handed to the listeners, which may observe it, replace it, or cancel it.
//!
//! ## Layout
//! - [`protocol`]: messages, listener priorities, the listener contract and the registry
//! - [`transport`]: the channel, pipeline and event loop abstractions consumed
//!   from the transport, plus an in-process implementation
//! - [`intercept`]: forwarding delegates, the interception stage, the lifecycle
//!   hook and the [`PacketInterceptor`] entry point
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging and metrics
//!
//! ## Example
//! ```rust,no_run
//! use channel_intercept::{impl_message, Channel, InterceptConfig, ListenerPriority, PacketInterceptor};
//!
//! #[derive(Debug)]
//! struct Chat {
//!     text: String,
//! }
//! impl_message!(Chat);
//!
//! # fn main() -> channel_intercept::Result<()> {
//! let interceptor = PacketInterceptor::new(InterceptConfig::default())?;
//! interceptor.register_with_priority(ListenerPriority::High, |_: &dyn Channel, chat: Chat| {
//!     (chat.text != "spam").then_some(chat)
//! });
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod intercept;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use config::{InterceptConfig, InterceptorConfig, LoggingConfig};
pub use error::{InterceptError, Result};
pub use intercept::{
    CarrierRegistry, ChannelDelegate, CompanionTable, ConnectionHook, PacketInterceptor,
};
pub use protocol::{
    ListenerId, ListenerPriority, ListenerRegistry, Message, MessageType, PacketCell,
};
pub use transport::{Channel, ChannelFuture, EventLoop, Pipeline, Stage, StageKind, Task};
