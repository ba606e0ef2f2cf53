//! Listener contract.
//!
//! A listener sees one message of one concrete type and decides its fate:
//! return it (possibly replaced by a new value) to let it continue, or return
//! `None` to cancel it. Cancelling stops the dispatch pass; no later listener
//! sees the message and it is never delivered.

use crate::error::Result;
use crate::protocol::message::Message;
use crate::transport::Channel;
use std::fmt;
use std::sync::Arc;

/// Handles messages of type `M` on behalf of an application module.
pub trait Listener<M: Message>: Send + Sync + 'static {
    /// `Ok(Some(m))` forwards `m`, `Ok(None)` cancels, `Err` aborts the
    /// dispatch pass and reaches the connection's error boundary.
    fn handle(&self, channel: &dyn Channel, message: M) -> Result<Option<M>>;
}

impl<M, F> Listener<M> for F
where
    M: Message,
    F: Fn(&dyn Channel, M) -> Option<M> + Send + Sync + 'static,
{
    fn handle(&self, channel: &dyn Channel, message: M) -> Result<Option<M>> {
        Ok(self(channel, message))
    }
}

/// Adapts a closure that can fail into a [`Listener`].
pub struct Fallible<F>(F);

/// Wrap `f` so its errors propagate out of dispatch.
pub fn fallible<M, F>(f: F) -> Fallible<F>
where
    M: Message,
    F: Fn(&dyn Channel, M) -> Result<Option<M>> + Send + Sync + 'static,
{
    Fallible(f)
}

impl<M, F> Listener<M> for Fallible<F>
where
    M: Message,
    F: Fn(&dyn Channel, M) -> Result<Option<M>> + Send + Sync + 'static,
{
    fn handle(&self, channel: &dyn Channel, message: M) -> Result<Option<M>> {
        (self.0)(channel, message)
    }
}

/// Handle returned by registration, used to unregister.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(pub(crate) u64);

impl ListenerId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

pub(crate) type ErasedListener =
    dyn Fn(&dyn Channel, Box<dyn Message>) -> Result<Option<Box<dyn Message>>> + Send + Sync;

fn erased<F>(f: F) -> Arc<ErasedListener>
where
    F: Fn(&dyn Channel, Box<dyn Message>) -> Result<Option<Box<dyn Message>>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Hide the message type behind `dyn Message` so listeners of every type can
/// share one registry. A message of another type passes through untouched.
pub(crate) fn erase<M, L>(listener: L) -> Arc<ErasedListener>
where
    M: Message,
    L: Listener<M>,
{
    erased(move |channel, message| {
        let typed = match message.downcast::<M>() {
            Ok(typed) => *typed,
            Err(other) => return Ok(Some(other)),
        };
        Ok(listener
            .handle(channel, typed)?
            .map(|m| Box::new(m) as Box<dyn Message>))
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::error::InterceptError;
    use crate::transport::local::{LocalChannel, LocalEventLoop};
    use crate::transport::EventLoop;

    #[derive(Debug, PartialEq)]
    struct Chat(String);

    #[derive(Debug)]
    struct Other;

    crate::impl_message!(Chat, Other);

    #[test]
    fn test_erased_listener_rewrites_and_cancels() {
        let event_loop = LocalEventLoop::spawn("listener-test").unwrap();
        let (channel, _endpoint) = LocalChannel::new(event_loop.clone());

        let upper = erase::<Chat, _>(|_: &dyn Channel, m: Chat| Some(Chat(m.0.to_uppercase())));
        let out = upper(&*channel, Box::new(Chat("hi".into())))
            .unwrap()
            .unwrap();
        assert_eq!(out.downcast_ref::<Chat>(), Some(&Chat("HI".into())));

        let cancel = erase::<Chat, _>(|_: &dyn Channel, _m: Chat| -> Option<Chat> { None });
        assert!(cancel(&*channel, Box::new(Chat("x".into())))
            .unwrap()
            .is_none());

        let passthrough = cancel(&*channel, Box::new(Other)).unwrap();
        assert!(passthrough.unwrap().is::<Other>());
        event_loop.shutdown();
    }

    #[test]
    fn test_fallible_listener_propagates() {
        let event_loop = LocalEventLoop::spawn("fallible-test").unwrap();
        let (channel, _endpoint) = LocalChannel::new(event_loop.clone());

        let failing = erase::<Chat, _>(fallible(|_: &dyn Channel, _m: Chat| {
            Err(InterceptError::Listener("rejected".into()))
        }));
        let err = failing(&*channel, Box::new(Chat("x".into()))).unwrap_err();
        assert!(matches!(err, InterceptError::Listener(msg) if msg == "rejected"));
        event_loop.shutdown();
    }

    #[test]
    fn test_listener_id_display() {
        assert_eq!(ListenerId(3).to_string(), "listener-3");
        assert_eq!(ListenerId(3).raw(), 3);
    }
}
