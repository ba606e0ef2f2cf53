// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use crate::error::InterceptError;
use crate::protocol::dispatcher::ListenerRegistry;
use crate::protocol::message::{Message, MessageType, PacketCell};
use crate::protocol::priority::ListenerPriority;
use crate::transport::local::{LocalChannel, LocalEventLoop};
use crate::transport::{Channel, EventLoop};
use crate::utils::metrics::Metrics;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
struct Chat(String);

#[derive(Debug, Clone, PartialEq)]
struct Move(i32);

crate::impl_message!(Chat, Move);

fn with_channel(f: impl FnOnce(&dyn Channel)) {
    let event_loop = LocalEventLoop::spawn("protocol-tests").expect("event loop");
    let (channel, _endpoint) = LocalChannel::new(event_loop.clone());
    f(&*channel);
    event_loop.shutdown();
}

fn chat(text: &str) -> Box<dyn Message> {
    Box::new(Chat(text.to_string()))
}

fn text_of(message: &Option<Box<dyn Message>>) -> String {
    message
        .as_ref()
        .and_then(|m| m.downcast_ref::<Chat>())
        .map(|c| c.0.clone())
        .expect("a Chat message")
}

#[test]
fn test_unlistened_type_passes_through() {
    let registry = ListenerRegistry::new();
    registry.register(|_: &dyn Channel, m: Chat| Some(Chat(format!("{}!", m.0))));

    with_channel(|channel| {
        let out = registry.dispatch(channel, Box::new(Move(3))).unwrap();
        assert_eq!(out.unwrap().downcast_ref::<Move>(), Some(&Move(3)));
    });
    assert_eq!(registry.metrics().snapshot().dispatch_fast_path, 1);
    assert_eq!(registry.metrics().snapshot().listener_invocations, 0);
}

#[test]
fn test_tiers_run_in_priority_order() {
    let registry = ListenerRegistry::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    // Registered out of order on purpose.
    for priority in [
        ListenerPriority::Monitor,
        ListenerPriority::Low,
        ListenerPriority::Highest,
        ListenerPriority::Lowest,
        ListenerPriority::Normal,
        ListenerPriority::High,
    ] {
        let seen = Arc::clone(&seen);
        registry.register_with_priority(priority, move |_: &dyn Channel, m: Chat| {
            seen.lock().push(priority);
            Some(m)
        });
    }

    with_channel(|channel| {
        registry.dispatch(channel, chat("x")).unwrap();
    });
    assert_eq!(*seen.lock(), ListenerPriority::ALL.to_vec());
}

#[test]
fn test_replacement_is_visible_to_later_listeners() {
    let registry = ListenerRegistry::new();
    registry.register_with_priority(ListenerPriority::Low, |_: &dyn Channel, m: Chat| {
        Some(Chat(format!("{}-low", m.0)))
    });
    registry.register_with_priority(ListenerPriority::High, |_: &dyn Channel, m: Chat| {
        Some(Chat(format!("{}-high", m.0)))
    });

    with_channel(|channel| {
        let out = registry.dispatch(channel, chat("msg")).unwrap();
        assert_eq!(text_of(&out), "msg-low-high");
    });
}

#[test]
fn test_cancel_in_same_tier_stops_later_registrations() {
    let registry = ListenerRegistry::new();
    let later = Arc::new(Mutex::new(0));
    registry.register(|_: &dyn Channel, _m: Chat| -> Option<Chat> { None });
    let counter = Arc::clone(&later);
    registry.register(move |_: &dyn Channel, m: Chat| {
        *counter.lock() += 1;
        Some(m)
    });

    with_channel(|channel| {
        assert!(registry.dispatch(channel, chat("x")).unwrap().is_none());
    });
    assert_eq!(*later.lock(), 0);
    assert_eq!(registry.metrics().snapshot().cancellations, 1);
}

#[test]
fn test_listener_error_propagates() {
    let registry = ListenerRegistry::new();
    let after = Arc::new(Mutex::new(false));
    registry.register_fallible(ListenerPriority::Low, |_: &dyn Channel, _m: Chat| {
        Err(InterceptError::Listener("bad chat".into()))
    });
    let flag = Arc::clone(&after);
    registry.register_with_priority(ListenerPriority::High, move |_: &dyn Channel, m: Chat| {
        *flag.lock() = true;
        Some(m)
    });

    with_channel(|channel| {
        let err = registry.dispatch(channel, chat("x")).unwrap_err();
        assert!(matches!(err, InterceptError::Listener(ref msg) if msg == "bad chat"));
    });
    assert!(!*after.lock());
    assert_eq!(registry.metrics().snapshot().listener_errors, 1);
}

#[test]
fn test_monitor_cancel_is_flagged() {
    let registry = ListenerRegistry::new();
    registry.register_with_priority(ListenerPriority::Monitor, |_: &dyn Channel, _m: Chat| None);

    with_channel(|channel| {
        assert!(registry.dispatch(channel, chat("x")).unwrap().is_none());
    });
    assert_eq!(registry.metrics().snapshot().monitor_violations, 1);
}

#[test]
fn test_strict_monitor_rejects_cancel() {
    let registry = ListenerRegistry::with_settings(true, Arc::new(Metrics::new()));
    registry.register_with_priority(ListenerPriority::Monitor, |_: &dyn Channel, _m: Chat| None);

    with_channel(|channel| {
        let err = registry.dispatch(channel, chat("x")).unwrap_err();
        assert!(matches!(err, InterceptError::MonitorCancelled(_)));
    });
}

#[test]
fn test_unregister_prunes_buckets() {
    let registry = ListenerRegistry::new();
    let low = registry.register_with_priority(ListenerPriority::Low, |_: &dyn Channel, m: Chat| Some(m));
    let high = registry.register_with_priority(ListenerPriority::High, |_: &dyn Channel, m: Chat| Some(m));
    let chat_type = MessageType::of::<Chat>();

    assert!(registry.unregister(low));
    assert!(!registry.has_bucket(chat_type, ListenerPriority::Low));
    assert!(registry.has_bucket(chat_type, ListenerPriority::High));
    assert!(registry.has_listeners(chat_type));

    assert!(registry.unregister(high));
    assert!(!registry.has_listeners(chat_type));
    assert!(registry.registered_types().is_empty());
    assert!(!registry.unregister(high));
    assert_eq!(registry.listener_count(), 0);
}

#[test]
fn test_registered_types_and_clear() {
    let registry = ListenerRegistry::new();
    registry.register(|_: &dyn Channel, m: Chat| Some(m));
    registry.register(|_: &dyn Channel, m: Chat| Some(m));
    registry.register(|_: &dyn Channel, m: Move| Some(m));

    let mut names: Vec<_> = registry
        .registered_types()
        .into_iter()
        .map(|t| t.name())
        .collect();
    names.sort_unstable();
    assert_eq!(names.len(), 2);
    assert_eq!(registry.listener_count(), 3);

    assert_eq!(registry.clear(), 3);
    assert!(registry.registered_types().is_empty());
}

#[test]
fn test_dispatch_cell_cancel_empties_shared_slot() {
    let registry = ListenerRegistry::new();
    registry.register(|_: &dyn Channel, m: Chat| if m.0 == "drop" { None } else { Some(m) });

    with_channel(|channel| {
        let kept = PacketCell::new(chat("keep"));
        assert!(registry.dispatch_cell(channel, &kept).unwrap());
        assert!(kept.is_present());

        let cell = PacketCell::new(chat("drop"));
        let held_by_task = cell.clone();
        assert!(!registry.dispatch_cell(channel, &cell).unwrap());
        assert!(held_by_task.is_cancelled());

        assert!(!registry.dispatch_cell(channel, &PacketCell::empty()).unwrap());
    });
}

#[test]
fn test_listener_may_register_during_dispatch() {
    let registry = Arc::new(ListenerRegistry::new());
    let inner = Arc::clone(&registry);
    registry.register(move |_: &dyn Channel, m: Move| {
        inner.register(|_: &dyn Channel, c: Chat| Some(c));
        Some(m)
    });

    with_channel(|channel| {
        registry.dispatch(channel, Box::new(Move(1))).unwrap();
    });
    assert!(registry.has_listeners(MessageType::of::<Chat>()));
}
