//! Property-based tests using proptest
//!
//! These tests validate dispatch ordering and registry bookkeeping across a
//! wide range of randomly generated registration sequences.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use channel_intercept::protocol::ListenerRegistry;
use channel_intercept::transport::local::{LocalChannel, LocalEventLoop};
use channel_intercept::{impl_message, Channel, ListenerId, ListenerPriority, MessageType, PacketCell};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Tick(u32);

impl_message!(Tick);

static CHANNEL: Lazy<Arc<LocalChannel>> = Lazy::new(|| {
    let event_loop = LocalEventLoop::spawn("proptest").expect("event loop should start");
    let (channel, _endpoint) = LocalChannel::new(event_loop);
    channel
});

fn priority() -> impl Strategy<Value = ListenerPriority> {
    prop::sample::select(ListenerPriority::ALL.to_vec())
}

/// Registers one logging listener per priority, in order. The listener at
/// `cancel_at`, if any, cancels.
fn register_all(
    registry: &ListenerRegistry,
    priorities: &[ListenerPriority],
    cancel_at: Option<usize>,
) -> (Arc<Mutex<Vec<usize>>>, Vec<ListenerId>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let ids = priorities
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            let log = Arc::clone(&log);
            registry.register_with_priority(p, move |_: &dyn Channel, t: Tick| {
                log.lock().push(i);
                (Some(i) != cancel_at).then_some(Tick(t.0 + 1))
            })
        })
        .collect();
    (log, ids)
}

/// Registration indexes in the order dispatch must visit them.
fn expected_order(priorities: &[ListenerPriority]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..priorities.len()).collect();
    order.sort_by_key(|&i| priorities[i]);
    order
}

// Property: listeners run by ascending priority, then registration order
proptest! {
    #[test]
    fn prop_dispatch_order(priorities in prop::collection::vec(priority(), 1..24)) {
        let registry = ListenerRegistry::new();
        let (log, _) = register_all(&registry, &priorities, None);

        let out = registry.dispatch(&**CHANNEL, Box::new(Tick(0))).unwrap().unwrap();

        prop_assert_eq!(log.lock().clone(), expected_order(&priorities));
        prop_assert_eq!(out.downcast_ref::<Tick>().unwrap().0 as usize, priorities.len());
    }
}

// Property: a cancel stops the pass; nothing after the cancelling listener runs
proptest! {
    #[test]
    fn prop_cancel_stops_pass(
        priorities in prop::collection::vec(priority(), 1..24),
        pick in any::<prop::sample::Index>(),
    ) {
        let cancel_at = pick.index(priorities.len());
        let registry = ListenerRegistry::new();
        let (log, _) = register_all(&registry, &priorities, Some(cancel_at));

        let out = registry.dispatch(&**CHANNEL, Box::new(Tick(0))).unwrap();
        prop_assert!(out.is_none());

        let order = expected_order(&priorities);
        let stop = order.iter().position(|&i| i == cancel_at).unwrap();
        prop_assert_eq!(log.lock().clone(), order[..=stop].to_vec());
    }
}

// Property: unregistering every listener leaves no buckets behind
proptest! {
    #[test]
    fn prop_unregister_prunes_buckets(
        (priorities, removal) in prop::collection::vec(priority(), 1..24).prop_flat_map(|p| {
            let order: Vec<usize> = (0..p.len()).collect();
            (Just(p), Just(order).prop_shuffle())
        }),
    ) {
        let registry = ListenerRegistry::new();
        let (_, ids) = register_all(&registry, &priorities, None);
        let n = ids.len();

        for (removed, &i) in removal.iter().enumerate() {
            prop_assert!(registry.unregister(ids[i]));
            prop_assert!(!registry.unregister(ids[i]));
            prop_assert_eq!(registry.listener_count(), n - removed - 1);
        }

        prop_assert!(!registry.has_listeners(MessageType::of::<Tick>()));
        for p in ListenerPriority::ALL {
            prop_assert!(!registry.has_bucket(MessageType::of::<Tick>(), p));
        }
        prop_assert!(registry.registered_types().is_empty());
    }
}

// Property: a bucket exists exactly when a listener is registered at that priority
proptest! {
    #[test]
    fn prop_bucket_presence(
        priorities in prop::collection::vec(priority(), 1..24),
        keep in prop::collection::vec(any::<bool>(), 24),
    ) {
        let registry = ListenerRegistry::new();
        let (_, ids) = register_all(&registry, &priorities, None);

        for (i, id) in ids.iter().enumerate() {
            if !keep[i] {
                registry.unregister(*id);
            }
        }

        for p in ListenerPriority::ALL {
            let live = priorities
                .iter()
                .enumerate()
                .any(|(i, &q)| q == p && keep[i]);
            prop_assert_eq!(registry.has_bucket(MessageType::of::<Tick>(), p), live);
        }
    }
}

// Property: dispatching through a cell agrees with dispatching the message
proptest! {
    #[test]
    fn prop_cell_dispatch_matches(
        priorities in prop::collection::vec(priority(), 0..12),
        cancel in any::<Option<prop::sample::Index>>(),
    ) {
        let cancel_at = match (priorities.is_empty(), cancel) {
            (false, Some(pick)) => Some(pick.index(priorities.len())),
            _ => None,
        };
        let registry = ListenerRegistry::new();
        register_all(&registry, &priorities, cancel_at);

        let cell = PacketCell::new(Box::new(Tick(0)));
        let survived = registry.dispatch_cell(&**CHANNEL, &cell).unwrap();

        prop_assert_eq!(survived, cancel_at.is_none());
        prop_assert_eq!(cell.is_present(), survived);
        if survived {
            let value = cell.with(|m| m.and_then(|m| m.downcast_ref::<Tick>()).map(|t| t.0));
            prop_assert_eq!(value, Some(priorities.len() as u32));
        }
    }
}
