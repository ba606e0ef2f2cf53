//! Task filtering and synthetic message injection

#![allow(clippy::unwrap_used, clippy::expect_used)]

use channel_intercept::intercept::{CarrierState, FilteringEventLoop};
use channel_intercept::transport::local::{LocalChannel, LocalEndpoint, LocalEventLoop};
use channel_intercept::transport::{ChannelFuture, EventLoopExt, OutboundTask};
use channel_intercept::utils::Metrics;
use channel_intercept::{
    impl_message, CarrierRegistry, Channel, EventLoop, InterceptConfig, PacketCell,
    PacketInterceptor, Pipeline, Task,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
struct Ping(u32);

impl_message!(Ping);

/// A task type of our own that carries one message.
struct Flush {
    cell: PacketCell,
    runs: Arc<AtomicUsize>,
}

impl Flush {
    fn cell(&self) -> &PacketCell {
        &self.cell
    }
}

impl Task for Flush {
    fn run(&mut self) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }
}

fn ping(n: u32) -> Box<Ping> {
    Box::new(Ping(n))
}

fn seen(message: Box<dyn channel_intercept::Message>) -> u32 {
    message.downcast_ref::<Ping>().unwrap().0
}

async fn tracked(
    interceptor: &PacketInterceptor,
) -> (Arc<LocalEventLoop>, Arc<LocalChannel>, LocalEndpoint) {
    let event_loop = LocalEventLoop::spawn("filter-test").unwrap();
    let (channel, endpoint) = LocalChannel::new(event_loop.clone());
    channel.activate().unwrap();
    let real: Arc<dyn Channel> = channel.clone();
    let future = ChannelFuture::new(real);
    interceptor.hook().push(future.clone()).unwrap();
    future.complete().unwrap();
    event_loop.call(|| ()).unwrap().await.unwrap();
    (event_loop, channel, endpoint)
}

#[tokio::test]
async fn test_cancelled_carrier_becomes_noop() {
    let event_loop = LocalEventLoop::spawn("custom-carrier").unwrap();
    let carriers = Arc::new(CarrierRegistry::new());
    carriers.declare::<Flush>(Flush::cell);
    let metrics = Arc::new(Metrics::new());
    let filtering = FilteringEventLoop::new(event_loop.clone(), carriers, Arc::clone(&metrics));

    let runs = Arc::new(AtomicUsize::new(0));
    let cancelled = PacketCell::new(ping(1));
    cancelled.cancel();
    filtering
        .execute(Box::new(Flush {
            cell: cancelled,
            runs: Arc::clone(&runs),
        }))
        .unwrap();
    filtering
        .execute(Box::new(Flush {
            cell: PacketCell::new(ping(2)),
            runs: Arc::clone(&runs),
        }))
        .unwrap();
    filtering.call(|| ()).unwrap().await.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.tasks_filtered, 2);
    assert_eq!(snapshot.tasks_suppressed, 1);
    event_loop.shutdown();
}

fn filtered(name: &str) -> (Arc<LocalEventLoop>, FilteringEventLoop, Arc<Metrics>) {
    let event_loop = LocalEventLoop::spawn(name).unwrap();
    let carriers = Arc::new(CarrierRegistry::new());
    carriers.declare::<Flush>(Flush::cell);
    let metrics = Arc::new(Metrics::new());
    let filtering = FilteringEventLoop::new(event_loop.clone(), carriers, Arc::clone(&metrics));
    (event_loop, filtering, metrics)
}

fn cancelled_flush(runs: &Arc<AtomicUsize>) -> Box<Flush> {
    let cell = PacketCell::new(ping(0));
    cell.cancel();
    Box::new(Flush {
        cell,
        runs: Arc::clone(runs),
    })
}

#[tokio::test]
async fn test_submit_suppresses_cancelled_carrier() {
    let (event_loop, filtering, metrics) = filtered("submit-cancelled");
    let runs = Arc::new(AtomicUsize::new(0));

    let completion = filtering.submit(cancelled_flush(&runs)).unwrap();
    // The stand-in still runs, so the completion fires.
    completion.wait().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(metrics.snapshot().tasks_suppressed, 1);
    event_loop.shutdown();
}

#[tokio::test]
async fn test_schedule_suppresses_cancelled_carrier() {
    let (event_loop, filtering, metrics) = filtered("schedule-cancelled");
    let runs = Arc::new(AtomicUsize::new(0));

    filtering
        .schedule(cancelled_flush(&runs), Duration::from_millis(10))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    filtering.call(|| ()).unwrap().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(metrics.snapshot().tasks_suppressed, 1);
    event_loop.shutdown();
}

#[tokio::test]
async fn test_fixed_rate_suppresses_cancelled_carrier() {
    let (event_loop, filtering, metrics) = filtered("fixed-rate-cancelled");
    let runs = Arc::new(AtomicUsize::new(0));

    let handle = filtering
        .schedule_at_fixed_rate(
            cancelled_flush(&runs),
            Duration::from_millis(5),
            Duration::from_millis(10),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    handle.cancel();
    filtering.call(|| ()).unwrap().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(metrics.snapshot().tasks_suppressed, 1);
    event_loop.shutdown();
}

#[tokio::test]
async fn test_listener_cancel_suppresses_queued_carrier() {
    let interceptor = PacketInterceptor::new(InterceptConfig::default()).unwrap();
    interceptor.register(|_: &dyn Channel, p: Ping| if p.0 == 0 { None } else { Some(p) });
    let (event_loop, channel, mut endpoint) = tracked(&interceptor).await;
    let delegate = interceptor.hook().delegate_for(channel.id()).unwrap();

    // A retry of the same write, built before the write is dispatched.
    let cell = PacketCell::new(ping(0));
    let retry = OutboundTask::new(delegate.pipeline(), cell.clone());
    channel.write_cell(cell.clone()).unwrap();
    event_loop.call(|| ()).unwrap().await.unwrap();
    assert!(cell.is_cancelled());
    assert!(endpoint.wire.try_recv().is_err());

    delegate.filtering_loop().execute(Box::new(retry)).unwrap();
    event_loop.call(|| ()).unwrap().await.unwrap();
    assert!(endpoint.wire.try_recv().is_err());

    let snapshot = interceptor.metrics().snapshot();
    assert_eq!(snapshot.cancellations, 1);
    assert_eq!(snapshot.tasks_suppressed, 1);
    event_loop.shutdown();
}

#[tokio::test]
async fn test_inbound_cancel_empties_caller_cell() {
    let interceptor = PacketInterceptor::new(InterceptConfig::default()).unwrap();
    interceptor.register(|_: &dyn Channel, _p: Ping| None);
    let (event_loop, channel, mut endpoint) = tracked(&interceptor).await;

    let cell = PacketCell::new(ping(3));
    channel.receive_cell(cell.clone()).unwrap();
    event_loop.call(|| ()).unwrap().await.unwrap();
    assert!(cell.is_cancelled());
    assert!(endpoint.app.try_recv().is_err());
    event_loop.shutdown();
}

#[tokio::test]
async fn test_cancel_after_submission_still_runs() {
    let event_loop = LocalEventLoop::spawn("late-cancel").unwrap();
    let carriers = Arc::new(CarrierRegistry::new());
    carriers.declare::<Flush>(Flush::cell);
    let filtering = FilteringEventLoop::new(event_loop.clone(), carriers, Arc::new(Metrics::new()));

    let runs = Arc::new(AtomicUsize::new(0));
    let cell = PacketCell::new(ping(1));
    filtering
        .schedule(
            Box::new(Flush {
                cell: cell.clone(),
                runs: Arc::clone(&runs),
            }),
            Duration::from_millis(30),
        )
        .unwrap();
    cell.cancel();

    tokio::time::sleep(Duration::from_millis(100)).await;
    filtering.call(|| ()).unwrap().await.unwrap();
    // Checked at submission only.
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    event_loop.shutdown();
}

#[test]
fn test_probe_without_declaration() {
    let carriers = CarrierRegistry::new();
    let task = Flush {
        cell: PacketCell::empty(),
        runs: Arc::new(AtomicUsize::new(0)),
    };
    assert_eq!(carriers.probe(&task), CarrierState::NotCarrier);

    carriers.declare::<Flush>(Flush::cell);
    assert_eq!(carriers.probe(&task), CarrierState::Cancelled);
    assert!(carriers.is_carrier::<Flush>());
    assert!(!carriers.is_carrier::<OutboundTask>());
}

#[tokio::test]
async fn test_send_cancelled_cell_writes_nothing() {
    let interceptor = PacketInterceptor::new(InterceptConfig::default()).unwrap();
    let (event_loop, channel, mut endpoint) = tracked(&interceptor).await;
    let real: Arc<dyn Channel> = channel.clone();

    let cell = PacketCell::new(ping(7));
    cell.cancel();
    interceptor.send_cell(&real, cell).unwrap();
    interceptor.send_message(&real, ping(8)).unwrap();

    assert_eq!(seen(endpoint.wire.recv().await.unwrap()), 8);
    event_loop.call(|| ()).unwrap().await.unwrap();
    assert!(endpoint.wire.try_recv().is_err());

    let snapshot = interceptor.metrics().snapshot();
    assert_eq!(snapshot.tasks_suppressed, 1);
    assert_eq!(snapshot.synthetic_sends, 2);
    event_loop.shutdown();
}

#[tokio::test]
async fn test_synthetic_messages_skip_listeners() {
    let interceptor = PacketInterceptor::new(InterceptConfig::default()).unwrap();
    interceptor.register(|_: &dyn Channel, _p: Ping| None);
    let (event_loop, channel, mut endpoint) = tracked(&interceptor).await;
    let real: Arc<dyn Channel> = channel.clone();

    interceptor.send_message(&real, ping(1)).unwrap();
    interceptor.receive_message(&real, ping(2)).unwrap();

    assert_eq!(seen(endpoint.wire.recv().await.unwrap()), 1);
    assert_eq!(seen(endpoint.app.recv().await.unwrap()), 2);
    assert_eq!(interceptor.metrics().snapshot().listener_invocations, 0);
    event_loop.shutdown();
}

#[tokio::test]
async fn test_synthetic_sends_keep_write_order() {
    let interceptor = PacketInterceptor::new(InterceptConfig::default()).unwrap();
    let (event_loop, channel, mut endpoint) = tracked(&interceptor).await;
    let real: Arc<dyn Channel> = channel.clone();

    channel.write(ping(1)).unwrap();
    interceptor.send_message(&real, ping(2)).unwrap();
    channel.write(ping(3)).unwrap();
    interceptor.send_message(&real, ping(4)).unwrap();

    let mut order = Vec::new();
    for _ in 0..4 {
        order.push(seen(endpoint.wire.recv().await.unwrap()));
    }
    assert_eq!(order, vec![1, 2, 3, 4]);
    event_loop.shutdown();
}

#[tokio::test]
async fn test_receive_cell_cancelled_delivers_nothing() {
    let interceptor = PacketInterceptor::new(InterceptConfig::default()).unwrap();
    let (event_loop, channel, mut endpoint) = tracked(&interceptor).await;
    let real: Arc<dyn Channel> = channel.clone();

    let cell = PacketCell::new(ping(5));
    cell.cancel();
    interceptor.receive_cell(&real, cell).unwrap();
    event_loop.call(|| ()).unwrap().await.unwrap();

    assert!(endpoint.app.try_recv().is_err());
    assert!(channel.local_pipeline().contains(&interceptor.settings().stage_name));
    event_loop.shutdown();
}

#[tokio::test]
async fn test_send_to_untracked_channel() {
    let interceptor = PacketInterceptor::new(InterceptConfig::default()).unwrap();
    let event_loop = LocalEventLoop::spawn("untracked").unwrap();
    let (channel, mut endpoint) = LocalChannel::new(event_loop.clone());
    channel.activate().unwrap();
    let real: Arc<dyn Channel> = channel.clone();

    interceptor.send_message(&real, ping(9)).unwrap();
    assert_eq!(seen(endpoint.wire.recv().await.unwrap()), 9);
    event_loop.shutdown();
}

#[tokio::test]
async fn test_send_after_loop_shutdown_fails() {
    let interceptor = PacketInterceptor::new(InterceptConfig::default()).unwrap();
    let (event_loop, channel, _endpoint) = tracked(&interceptor).await;
    let real: Arc<dyn Channel> = channel.clone();

    event_loop.shutdown();
    assert!(interceptor.send_message(&real, ping(1)).is_err());
}
