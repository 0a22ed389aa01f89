use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use bytes::Bytes;
use flowctl_node::{
    adapter::{AdapterError, DryRunBackend, DryRunLog, Reconfiguration},
    AdapterOptions, TrafficAdapter,
};
use flowctl_rpc::{ReqOptions, ReqSocket};
use flowctl_tc::{handle::band_for_priority, KernelError};
use flowctl_wire::rpc::{Action, AdapterRequest, Reply};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn options(throttle: usize) -> AdapterOptions {
    AdapterOptions::default()
        .listen(SocketAddr::new(LOCALHOST, 0))
        .addresses([LOCALHOST])
        .throttle(throttle)
}

async fn start(throttle: usize) -> (TrafficAdapter, DryRunLog, ReqSocket) {
    let backend = DryRunBackend::single(LOCALHOST);
    let log = backend.log();
    let adapter = TrafficAdapter::start(options(throttle), backend).await.unwrap();

    let client = ReqSocket::connect_with(
        adapter.local_addr(),
        ReqOptions::default().timeout(Duration::from_millis(500)),
    )
    .await
    .unwrap();

    (adapter, log, client)
}

async fn update(client: &ReqSocket, priority: u32, rate_bps: u64) -> Reply {
    let request = AdapterRequest::UpdateFlowParameters(Action { priority, rate_bps });
    Reply::decode(client.request(request.encode()).await.unwrap()).unwrap()
}

/// Polls `log` until it holds `n` reconfigurations.
async fn wait_for_reconfigurations(log: &DryRunLog, n: usize) -> Vec<Reconfiguration> {
    for _ in 0..200 {
        let reconfigurations = log.reconfigurations();
        if reconfigurations.len() >= n {
            return reconfigurations;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("expected {n} reconfigurations, got {:?}", log.reconfigurations());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn baseline_installed_on_start() {
    let _ = tracing_subscriber::fmt::try_init();

    let (mut adapter, log, _client) = start(10).await;

    assert_eq!(log.baselines(), vec![1]);
    assert_eq!(adapter.advertised_addr(), adapter.local_addr());
    assert!(adapter.is_running());

    adapter.stop().await;
    assert!(log.is_closed());
    assert!(!adapter.is_running());

    // Stopping twice is fine.
    adapter.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_matching_interface() {
    let backend = DryRunBackend::single(IpAddr::V4(Ipv4Addr::new(10, 9, 9, 9)));
    let log = backend.log();

    let result = TrafficAdapter::start(options(10), backend).await;

    assert!(matches!(result, Err(AdapterError::NoMatchingInterface(_))), "{result:?}");
    assert!(log.baselines().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn updates_are_throttled() {
    let _ = tracing_subscriber::fmt::try_init();

    const K: usize = 5;
    let (mut adapter, log, client) = start(K).await;

    for i in 0..K + 5 {
        assert_eq!(update(&client, 6, 1_000_000 * (i as u64 + 1)).await, Reply::Ack);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    adapter.stop().await;

    assert_eq!(adapter.stats().received(), K + 5);
    assert!(log.reconfigurations().len() <= (K + 5) / K + 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_kth_action_is_applied() {
    let _ = tracing_subscriber::fmt::try_init();

    let (mut adapter, log, client) = start(2).await;

    update(&client, 6, 10_000_000).await;
    update(&client, 6, 20_000_000).await;

    let reconfigurations = wait_for_reconfigurations(&log, 1).await;
    assert_eq!(
        reconfigurations[0],
        Reconfiguration { if_index: 1, band: band_for_priority(6), rate_bps: 20_000_000 }
    );

    adapter.stop().await;
    assert_eq!(adapter.stats().applied(), 1);
    assert_eq!(adapter.stats().forwarded(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_rate_is_refused() {
    let (mut adapter, log, client) = start(1).await;

    assert_eq!(update(&client, 0, 0).await, Reply::Ack);
    tokio::time::sleep(Duration::from_millis(50)).await;
    update(&client, 0, 5_000_000).await;

    let reconfigurations = wait_for_reconfigurations(&log, 1).await;
    assert_eq!(reconfigurations.len(), 1);
    assert_eq!(reconfigurations[0].rate_bps, 5_000_000);

    adapter.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_request_is_rejected() {
    let (mut adapter, log, client) = start(1).await;

    let reply = client.request(Bytes::from_static(b"\xff")).await.unwrap();
    assert_eq!(Reply::decode(reply).unwrap(), Reply::Rejected);
    assert_eq!(adapter.stats().rejected(), 1);
    assert!(log.reconfigurations().is_empty());

    adapter.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn absent_errors_are_ignored() {
    let (mut adapter, log, client) = start(1).await;
    log.fail_next(KernelError::Io(io::Error::from_raw_os_error(nix::libc::ENOENT)));

    update(&client, 0, 1_000_000).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    update(&client, 0, 2_000_000).await;

    let reconfigurations = wait_for_reconfigurations(&log, 1).await;
    assert_eq!(reconfigurations[0].rate_bps, 2_000_000);
    assert!(adapter.is_running());

    adapter.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fatal_error_stops_adapter() {
    let _ = tracing_subscriber::fmt::try_init();

    let (mut adapter, log, client) = start(1).await;
    log.fail_next(KernelError::Io(io::Error::from_raw_os_error(nix::libc::EPERM)));

    update(&client, 0, 1_000_000).await;

    for _ in 0..200 {
        if !adapter.is_running() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!adapter.is_running());
    assert!(log.is_closed());

    // The listener is gone along with the consumer.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let request = AdapterRequest::UpdateFlowParameters(Action { priority: 0, rate_bps: 1 });
    assert!(client.request(request.encode()).await.is_err());

    adapter.stop().await;
}
