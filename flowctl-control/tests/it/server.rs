use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use flowctl_control::{ControlOptions, ControlServer, Decision, FixedDecision};
use flowctl_node::{adapter::DryRunBackend, AdapterOptions, TrafficAdapter};
use flowctl_rpc::{ReqOptions, ReqSocket};
use flowctl_tc::handle::band_for_priority;
use flowctl_wire::rpc::{
    Action, CompletedFlow, ControlRequest, FlowAttributes, FlowReport, Reply,
};
use parking_lot::Mutex;
use tokio::net::TcpListener;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn options() -> ControlOptions {
    ControlOptions::default()
        .listen(SocketAddr::new(LOCALHOST, 0))
        .cleanup_interval(Duration::from_millis(50))
        .node_rpc(
            ReqOptions::default()
                .timeout(Duration::from_millis(500))
                .connect_timeout(Duration::from_millis(500)),
        )
}

async fn connect(server: &ControlServer) -> ReqSocket {
    ReqSocket::connect_with(server.local_addr(), ReqOptions::default()).await.unwrap()
}

async fn send(client: &ReqSocket, request: ControlRequest) -> Reply {
    Reply::decode(client.request(request.encode()).await.unwrap()).unwrap()
}

fn report(node: SocketAddr, waiting: usize, completed: usize) -> FlowReport {
    let attributes = FlowAttributes { priority: 4, ..Default::default() };
    FlowReport {
        node,
        waiting: vec![attributes; waiting],
        completed: vec![
            CompletedFlow { attributes, completion_time_us: 120, size_bytes: 1_500 };
            completed
        ],
    }
}

/// Waits until `condition` holds, for up to two seconds.
async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(condition(), "condition not reached in time");
}

#[derive(Debug, Default)]
struct Events {
    decisions: Vec<(SocketAddr, usize, usize)>,
    unregistered: Vec<SocketAddr>,
    stopped: bool,
}

/// Records every call and answers with a fixed action.
struct Recorder(Arc<Mutex<Events>>);

impl Decision for Recorder {
    fn decide(
        &mut self,
        node: SocketAddr,
        waiting: &[FlowAttributes],
        completed: &[CompletedFlow],
    ) -> Action {
        self.0.lock().decisions.push((node, waiting.len(), completed.len()));
        Action { priority: 0, rate_bps: 1_000_000 }
    }

    fn unregister(&mut self, node: SocketAddr) {
        self.0.lock().unregistered.push(node);
    }

    fn stop(&mut self) {
        self.0.lock().stopped = true;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connection_is_acknowledged() {
    let _ = tracing_subscriber::fmt::try_init();

    let action = Action { priority: 0, rate_bps: 1 };
    let mut server = ControlServer::start(options(), FixedDecision(action)).await.unwrap();
    let client = connect(&server).await;

    assert_eq!(send(&client, ControlRequest::TestConnection).await, Reply::Ack);

    let reply = client.request(Bytes::from_static(b"\x07garbage")).await.unwrap();
    assert_eq!(Reply::decode(reply).unwrap(), Reply::Rejected);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn actions_reach_the_traffic_adapter() {
    let _ = tracing_subscriber::fmt::try_init();

    let backend = DryRunBackend::single(LOCALHOST);
    let log = backend.log();
    let adapter_options = AdapterOptions::default()
        .listen(SocketAddr::new(LOCALHOST, 0))
        .addresses([LOCALHOST])
        .throttle(1);
    let mut adapter = TrafficAdapter::start(adapter_options, backend).await.unwrap();

    let action = Action { priority: 6, rate_bps: 50_000_000 };
    let mut server = ControlServer::start(options(), FixedDecision(action)).await.unwrap();
    let client = connect(&server).await;

    let reply = send(&client, ControlRequest::PassFlowInfo(report(adapter.advertised_addr(), 2, 3)))
        .await;
    assert_eq!(reply, Reply::Ack);

    eventually(|| !log.reconfigurations().is_empty()).await;
    let applied = log.reconfigurations()[0];
    assert_eq!(applied.band, band_for_priority(6));
    assert_eq!(applied.rate_bps, 50_000_000);

    eventually(|| server.stats().actions_sent() == 1).await;
    assert_eq!(server.stats().reports(), 1);
    assert_eq!(server.stats().nodes(), 1);

    server.stop().await;
    adapter.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn decisions_and_lifecycle_hooks() {
    let _ = tracing_subscriber::fmt::try_init();

    // A node whose adapter is not listening: pushes fail, the server carries on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let node = listener.local_addr().unwrap();
    drop(listener);

    let events = Arc::new(Mutex::new(Events::default()));
    let mut server = ControlServer::start(options(), Recorder(Arc::clone(&events))).await.unwrap();
    let client = connect(&server).await;

    assert_eq!(send(&client, ControlRequest::PassFlowInfo(report(node, 1, 4))).await, Reply::Ack);
    assert_eq!(send(&client, ControlRequest::PassFlowInfo(report(node, 0, 2))).await, Reply::Ack);

    eventually(|| server.stats().push_failures() == 2).await;
    assert_eq!(events.lock().decisions, vec![(node, 1, 4), (node, 0, 2)]);
    assert_eq!(server.stats().nodes(), 1);

    assert_eq!(send(&client, ControlRequest::UnregisterServer(node)).await, Reply::Ack);
    eventually(|| server.stats().unregistered() == 1).await;
    assert_eq!(events.lock().unregistered, vec![node]);
    assert_eq!(server.stats().nodes(), 0);

    // Still serving after the failures.
    assert_eq!(send(&client, ControlRequest::TestConnection).await, Reply::Ack);

    server.stop().await;
    assert!(events.lock().stopped);
    server.stop().await;
}
