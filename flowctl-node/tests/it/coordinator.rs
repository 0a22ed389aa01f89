use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use flowctl_common::constants::{DEFAULT_CONTROL_PORT, DEFAULT_RESPONDER_PORT};
use flowctl_node::{
    adapter::DryRunBackend,
    coordinator::CoordinatorError,
    distribution::FlowClass,
    AdapterOptions, Coordinator, CoordinatorOptions, Responder, ResponderOptions,
};
use flowctl_rpc::{RepSocket, ReqOptions};
use flowctl_wire::rpc::{ControlRequest, FlowReport, Reply};
use futures::StreamExt;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

type ControlServerHandle = (SocketAddr, mpsc::UnboundedReceiver<ControlRequest>, JoinHandle<()>);

/// A control server that acknowledges everything and hands the requests to the test.
/// Aborting the returned task closes the server and all of its connections.
async fn spawn_control_server() -> ControlServerHandle {
    spawn_control_server_on(SocketAddr::new(LOCALHOST, 0)).await
}

async fn spawn_control_server_on(addr: SocketAddr) -> ControlServerHandle {
    let mut socket = RepSocket::new();

    // The previous server on this address may still be shutting down.
    let mut attempts = 0;
    while let Err(e) = socket.bind(addr).await {
        attempts += 1;
        assert!(attempts < 100, "failed to bind {addr}: {e:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let addr = socket.local_addr().unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        while let Some(mut request) = socket.next().await {
            let decoded = ControlRequest::decode(request.take_msg()).unwrap();
            let _ = tx.send(decoded);
            let _ = request.respond(Reply::Ack.encode());
        }
    });

    (addr, rx, task)
}

fn coordinator_options(control_addr: SocketAddr, peer: SocketAddr) -> CoordinatorOptions {
    CoordinatorOptions::default()
        .control_addr(control_addr)
        .peers([peer])
        .total_flows(4)
        .classes(vec![
            FlowClass::new(0, 0.5).with_size(1_500),
            FlowClass::new(6, 0.5).with_size(500),
        ])
        .flow_interval(Duration::from_millis(10))
        .report_interval(Duration::from_millis(100))
        .adapter(
            AdapterOptions::default().listen(SocketAddr::new(LOCALHOST, 0)).addresses([LOCALHOST]),
        )
        .rpc(ReqOptions::default().connect_timeout(Duration::from_millis(500)))
}

async fn next_request(rx: &mut mpsc::UnboundedReceiver<ControlRequest>) -> ControlRequest {
    tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reports_flows_and_unregisters() {
    let _ = tracing_subscriber::fmt::try_init();

    let responder = Responder::bind("127.0.0.1:0", ResponderOptions::default()).await.unwrap();
    let (control_addr, mut rx, _server) = spawn_control_server().await;

    let dir = std::env::temp_dir().join(format!("flowctl-it-coordinator-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);

    let options = coordinator_options(control_addr, responder.local_addr()).telemetry_dir(&dir);
    let mut coordinator =
        Coordinator::start(options, DryRunBackend::single(LOCALHOST)).await.unwrap();
    let node = coordinator.node_addr();

    assert_eq!(coordinator.worker_count(), 4);
    assert_eq!(coordinator.registry().len(), 4);
    assert_eq!(next_request(&mut rx).await, ControlRequest::TestConnection);

    // Wait for a report with completed flows in it.
    let report: FlowReport = loop {
        match next_request(&mut rx).await {
            ControlRequest::PassFlowInfo(report) if !report.completed.is_empty() => break report,
            ControlRequest::PassFlowInfo(report) => assert!(!report.is_empty()),
            other => panic!("unexpected request {other:?}"),
        }
    };

    assert_eq!(report.node, node);
    for flow in &report.completed {
        assert!(flow.completion_time_us > 0);
        assert_eq!(flow.attributes.dst, responder.local_addr());
        match flow.attributes.priority {
            0 => assert_eq!(flow.size_bytes, 1_500),
            6 => assert_eq!(flow.size_bytes, 500),
            other => panic!("unexpected priority {other}"),
        }
    }
    // Reports never carry more completions than the channel holds.
    assert!(report.completed.len() <= 20);

    coordinator.shutdown().await;
    assert!(!coordinator.adapter().is_running());

    let unregistered = loop {
        match next_request(&mut rx).await {
            ControlRequest::UnregisterServer(addr) => break addr,
            ControlRequest::PassFlowInfo(_) => {}
            other => panic!("unexpected request {other:?}"),
        }
    };
    assert_eq!(unregistered, node);

    // Every worker logged its flows.
    let csv = std::fs::read_to_string(dir.join("flow_0.csv")).unwrap();
    assert!(csv.starts_with("FLOW_SIZE_bytes,FCT_us\n"));

    // Shutting down again is a no-op.
    coordinator.shutdown().await;
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_control_server_stops_adapter() {
    let responder = Responder::bind("127.0.0.1:0", ResponderOptions::default()).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_addr = listener.local_addr().unwrap();
    drop(listener);

    let backend = DryRunBackend::single(LOCALHOST);
    let log = backend.log();

    let options = coordinator_options(control_addr, responder.local_addr());
    let result = Coordinator::start(options, backend).await;

    assert!(matches!(result, Err(CoordinatorError::ControlPlane(_))), "{result:?}");
    assert!(log.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn configuration_is_checked_first() {
    let peer = SocketAddr::new(LOCALHOST, DEFAULT_RESPONDER_PORT);
    let control_addr = SocketAddr::new(LOCALHOST, DEFAULT_CONTROL_PORT);

    let backend = DryRunBackend::single(LOCALHOST);
    let log = backend.log();

    // No fixed size and no CDF table.
    let options = coordinator_options(control_addr, peer).classes(vec![FlowClass::new(2, 1.0)]);
    let result = Coordinator::start(options, backend.clone()).await;
    assert!(matches!(result, Err(CoordinatorError::MissingSize(2))), "{result:?}");

    let options = coordinator_options(control_addr, peer).cdf_path("/nonexistent/flowctl.cdf");
    let result = Coordinator::start(options, backend.clone()).await;
    assert!(matches!(result, Err(CoordinatorError::Cdf(_))), "{result:?}");

    let options = coordinator_options(control_addr, peer).peers(Vec::new());
    let result = Coordinator::start(options, backend.clone()).await;
    assert!(matches!(result, Err(CoordinatorError::Distribution(_))), "{result:?}");

    let options = coordinator_options(control_addr, peer).completion_capacity(0);
    let result = Coordinator::start(options, backend).await;
    assert!(matches!(result, Err(CoordinatorError::ZeroCompletionCapacity)), "{result:?}");

    // Nothing was touched.
    assert!(log.baselines().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reports_resume_after_control_server_restart() {
    let _ = tracing_subscriber::fmt::try_init();

    let responder = Responder::bind("127.0.0.1:0", ResponderOptions::default()).await.unwrap();
    let (control_addr, mut rx, server) = spawn_control_server().await;

    let options = coordinator_options(control_addr, responder.local_addr());
    let mut coordinator =
        Coordinator::start(options, DryRunBackend::single(LOCALHOST)).await.unwrap();
    let node = coordinator.node_addr();

    assert_eq!(next_request(&mut rx).await, ControlRequest::TestConnection);
    assert!(matches!(next_request(&mut rx).await, ControlRequest::PassFlowInfo(_)));

    // Take the control server down, then bring a new one up on the same address.
    server.abort();
    let _ = server.await;
    drop(rx);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (_, mut rx, _server) = spawn_control_server_on(control_addr).await;

    match next_request(&mut rx).await {
        ControlRequest::PassFlowInfo(report) => assert_eq!(report.node, node),
        other => panic!("unexpected request {other:?}"),
    }

    // Unregistration goes to the new server as well.
    coordinator.shutdown().await;
    let unregistered = loop {
        match next_request(&mut rx).await {
            ControlRequest::UnregisterServer(addr) => break addr,
            ControlRequest::PassFlowInfo(_) => {}
            other => panic!("unexpected request {other:?}"),
        }
    };
    assert_eq!(unregistered, node);
}
