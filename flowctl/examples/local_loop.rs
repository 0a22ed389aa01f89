//! Runs the whole loop on localhost: a responder, a control server and one node whose
//! traffic adapter only logs the kernel changes it would make.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use flowctl::{
    adapter::DryRunBackend,
    distribution::FlowClass,
    wire::rpc::{Action, CompletedFlow, FlowAttributes},
    AdapterOptions, ControlOptions, ControlServer, Coordinator, CoordinatorOptions, Responder,
    ResponderOptions,
};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    // The far end of every flow
    let responder = Responder::bind("127.0.0.1:0", ResponderOptions::default()).await.unwrap();

    // Throttle the highest class whenever the slowest completion exceeds 5ms
    let decision = |node: SocketAddr, waiting: &[FlowAttributes], completed: &[CompletedFlow]| {
        let slowest = completed.iter().map(|f| f.completion_time_us).max().unwrap_or_default();
        tracing::info!(%node, waiting = waiting.len(), completed = completed.len(), slowest, "report");

        let rate_bps = if slowest > 5_000 { 10_000_000 } else { 1_000_000_000 };
        Action { priority: 6, rate_bps }
    };

    let control_options = ControlOptions::default().listen(SocketAddr::new(LOCALHOST, 0));
    let mut control = ControlServer::start(control_options, decision).await.unwrap();

    let backend = DryRunBackend::single(LOCALHOST);
    let log = backend.log();

    let options = CoordinatorOptions::default()
        .control_addr(control.local_addr())
        .peers([responder.local_addr()])
        .total_flows(8)
        .classes(vec![
            FlowClass::new(0, 0.75).with_size(64 * 1024),
            FlowClass::new(6, 0.25).with_size(4 * 1024 * 1024),
        ])
        .flow_interval(Duration::from_millis(20))
        .report_interval(Duration::from_millis(500))
        .adapter(
            AdapterOptions::default()
                .listen(SocketAddr::new(LOCALHOST, 0))
                .addresses([LOCALHOST])
                .throttle(1),
        );

    let mut coordinator = Coordinator::start(options, backend).await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    coordinator.shutdown().await;
    control.stop().await;

    println!("Reports handled: {}", control.stats().reports());
    println!("Flows acknowledged: {}", responder.stats().flows_acked());
    for reconfiguration in log.reconfigurations() {
        println!("Would apply: {reconfiguration:?}");
    }
}
