use std::{path::PathBuf, sync::Arc, time::Duration};

use flowctl_node::{
    completion::CompletionChannel,
    registry::FlowRegistry,
    sampler::{CdfTable, FlowSampler},
    telemetry::CSV_HEADER,
    worker::{FlowInterval, FlowSize, TransportError},
    FlowWorker, Responder, ResponderOptions, WorkerOptions,
};
use flowctl_wire::{flow::FlowTokens, rpc::PROTOCOL_TCP};
use tokio::net::TcpListener;

fn cdf_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("testdata/web_search.cdf")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_completes_fixed_size_flows() {
    let _ = tracing_subscriber::fmt::try_init();

    let responder = Responder::bind("127.0.0.1:0", ResponderOptions::default()).await.unwrap();
    let registry = FlowRegistry::new(1);
    let completions = Arc::new(CompletionChannel::new(16));

    let options = WorkerOptions::new(responder.local_addr())
        .priority(4)
        .tos(0x10)
        .size(FlowSize::Fixed(1_500))
        .max_flows(5);

    let worker = FlowWorker::new(registry.slot(0).unwrap(), Arc::clone(&completions), options);
    worker.run().await.unwrap();

    let completed = completions.drain();
    assert_eq!(completed.len(), 5);
    for flow in &completed {
        assert_eq!(flow.size_bytes, 1_500);
        assert!(flow.completion_time_us > 0);
        assert_eq!(flow.attributes.dst, responder.local_addr());
        assert_eq!(flow.attributes.protocol, PROTOCOL_TCP);
        assert_eq!(flow.attributes.priority, 4);
    }

    // Every flow ran over the same connection.
    assert!(completed.iter().all(|f| f.attributes.src == completed[0].attributes.src));
    assert_eq!(responder.stats().connections(), 1);
    assert_eq!(responder.stats().flows_acked(), 5);

    assert!(!registry.slot(0).unwrap().is_valid());
    assert!(registry.snapshot().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sampled_flows_with_custom_tokens_and_telemetry() {
    let _ = tracing_subscriber::fmt::try_init();

    let tokens = FlowTokens::new(&b"EOF"[..], &b"ACK"[..]).unwrap();
    let responder =
        Responder::bind("127.0.0.1:0", ResponderOptions::default().tokens(tokens.clone()))
            .await
            .unwrap();

    let dir = std::env::temp_dir().join(format!("flowctl-it-flows-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let csv = dir.join("flow_0.csv");

    let table = Arc::new(CdfTable::load(cdf_path()).unwrap());
    let sampler = FlowSampler::new(Arc::clone(&table), 1_000.0).unwrap();

    let registry = FlowRegistry::new(1);
    let completions = Arc::new(CompletionChannel::new(16));
    let options = WorkerOptions::new(responder.local_addr())
        .size(FlowSize::Sampled(table))
        .interval(FlowInterval::Poisson(sampler))
        .tokens(tokens)
        .telemetry_path(&csv)
        .max_flows(8);

    FlowWorker::new(registry.slot(0).unwrap(), Arc::clone(&completions), options)
        .run()
        .await
        .unwrap();

    let completed = completions.drain();
    assert_eq!(completed.len(), 8);
    assert!(completed.iter().all(|f| (6..=20_000).contains(&f.size_bytes)));

    let contents = std::fs::read_to_string(&csv).unwrap();
    let mut lines = contents.lines();
    assert_eq!(lines.next(), Some(CSV_HEADER.trim_end()));
    assert_eq!(lines.count(), 8);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_fails_on_refused_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let registry = FlowRegistry::new(1);
    let completions = Arc::new(CompletionChannel::default());
    let worker = FlowWorker::new(
        registry.slot(0).unwrap(),
        Arc::clone(&completions),
        WorkerOptions::new(addr),
    );

    assert!(matches!(worker.run().await, Err(TransportError::Connect(_))));
    assert!(completions.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_exits_when_peer_closes() {
    let _ = tracing_subscriber::fmt::try_init();

    // Accepts and immediately hangs up.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });

    let registry = FlowRegistry::new(1);
    let completions = Arc::new(CompletionChannel::default());
    let worker = FlowWorker::new(
        registry.slot(0).unwrap(),
        Arc::clone(&completions),
        WorkerOptions::new(addr).size(FlowSize::Fixed(64)).interval(FlowInterval::Fixed(
            Duration::from_millis(1),
        )),
    );

    let result = tokio::time::timeout(Duration::from_secs(5), worker.run()).await.unwrap();
    assert!(
        matches!(result, Err(TransportError::ConnectionClosed | TransportError::Io(_))),
        "{result:?}"
    );
    assert!(completions.is_empty());
    assert!(!registry.slot(0).unwrap().is_valid());
}
