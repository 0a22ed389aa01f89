use std::time::Duration;

use bytes::Bytes;
use flowctl_rpc::{RepOptions, RepSocket, ReqError, ReqOptions, ReqSocket};
use futures::StreamExt;
use rand::Rng;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reqrep_works() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut rep = RepSocket::new();
    rep.bind("127.0.0.1:0").await.unwrap();

    let mut req = ReqSocket::new();
    req.connect(rep.local_addr().unwrap()).await.unwrap();

    tokio::spawn(async move {
        while let Some(request) = rep.next().await {
            let msg = request.msg().clone();
            request.respond(msg).unwrap();
        }
    });

    let mut rng = rand::thread_rng();
    for _ in 0..100 {
        let mut payload = vec![0u8; rng.gen_range(0..2048)];
        rng.fill(&mut payload[..]);
        let payload = Bytes::from(payload);

        assert_eq!(req.request(payload.clone()).await.unwrap(), payload);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replies_are_matched_out_of_order() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut rep = RepSocket::new();
    rep.bind("127.0.0.1:0").await.unwrap();

    let mut req = ReqSocket::new();
    req.connect(rep.local_addr().unwrap()).await.unwrap();

    // Answer the first request last.
    tokio::spawn(async move {
        let first = rep.next().await.unwrap();
        let second = rep.next().await.unwrap();

        let msg = second.msg().clone();
        second.respond(msg).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let msg = first.msg().clone();
        first.respond(msg).unwrap();

        // Keep the socket alive until the client is done.
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let slow = req.clone();
    let first = tokio::spawn(async move { slow.request(Bytes::from_static(b"first")).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = req.request(Bytes::from_static(b"second")).await.unwrap();

    assert_eq!(second.as_ref(), b"second");
    assert_eq!(first.await.unwrap().unwrap().as_ref(), b"first");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropped_request_times_out() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut rep = RepSocket::new();
    rep.bind("127.0.0.1:0").await.unwrap();

    let options = ReqOptions::default().timeout(Duration::from_millis(200));
    let req = ReqSocket::connect_with(rep.local_addr().unwrap(), options).await.unwrap();

    tokio::spawn(async move {
        while let Some(request) = rep.next().await {
            drop(request);
        }
    });

    let response = req.request(Bytes::from_static(b"ignored")).await;
    assert!(matches!(response, Err(ReqError::Timeout)), "{response:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rep_max_connections() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut rep = RepSocket::with_options(RepOptions::default().max_clients(1));
    rep.bind("127.0.0.1:0").await.unwrap();
    let addr = rep.local_addr().unwrap();

    let mut req1 = ReqSocket::new();
    req1.connect(addr).await.unwrap();

    let mut req2 = ReqSocket::new();
    req2.connect(addr).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(rep.stats().active_clients(), 1);
    assert_eq!(rep.stats().rejected_clients(), 1);

    // The rejected connection is closed by the server.
    let response = req2.request(Bytes::from_static(b"rejected")).await;
    assert!(matches!(response, Err(ReqError::SocketClosed)), "{response:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closed_rep_socket_ends_stream() {
    let mut rep = RepSocket::new();
    rep.bind("127.0.0.1:0").await.unwrap();
    let addr = rep.local_addr().unwrap();

    rep.close();
    assert!(rep.next().await.is_none());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut req = ReqSocket::with_options(
        ReqOptions::default().connect_timeout(Duration::from_millis(500)),
    );
    assert!(req.connect(addr).await.is_err());
}
