//! Control API over a real socket

mod common;

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use common::{eventually, request, Harness};
use msg_client::envelope::Envelope;
use msg_client::registry::{ServiceId, ServiceState};
use msg_client::server::{ControlClient, ControlResponse, ControlServer, ServerConfig};
use msg_client::subscription::SubscriptionState;
use msg_client::Error;

struct RunningServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<msg_client::Result<()>>,
}

impl RunningServer {
    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.unwrap().unwrap();
    }
}

async fn start(h: &Harness) -> RunningServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = ServerConfig::with_addr(addr)
        .disable_liveness()
        .disable_reconcile();
    let server = ControlServer::new(config, h.router.clone());
    let (tx, rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        server
            .serve(listener, async {
                let _ = rx.await;
            })
            .await
    });

    RunningServer {
        addr,
        shutdown: Some(tx),
        task,
    }
}

#[tokio::test]
async fn test_register_handle_publish_round_trip() {
    let h = Harness::new();
    let server = start(&h).await;
    let mut client = ControlClient::connect(server.addr).await.unwrap();

    let consumer = client
        .register_service(request("consumer", &["event.cloud.*.create"]))
        .await
        .unwrap();
    assert_eq!(consumer.state, ServiceState::Registered);
    client.start_handling(consumer.service_uuid).await.unwrap();

    let producer = client
        .register_service(request("producer", &["unused"]))
        .await
        .unwrap();
    client
        .publish(
            producer.service_uuid,
            "event.cloud.node.create",
            Envelope::new("type.test/Node", Bytes::from_static(b"\x00\x01payload")),
        )
        .await
        .unwrap();

    assert!(eventually(|| async { h.callbacks.received_by("consumer").len() == 1 }).await);
    assert_eq!(
        h.callbacks.received()[0].payload,
        Bytes::from_static(b"\x00\x01payload")
    );

    let routes = client.list_routes().await.unwrap();
    let handled: Vec<_> = routes
        .iter()
        .filter(|r| r.key.as_str() == "event.cloud.*.create")
        .collect();
    assert_eq!(handled.len(), 1);
    assert_eq!(handled[0].interested, vec![consumer.service_uuid]);
    assert_eq!(handled[0].subscription, SubscriptionState::Subscribed);

    assert_eq!(client.list_services().await.unwrap().len(), 2);

    client.unregister_service(consumer.service_uuid).await.unwrap();
    client.unregister_service(producer.service_uuid).await.unwrap();
    assert!(client.list_services().await.unwrap().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_error_codes() {
    let h = Harness::new();
    let server = start(&h).await;
    let mut client = ControlClient::connect(server.addr).await.unwrap();

    let err = client.start_handling(ServiceId::new()).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let err = client
        .register_service(request("bad", &["a..b"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let producer = client
        .register_service(request("producer", &["k"]))
        .await
        .unwrap();
    let err = client
        .publish(producer.service_uuid, "event.*", Envelope::new("", Bytes::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    // idempotent teardown of unknown services
    client.unregister_service(ServiceId::new()).await.unwrap();
    client.stop_handling(ServiceId::new()).await.unwrap();

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_line_keeps_connection() {
    let h = Harness::new();
    let server = start(&h).await;

    let socket = TcpStream::connect(server.addr).await.unwrap();
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    write_half.write_all(b"{\"method\":\"Bogus\"}\n").await.unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let response: ControlResponse = serde_json::from_str(&line).unwrap();
    assert!(!response.ok);
    assert_eq!(response.error.unwrap().code, "invalid_argument");

    write_half
        .write_all(b"{\"method\":\"ListServices\"}\n")
        .await
        .unwrap();
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    let response: ControlResponse = serde_json::from_str(&line).unwrap();
    assert!(response.ok);
    assert_eq!(response.result, Some(serde_json::json!([])));

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_releases_subscriptions() {
    let h = Harness::new();
    let server = start(&h).await;
    let mut client = ControlClient::connect(server.addr).await.unwrap();

    let service = client
        .register_service(request("svc", &["k1", "k2"]))
        .await
        .unwrap();
    client.start_handling(service.service_uuid).await.unwrap();
    assert_eq!(h.broker.consumer_count().await, 2);

    server.stop().await;
    assert_eq!(h.broker.consumer_count().await, 0);
}
