//! Integration tests for framed streams over loopback TCP.

use proptest::prelude::*;
use std::time::Duration;
use tether_model::Entity;
use tether_sync_protocol::{FetchSpec, PackageKind, PackageMethod, WirePackage};
use tether_transport::{
    encode_frame, read_frame, write_frame, GuardConfig, StreamEvent, TransportConfig,
    TransportError, TransportStream,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

fn fast_config() -> TransportConfig {
    TransportConfig::default()
        .with_send_buffer_size(64)
        .with_stall_timeout(Duration::from_millis(200))
        .with_guard(
            GuardConfig::default()
                .with_first_probe(Duration::from_millis(20))
                .with_interval(Duration::from_millis(20))
                .with_poll_timeout(Duration::from_millis(20)),
        )
}

async fn pair() -> (
    (TransportStream, mpsc::UnboundedReceiver<StreamEvent>),
    (TransportStream, mpsc::UnboundedReceiver<StreamEvent>),
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (server_tx, server_rx) = mpsc::unbounded_channel();
    let client = TransportStream::open(client.unwrap(), fast_config(), client_tx).unwrap();
    let server = TransportStream::open(accepted.unwrap().0, fast_config(), server_tx).unwrap();
    ((client, client_rx), (server, server_rx))
}

fn person(name: &str) -> Entity {
    Entity::new("Person").with("Name", name)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> StreamEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn direct_write_is_received() {
    let ((client, _), (server, _)) = pair().await;

    let package = WirePackage::command(PackageMethod::Insert, person("Ada"));
    assert!(client.write_package(&package).await);

    let received = server.receive_package().await.unwrap();
    assert_eq!(received, package);
}

#[tokio::test]
async fn queued_packages_arrive_in_order() {
    let ((client, mut events), (server, _)) = pair().await;

    let packages: Vec<_> = (0..5)
        .map(|i| WirePackage::command(PackageMethod::Update, person(&format!("p{i}"))))
        .collect();
    for package in &packages {
        client.add_to_queue(package.clone()).unwrap();
    }

    for package in &packages {
        let received = server.receive_package().await.unwrap();
        assert_eq!(received.id, package.id);
        match next_event(&mut events).await {
            StreamEvent::PackageSent(sent) => assert_eq!(sent.id, package.id),
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test]
async fn locked_stream_holds_queue_until_released() {
    let ((client, _), (server, _)) = pair().await;

    client.set_locked(true);
    assert!(client.is_locked());
    client.add_to_queue(WirePackage::fetch(FetchSpec::new("Person"))).unwrap();

    let early = tokio::time::timeout(Duration::from_millis(100), server.receive_package()).await;
    assert!(early.is_err());
    assert_eq!(client.queued(), 1);

    client.set_locked(false);
    let received = tokio::time::timeout(Duration::from_secs(2), server.receive_package())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.kind, PackageKind::Fetch);
}

#[tokio::test]
async fn guard_reports_dropped_peer_once() {
    let ((client, mut events), (server, _)) = pair().await;
    assert!(client.arm_guard());
    assert!(!client.arm_guard());

    drop(server);

    match next_event(&mut events).await {
        StreamEvent::ConnectionLost => {}
        other => panic!("unexpected event {other:?}"),
    }
    assert!(!client.is_connected());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn check_connection_sees_closed_peer() {
    let ((client, _), (server, _)) = pair().await;
    assert!(client.check_connection().await);

    server.close();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!client.check_connection().await);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn peer_close_ends_receive() {
    let ((client, _), (server, _)) = pair().await;
    drop(client);
    let err = server.receive_package().await.unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn close_interrupts_pending_receive() {
    let ((client, _), (_server, _)) = pair().await;
    let client = std::sync::Arc::new(client);

    let reader = std::sync::Arc::clone(&client);
    let pending = tokio::spawn(async move { reader.receive_package().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    client.close();
    client.close();
    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(TransportError::Closed)));
    assert!(matches!(
        client.add_to_queue(WirePackage::fetch(FetchSpec::new("Person"))),
        Err(TransportError::Closed)
    ));
    assert!(!client.write_package(&WirePackage::fetch(FetchSpec::new("Person"))).await);
}

#[tokio::test]
async fn client_id_is_tracked() {
    let ((client, _), _) = pair().await;
    assert_eq!(client.client_id(), None);
    client.set_client_id("device-1");
    assert_eq!(client.client_id().as_deref(), Some("device-1"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn chunk_size_does_not_change_the_frame(chunk in 1usize..512, name in "[a-z]{0,200}") {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let package = WirePackage::command(PackageMethod::Insert, person(&name));
        let frame = encode_frame(&package).unwrap();

        let decoded = runtime.block_on(async {
            let (mut a, mut b) = tokio::io::duplex(64);
            let writer = async { write_frame(&mut a, &frame, chunk).await.unwrap() };
            let reader = async { read_frame(&mut b, &TransportConfig::default()).await.unwrap() };
            tokio::join!(writer, reader).1
        });
        prop_assert_eq!(decoded, package);
    }
}
