mod support;

use std::time::Duration;

use electrum_client::RawClient;
use support::{MockElectrumServer, read_line, split, write_line};
use tokio::net::TcpStream;

async fn connected_client(server: &MockElectrumServer) -> RawClient<TcpStream> {
    let client: RawClient<TcpStream> = RawClient::new(
        "test-app",
        "1.4",
        server.host(),
        server.port(),
        Duration::from_secs(60),
        Duration::from_secs(1),
        Duration::from_secs(2),
    )
    .unwrap();
    let host = server.host();
    let port = server.port();
    client
        .connect_with(move || TcpStream::connect(format!("{host}:{port}")))
        .await
        .expect("handshake should succeed");
    client
}

#[tokio::test]
async fn concurrent_requests_resolve_regardless_of_reply_order() {
    let server = MockElectrumServer::start(|stream| async move {
        let (mut reader, mut writer) = split(stream);
        support::handshake_ok(&mut reader, &mut writer, "electrs/0.10", "1.4").await;

        // Read both requests, then reply to the second one first.
        let first = read_line(&mut reader).await.unwrap();
        let second = read_line(&mut reader).await.unwrap();
        let first_id = serde_json::from_str::<serde_json::Value>(&first).unwrap()["id"]
            .as_u64()
            .unwrap();
        let second_id = serde_json::from_str::<serde_json::Value>(&second).unwrap()["id"]
            .as_u64()
            .unwrap();

        write_line(
            &mut writer,
            &serde_json::json!({"id": second_id, "result": "second"}).to_string(),
        )
        .await;
        write_line(
            &mut writer,
            &serde_json::json!({"id": first_id, "result": "first"}).to_string(),
        )
        .await;
    })
    .await;

    let client = connected_client(&server).await;

    let (a, b) = tokio::join!(
        client.request("blockchain.headers.subscribe", vec![]),
        client.request("server.banner", vec![])
    );

    assert_eq!(a.unwrap().unwrap(), serde_json::json!("first"));
    assert_eq!(b.unwrap().unwrap(), serde_json::json!("second"));
}

#[tokio::test]
async fn remote_error_surfaces_as_server_error_value() {
    let server = MockElectrumServer::start(|stream| async move {
        let (mut reader, mut writer) = split(stream);
        support::handshake_ok(&mut reader, &mut writer, "electrs/0.10", "1.4").await;
        let _req = read_line(&mut reader).await.unwrap();
        write_line(
            &mut writer,
            &serde_json::json!({"id": 0, "error": {"message": "unknown method"}}).to_string(),
        )
        .await;
    })
    .await;

    let client = connected_client(&server).await;
    let outcome = client.request("bogus.method", vec![]).await.unwrap();
    let err = outcome.unwrap_err();
    assert!(matches!(err, electrum_client::ServerError::Remote(_)));
}

#[tokio::test]
async fn disconnect_fails_pending_requests() {
    let server = MockElectrumServer::start(|stream| async move {
        let (mut reader, mut writer) = split(stream);
        support::handshake_ok(&mut reader, &mut writer, "electrs/0.10", "1.4").await;
        let _req = read_line(&mut reader).await;
        // Never reply; just drop the connection.
    })
    .await;

    let client = std::sync::Arc::new(connected_client(&server).await);

    let pending = tokio::spawn({
        let client = std::sync::Arc::clone(&client);
        async move { client.request("blockchain.headers.subscribe", vec![]).await }
    });

    // Give the server a moment to read the request before we tear down.
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.disconnect(true).await;

    let outcome = pending.await.unwrap().unwrap();
    assert!(matches!(
        outcome.unwrap_err(),
        electrum_client::ServerError::ManualDisconnection
            | electrum_client::ServerError::Transport(_)
    ));
}

#[tokio::test]
async fn notification_is_delivered_to_subscriber() {
    let server = MockElectrumServer::start(|stream| async move {
        let (mut reader, mut writer) = split(stream);
        support::handshake_ok(&mut reader, &mut writer, "electrs/0.10", "1.4").await;
        let _req = read_line(&mut reader).await.unwrap();
        write_line(
            &mut writer,
            &serde_json::json!({"id": 0, "result": ["00", 1]}).to_string(),
        )
        .await;
        write_line(
            &mut writer,
            &serde_json::json!({
                "method": "blockchain.headers.subscribe",
                "params": [{"height": 100}],
            })
            .to_string(),
        )
        .await;
    })
    .await;

    let client = connected_client(&server).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let outcome = client
        .subscribe(
            "blockchain.headers.subscribe",
            vec![],
            std::sync::Arc::new(move |value| {
                let _ = tx.send(value);
            }),
        )
        .await
        .unwrap();
    assert!(outcome.is_ok());

    // First delivery is the subscribe's own initial reply.
    let first = rx.recv().await.unwrap();
    assert_eq!(first, serde_json::json!(["00", 1]));

    // Second delivery is the pushed notification.
    let second = rx.recv().await.unwrap();
    assert_eq!(second, serde_json::json!([{"height": 100}]));
}
