//! End-to-end flows over the bundled TCP line transport.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::time::timeout;

use converge::{BucketEvent, Client, ClientConfig, ClientEvent, MemoryStore, TcpConnector};

async fn read_frame(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> String {
    loop {
        let line = timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("timed out waiting for a frame")
            .expect("read failed")
            .expect("client hung up");
        if line.starts_with("h:") {
            continue;
        }
        return line;
    }
}

async fn accept(listener: &TcpListener) -> (Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf) {
    let (socket, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("timed out waiting for a connection")
        .expect("accept failed");
    let (read, write) = socket.into_split();
    (BufReader::new(read).lines(), write)
}

async fn send(write: &mut OwnedWriteHalf, line: &str) {
    write.write_all(line.as_bytes()).await.unwrap();
    write.write_all(b"\n").await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn index_entity_fetch_and_checkpoint_fallback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client = Client::new(ClientConfig::new("test-app", "test-token"));
    let store = Arc::new(MemoryStore::new());
    let bucket = client.bucket("notes", store.clone());
    let mut events = bucket.subscribe();
    let mut client_events = client.subscribe();
    let driver = tokio::spawn({
        let client = client.clone();
        async move { client.run(TcpConnector::new(addr.to_string())).await }
    });

    // First connection: the index entry carries no data, so the client pulls
    // the entity, whose payload arrives on the line after its header.
    let (mut lines, mut write) = accept(&listener).await;
    let init = read_frame(&mut lines).await;
    assert!(init.starts_with("0:init:"), "unexpected frame {init}");
    assert!(init.contains("\"name\":\"notes\""));
    send(&mut write, "0:auth:user@example.com").await;
    assert_eq!(read_frame(&mut lines).await, "0:i:1::::100");
    send(&mut write, r#"0:i:{"index":[{"id":"note-1","v":3}],"current":"cv-3"}"#).await;
    assert_eq!(read_frame(&mut lines).await, "0:e:note-1.3");
    send(&mut write, "0:e:note-1.3").await;
    send(&mut write, r#"{"title":"fetched"}"#).await;

    loop {
        match timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for the index")
            .expect("event bus closed")
        {
            BucketEvent::Index => break,
            _ => {}
        }
    }
    for _ in 0..500 {
        if bucket.get_version("note-1").await.unwrap() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let object = bucket.get("note-1").await.unwrap().unwrap();
    assert_eq!(object.version, 3);
    assert_eq!(object.data["title"], json!("fetched"));

    // Kill the connection. The client reconnects, tries its checkpoint, and
    // falls back to a full index when the server does not know it.
    drop(write);
    drop(lines);
    let (mut lines, mut write) = accept(&listener).await;
    let init = read_frame(&mut lines).await;
    assert!(init.starts_with("0:init:"));
    send(&mut write, "0:auth:user@example.com").await;
    assert_eq!(read_frame(&mut lines).await, "0:cv:cv-3");
    send(&mut write, "0:cv:?").await;
    assert_eq!(read_frame(&mut lines).await, "0:i:1::::100");
    send(&mut write, r#"0:i:{"index":[],"current":"cv-4"}"#).await;
    loop {
        match timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for the re-index")
            .expect("event bus closed")
        {
            BucketEvent::Index => break,
            _ => {}
        }
    }

    // Connection lifecycle as seen by the application.
    let mut lifecycle = Vec::new();
    while let Ok(event) = client_events.try_recv() {
        lifecycle.push(event);
    }
    assert_eq!(
        lifecycle,
        vec![
            ClientEvent::Connect,
            ClientEvent::Disconnect,
            ClientEvent::Connect
        ]
    );

    driver.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_dials_back_off_with_attempt_counts() {
    // Bind to learn a free port, then close it so dials are refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = Client::new(ClientConfig::new("test-app", "test-token"));
    let mut client_events = client.subscribe();
    let driver = tokio::spawn({
        let client = client.clone();
        async move { client.run(TcpConnector::new(addr.to_string())).await }
    });

    for expected in 1..=2u32 {
        let event = timeout(Duration::from_secs(10), client_events.recv())
            .await
            .expect("timed out waiting for a reconnect event")
            .expect("event bus closed");
        assert_eq!(event, ClientEvent::Reconnect { attempt: expected });
    }

    driver.abort();
}
