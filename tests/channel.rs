//! The change-protocol scenarios, driven over an in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use converge::textdiff;
use converge::transport::{Connector, FrameSink, FrameSource};
use converge::{Bucket, BucketEvent, Client, ClientConfig, MemoryStore};

struct TestServer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
}

impl TestServer {
    /// Next frame from the client, skipping heartbeats.
    async fn recv(&mut self) -> String {
        loop {
            let frame = timeout(Duration::from_secs(5), self.from_client.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("client hung up");
            if frame.starts_with("h:") {
                continue;
            }
            return frame;
        }
    }

    /// First non-heartbeat frame within `wait`, if any.
    async fn try_recv(&mut self, wait: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let frame = match tokio::time::timeout_at(deadline, self.from_client.recv()).await {
                Ok(frame) => frame?,
                Err(_) => return None,
            };
            if !frame.starts_with("h:") {
                return Some(frame);
            }
        }
    }

    fn send(&self, line: &str) {
        self.to_client
            .send(line.to_string())
            .expect("client reader gone");
    }
}

#[derive(Clone)]
struct TestConnector {
    accepts: mpsc::UnboundedSender<TestServer>,
}

fn test_connector() -> (TestConnector, mpsc::UnboundedReceiver<TestServer>) {
    let (accepts, accepted) = mpsc::unbounded_channel();
    (TestConnector { accepts }, accepted)
}

struct ChanSink(mpsc::UnboundedSender<String>);

#[async_trait]
impl FrameSink for ChanSink {
    async fn send(&mut self, frame: &str) -> std::io::Result<()> {
        self.0
            .send(frame.to_string())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer gone"))
    }
}

struct ChanSource(mpsc::UnboundedReceiver<String>);

#[async_trait]
impl FrameSource for ChanSource {
    async fn next_frame(&mut self) -> std::io::Result<Option<String>> {
        Ok(self.0.recv().await)
    }
}

#[async_trait]
impl Connector for TestConnector {
    async fn connect(&self) -> std::io::Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        self.accepts
            .send(TestServer {
                from_client: server_rx,
                to_client: server_tx,
            })
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "no listener")
            })?;
        Ok((Box::new(ChanSink(client_tx)), Box::new(ChanSource(client_rx))))
    }
}

struct Harness {
    bucket: Bucket,
    events: broadcast::Receiver<BucketEvent>,
    accepts: mpsc::UnboundedReceiver<TestServer>,
    driver: tokio::task::JoinHandle<()>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

async fn start(bucket_name: &str) -> Harness {
    let (connector, accepts) = test_connector();
    let client = Client::new(ClientConfig::new("test-app", "test-token"));
    let store = Arc::new(MemoryStore::new());
    let bucket = client.bucket(bucket_name, store);
    let events = bucket.subscribe();
    let driver = tokio::spawn(async move { client.run(connector).await });
    Harness {
        bucket,
        events,
        accepts,
        driver,
    }
}

async fn accept(harness: &mut Harness) -> TestServer {
    timeout(Duration::from_secs(5), harness.accepts.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector gone")
}

/// Run the init/auth/index handshake, serving `index_body` as the single
/// index page.
async fn handshake(server: &mut TestServer, index_body: &str) {
    let init = server.recv().await;
    assert!(init.starts_with("0:init:"), "unexpected frame {init}");
    server.send("0:auth:user@example.com");
    let request = server.recv().await;
    assert_eq!(request, "0:i:1::::100");
    server.send(&format!("0:i:{index_body}"));
}

async fn next_event(events: &mut broadcast::Receiver<BucketEvent>) -> BucketEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event bus closed")
}

async fn wait_for_index(events: &mut broadcast::Receiver<BucketEvent>) {
    loop {
        if let BucketEvent::Index = next_event(events).await {
            return;
        }
    }
}

fn change_payload(frame: &str) -> Value {
    let body = frame
        .strip_prefix("0:c:")
        .unwrap_or_else(|| panic!("not a change frame: {frame}"));
    serde_json::from_str(body).expect("change frame is not JSON")
}

#[tokio::test]
async fn create_then_update() {
    let mut harness = start("notes").await;
    let mut server = accept(&mut harness).await;
    handshake(&mut server, r#"{"index":[],"current":"cv-1"}"#).await;
    wait_for_index(&mut harness.events).await;

    let object = harness.bucket.add(json!({"content": "Hi"})).await.unwrap();
    assert_eq!(object.version, 0);

    let payload = change_payload(&server.recv().await);
    assert_eq!(payload["o"], "M");
    assert_eq!(payload["sv"], 0);
    assert_eq!(payload["id"], Value::String(object.id.clone()));
    assert_eq!(payload["v"], json!({"content": {"o": "+", "v": "Hi"}}));
    let ccid = payload["ccid"].as_str().expect("change without a ccid");

    server.send(&format!(
        r#"0:c:[{{"id":"{}","o":"M","ev":1,"ccid":"{}","v":{}}}]"#,
        object.id, ccid, payload["v"]
    ));

    let bucket = &harness.bucket;
    for _ in 0..500 {
        if bucket.get_version(&object.id).await.unwrap() == 1 && !bucket.has_local_changes().await
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(bucket.get_version(&object.id).await.unwrap(), 1);
    assert!(!bucket.has_local_changes().await);
    let stored = harness.bucket.get(&object.id).await.unwrap().unwrap();
    assert_eq!(serde_json::to_value(&stored.data).unwrap(), json!({"content": "Hi"}));
}

#[tokio::test]
async fn concurrent_string_edits_merge() {
    let mut harness = start("notes").await;
    let mut server = accept(&mut harness).await;
    handshake(
        &mut server,
        r#"{"index":[{"id":"note-1","v":2,"d":{"t":"hello"}}],"current":"cv-2"}"#,
    )
    .await;
    wait_for_index(&mut harness.events).await;

    harness
        .bucket
        .update("note-1", json!({"t": "hello world"}))
        .await
        .unwrap();
    let first = change_payload(&server.recv().await);
    assert_eq!(first["sv"], 2);
    assert_eq!(first["v"]["t"]["o"], "d");

    // A concurrent edit lands upstream before our change is acknowledged.
    let upstream_patch = textdiff::make_patch("hello", "hello!").unwrap();
    server.send(&format!(
        r#"0:c:[{{"id":"note-1","o":"M","ev":3,"sv":2,"ccid":"peer-1","cv":"cv-3","v":{{"t":{{"o":"d","v":{}}}}}}}]"#,
        serde_json::to_string(&upstream_patch).unwrap()
    ));

    // The local change is rebased and re-sent against the new ghost.
    let second = change_payload(&server.recv().await);
    assert_eq!(second["sv"], 3);
    assert_eq!(second["v"]["t"]["o"], "d");
    let rebased = second["v"]["t"]["v"].as_str().unwrap();
    assert_eq!(
        textdiff::apply_patch(rebased, "hello!").unwrap(),
        "hello world!"
    );

    server.send(&format!(
        r#"0:c:[{{"id":"note-1","o":"M","ev":4,"ccid":"{}","v":{}}}]"#,
        second["ccid"].as_str().unwrap(),
        second["v"]
    ));

    let bucket = &harness.bucket;
    for _ in 0..500 {
        if bucket.get_version("note-1").await.unwrap() == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stored = bucket.get("note-1").await.unwrap().unwrap();
    assert_eq!(stored.version, 4);
    assert_eq!(stored.data["t"], json!("hello world!"));
}

#[tokio::test]
async fn concurrent_increments_commute() {
    let mut harness = start("counters").await;
    let mut server = accept(&mut harness).await;
    handshake(
        &mut server,
        r#"{"index":[{"id":"c1","v":1,"d":{"c":5}}],"current":"cv-1"}"#,
    )
    .await;
    wait_for_index(&mut harness.events).await;

    harness.bucket.update("c1", json!({"c": 7})).await.unwrap();
    let first = change_payload(&server.recv().await);
    assert_eq!(first["v"], json!({"c": {"o": "I", "v": 2}}));

    server.send(r#"0:c:[{"id":"c1","o":"M","ev":2,"sv":1,"ccid":"peer-1","v":{"c":{"o":"I","v":3}}}]"#);

    let second = change_payload(&server.recv().await);
    assert_eq!(second["sv"], 2);
    assert_eq!(second["v"], json!({"c": {"o": "I", "v": 2}}));

    server.send(&format!(
        r#"0:c:[{{"id":"c1","o":"M","ev":3,"ccid":"{}","v":{}}}]"#,
        second["ccid"].as_str().unwrap(),
        second["v"]
    ));

    let bucket = &harness.bucket;
    for _ in 0..500 {
        if bucket.get_version("c1").await.unwrap() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stored = bucket.get("c1").await.unwrap().unwrap();
    assert_eq!(stored.version, 3);
    assert_eq!(stored.data["c"], json!(10));
}

#[tokio::test]
async fn concurrent_replaces_let_upstream_win() {
    let mut harness = start("notes").await;
    let mut server = accept(&mut harness).await;
    handshake(
        &mut server,
        r#"{"index":[{"id":"k1","v":1,"d":{"k":"a"}}],"current":"cv-1"}"#,
    )
    .await;
    wait_for_index(&mut harness.events).await;

    // A kind change diffs to a replacement.
    harness.bucket.update("k1", json!({"k": 2})).await.unwrap();
    let first = change_payload(&server.recv().await);
    assert_eq!(first["v"], json!({"k": {"o": "r", "v": 2}}));

    server.send(r#"0:c:[{"id":"k1","o":"M","ev":2,"sv":1,"ccid":"peer-1","v":{"k":{"o":"r","v":"c"}}}]"#);

    let bucket = &harness.bucket;
    for _ in 0..500 {
        if bucket.get_version("k1").await.unwrap() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stored = bucket.get("k1").await.unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.data["k"], json!("c"));
    assert!(!harness.bucket.has_local_changes().await);
    // the superseded local change is never re-sent
    assert_eq!(server.try_recv(Duration::from_millis(300)).await, None);
}

#[tokio::test]
async fn replayed_changes_are_discarded() {
    let mut harness = start("notes").await;
    let mut server = accept(&mut harness).await;
    handshake(
        &mut server,
        r#"{"index":[{"id":"n1","v":4,"d":{"x":1}}],"current":"cv-4"}"#,
    )
    .await;
    wait_for_index(&mut harness.events).await;

    let replay = r#"0:c:[{"id":"n1","o":"M","ev":4,"sv":3,"ccid":"peer-9","v":{"x":{"o":"I","v":1}}}]"#;
    server.send(replay);
    server.send(replay);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(harness.bucket.get_version("n1").await.unwrap(), 4);
    let stored = harness.bucket.get("n1").await.unwrap().unwrap();
    assert_eq!(stored.data["x"], json!(1));
    // no update events beyond the index download itself
    while let Ok(event) = harness.events.try_recv() {
        if let BucketEvent::Update { remote: Some(info), .. } = event {
            assert!(info.is_indexing, "replayed change produced {info:?}");
        }
    }
}

#[tokio::test]
async fn reconnect_resends_with_refreshed_source_version() {
    let mut harness = start("notes").await;
    let mut server = accept(&mut harness).await;
    handshake(
        &mut server,
        r#"{"index":[{"id":"n1","v":1,"d":{"n":1}}],"current":"cv-1"}"#,
    )
    .await;
    wait_for_index(&mut harness.events).await;

    harness.bucket.update("n1", json!({"n": 5})).await.unwrap();
    let first = change_payload(&server.recv().await);
    assert_eq!(first["sv"], 1);

    // Drop the connection with the change still unacknowledged.
    drop(server);
    let mut server = accept(&mut harness).await;
    let init = server.recv().await;
    assert!(init.starts_with("0:init:"));
    server.send("0:auth:user@example.com");

    // The channel resumes from its checkpoint instead of re-indexing, then
    // re-sends the pending change against the current ghost.
    assert_eq!(server.recv().await, "0:cv:cv-1");
    let resent = change_payload(&server.recv().await);
    assert_eq!(resent["sv"], 1);
    assert_eq!(resent["v"], json!({"n": {"o": "I", "v": 4}}));

    server.send(&format!(
        r#"0:c:[{{"id":"n1","o":"M","ev":2,"ccid":"{}","v":{}}}]"#,
        resent["ccid"].as_str().unwrap(),
        resent["v"]
    ));
    let bucket = &harness.bucket;
    for _ in 0..500 {
        if bucket.get_version("n1").await.unwrap() == 2 && !bucket.has_local_changes().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(bucket.get_version("n1").await.unwrap(), 2);
    assert!(!bucket.has_local_changes().await);
}

#[tokio::test]
async fn changes_for_unindexed_ids_wait_for_the_index() {
    let mut harness = start("notes").await;
    let mut server = accept(&mut harness).await;
    let init = server.recv().await;
    assert!(init.starts_with("0:init:"));
    server.send("0:auth:user@example.com");
    assert_eq!(server.recv().await, "0:i:1::::100");

    server.send(r#"0:i:{"index":[{"id":"a","v":1,"d":{"x":1}}],"mark":"m1"}"#);
    // a change for an id the index has not reached yet
    server.send(r#"0:c:[{"id":"b","o":"M","ev":2,"sv":1,"ccid":"peer-1","v":{"y":{"o":"I","v":1}}}]"#);
    assert_eq!(server.recv().await, "0:i:1::m1::100");
    server.send(r#"0:i:{"index":[{"id":"b","v":1,"d":{"y":10}}],"current":"cv-5"}"#);
    wait_for_index(&mut harness.events).await;

    let bucket = &harness.bucket;
    for _ in 0..500 {
        if bucket.get_version("b").await.unwrap() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stored = bucket.get("b").await.unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.data["y"], json!(11));
}

#[tokio::test]
async fn expired_auth_halts_the_channel() {
    let mut harness = start("notes").await;
    let mut server = accept(&mut harness).await;
    let init = server.recv().await;
    assert!(init.starts_with("0:init:"));
    server.send("0:auth:expired");

    loop {
        match next_event(&mut harness.events).await {
            BucketEvent::Unauthorized => break,
            other => panic!("expected unauthorized, got {other:?}"),
        }
    }
    // no index download is attempted
    assert_eq!(server.try_recv(Duration::from_millis(300)).await, None);
}

#[tokio::test]
async fn remove_reaches_the_server_and_back() {
    let mut harness = start("notes").await;
    let mut server = accept(&mut harness).await;
    handshake(
        &mut server,
        r#"{"index":[{"id":"gone","v":3,"d":{"x":1}},{"id":"kept","v":1,"d":{"y":1}}],"current":"cv-3"}"#,
    )
    .await;
    wait_for_index(&mut harness.events).await;

    // local removal
    harness.bucket.remove("gone").await.unwrap();
    let payload = change_payload(&server.recv().await);
    assert_eq!(payload["o"], "-");
    assert_eq!(payload["sv"], 3);
    assert!(payload.get("v").is_none());
    server.send(&format!(
        r#"0:c:[{{"id":"gone","o":"-","ev":4,"ccid":"{}"}}]"#,
        payload["ccid"].as_str().unwrap()
    ));
    let bucket = &harness.bucket;
    for _ in 0..500 {
        if !bucket.has_local_changes().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!bucket.has_local_changes().await);

    // remote removal
    server.send(r#"0:c:[{"id":"kept","o":"-","ev":2,"ccid":"peer-1"}]"#);
    for _ in 0..500 {
        if matches!(bucket.get("kept").await, Ok(None)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(matches!(bucket.get("kept").await, Ok(None)));
}
