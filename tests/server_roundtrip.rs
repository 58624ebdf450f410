//! Drives a real server over TCP: WebSocket protocol and HTTP routes on one port

use futures_util::{SinkExt, StreamExt};
use orbit_server::{Server, Settings};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(10);

async fn start(dir: &Path) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let settings = Settings {
        host: "127.0.0.1".to_string(),
        port: 0,
        working_directory: dir.to_path_buf(),
        watch_enabled: true,
        shell: "/bin/sh".to_string(),
        quiet_window: Duration::from_millis(50),
        data_dir: dir.join(".orbit-data"),
        ..Settings::default()
    };
    let server = Server::bind(settings).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        server
            .run_until(async {
                let _ = stop_rx.await;
            })
            .await
            .unwrap();
    });
    (addr, stop_tx, task)
}

async fn next_json(ws: &mut Socket) -> Value {
    loop {
        let frame = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn next_of_type(ws: &mut Socket, kind: &str) -> Value {
    loop {
        let value = next_json(ws).await;
        if value["type"] == kind {
            return value;
        }
    }
}

async fn send(ws: &mut Socket, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, addr
    );
    raw_request(addr, &request).await
}

async fn raw_request(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    tokio::time::timeout(WAIT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

#[cfg(unix)]
#[tokio::test]
async fn test_websocket_session() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    // New directories are picked up by the watcher asynchronously
    std::fs::create_dir_all(root.join(".taskmaster").join("tasks")).unwrap();
    let (addr, stop, task) = start(&root).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/", addr))
        .await
        .unwrap();

    assert_eq!(
        next_json(&mut ws).await,
        json!({"type": "connection:status", "connected": true})
    );
    assert_eq!(
        next_json(&mut ws).await,
        json!({"type": "config:workingDir", "path": root.display().to_string()})
    );
    next_of_type(&mut ws, "terminal:ready").await;

    // Malformed frames get an error and the socket stays usable
    ws.send(Message::Text("{oops".to_string())).await.unwrap();
    assert_eq!(
        next_of_type(&mut ws, "error").await,
        json!({"type": "error", "message": "Invalid message format"})
    );

    send(
        &mut ws,
        json!({"type": "config:writeFile", "relativePath": "notes/todo.md", "content": "- ship"}),
    )
    .await;
    assert_eq!(
        next_of_type(&mut ws, "config:writeResult").await,
        json!({"type": "config:writeResult", "success": true, "path": "notes/todo.md"})
    );
    assert_eq!(
        std::fs::read_to_string(root.join("notes/todo.md")).unwrap(),
        "- ship"
    );

    // Writing the task file is seen by the watcher and synced
    send(
        &mut ws,
        json!({
            "type": "config:writeFile",
            "relativePath": ".taskmaster/tasks/tasks.json",
            "content": r#"{"master":{"tasks":[{"id":1,"title":"Launch","status":"in-progress"}]}}"#
        }),
    )
    .await;
    let updated = next_of_type(&mut ws, "tasks:updated").await;
    assert_eq!(updated["tasks"][0]["id"], "taskmaster-1");
    assert_eq!(updated["tasks"][0]["status"], "in_progress");

    send(
        &mut ws,
        json!({"type": "terminal:input", "data": "echo orbit-$((40+2))\n"}),
    )
    .await;
    let mut output = String::new();
    while !output.contains("orbit-42") {
        let frame = next_of_type(&mut ws, "terminal:output").await;
        output.push_str(frame["data"].as_str().unwrap());
    }

    let _ = ws.close(None).await;
    stop.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_http_routes_share_the_port() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, stop, task) = start(dir.path()).await;

    let response = http_get(addr, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#""status":"ok""#));
    assert!(response.to_ascii_lowercase().contains("access-control-allow-origin: *"));

    let response = http_get(addr, "/projects").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("[]"));

    let response = http_get(addr, "/projects/unknown").await;
    assert!(response.starts_with("HTTP/1.1 404"));

    stop.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_bad_handshakes_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, stop, task) = start(dir.path()).await;

    let handshake = |method: &str, version: &str| {
        format!(
            "{} / HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade, close\r\nUpgrade: websocket\r\n\
             Sec-WebSocket-Version: {}\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
            method, addr, version
        )
    };

    let response = raw_request(addr, &handshake("GET", "8")).await;
    assert!(response.starts_with("HTTP/1.1 426"));
    assert!(response.to_ascii_lowercase().contains("sec-websocket-version: 13"));

    let response = raw_request(addr, &handshake("POST", "13")).await;
    assert!(response.starts_with("HTTP/1.1 400"));

    // The server still accepts a proper client afterwards
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/", addr))
        .await
        .unwrap();
    assert_eq!(
        next_json(&mut ws).await,
        json!({"type": "connection:status", "connected": true})
    );

    let _ = ws.close(None).await;
    stop.send(()).unwrap();
    task.await.unwrap();
}
