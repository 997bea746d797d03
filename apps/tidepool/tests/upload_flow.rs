use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use tidepool::cell::Bond;
use tidepool::client::App;
use tidepool::config::Config;
use tidepool::protocol::{Page, ServerFrame, encode_server_frame};
use tidepool::transport::SessionLink;
use tidepool::upload::{FilePayload, HttpTransfers, UploadBody, UploadConfig};

struct UploadServer {
    uploads: AtomicUsize,
    received: mpsc::UnboundedSender<String>,
}

async fn start_upload_server() -> (SocketAddr, Arc<UploadServer>, mpsc::UnboundedReceiver<String>) {
    let (received_tx, received_rx) = mpsc::unbounded_channel();
    let state = Arc::new(UploadServer {
        uploads: AtomicUsize::new(0),
        received: received_tx,
    });
    let router = Router::new()
        .route("/_s", get(ws_upgrade))
        .route("/_f", post(accept_files))
        .with_state(Arc::clone(&state));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, state, received_rx)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<UploadServer>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| speak(socket, state))
}

/// Record every sync payload and answer it with a fresh page so busy
/// settles.
async fn speak(mut socket: WebSocket, state: Arc<UploadServer>) {
    let page = encode_server_frame(&ServerFrame::Data {
        page: Page {
            key: "s-1".to_string(),
            content: serde_json::json!({}),
        },
    })
    .unwrap();
    let _ = socket.send(Message::Text(page.clone())).await;
    while let Some(Ok(message)) = socket.recv().await {
        if let Message::Text(text) = message {
            let _ = state.received.send(text);
            let _ = socket.send(Message::Text(page.clone())).await;
        }
    }
}

/// Mint one opaque handle per `files` field, in field order.
async fn accept_files(
    State(state): State<Arc<UploadServer>>,
    mut multipart: Multipart,
) -> Json<serde_json::Value> {
    state.uploads.fetch_add(1, Ordering::SeqCst);
    let mut handles = Vec::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.file_name().unwrap_or("unnamed").to_string();
        let _bytes = field.bytes().await.unwrap();
        handles.push(format!("/_f/test/{name}"));
    }
    Json(serde_json::json!({ "files": handles }))
}

fn build_app(addr: SocketAddr) -> (App, SessionLink) {
    let config = Config {
        session_server: addr.to_string(),
        reconnect_initial: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(50),
        ..Config::default()
    };
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let link = SessionLink::open(&config, link_tx);
    let transfers = Arc::new(HttpTransfers::new(config.upload_url()));
    let app = App::new(&config, transfers, link.sender(), link_rx);
    (app, link)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

async fn next_payload_with(
    received: &mut mpsc::UnboundedReceiver<String>,
    key: &str,
) -> serde_json::Value {
    loop {
        let payload = received.recv().await.expect("server hung up");
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        if value.get(key).is_some() {
            return value;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interactive_upload_round_trips_handles() {
    let (addr, server, mut received) = start_upload_server().await;
    let (mut app, _link) = build_app(addr);
    let widget = app.register_upload(
        UploadConfig::new("report")
            .with_label("Upload")
            .with_extensions(&["txt"]),
    );
    let handle = app.handle();
    tokio::spawn(app.run());

    // Large enough for several metered chunks.
    widget.select(vec![FilePayload::new("a.txt", vec![7u8; 200_000])]);
    widget.confirm();

    let value = next_payload_with(&mut received, "report").await;
    assert_eq!(value["report"][0], "/_f/test/a.txt");
    assert_eq!(server.uploads.load(Ordering::SeqCst), 1);

    eventually(|| matches!(widget.render().body, UploadBody::Success(_))).await;
    match widget.render().body {
        UploadBody::Success(message) => {
            assert_eq!(message, "Successfully uploaded files: a.txt.");
        }
        other => panic!("expected success body, got {:?}", other),
    }

    // The handle list rides along unchanged on the next sync.
    handle.set_fragment("later");
    let value = next_payload_with(&mut received, "#").await;
    assert_eq!(value["report"][0], "/_f/test/a.txt");
    assert_eq!(server.uploads.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn staged_upload_waits_for_the_next_sync_cycle() {
    let (addr, server, mut received) = start_upload_server().await;
    let (mut app, _link) = build_app(addr);
    let widget = app.register_upload(UploadConfig::new("photos").with_compact(true));
    let sync = app.sync();
    tokio::spawn(app.run());

    widget.select(vec![
        FilePayload::new("pic.png", vec![1u8; 64]),
    ]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.uploads.load(Ordering::SeqCst), 0);

    // Some other interaction pushes the arguments; the staged selection
    // flushes on that cycle's busy rising edge.
    sync.sync();
    let value = next_payload_with(&mut received, "photos").await;
    assert_eq!(value["photos"][0], "/_f/test/pic.png");
    assert_eq!(server.uploads.load(Ordering::SeqCst), 1);

    // The pending set was cleared: further syncs carry the handles but
    // upload nothing new.
    sync.sync();
    let value = next_payload_with(&mut received, "photos").await;
    assert_eq!(value["photos"][0], "/_f/test/pic.png");
    assert_eq!(server.uploads.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_selection_never_reaches_the_network() {
    let (addr, server, mut received) = start_upload_server().await;
    let (mut app, _link) = build_app(addr);
    let widget = app.register_upload(UploadConfig::new("report").with_extensions(&["csv"]));
    tokio::spawn(app.run());

    widget.select(vec![FilePayload::new("notes.txt", vec![0u8; 8])]);
    widget.confirm();

    eventually(|| matches!(widget.render().body, UploadBody::Error(_))).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.uploads.load(Ordering::SeqCst), 0);
    assert!(received.try_recv().is_err());
}
