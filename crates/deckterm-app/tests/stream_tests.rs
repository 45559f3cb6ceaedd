mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use deckterm::client::{connect, ClientConfig, ClientEvent, ConnectionState};
use deckterm::terminal::TerminalManager;
use deckterm::types::ServerFrame;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

struct Running {
    addr: SocketAddr,
    manager: Arc<TerminalManager>,
    http: reqwest::Client,
}

impl Running {
    async fn create(&self, user: &str) -> String {
        let reply: serde_json::Value = self
            .http
            .post(format!("http://{}/terminals", self.addr))
            .header(USER_HEADER, user)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        reply["id"].as_str().unwrap().to_string()
    }

    fn client(&self, id: &str, user: &str) -> ClientConfig {
        ClientConfig::new(format!("ws://{}/stream/terminals/{}", self.addr, id))
            .header(USER_HEADER, user)
    }

    async fn subscribers(&self, id: &str) -> usize {
        match self.manager.get(id).await {
            Ok(session) => session.subscribers().len(),
            Err(_) => 0,
        }
    }
}

async fn start(spawner: &Arc<FakeSpawner>) -> Running {
    let server = server(server_config(10, 10, 20), spawner);
    let manager = server.manager();
    let app = server.router();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Running {
        addr,
        manager,
        http: reqwest::Client::new(),
    }
}

async fn next_event(events: &mut tokio::sync::mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("client stopped")
}

/// Skip state changes until the next output or control event
async fn next_payload(events: &mut tokio::sync::mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    loop {
        match next_event(events).await {
            ClientEvent::State(_) => continue,
            other => return other,
        }
    }
}

#[tokio::test]
async fn test_stream_relays_output_input_and_exit() {
    let spawner = FakeSpawner::new();
    let running = start(&spawner).await;
    let id = running.create("alice").await;

    let (r, sid) = (&running, id.as_str());

    let mut handle = connect(running.client(&id, "alice"));
    eventually(|| async move { r.subscribers(sid).await == 1 }).await;

    let pty = spawner.pty(0);
    let p = &pty;
    pty.emit("hello\r\n");
    assert_eq!(
        next_payload(&mut handle.events).await,
        ClientEvent::Output("hello\r\n".to_string())
    );

    handle.send_input("ls\r").unwrap();
    handle.resize(90, 20).unwrap();
    eventually(|| async move { p.written_text() == "ls\r" }).await;
    eventually(|| async move { p.resizes.lock().unwrap().contains(&(90, 20)) }).await;

    pty.exit(Some(0));
    assert_eq!(
        next_payload(&mut handle.events).await,
        ClientEvent::Control(ServerFrame::Exit { code: Some(0) })
    );
    assert_eq!(
        next_event(&mut handle.events).await,
        ClientEvent::State(ConnectionState::Closed)
    );
    eventually(|| async move { r.manager.get(sid).await.is_err() }).await;
}

#[tokio::test]
async fn test_two_subscribers_see_the_same_output() {
    let spawner = FakeSpawner::new();
    let running = start(&spawner).await;
    let id = running.create("alice").await;

    let (r, sid) = (&running, id.as_str());

    let mut first = connect(running.client(&id, "alice"));
    let mut second = connect(running.client(&id, "alice"));
    eventually(|| async move { r.subscribers(sid).await == 2 }).await;

    spawner.pty(0).emit("shared");
    for handle in [&mut first, &mut second] {
        assert_eq!(
            next_payload(&mut handle.events).await,
            ClientEvent::Output("shared".to_string())
        );
    }

    // One leaving does not end the session
    first.close();
    eventually(|| async move { r.subscribers(sid).await == 1 }).await;
    assert!(running.manager.get(&id).await.is_ok());
}

#[tokio::test]
async fn test_explicit_close_notifies_stream() {
    let spawner = FakeSpawner::new();
    let running = start(&spawner).await;
    let id = running.create("alice").await;

    let (r, sid) = (&running, id.as_str());

    let mut handle = connect(running.client(&id, "alice"));
    eventually(|| async move { r.subscribers(sid).await == 1 }).await;

    let status = running
        .http
        .delete(format!("http://{}/terminals/{}", running.addr, id))
        .header(USER_HEADER, "alice")
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::OK);

    assert_eq!(
        next_payload(&mut handle.events).await,
        ClientEvent::Control(ServerFrame::Closed)
    );
}

#[tokio::test]
async fn test_foreign_stream_is_refused_before_upgrade() {
    let spawner = FakeSpawner::new();
    let running = start(&spawner).await;
    let id = running.create("alice").await;

    let mut request = format!("ws://{}/ws/terminals/{}", running.addr, id)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(USER_HEADER, "bob".parse().unwrap());

    match tokio_tungstenite::connect_async(request).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 403);
        }
        other => panic!("expected HTTP 403, got {:?}", other.map(|_| ())),
    }
    assert_eq!(running.subscribers(&id).await, 0);
}
