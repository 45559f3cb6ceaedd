#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use deckterm::config::{FileConfig, ServerConfig};
use deckterm::terminal::{
    AdmissionLimits, PtyControl, PtyEvent, PtySpawner, SpawnRequest, SpawnedPty,
};
use deckterm::types::TerminalError;
use deckterm::{ServeArgs, WebServer};
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;

pub const USER_HEADER: &str = "x-deckterm-user-id";

/// PTY double that records input and lets tests drive output and exit
pub struct FakePty {
    written: Mutex<Vec<u8>>,
    pub resizes: Mutex<Vec<(u16, u16)>>,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<PtyEvent>,
}

impl FakePty {
    pub fn emit(&self, text: &str) {
        let _ = self.events.send(PtyEvent::Output(text.as_bytes().to_vec()));
    }

    pub fn exit(&self, code: Option<i32>) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(PtyEvent::Exit { code });
    }

    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written.lock().unwrap()).into_owned()
    }
}

impl PtyControl for FakePty {
    fn write(&self, data: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        self.written.lock().unwrap().extend_from_slice(data);
        true
    }

    fn resize(&self, cols: u16, rows: u16) -> bool {
        self.resizes.lock().unwrap().push((cols, rows));
        !self.is_closed()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(PtyEvent::Exit { code: None });
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn process_id(&self) -> Option<u32> {
        None
    }
}

#[derive(Default)]
pub struct FakeSpawner {
    ptys: Mutex<Vec<Arc<FakePty>>>,
    fail_remaining: AtomicUsize,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, count: usize) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    pub fn pty(&self, index: usize) -> Arc<FakePty> {
        Arc::clone(&self.ptys.lock().unwrap()[index])
    }
}

impl PtySpawner for FakeSpawner {
    fn spawn(&self, _request: &SpawnRequest) -> Result<SpawnedPty, TerminalError> {
        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TerminalError::SpawnFailure("no such shell".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let pty = Arc::new(FakePty {
            written: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            events: tx,
        });
        self.ptys.lock().unwrap().push(Arc::clone(&pty));
        Ok(SpawnedPty {
            control: pty,
            events: rx,
        })
    }
}

/// Server settings with test-sized limits and no idle reaping
pub fn server_config(max_sessions: usize, per_owner: usize, rate_max: usize) -> ServerConfig {
    let mut config = ServerConfig::resolve(&ServeArgs::default(), &FileConfig::default()).unwrap();
    config.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.manager.shell = vec!["/bin/sh".to_string()];
    config.manager.idle_timeout = None;
    config.manager.limits = AdmissionLimits {
        max_sessions,
        max_sessions_per_owner: per_owner,
        rate_window: Duration::from_secs(60),
        rate_max,
    };
    config
}

pub fn server(config: ServerConfig, spawner: &Arc<FakeSpawner>) -> WebServer {
    WebServer::with_parts(config, Arc::clone(spawner) as Arc<dyn PtySpawner>, None).unwrap()
}

pub fn app(config: ServerConfig, spawner: &Arc<FakeSpawner>) -> Router {
    server(config, spawner).router()
}

/// Response status, headers and JSON body (`Null` when empty)
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

/// Send one request through the router without a socket
pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    user: Option<&str>,
    body: Option<&str>,
) -> Reply {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        request = request.header(USER_HEADER, user);
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    Reply {
        status,
        headers,
        body,
    }
}

/// Create a terminal for `user` and return its id
pub async fn create(app: &Router, user: &str) -> String {
    let reply = send(app, Method::POST, "/terminals", Some(user), None).await;
    assert_eq!(reply.status, StatusCode::OK, "create failed: {}", reply.body);
    reply.body["id"].as_str().unwrap().to_string()
}

/// Poll until `check` holds, failing the test after two seconds
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
