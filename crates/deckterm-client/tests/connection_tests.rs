use std::time::Duration;

use deckterm_client::{connect, BackoffPolicy, ClientConfig, ClientEvent, ConnectionState};
use deckterm_types::ServerFrame;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

fn fast_config(port: u16, max_retries: u32) -> ClientConfig {
    let mut config = ClientConfig::new(format!("ws://127.0.0.1:{}/stream/terminals/t1", port))
        .header("x-deckterm-user-id", "alice");
    config.backoff = BackoffPolicy {
        base: Duration::from_millis(10),
        cap: Duration::from_millis(40),
        max_retries,
    };
    config
}

/// Collect events until `done` matches one, failing after five seconds
async fn collect_until(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<ClientEvent>,
    done: impl Fn(&ClientEvent) -> bool,
) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            let stop = done(&event);
            seen.push(event);
            if stop {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for client events");
    seen
}

#[tokio::test]
async fn test_output_then_exit_stops_without_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Text("hello".into())).await.unwrap();
        ws.send(Message::Text(ServerFrame::Exit { code: Some(0) }.to_json().into()))
            .await
            .unwrap();
        while ws.next().await.is_some() {}
    });

    let mut handle = connect(fast_config(port, 3));
    let events = collect_until(&mut handle.events, |e| {
        *e == ClientEvent::State(ConnectionState::Closed)
    })
    .await;

    assert_eq!(
        events,
        vec![
            ClientEvent::State(ConnectionState::Connecting),
            ClientEvent::State(ConnectionState::Connected),
            ClientEvent::Output("hello".to_string()),
            ClientEvent::Control(ServerFrame::Exit { code: Some(0) }),
            ClientEvent::State(ConnectionState::Closed),
        ]
    );
    // The task ends instead of reconnecting
    let rest = tokio::time::timeout(Duration::from_secs(2), handle.events.recv())
        .await
        .unwrap();
    assert_eq!(rest, None);
}

#[tokio::test]
async fn test_input_is_sent_as_tagged_json() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let received = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break text.to_string(),
                Some(Ok(_)) => continue,
                other => panic!("unexpected {:?}", other),
            }
        };
        ws.send(Message::Text(ServerFrame::Closed.to_json().into()))
            .await
            .unwrap();
        received
    });

    let mut handle = connect(fast_config(port, 3));
    collect_until(&mut handle.events, |e| {
        *e == ClientEvent::State(ConnectionState::Connected)
    })
    .await;
    handle.send_input("ls\r").unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    let json: serde_json::Value = serde_json::from_str(&received).unwrap();
    assert_eq!(json["type"], "input");
    assert_eq!(json["data"], "ls\r");
}

#[tokio::test]
async fn test_dropped_connection_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        drop(ws);

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Text("again".into())).await.unwrap();
        ws.send(Message::Text(ServerFrame::Closed.to_json().into()))
            .await
            .unwrap();
        while ws.next().await.is_some() {}
    });

    let mut handle = connect(fast_config(port, 3));
    let events = collect_until(&mut handle.events, |e| {
        *e == ClientEvent::Control(ServerFrame::Closed)
    })
    .await;

    assert!(events.iter().any(|e| matches!(
        e,
        ClientEvent::State(ConnectionState::Reconnecting { attempt: 1, .. })
    )));
    assert_eq!(
        events
            .iter()
            .filter(|e| **e == ClientEvent::State(ConnectionState::Connected))
            .count(),
        2
    );
    assert!(events.contains(&ClientEvent::Output("again".to_string())));
}

#[tokio::test]
async fn test_missing_pong_fails_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        // Read pings but never answer them
        while ws.next().await.is_some() {}
    });

    let mut config = fast_config(port, 0);
    config.heartbeat_interval = Duration::from_millis(50);
    config.heartbeat_timeout = Duration::from_millis(50);
    let mut handle = connect(config);

    let events = collect_until(&mut handle.events, |e| {
        *e == ClientEvent::State(ConnectionState::Failed)
    })
    .await;
    assert!(events.contains(&ClientEvent::State(ConnectionState::Connected)));
    handle.close();
}

#[tokio::test]
async fn test_refused_connection_gives_up_then_retries() {
    // Bind then drop to get a port nobody listens on
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut handle = connect(fast_config(port, 1));
    let events = collect_until(&mut handle.events, |e| {
        *e == ClientEvent::State(ConnectionState::Failed)
    })
    .await;
    assert_eq!(
        events
            .iter()
            .filter(|e| **e == ClientEvent::State(ConnectionState::Connecting))
            .count(),
        2
    );

    handle.retry().unwrap();
    collect_until(&mut handle.events, |e| {
        *e == ClientEvent::State(ConnectionState::Failed)
    })
    .await;

    handle.close();
    let end = tokio::time::timeout(Duration::from_secs(2), handle.events.recv())
        .await
        .unwrap();
    assert_eq!(end, None);
}
