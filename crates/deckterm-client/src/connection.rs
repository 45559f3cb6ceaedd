use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use deckterm_types::{ClientFrame, ServerFrame, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_TIMEOUT};

use super::backoff::BackoffPolicy;
use super::heartbeat::{Heartbeat, HeartbeatAction};
use super::state::{ConnectionState, Disconnect, NextStep, ReconnectMachine};
use super::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where and how to connect
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://` or `wss://` URL of the session's streaming channel
    pub url: String,
    /// Extra request headers, e.g. the identity headers a proxy would add
    pub headers: Vec<(String, String)>,
    pub backoff: BackoffPolicy,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            backoff: BackoffPolicy::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Something the connection reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    State(ConnectionState),
    /// Terminal output
    Output(String),
    /// Control frame from the server, other than ping/pong
    Control(ServerFrame),
}

#[derive(Debug)]
enum Command {
    Send(ClientFrame),
    Close,
    Retry,
}

/// Handle to a running connection task
///
/// Dropping the handle closes the connection.
#[derive(Debug)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
}

impl ClientHandle {
    pub fn send(&self, frame: ClientFrame) -> Result<(), ClientError> {
        self.commands
            .send(Command::Send(frame))
            .map_err(|_| ClientError::Stopped)
    }

    pub fn send_input(&self, data: impl Into<String>) -> Result<(), ClientError> {
        self.send(ClientFrame::Input { data: data.into() })
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), ClientError> {
        self.send(ClientFrame::Resize { cols, rows })
    }

    /// Close on purpose; the connection will not come back
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Try again after the connection has given up
    pub fn retry(&self) -> Result<(), ClientError> {
        self.commands
            .send(Command::Retry)
            .map_err(|_| ClientError::Stopped)
    }
}

/// Start a connection task that keeps the channel up until closed or failed
pub fn connect(config: ClientConfig) -> ClientHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(config, command_rx, event_tx));
    ClientHandle {
        commands: command_tx,
        events: event_rx,
    }
}

enum Outcome {
    Disconnected(Disconnect),
    /// The server ended the session; reconnecting would not help
    SessionEnded,
    ClosedLocally,
    HandleDropped,
}

async fn run(
    config: ClientConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut machine = ReconnectMachine::new(config.backoff);
    let emit = |event: ClientEvent| {
        let _ = events.send(event);
    };

    loop {
        machine.connecting();
        emit(ClientEvent::State(machine.state()));

        let outcome = match open(&config).await {
            Ok(ws) => {
                machine.on_open();
                emit(ClientEvent::State(machine.state()));
                info!(url = %config.url, "connected");
                drive(ws, &config, &mut commands, &emit).await
            }
            Err(e) => {
                warn!(url = %config.url, error = %e, "connection failed");
                Outcome::Disconnected(Disconnect::Error)
            }
        };

        let step = match outcome {
            Outcome::Disconnected(how) => machine.on_disconnect(how),
            Outcome::SessionEnded | Outcome::ClosedLocally => {
                machine.close();
                NextStep::Stop
            }
            Outcome::HandleDropped => return,
        };
        emit(ClientEvent::State(machine.state()));

        match step {
            NextStep::Reconnect { attempt, delay } => {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
                if !wait_for_reconnect(delay, &mut commands, &mut machine).await {
                    emit(ClientEvent::State(machine.state()));
                    return;
                }
            }
            NextStep::GiveUp => {
                warn!(url = %config.url, "giving up after repeated failures");
                if !wait_for_retry(&mut commands, &mut machine).await {
                    return;
                }
            }
            NextStep::Stop => return,
        }
    }
}

/// Sleep out the backoff; false if the owner closed meanwhile
async fn wait_for_reconnect(
    delay: Duration,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    machine: &mut ReconnectMachine,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => match command {
                Some(Command::Close) | None => {
                    machine.close();
                    return false;
                }
                // Nothing to send to while disconnected
                Some(Command::Send(frame)) => debug!(?frame, "dropping frame while disconnected"),
                Some(Command::Retry) => {}
            }
        }
    }
}

/// Park in `Failed` until the owner asks to retry or goes away
async fn wait_for_retry(
    commands: &mut mpsc::UnboundedReceiver<Command>,
    machine: &mut ReconnectMachine,
) -> bool {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Retry if machine.retry() => return true,
            Command::Close => {
                machine.close();
                return false;
            }
            _ => {}
        }
    }
    false
}

async fn open(config: &ClientConfig) -> Result<WsStream, ClientError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ClientError::InvalidHeader(name.clone()))?;
        let value =
            HeaderValue::from_str(value).map_err(|_| ClientError::InvalidHeader(name.to_string()))?;
        request.headers_mut().insert(name, value);
    }
    let (ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| ClientError::Connect(e.to_string()))?;
    Ok(ws)
}

/// Pump one open connection until it ends
async fn drive(
    ws: WsStream,
    config: &ClientConfig,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    emit: &impl Fn(ClientEvent),
) -> Outcome {
    let (mut sink, mut stream) = ws.split();
    let mut heartbeat = Heartbeat::new(config.heartbeat_interval, config.heartbeat_timeout);

    loop {
        let wake = tokio::time::Instant::from_std(heartbeat.next_wake());
        tokio::select! {
            message = stream.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket error");
                        return Outcome::Disconnected(Disconnect::Error);
                    }
                    None => return Outcome::Disconnected(Disconnect::Clean),
                };
                match message {
                    Message::Text(text) => {
                        let text = text.to_string();
                        match ServerFrame::parse(&text) {
                            Some(ServerFrame::Pong) => heartbeat.on_pong(),
                            Some(ServerFrame::Ping) => {
                                let pong = ClientFrame::Pong.encode();
                                if sink.send(Message::Text(pong.into())).await.is_err() {
                                    return Outcome::Disconnected(Disconnect::Error);
                                }
                            }
                            Some(frame) => {
                                let ended = frame.is_terminal() || matches!(frame, ServerFrame::Error { .. });
                                emit(ClientEvent::Control(frame));
                                if ended {
                                    let _ = sink.close().await;
                                    return Outcome::SessionEnded;
                                }
                            }
                            None => emit(ClientEvent::Output(text)),
                        }
                    }
                    Message::Binary(bytes) => {
                        emit(ClientEvent::Output(String::from_utf8_lossy(&bytes).into_owned()));
                    }
                    Message::Close(_) => return Outcome::Disconnected(Disconnect::Clean),
                    _ => {}
                }
            }
            command = commands.recv() => {
                match command {
                    Some(Command::Send(frame)) => {
                        if sink.send(Message::Text(frame.encode().into())).await.is_err() {
                            return Outcome::Disconnected(Disconnect::Error);
                        }
                    }
                    Some(Command::Close) => {
                        let _ = sink.close().await;
                        return Outcome::ClosedLocally;
                    }
                    Some(Command::Retry) => {}
                    None => {
                        let _ = sink.close().await;
                        return Outcome::HandleDropped;
                    }
                }
            }
            _ = tokio::time::sleep_until(wake) => {
                match heartbeat.poll_at(std::time::Instant::now()) {
                    HeartbeatAction::SendPing => {
                        let ping = ClientFrame::Ping.encode();
                        if sink.send(Message::Text(ping.into())).await.is_err() {
                            return Outcome::Disconnected(Disconnect::Error);
                        }
                    }
                    HeartbeatAction::TimedOut => {
                        warn!(url = %config.url, "heartbeat timed out");
                        return Outcome::Disconnected(Disconnect::HeartbeatTimeout);
                    }
                    HeartbeatAction::Idle => {}
                }
            }
        }
    }
}
