/// Per-session subscriber sets and output fan-out
use std::collections::HashMap;
use std::sync::Mutex;

use deckterm_types::{ServerFrame, TerminalError, DEFAULT_SUBSCRIBER_QUEUE};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Identifier of one attached channel, unique within its session
pub type SubscriberId = u64;

/// What a subscriber's channel task should send next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Terminal output, already decoded to text
    Output(String),
    /// JSON control frame
    Control(ServerFrame),
    /// Close the channel; nothing follows
    Close,
}

/// A channel attached to a session
///
/// `sender` reaches only this subscriber, for replies such as `pong`.
/// `dropped` fires when the session gave up on this channel because its
/// queue filled; the transport should then disconnect so the client
/// reattaches.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub receiver: mpsc::Receiver<Outbound>,
    pub sender: mpsc::Sender<Outbound>,
    pub dropped: CancellationToken,
}

struct Subscriber {
    tx: mpsc::Sender<Outbound>,
    dropped: CancellationToken,
}

impl Subscriber {
    /// Queue without waiting; false once this subscriber is gone
    fn offer(&self, id: SubscriberId, message: Outbound) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(subscriber = id, error = %TerminalError::TransportClosed, "subscriber queue full, dropping stalled subscriber");
                self.dropped.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = id, error = %TerminalError::TransportClosed, "dropping closed subscriber");
                false
            }
        }
    }
}

struct SubscriberTable {
    next_id: SubscriberId,
    subscribers: HashMap<SubscriberId, Subscriber>,
    closed: bool,
}

/// The live channels of one session
///
/// Each channel has a bounded queue. A subscriber that falls `capacity`
/// messages behind is dropped rather than allowed to buffer without limit.
pub struct Subscribers {
    capacity: usize,
    table: Mutex<SubscriberTable>,
}

impl Default for Subscribers {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_QUEUE)
    }
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            table: Mutex::new(SubscriberTable {
                next_id: 0,
                subscribers: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Add a channel; `None` once the session has been closed
    pub fn attach(&self) -> Option<Subscription> {
        let mut table = self.table.lock().ok()?;
        if table.closed {
            return None;
        }
        let id = table.next_id;
        table.next_id += 1;
        let (tx, rx) = mpsc::channel(self.capacity);
        let dropped = CancellationToken::new();
        table.subscribers.insert(
            id,
            Subscriber {
                tx: tx.clone(),
                dropped: dropped.clone(),
            },
        );
        Some(Subscription {
            id,
            receiver: rx,
            sender: tx,
            dropped,
        })
    }

    /// Remove a channel; returns whether it was attached
    pub fn detach(&self, id: SubscriberId) -> bool {
        match self.table.lock() {
            Ok(mut table) => table.subscribers.remove(&id).is_some(),
            Err(_) => false,
        }
    }

    /// Send to every attached channel without waiting
    ///
    /// Channels whose receiver is gone or whose queue is full are dropped
    /// from the set. Returns the number of channels the message reached.
    pub fn broadcast(&self, message: &Outbound) -> usize {
        let Ok(mut table) = self.table.lock() else {
            return 0;
        };
        let before = table.subscribers.len();
        table
            .subscribers
            .retain(|id, subscriber| subscriber.offer(*id, message.clone()));
        let reached = table.subscribers.len();
        if reached < before {
            trace!(dropped = before - reached, "broadcast pruned subscribers");
        }
        reached
    }

    /// Send `frame` (if any) and a close to every channel, then refuse new attaches
    pub fn close_all(&self, frame: Option<ServerFrame>) -> usize {
        let Ok(mut table) = self.table.lock() else {
            return 0;
        };
        table.closed = true;
        let subscribers = std::mem::take(&mut table.subscribers);
        for (id, subscriber) in &subscribers {
            let notified = match &frame {
                Some(frame) => subscriber.offer(*id, Outbound::Control(frame.clone())),
                None => true,
            };
            if notified {
                subscriber.offer(*id, Outbound::Close);
            }
        }
        subscribers.len()
    }

    pub fn len(&self) -> usize {
        self.table.lock().map(|t| t.subscribers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.table.lock().map(|t| t.closed).unwrap_or(true)
    }
}

/// Incremental UTF-8 decoder for PTY output
///
/// A multi-byte character split across two reads is held back until the
/// rest arrives. Bytes that can never form valid UTF-8 become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `pending + chunk` as is complete
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let remaining = rest.to_vec();
        self.pending = remaining;
        out
    }

    /// Flush whatever is left, replacing an incomplete tail
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}
