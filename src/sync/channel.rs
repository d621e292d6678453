//! Process-local publish/subscribe bus, one queue per subscriber.
//!
//! A `SyncBus` is shared (cheaply cloned) by every window in the process.
//! Each window opens a `SyncChannel` on a named channel; publishing encodes
//! the message once and pushes the frame onto every *other* subscriber's
//! queue. Queues are plain `mpsc` channels drained by the owning window's
//! event loop, so a single sender's frames are observed in publish order by
//! every receiver. Nothing orders frames from different senders.
//!
//! Self-echo suppression happens on the receive side: a decoded message whose
//! `senderId` equals the receiving channel's own peer id is dropped before any
//! handler sees it. This also covers a window that opened the channel twice.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace, warn};

use super::message::{MessageBody, PeerId, SyncMessage};

/// Channel shared by both windows of one presentation session.
pub const DEFAULT_CHANNEL: &str = "presentation-control";

type Frame = Arc<str>;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Frame>,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    channels: HashMap<String, Vec<Subscriber>>,
}

/// Registry of named channels within this process.
#[derive(Clone, Default)]
pub struct SyncBus {
    inner: Arc<Mutex<BusInner>>,
}

impl SyncBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `name` as `peer`. The returned channel is subscribed immediately:
    /// frames published by others from this point on are queued for it.
    pub fn open(&self, name: &str, peer: PeerId) -> SyncChannel {
        let (tx, rx) = mpsc::channel();
        let id = {
            let mut inner = self.lock();
            inner.next_id += 1;
            let id = inner.next_id;
            inner
                .channels
                .entry(name.to_string())
                .or_default()
                .push(Subscriber { id, tx });
            id
        };
        debug!("sync: peer {peer} opened '{name}' (subscriber {id})");
        SyncChannel {
            bus: self.clone(),
            name: name.to_string(),
            peer,
            subscriber_id: id,
            rx,
            closed: false,
        }
    }

    /// Number of open channels on `name`.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.lock().channels.get(name).map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        // The bus holds no invariant a panicking publisher could break
        // half-way, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn broadcast(&self, name: &str, from: u64, frame: &Frame) -> usize {
        let mut inner = self.lock();
        let Some(subscribers) = inner.channels.get_mut(name) else {
            return 0;
        };
        let mut delivered = 0;
        subscribers.retain(|sub| {
            if sub.id == from {
                return true;
            }
            match sub.tx.send(Arc::clone(frame)) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                // Receiver dropped without closing: forget it.
                Err(_) => false,
            }
        });
        delivered
    }

    fn remove(&self, name: &str, id: u64) {
        let mut inner = self.lock();
        if let Some(subscribers) = inner.channels.get_mut(name) {
            subscribers.retain(|sub| sub.id != id);
            if subscribers.is_empty() {
                inner.channels.remove(name);
            }
        }
    }
}

/// One window's handle on a named channel.
pub struct SyncChannel {
    bus: SyncBus,
    name: String,
    peer: PeerId,
    subscriber_id: u64,
    rx: mpsc::Receiver<Frame>,
    closed: bool,
}

impl SyncChannel {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Fire-and-forget. Succeeds even when nobody is listening; a late
    /// joiner catches up with REQUEST_STATE instead.
    pub fn publish(&self, body: MessageBody) {
        if self.closed {
            debug!("sync: peer {} dropping {} on closed channel", self.peer, body.kind());
            return;
        }
        let kind = body.kind();
        let message = SyncMessage::new(self.peer, body);
        let frame: Frame = match message.encode() {
            Ok(s) => s.into(),
            Err(e) => {
                warn!("sync: {e}");
                return;
            }
        };
        let delivered = self.bus.broadcast(&self.name, self.subscriber_id, &frame);
        debug!("sync: peer {} published {kind} to {delivered} subscriber(s)", self.peer);
        trace!("sync: frame {frame}");
    }

    /// Next queued message from another peer, without blocking.
    ///
    /// Undecodable frames and self-echoes are consumed and skipped.
    pub fn try_next(&self) -> Option<SyncMessage> {
        loop {
            let frame = self.rx.try_recv().ok()?;
            let message = match SyncMessage::decode(&frame) {
                Ok(m) => m,
                Err(e) => {
                    warn!("sync: peer {} rejected frame: {e}", self.peer);
                    continue;
                }
            };
            if message.sender_id == self.peer {
                debug!(
                    "sync: peer {} suppressed self-echo {}",
                    self.peer,
                    message.body.kind()
                );
                continue;
            }
            return Some(message);
        }
    }

    /// Run `handler` once for every queued message from another peer.
    /// Returns how many messages were delivered.
    pub fn dispatch<F: FnMut(SyncMessage)>(&self, mut handler: F) -> usize {
        let mut delivered = 0;
        while let Some(message) = self.try_next() {
            handler(message);
            delivered += 1;
        }
        delivered
    }

    /// Stop delivery. Already-published frames stay with their receivers.
    /// Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.bus.remove(&self.name, self.subscriber_id);
        debug!("sync: peer {} closed '{}'", self.peer, self.name);
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        self.close();
    }
}
