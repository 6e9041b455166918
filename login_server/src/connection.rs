//! Outbound plumbing shared by both listeners.
//!
//! A connection is split in two tasks. The reader task owns the protocol state and decodes
//! inbound frames; a writer task owns the sending cipher and the write half of the socket.
//! Everything else (the reader itself, the login controller, the game server registry,
//! another connection) talks to a peer through a cloneable `ConnectionHandle`, which only
//! queues `Outbound` events. Queuing never blocks, so handles can be used while holding a lock.
//! The queue is bounded: a peer that stops reading is dropped once `OUTBOUND_QUEUE_LIMIT`
//! events are waiting.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use smol::net::{Shutdown, TcpStream};
use tracing::{debug, warn};

use crate::crypt::{write_frame, FrameCipher, FrameError};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub const OUTBOUND_QUEUE_LIMIT: usize = 256;

pub enum Outbound {
    Packet(Vec<u8>),
    /// Switch the sending cipher; every packet queued before it still uses the old key.
    Rekey(Vec<u8>),
    Close,
}

#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    address: SocketAddr,
    sender: flume::Sender<Outbound>,
    overflowed: Arc<AtomicBool>,
}

/// Receiving end of a connection's events, drained by its writer task.
pub struct OutboundQueue {
    events: flume::Receiver<Outbound>,
    overflowed: Arc<AtomicBool>,
}

impl OutboundQueue {
    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }
}

impl ConnectionHandle {
    /// Handle plus the queue a writer task would drain.
    pub fn channel(address: SocketAddr) -> (Self, OutboundQueue) {
        let (sender, events) = flume::bounded(OUTBOUND_QUEUE_LIMIT);
        let overflowed = Arc::new(AtomicBool::new(false));
        let handle = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            address,
            sender,
            overflowed: overflowed.clone(),
        };
        (handle, OutboundQueue { events, overflowed })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn send(&self, body: Vec<u8>) {
        self.queue(Outbound::Packet(body));
    }

    pub fn rekey(&self, key: Vec<u8>) {
        self.queue(Outbound::Rekey(key));
    }

    pub fn close(&self) {
        self.queue(Outbound::Close);
    }

    /// Sends a last packet, then closes once it has been written.
    pub fn close_with(&self, body: Vec<u8>) {
        self.send(body);
        self.close();
    }

    fn queue(&self, event: Outbound) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(_)) => {
                if !self.overflowed.swap(true, Ordering::AcqRel) {
                    warn!("Outbound queue of {} is full, dropping the connection", self.address);
                }
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                debug!("Dropped outbound event for closed connection {}", self.address)
            }
        }
    }
}

/// Drains `receiver` onto `stream` until a close is requested or every handle is gone, then
/// shuts the socket down so the reader side wakes up as well.
pub async fn write_outbound<C: FrameCipher>(mut stream: TcpStream, mut cipher: C, queue: OutboundQueue) {
    let addr = stream.peer_addr().ok();
    if let Err(e) = drain(&mut stream, &mut cipher, &queue).await {
        warn!("Error writing to {addr:?}: {e}");
    }
    stream.shutdown(Shutdown::Both).unwrap_or_else(|e| debug!("Shutdown of {addr:?} failed: {e}"));
}

async fn drain<C: FrameCipher>(stream: &mut TcpStream, cipher: &mut C, queue: &OutboundQueue) -> Result<(), FrameError> {
    while let Ok(event) = queue.events.recv_async().await {
        if queue.overflowed() {
            break;
        }
        match event {
            Outbound::Packet(body) => {
                let payload = cipher.seal(&body)?;
                write_frame(stream, &payload).await?;
            }
            Outbound::Rekey(key) => cipher.rekey(&key)?,
            Outbound::Close => break,
        }
    }
    Ok(())
}
