//! Pairing queues for agent-side and public-side pipes
//!
//! Each side of the relay parks authorized-but-unpaired pipes in a FIFO per
//! tunnel key. An arriving pipe checks the opposite side's queue under one
//! lock: if a counterpart is waiting, the arriving pipe's stream and buffered
//! bytes are handed through the waiter's channel and the waiter runs the
//! pump; otherwise the arrival parks itself. A pipe is handed over at most
//! once, and a parked pipe that closes removes itself by id.

use backhaul_net::{ByteStream, PendingBuffer};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// Queue partition derived from the verified peer certificate. `None` is the
/// null key used when client-certificate identity is not in play.
pub type TunnelKey = Option<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Agent,
    Public,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Agent => Side::Public,
            Side::Public => Side::Agent,
        }
    }

    fn index(self) -> usize {
        match self {
            Side::Agent => 0,
            Side::Public => 1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Agent => f.write_str("agent"),
            Side::Public => f.write_str("public"),
        }
    }
}

/// One authorized connection ready to pair: its stream, whatever bytes it
/// buffered before pairing, and the idle policy of the listener it arrived on.
#[derive(Debug)]
pub struct Pipe {
    pub id: u64,
    pub stream: ByteStream,
    pub pending: PendingBuffer,
    pub idle_timeout: Option<Duration>,
}

/// Outcome of offering a pipe to the matcher.
pub enum Offer {
    /// A counterpart was waiting; the pipe was handed to it and the waiter
    /// now owns both halves.
    Handed,
    /// No counterpart; the caller keeps its pipe and receives the future
    /// counterpart through the channel.
    Parked {
        pipe: Pipe,
        rx: oneshot::Receiver<Pipe>,
    },
}

struct Waiting {
    id: u64,
    tx: oneshot::Sender<Pipe>,
}

type SideQueues = HashMap<TunnelKey, VecDeque<Waiting>>;

pub struct Matcher {
    queues: Mutex<[SideQueues; 2]>,
    next_id: AtomicU64,
    active: AtomicUsize,
}

impl Matcher {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new([HashMap::new(), HashMap::new()]),
            next_id: AtomicU64::new(1),
            active: AtomicUsize::new(0),
        }
    }

    /// Allocate the next pipe id. Ids are process-unique and monotonic.
    pub fn next_pipe_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Offer an authorized pipe arriving on `side` under `key`.
    ///
    /// The lookup-dequeue-enqueue sequence runs under one lock, so pairing is
    /// stable under concurrent arrivals. Waiters whose task already went away
    /// are skipped and discarded; FIFO order holds among live waiters.
    pub fn offer(&self, side: Side, key: &TunnelKey, pipe: Pipe) -> Offer {
        let mut queues = self.queues.lock().unwrap();

        let opposite = &mut queues[side.opposite().index()];
        if let Some(waiters) = opposite.get_mut(key) {
            let mut pipe = pipe;
            while let Some(waiting) = waiters.pop_front() {
                match waiting.tx.send(pipe) {
                    Ok(()) => {
                        if waiters.is_empty() {
                            opposite.remove(key);
                        }
                        return Offer::Handed;
                    }
                    // Waiter died while parked; try the next oldest.
                    Err(returned) => pipe = returned,
                }
            }
            opposite.remove(key);
            return self.park(&mut queues, side, key, pipe);
        }

        self.park(&mut queues, side, key, pipe)
    }

    fn park(&self, queues: &mut [SideQueues; 2], side: Side, key: &TunnelKey, pipe: Pipe) -> Offer {
        let (tx, rx) = oneshot::channel();
        queues[side.index()]
            .entry(key.clone())
            .or_default()
            .push_back(Waiting { id: pipe.id, tx });
        Offer::Parked { pipe, rx }
    }

    /// Remove a parked pipe by id, e.g. because its connection closed while
    /// waiting. Returns false if the pipe was already dequeued for pairing.
    pub fn abandon(&self, side: Side, key: &TunnelKey, id: u64) -> bool {
        let mut queues = self.queues.lock().unwrap();
        let side_queues = &mut queues[side.index()];
        let Some(waiters) = side_queues.get_mut(key) else {
            return false;
        };
        let before = waiters.len();
        waiters.retain(|w| w.id != id);
        let removed = waiters.len() < before;
        if waiters.is_empty() {
            side_queues.remove(key);
        }
        removed
    }

    /// Number of pipes parked on `side` under `key`.
    pub fn pending_len(&self, side: Side, key: &TunnelKey) -> usize {
        let queues = self.queues.lock().unwrap();
        queues[side.index()].get(key).map_or(0, VecDeque::len)
    }

    /// Drop every parked pipe. Their waiting tasks observe the closed channel
    /// and destroy themselves. Used on operator shutdown.
    pub fn clear(&self) {
        let mut queues = self.queues.lock().unwrap();
        queues[0].clear();
        queues[1].clear();
    }

    pub(crate) fn tunnel_started(&self) -> usize {
        self.active.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn tunnel_closed(&self) -> usize {
        self.active.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Number of currently pumping tunnels.
    pub fn active_tunnels(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}
