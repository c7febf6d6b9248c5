//! Group reads awaiting a response.
//!
//! Each `group_read` that misses the cache registers a one-shot waiter
//! under its destination address before the request goes out. A
//! `GroupValue_Response` for that address resolves every waiter
//! registered on it; responses for other addresses leave it alone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

use dashmap::DashMap;

use crate::addressing::GroupAddress;
use crate::error::{KnxError, Result};
use crate::protocol::cemi::Payload;

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: SyncSender<Payload>,
}

/// Outstanding reads keyed by group address
#[derive(Debug, Default)]
pub(crate) struct PendingReads {
    next_id: AtomicU64,
    waiters: DashMap<GroupAddress, Vec<Waiter>>,
}

/// Receiving half of one registered read
#[derive(Debug)]
pub(crate) struct PendingRead {
    id: u64,
    addr: GroupAddress,
    rx: Receiver<Payload>,
}

impl PendingReads {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the next response on `addr`.
    pub(crate) fn register(&self, addr: GroupAddress) -> PendingRead {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::sync_channel(1);
        self.waiters.entry(addr).or_default().push(Waiter { id, tx });
        knx_log!(trace, "Registered pending read {} for {}", id, addr);
        PendingRead { id, addr, rx }
    }

    /// Deliver `data` to every waiter on `addr`.
    ///
    /// Returns how many waiters received it.
    pub(crate) fn resolve(&self, addr: GroupAddress, data: &Payload) -> usize {
        let Some((_, waiters)) = self.waiters.remove(&addr) else {
            return 0;
        };

        waiters
            .into_iter()
            .filter(|waiter| waiter.tx.try_send(data.clone()).is_ok())
            .count()
    }

    /// Withdraw a read that gave up waiting.
    pub(crate) fn cancel(&self, read: &PendingRead) {
        let now_empty = match self.waiters.get_mut(&read.addr) {
            Some(mut entry) => {
                entry.retain(|waiter| waiter.id != read.id);
                entry.is_empty()
            }
            None => false,
        };

        // The guard above is released before touching the map again
        if now_empty {
            self.waiters.remove_if(&read.addr, |_, waiters| waiters.is_empty());
        }
    }

    /// Drop every waiter; their reads fail as closed.
    pub(crate) fn clear(&self) {
        self.waiters.clear();
    }

    /// Number of registered waiters across all addresses
    pub(crate) fn count(&self) -> usize {
        self.waiters.iter().map(|entry| entry.value().len()).sum()
    }
}

impl PendingRead {
    /// Block until the response arrives.
    ///
    /// `None` waits indefinitely. A cleared registry fails the wait with a
    /// closed-connection error.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Result<Payload> {
        match timeout {
            Some(timeout) => self.rx.recv_timeout(timeout).map_err(|err| match err {
                RecvTimeoutError::Timeout => KnxError::Timeout,
                RecvTimeoutError::Disconnected => KnxError::connection_closed(),
            }),
            None => self.rx.recv().map_err(|_| KnxError::connection_closed()),
        }
    }
}
