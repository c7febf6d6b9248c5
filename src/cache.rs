//! Last-known group values.
//!
//! The data-channel listener records every value it sees written or
//! reported on the bus; reads and toggles consult it before going to the
//! bus. Last write wins and entries never expire.

use dashmap::DashMap;

use crate::addressing::GroupAddress;
use crate::protocol::cemi::Payload;

/// Concurrent map from group address to the last payload seen for it.
///
/// ```
/// use knx_tunnel::{ga, ValueCache};
/// use knx_tunnel::protocol::Payload;
///
/// let cache = ValueCache::new();
/// assert!(cache.get(ga!(1/2/3)).is_none());
///
/// cache.set(ga!(1/2/3), Payload::from_slice(&[1]).unwrap());
/// assert_eq!(cache.get(ga!(1/2/3)).unwrap().as_slice(), &[1]);
/// ```
#[derive(Debug, Default)]
pub struct ValueCache {
    values: DashMap<GroupAddress, Payload>,
}

impl ValueCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value seen for `addr`.
    pub fn get(&self, addr: GroupAddress) -> Option<Payload> {
        self.values.get(&addr).map(|entry| entry.value().clone())
    }

    /// Record `data` as the current value of `addr`.
    ///
    /// Only the data-channel listener calls this during a session; it is
    /// public so applications can seed a cache before connecting.
    pub fn set(&self, addr: GroupAddress, data: Payload) {
        self.values.insert(addr, data);
    }

    /// Number of addresses with a known value
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no value has been recorded yet
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
