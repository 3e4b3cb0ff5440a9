//! Request/response correlation table.
//!
//! One table per capture session, shared by every stream parser. A request
//! parsed on flow `(a, b)` is stored under that key; the parser reading the
//! reverse flow `(b, a)` takes it out when the matching response appears.
//! At most one request is pending per key: a later request on the same flow
//! displaces the earlier one, which loses its pairing.

use crate::conntrack::flow_id::FlowKey;
use crate::protocols::http::HttpRequest;

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

/// A fully-parsed request waiting for its response.
#[derive(Debug)]
pub struct PendingRequest {
    pub req: HttpRequest,
    pub time: SystemTime,
}

#[derive(Debug, Default)]
pub struct RequestTable {
    inner: Mutex<HashMap<FlowKey, PendingRequest>>,
}

impl RequestTable {
    pub fn new() -> Self {
        RequestTable::default()
    }

    /// Inserts or displaces the pending request for `key`.
    pub fn put(&self, key: FlowKey, pending: PendingRequest) {
        self.lock().insert(key, pending);
    }

    /// Removes and returns the pending request for `key`, if any. A miss is
    /// not an error: responses without an observed request are expected.
    pub fn take(&self, key: &FlowKey) -> Option<PendingRequest> {
        self.lock().remove(key)
    }

    /// Number of requests still awaiting a response.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<FlowKey, PendingRequest>> {
        // A parser thread that panicked mid-insert cannot leave the map in a
        // torn state; keep serving the survivors.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
