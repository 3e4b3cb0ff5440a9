//! TCP stream reassembly for one half-flow.
//!
//! [`StreamBuffer`] orders segments by sequence number and yields the
//! contiguous byte runs as they become available. Sequence arithmetic is
//! wrap-safe; offsets are kept relative to the first byte the buffer ever
//! expected. Out-of-order data is buffered up to a configurable cap, beyond
//! which the tail is dropped.

use std::collections::BTreeMap;
use std::time::SystemTime;

/// `true` if sequence number `lhs` precedes `rhs` modulo 2^32.
#[inline]
pub fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    (lhs.wrapping_sub(rhs) as i32) < 0
}

/// A contiguous byte run with the capture timestamp of the earliest segment
/// that produced it.
#[derive(Clone, Debug)]
pub struct Reassembled {
    pub bytes: Vec<u8>,
    pub seen: SystemTime,
}

/// Outcome of inserting one segment.
#[derive(Debug, Default)]
pub struct Insert {
    /// Byte runs now contiguous with everything delivered so far, in order.
    pub ready: Vec<Reassembled>,
    /// Bytes discarded because the out-of-order cap was exceeded.
    pub dropped: usize,
}

struct OooSegment {
    bytes: Vec<u8>,
    seen: SystemTime,
}

/// Sequence-ordering buffer for one direction of one connection.
pub struct StreamBuffer {
    /// Absolute sequence number of relative offset zero.
    base: u32,
    /// Next relative offset expected in order.
    next_rel: u32,
    pending: BTreeMap<u32, OooSegment>,
    pending_bytes: usize,
    max_pending_bytes: usize,
}

impl StreamBuffer {
    /// Creates a buffer for a half-flow first seen with sequence number
    /// `seq`. A SYN consumes one sequence number, so payload starts one past
    /// it.
    pub fn new(seq: u32, syn: bool, max_pending_bytes: usize) -> Self {
        StreamBuffer {
            base: seq.wrapping_add(u32::from(syn)),
            next_rel: 0,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            max_pending_bytes,
        }
    }

    /// Number of out-of-order bytes currently held back.
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Inserts one segment, returning the byte runs that became contiguous.
    ///
    /// Duplicate and already-delivered bytes are trimmed silently; segments
    /// entirely in the past (keepalive probes, retransmits) are no-ops.
    pub fn insert(&mut self, seq: u32, syn: bool, payload: &[u8], ts: SystemTime) -> Insert {
        let mut out = Insert::default();
        if payload.is_empty() {
            return out;
        }

        let mut rel = seq.wrapping_add(u32::from(syn)).wrapping_sub(self.base);
        let mut payload = payload;
        if wrapping_lt(rel, self.next_rel) {
            let skip = self.next_rel.wrapping_sub(rel) as usize;
            if skip >= payload.len() {
                return out;
            }
            payload = &payload[skip..];
            rel = self.next_rel;
        }

        if rel == self.next_rel {
            out.ready.push(Reassembled {
                bytes: payload.to_vec(),
                seen: ts,
            });
            self.next_rel = self.next_rel.wrapping_add(payload.len() as u32);
            self.drain_pending(&mut out.ready);
        } else {
            // Gap ahead of us: hold the segment back, within the cap.
            use std::collections::btree_map::Entry;
            match self.pending.entry(rel) {
                Entry::Occupied(_) => {} // retransmit of a buffered segment
                Entry::Vacant(slot) => {
                    if self.pending_bytes + payload.len() > self.max_pending_bytes {
                        out.dropped = payload.len();
                        return out;
                    }
                    self.pending_bytes += payload.len();
                    slot.insert(OooSegment {
                        bytes: payload.to_vec(),
                        seen: ts,
                    });
                }
            }
        }
        out
    }

    fn drain_pending(&mut self, ready: &mut Vec<Reassembled>) {
        while let Some((&rel, _)) = self.pending.iter().next() {
            if wrapping_lt(self.next_rel, rel) {
                break;
            }
            let seg = match self.pending.remove(&rel) {
                Some(seg) => seg,
                None => break,
            };
            self.pending_bytes -= seg.bytes.len();
            let skip = self.next_rel.wrapping_sub(rel) as usize;
            if skip >= seg.bytes.len() {
                continue;
            }
            let bytes = seg.bytes[skip..].to_vec();
            self.next_rel = self.next_rel.wrapping_add(bytes.len() as u32);
            ready.push(Reassembled {
                bytes,
                seen: seg.seen,
            });
        }
    }
}
