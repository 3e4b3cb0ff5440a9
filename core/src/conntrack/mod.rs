//! Connection tracking.
//!
//! The [`FlowTable`] owns all per-flow reassembly state for one capture
//! handle. Every accepted TCP segment is routed here; the first segment of
//! an unseen `(src, dst)` direction creates a half-flow, a bounded byte
//! pipe, and a stream-parser thread reading from it. Whenever the
//! contiguous prefix of a half-flow advances, the new bytes go down the
//! pipe with their capture timestamp.
//!
//! The table is kept in recency order, so idle teardown only ever has to
//! look at the front.

pub mod flow_id;
pub mod pdu;
pub mod reassembly;
pub mod request_table;
pub mod stream;

use crate::config::CaptureConfig;
use crate::conntrack::flow_id::FlowKey;
use crate::conntrack::pdu::TcpSegment;
use crate::conntrack::reassembly::{Reassembled, StreamBuffer};
use crate::conntrack::request_table::RequestTable;
use crate::conntrack::stream::{StreamReader, PIPE_DEPTH};
use crate::errors::{CaptureError, ErrorKind};
use crate::protocols::http::parser::run_stream_parser;
use crate::subscription::CaptureEvent;

use crossbeam_channel::{bounded, Sender};
use hashlink::LinkedHashMap;
use log::{debug, warn};

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct HalfFlow {
    buffer: StreamBuffer,
    /// `None` once the parser hung up; bytes are then discarded until the
    /// flow closes or ages out.
    pipe: Option<Sender<Reassembled>>,
    last_activity: Instant,
}

#[derive(Debug, Default)]
struct SegmentOutcome {
    closed: bool,
    overflow_dropped: usize,
}

impl HalfFlow {
    fn handle(&mut self, seg: &TcpSegment<'_>) -> SegmentOutcome {
        let mut out = SegmentOutcome::default();
        let insert = self
            .buffer
            .insert(seg.seq, seg.syn, seg.payload, seg.ts);
        out.overflow_dropped = insert.dropped;
        if let Some(pipe) = self.pipe.take() {
            let mut alive = true;
            for run in insert.ready {
                if pipe.send(run).is_err() {
                    alive = false;
                    break;
                }
            }
            if alive {
                self.pipe = Some(pipe);
            }
        }
        if seg.fin || seg.rst {
            // Ready runs were already delivered; anything still stuck
            // behind a gap is abandoned with the connection.
            self.pipe = None;
            out.closed = true;
        }
        self.last_activity = Instant::now();
        out
    }
}

/// Per-capture-handle reassembly state and parser-thread factory.
pub struct FlowTable {
    flows: LinkedHashMap<FlowKey, HalfFlow>,
    requests: Arc<RequestTable>,
    sink: Sender<CaptureEvent>,
    idle_timeout: Duration,
    max_buffered_bytes: usize,
    emit_lone_responses: bool,
}

impl FlowTable {
    pub fn new(
        requests: Arc<RequestTable>,
        sink: Sender<CaptureEvent>,
        config: &CaptureConfig,
    ) -> Self {
        FlowTable {
            flows: LinkedHashMap::new(),
            requests,
            sink,
            idle_timeout: config.idle_timeout,
            max_buffered_bytes: config.max_buffered_bytes,
            emit_lone_responses: config.emit_lone_responses,
        }
    }

    /// Number of tracked half-flows.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Routes one segment into its half-flow, creating the half-flow and
    /// its parser on first sight.
    pub fn process(&mut self, key: FlowKey, seg: &TcpSegment<'_>) {
        // Re-inserting on every segment keeps the table in recency order.
        let mut flow = match self.flows.remove(&key) {
            Some(flow) => flow,
            None => match self.open_half_flow(&key, seg) {
                Some(flow) => flow,
                None => return,
            },
        };
        let outcome = flow.handle(seg);
        if outcome.overflow_dropped > 0 {
            warn!(
                "reassembly overflow on {}: dropped {} bytes",
                key, outcome.overflow_dropped
            );
            let record = CaptureError::new(
                seg.ts,
                ErrorKind::ReassemblyOverflow {
                    flow: key.clone(),
                    dropped: outcome.overflow_dropped,
                },
            );
            if self.sink.send(CaptureEvent::Error(record)).is_err() {
                return;
            }
        }
        if outcome.closed {
            debug!("half-flow closed: {}", key);
        } else {
            self.flows.insert(key, flow);
        }
    }

    /// Tears down half-flows that have been quiet for the idle timeout.
    /// Cheap when nothing is stale: only the least-recent entry is examined.
    pub fn sweep_idle(&mut self) {
        let now = Instant::now();
        while let Some((_, flow)) = self.flows.front() {
            if now.duration_since(flow.last_activity) < self.idle_timeout {
                break;
            }
            if let Some((key, _)) = self.flows.pop_front() {
                debug!("half-flow idle teardown: {}", key);
            }
        }
    }

    fn open_half_flow(&self, key: &FlowKey, seg: &TcpSegment<'_>) -> Option<HalfFlow> {
        let (tx, rx) = bounded(PIPE_DEPTH);
        let parser_key = key.clone();
        let requests = Arc::clone(&self.requests);
        let sink = self.sink.clone();
        let emit_lone = self.emit_lone_responses;
        let spawned = thread::Builder::new()
            .name(format!("httap-flow {}", key))
            .spawn(move || {
                run_stream_parser(
                    parser_key,
                    StreamReader::new(rx),
                    requests,
                    sink,
                    emit_lone,
                )
            });
        if let Err(err) = spawned {
            warn!("spawn stream parser for {}: {}", key, err);
            return None;
        }
        debug!("half-flow opened: {}", key);
        Some(HalfFlow {
            buffer: StreamBuffer::new(seg.seq, seg.syn, self.max_buffered_bytes),
            pipe: Some(tx),
            last_activity: Instant::now(),
        })
    }
}
