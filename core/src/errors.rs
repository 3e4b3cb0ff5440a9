//! Error taxonomy.
//!
//! Failures split into two classes. Setup failures ([`SetupError`]) abort
//! before capture starts and are returned to the caller. Everything observed
//! after that is per-packet or per-stream: those faults are wrapped in a
//! [`CaptureError`] record, sent down the result channel, and terminate at
//! most the affected stream parser while the capture keeps running.

use crate::conntrack::flow_id::FlowKey;

use serde::ser::{SerializeStruct, Serializer};
use serde::Serialize;

use std::fmt;
use std::net::SocketAddr;
use std::time::SystemTime;

use thiserror::Error;

/// Fatal error raised while bringing a capture session up.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The backend refused to open the device.
    #[error("open capture device {device:?}: {source}")]
    DeviceOpen {
        device: String,
        #[source]
        source: anyhow::Error,
    },
    /// The BPF filter expression did not compile or could not be installed.
    #[error("set filter {expr:?}: {source}")]
    FilterCompile {
        expr: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Classification of a non-fatal capture fault.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// Reading from a live stream failed for a reason other than
    /// end-of-stream. Also covers the capture driver dying mid-session.
    #[error("read stream: {0}")]
    PeekFailure(String),
    /// A network or transport endpoint had an unexpected wire encoding.
    #[error("bad address: {0}")]
    BadAddress(String),
    /// The HTTP parser rejected a request head or its body framing.
    #[error("read request: src={src}, dst={dst}: {reason}")]
    RequestParse {
        src: SocketAddr,
        dst: SocketAddr,
        reason: String,
    },
    /// The HTTP parser rejected a response head or its body framing.
    #[error("read response: src={src}, dst={dst}: {reason}")]
    ResponseParse {
        src: SocketAddr,
        dst: SocketAddr,
        reason: String,
    },
    /// A half-flow exceeded its out-of-order buffering cap; the contiguous
    /// prefix was delivered and the tail dropped.
    #[error("reassembly overflow: flow={flow}, dropped={dropped} bytes")]
    ReassemblyOverflow { flow: FlowKey, dropped: usize },
}

impl ErrorKind {
    /// Short tag used in structured output.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::PeekFailure(_) => "peek_failure",
            ErrorKind::BadAddress(_) => "bad_address",
            ErrorKind::RequestParse { .. } => "request_parse",
            ErrorKind::ResponseParse { .. } => "response_parse",
            ErrorKind::ReassemblyOverflow { .. } => "reassembly_overflow",
        }
    }
}

/// A non-fatal fault record delivered on the result channel.
#[derive(Debug)]
pub struct CaptureError {
    /// When the fault was observed.
    pub time: SystemTime,
    pub kind: ErrorKind,
}

impl CaptureError {
    pub fn new(time: SystemTime, kind: ErrorKind) -> Self {
        CaptureError { time, kind }
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl Serialize for CaptureError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("CaptureError", 3)?;
        state.serialize_field("time", &crate::subscription::unix_micros(self.time))?;
        state.serialize_field("kind", self.kind.label())?;
        state.serialize_field("detail", &self.kind.to_string())?;
        state.end()
    }
}
