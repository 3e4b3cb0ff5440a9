//! Records delivered to the capture consumer.
//!
//! A capture session produces a stream of [`CaptureEvent`]s on one
//! multi-producer channel: completed [`Transaction`]s and non-fatal
//! [`CaptureError`](crate::errors::CaptureError)s. Emission order is
//! preserved per half-flow only; consumers that need a global order sort by
//! timestamp.

use crate::errors::CaptureError;
use crate::protocols::http::{HttpRequest, HttpResponse};

use serde::ser::{SerializeStruct, Serializer};
use serde::Serialize;

use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// One observed HTTP exchange.
///
/// `request` is `None` for a response whose request was never observed (the
/// capture started mid-connection, or a pipelined request was displaced).
#[derive(Debug)]
pub struct Transaction {
    /// When the request was last seen on the wire; `None` without a request.
    pub request_time: Option<SystemTime>,
    /// When the response was last seen on the wire.
    pub response_time: SystemTime,
    /// The endpoint that sent the request.
    pub client: SocketAddr,
    /// The endpoint that sent the response.
    pub server: SocketAddr,
    pub request: Option<HttpRequest>,
    pub response: HttpResponse,
}

/// What a capture session sends on its result channel.
#[derive(Debug)]
pub enum CaptureEvent {
    Transaction(Transaction),
    Error(CaptureError),
}

/// Microseconds since the unix epoch, for structured output.
pub(crate) fn unix_micros(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn fmt_unix(time: SystemTime) -> String {
    let micros = unix_micros(time);
    format!("{}.{:06}", micros / 1_000_000, micros % 1_000_000)
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.request_time {
            Some(t) => write!(f, "reqTime={}", fmt_unix(t))?,
            None => write!(f, "reqTime=-")?,
        }
        write!(
            f,
            " respTime={} client={} server={}",
            fmt_unix(self.response_time),
            self.client,
            self.server
        )?;
        match &self.request {
            Some(req) => write!(
                f,
                " request={:?} requestBody={:?}",
                req.request_line(),
                String::from_utf8_lossy(&req.body)
            )?,
            None => write!(f, " request=-")?,
        }
        write!(
            f,
            " response={:?} responseBody={:?}",
            self.response.status_line(),
            String::from_utf8_lossy(&self.response.body)
        )
    }
}

impl Serialize for Transaction {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("Transaction", 6)?;
        state.serialize_field("request_time", &self.request_time.map(unix_micros))?;
        state.serialize_field("response_time", &unix_micros(self.response_time))?;
        state.serialize_field("client", &self.client.to_string())?;
        state.serialize_field("server", &self.server.to_string())?;
        state.serialize_field("request", &self.request)?;
        state.serialize_field("response", &self.response)?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::http::Header;
    use std::time::Duration;

    fn transaction() -> Transaction {
        Transaction {
            request_time: Some(UNIX_EPOCH + Duration::from_millis(1000)),
            response_time: UNIX_EPOCH + Duration::from_millis(1100),
            client: "10.0.0.1:54321".parse().unwrap(),
            server: "10.0.0.2:80".parse().unwrap(),
            request: Some(HttpRequest {
                method: "GET".into(),
                target: "/".into(),
                version: 1,
                headers: vec![Header::new("Host", b"x".to_vec())],
                body: Vec::new(),
            }),
            response: HttpResponse {
                version: 1,
                status: 200,
                reason: "OK".into(),
                headers: Vec::new(),
                body: b"hello".to_vec(),
            },
        }
    }

    #[test]
    fn display_single_line() {
        let line = transaction().to_string();
        assert!(!line.contains('\n'));
        assert!(line.contains("client=10.0.0.1:54321"));
        assert!(line.contains("server=10.0.0.2:80"));
        assert!(line.contains("GET / HTTP/1.1"));
        assert!(line.contains("hello"));
    }

    #[test]
    fn lone_response_display() {
        let mut txn = transaction();
        txn.request = None;
        txn.request_time = None;
        let line = txn.to_string();
        assert!(line.contains("reqTime=-"));
        assert!(line.contains("request=-"));
    }

    #[test]
    fn serializes_to_json() {
        let value = serde_json::to_value(transaction()).unwrap();
        assert_eq!(value["client"], "10.0.0.1:54321");
        assert_eq!(value["request"]["method"], "GET");
        assert_eq!(value["response"]["status"], 200);
        assert_eq!(value["response"]["body"], "hello");
        assert_eq!(value["request_time"], 1_000_000u64);
    }
}
