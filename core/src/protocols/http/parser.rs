//! Per-half-flow HTTP stream parser.
//!
//! One parser runs per `(flow, direction)`, consuming the reassembled byte
//! stream and speculatively classifying each message: a stream whose next
//! five bytes are `HTTP/` is carrying responses, anything else is a request
//! line (method tokens can never start with `HTTP/` because of the space
//! that follows the method). Requests are parked in the shared request
//! table; responses take the request parked under the reverse flow and emit
//! a transaction.
//!
//! All failures here are stream-local: the parser sends one error record
//! and exits, leaving every other flow of the session running.

use crate::conntrack::flow_id::FlowKey;
use crate::conntrack::request_table::{PendingRequest, RequestTable};
use crate::conntrack::stream::StreamReader;
use crate::errors::{CaptureError, ErrorKind};
use crate::protocols::http::body::{read_body, request_framing, response_framing};
use crate::protocols::http::{Header, HttpRequest, HttpResponse, ParseError};
use crate::subscription::{CaptureEvent, Transaction};

use crossbeam_channel::Sender;
use log::{debug, trace};

use std::sync::Arc;

/// Responses are recognized by this exact prefix.
pub const RESPONSE_PREFIX: &[u8] = b"HTTP/";

const MAX_HEADERS: usize = 64;
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Parser loop for one half-flow. Runs until the stream ends or the first
/// unparseable message.
pub fn run_stream_parser(
    key: FlowKey,
    mut reader: StreamReader,
    requests: Arc<RequestTable>,
    sink: Sender<CaptureEvent>,
    emit_lone_responses: bool,
) {
    loop {
        let prefix = match reader.peek(RESPONSE_PREFIX.len()) {
            Some(prefix) => prefix.to_vec(),
            // End of stream between messages (or inside a head shorter than
            // the prefix) is a normal termination.
            None => return,
        };
        let seen = reader.last_seen();

        if prefix == RESPONSE_PREFIX {
            let pending = requests.take(&key.reverse());
            let method = pending.as_ref().map(|p| p.req.method.clone());
            let response = match parse_response(&mut reader, method.as_deref()) {
                Ok(response) => response,
                Err(err) => {
                    let kind = ErrorKind::ResponseParse {
                        src: key.src,
                        dst: key.dst,
                        reason: err.to_string(),
                    };
                    let _ = sink.send(CaptureEvent::Error(CaptureError::new(seen, kind)));
                    return;
                }
            };
            trace!("{}: response {}", key, response.status_line());
            let (request_time, request) = match pending {
                Some(p) => (Some(p.time), Some(p.req)),
                None => (None, None),
            };
            if request.is_none() && !emit_lone_responses {
                debug!("{}: dropping lone response", key);
                continue;
            }
            let txn = Transaction {
                request_time,
                response_time: seen,
                client: key.dst,
                server: key.src,
                request,
                response,
            };
            if sink.send(CaptureEvent::Transaction(txn)).is_err() {
                return;
            }
        } else {
            let request = match parse_request(&mut reader) {
                Ok(request) => request,
                Err(err) => {
                    let kind = ErrorKind::RequestParse {
                        src: key.src,
                        dst: key.dst,
                        reason: err.to_string(),
                    };
                    let _ = sink.send(CaptureEvent::Error(CaptureError::new(seen, kind)));
                    return;
                }
            };
            trace!("{}: request {}", key, request.request_line());
            requests.put(key.clone(), PendingRequest {
                req: request,
                time: seen,
            });
        }
    }
}

/// Parses one full request (head and body) off the stream.
pub fn parse_request(reader: &mut StreamReader) -> Result<HttpRequest, ParseError> {
    let mut request = parse_request_head(reader)?;
    let framing = request_framing(&request.headers)?;
    request.body = read_body(reader, framing, &mut request.headers)?;
    Ok(request)
}

/// Parses one full response off the stream. `request_method` is the method
/// of the request this response answers, when one was observed; it decides
/// body presence for HEAD.
pub fn parse_response(
    reader: &mut StreamReader,
    request_method: Option<&str>,
) -> Result<HttpResponse, ParseError> {
    let mut response = parse_response_head(reader)?;
    let framing = response_framing(response.status, request_method, &response.headers)?;
    response.body = read_body(reader, framing, &mut response.headers)?;
    Ok(response)
}

fn own_headers(parsed: &[httparse::Header<'_>]) -> Vec<Header> {
    parsed
        .iter()
        .map(|h| Header::new(h.name, h.value.to_vec()))
        .collect()
}

fn parse_request_head(reader: &mut StreamReader) -> Result<HttpRequest, ParseError> {
    loop {
        let complete = {
            let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut head = httparse::Request::new(&mut slots);
            match head.parse(reader.buffered())? {
                httparse::Status::Complete(n) => Some((
                    n,
                    HttpRequest {
                        method: head.method.unwrap_or_default().to_string(),
                        target: head.path.unwrap_or_default().to_string(),
                        version: head.version.unwrap_or(1),
                        headers: own_headers(head.headers),
                        body: Vec::new(),
                    },
                )),
                httparse::Status::Partial => None,
            }
        };
        match complete {
            Some((n, request)) => {
                reader.consume(n);
                return Ok(request);
            }
            None => fill_head(reader)?,
        }
    }
}

fn parse_response_head(reader: &mut StreamReader) -> Result<HttpResponse, ParseError> {
    loop {
        let complete = {
            let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut head = httparse::Response::new(&mut slots);
            match head.parse(reader.buffered())? {
                httparse::Status::Complete(n) => Some((
                    n,
                    HttpResponse {
                        version: head.version.unwrap_or(1),
                        status: head.code.unwrap_or_default(),
                        reason: head.reason.unwrap_or_default().to_string(),
                        headers: own_headers(head.headers),
                        body: Vec::new(),
                    },
                )),
                httparse::Status::Partial => None,
            }
        };
        match complete {
            Some((n, response)) => {
                reader.consume(n);
                return Ok(response);
            }
            None => fill_head(reader)?,
        }
    }
}

fn fill_head(reader: &mut StreamReader) -> Result<(), ParseError> {
    if reader.buffered().len() > MAX_HEAD_BYTES {
        return Err(ParseError::HeadTooLarge);
    }
    if !reader.fill_more() {
        return Err(ParseError::UnexpectedEof);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::reassembly::Reassembled;
    use crossbeam_channel::unbounded;
    use std::time::UNIX_EPOCH;

    fn reader(parts: &[&[u8]]) -> StreamReader {
        let (tx, rx) = unbounded();
        for part in parts {
            tx.send(Reassembled {
                bytes: part.to_vec(),
                seen: UNIX_EPOCH,
            })
            .unwrap();
        }
        StreamReader::new(rx)
    }

    #[test]
    fn request_with_length_body() {
        let mut r = reader(&[b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello"]);
        let req = parse_request(&mut r).unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.target, "/x");
        assert_eq!(req.version, 1);
        assert_eq!(req.body, b"hello");
    }

    #[test]
    fn request_without_body() {
        let mut r = reader(&[b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"]);
        let req = parse_request(&mut r).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.header("host"), Some(b"x".as_slice()));
        assert!(req.body.is_empty());
    }

    #[test]
    fn head_split_across_runs() {
        let mut r = reader(&[b"GET / HT", b"TP/1.1\r\nHo", b"st: x\r\n\r\n"]);
        let req = parse_request(&mut r).unwrap();
        assert_eq!(req.method, "GET");
    }

    #[test]
    fn response_with_body() {
        let mut r = reader(&[b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello"]);
        let resp = parse_response(&mut r, Some("GET")).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.reason, "OK");
        assert_eq!(resp.body, b"hello");
        assert!(resp.status_line().starts_with("HTTP/"));
    }

    #[test]
    fn head_response_has_no_body() {
        let mut r = reader(&[b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n"]);
        let resp = parse_response(&mut r, Some("HEAD")).unwrap();
        assert!(resp.body.is_empty());
    }

    #[test]
    fn chunked_response() {
        let mut r = reader(&[
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nfoo\r\n0\r\n\r\n",
        ]);
        let resp = parse_response(&mut r, None).unwrap();
        assert_eq!(resp.body, b"foo");
    }

    #[test]
    fn close_delimited_response() {
        let mut r = reader(&[b"HTTP/1.0 200 OK\r\n\r\nall the rest"]);
        let resp = parse_response(&mut r, None).unwrap();
        assert_eq!(resp.version, 0);
        assert_eq!(resp.body, b"all the rest");
    }

    #[test]
    fn garbage_head_rejected() {
        let mut r = reader(&[b"\x00\x01\x02 nonsense\r\n\r\n"]);
        assert!(parse_request(&mut r).is_err());
    }

    #[test]
    fn truncated_body_rejected() {
        let mut r = reader(&[b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nabc"]);
        match parse_response(&mut r, None) {
            Err(ParseError::TruncatedBody { expected: 5, got: 3 }) => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
