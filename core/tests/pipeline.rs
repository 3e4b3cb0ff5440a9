//! End-to-end pipeline tests: synthetic TCP segments in, transaction
//! records out. These drive the flow table exactly the way an ingest loop
//! does, with real parser threads and a real shared request table.

use httap_core::config::CaptureConfig;
use httap_core::conntrack::flow_id::FlowKey;
use httap_core::conntrack::pdu::TcpSegment;
use httap_core::conntrack::request_table::RequestTable;
use httap_core::conntrack::FlowTable;
use httap_core::errors::ErrorKind;
use httap_core::subscription::{CaptureEvent, Transaction};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

fn ts(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

fn key(src: &str, dst: &str) -> FlowKey {
    FlowKey::new(src.parse().unwrap(), dst.parse().unwrap())
}

fn session(config: &CaptureConfig) -> (FlowTable, Arc<RequestTable>, Receiver<CaptureEvent>) {
    let requests = Arc::new(RequestTable::new());
    let (tx, rx) = unbounded();
    let table = FlowTable::new(Arc::clone(&requests), tx, config);
    (table, requests, rx)
}

fn push(table: &mut FlowTable, key: &FlowKey, seq: u32, payload: &[u8], ms: u64) {
    let segment = TcpSegment {
        seq,
        payload,
        syn: false,
        fin: false,
        rst: false,
        ts: ts(ms),
    };
    table.process(key.clone(), &segment);
}

fn push_syn(table: &mut FlowTable, key: &FlowKey, seq: u32, ms: u64) {
    let segment = TcpSegment {
        seq,
        payload: b"",
        syn: true,
        fin: false,
        rst: false,
        ts: ts(ms),
    };
    table.process(key.clone(), &segment);
}

fn push_fin(table: &mut FlowTable, key: &FlowKey, seq: u32, payload: &[u8], ms: u64) {
    let segment = TcpSegment {
        seq,
        payload,
        syn: false,
        fin: true,
        rst: false,
        ts: ts(ms),
    };
    table.process(key.clone(), &segment);
}

/// Ends the session and collects everything the pipeline produced.
fn drain(table: FlowTable, rx: Receiver<CaptureEvent>) -> Vec<CaptureEvent> {
    drop(table);
    let mut events = Vec::new();
    loop {
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(event) => events.push(event),
            Err(RecvTimeoutError::Disconnected) => return events,
            Err(RecvTimeoutError::Timeout) => panic!("pipeline did not drain"),
        }
    }
}

fn transactions(events: Vec<CaptureEvent>) -> Vec<Transaction> {
    events
        .into_iter()
        .map(|event| match event {
            CaptureEvent::Transaction(txn) => txn,
            CaptureEvent::Error(err) => panic!("unexpected capture error: {}", err),
        })
        .collect()
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("timed out waiting for {}", what);
}

#[test]
fn single_get() {
    let config = CaptureConfig::default();
    let (mut table, requests, rx) = session(&config);
    let fwd = key("10.0.0.1:54321", "10.0.0.2:80");

    // a bare ACK first: zero payload is accepted silently
    push(&mut table, &fwd, 1, b"", 999);
    push(&mut table, &fwd, 1, REQUEST, 1000);
    wait_for("request parked", || requests.len() == 1);
    push(&mut table, &fwd.reverse(), 1, RESPONSE, 1100);

    let txns = transactions(drain(table, rx));
    assert_eq!(txns.len(), 1);
    let txn = &txns[0];
    assert_eq!(txn.client, "10.0.0.1:54321".parse().unwrap());
    assert_eq!(txn.server, "10.0.0.2:80".parse().unwrap());
    assert_eq!(txn.request_time, Some(ts(1000)));
    assert_eq!(txn.response_time, ts(1100));
    assert!(txn.response_time >= txn.request_time.unwrap());
    let request = txn.request.as_ref().unwrap();
    assert_eq!(request.method, "GET");
    assert_eq!(txn.response.status, 200);
    assert!(txn.response.status_line().starts_with("HTTP/"));
    assert_eq!(txn.response.body, b"hello");
}

#[test]
fn split_into_small_segments() {
    for n in [1usize, 2, 3, 7] {
        let config = CaptureConfig::default();
        let (mut table, requests, rx) = session(&config);
        let fwd = key("10.0.0.1:54321", "10.0.0.2:80");

        let mut seq = 1u32;
        for chunk in REQUEST.chunks(n) {
            push(&mut table, &fwd, seq, chunk, 1000);
            seq = seq.wrapping_add(chunk.len() as u32);
        }
        wait_for("request parked", || requests.len() == 1);
        let rev = fwd.reverse();
        let mut seq = 1u32;
        for chunk in RESPONSE.chunks(n) {
            push(&mut table, &rev, seq, chunk, 1100);
            seq = seq.wrapping_add(chunk.len() as u32);
        }

        let txns = transactions(drain(table, rx));
        assert_eq!(txns.len(), 1, "chunk size {}", n);
        let txn = &txns[0];
        assert_eq!(txn.request.as_ref().unwrap().method, "GET");
        assert_eq!(txn.response.body, b"hello");
        assert_eq!(txn.request_time, Some(ts(1000)));
        assert_eq!(txn.response_time, ts(1100));
    }
}

#[test]
fn reordered_segments() {
    let config = CaptureConfig::default();
    let (mut table, requests, rx) = session(&config);
    let fwd = key("10.0.0.1:54321", "10.0.0.2:80");

    // SYNs pin the stream starts, then payload segments arrive shuffled
    push_syn(&mut table, &fwd, 100, 990);
    let mut offsets: Vec<(u32, &[u8])> = Vec::new();
    let mut seq = 101u32;
    for chunk in REQUEST.chunks(5) {
        offsets.push((seq, chunk));
        seq = seq.wrapping_add(chunk.len() as u32);
    }
    offsets.reverse();
    for (seq, chunk) in offsets {
        push(&mut table, &fwd, seq, chunk, 1000);
    }
    wait_for("request parked", || requests.len() == 1);

    let rev = fwd.reverse();
    push_syn(&mut table, &rev, 500, 1090);
    let mut offsets: Vec<(u32, &[u8])> = Vec::new();
    let mut seq = 501u32;
    for chunk in RESPONSE.chunks(4) {
        offsets.push((seq, chunk));
        seq = seq.wrapping_add(chunk.len() as u32);
    }
    offsets.rotate_left(3);
    for (seq, chunk) in offsets {
        push(&mut table, &rev, seq, chunk, 1100);
    }

    let txns = transactions(drain(table, rx));
    assert_eq!(txns.len(), 1);
    let txn = &txns[0];
    assert_eq!(txn.request.as_ref().unwrap().method, "GET");
    assert_eq!(txn.response.status, 200);
    assert_eq!(txn.response.body, b"hello");
}

#[test]
fn pipelined_requests_displace() {
    let config = CaptureConfig::default();
    let (mut table, requests, rx) = session(&config);
    let fwd = key("10.0.0.1:54321", "10.0.0.2:80");

    let req1: &[u8] = b"GET /one HTTP/1.1\r\nHost: x\r\n\r\n";
    let req2: &[u8] = b"POST /two HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\n\r\nhi";
    push(&mut table, &fwd, 1, req1, 1000);
    push(&mut table, &fwd, 1 + req1.len() as u32, req2, 1010);
    // wait until the second request has displaced the first
    wait_for("second request parked", || match requests.take(&fwd) {
        Some(pending) => {
            let is_post = pending.req.method == "POST";
            requests.put(fwd.clone(), pending);
            is_post
        }
        None => false,
    });

    let rev = fwd.reverse();
    let resp1: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\na";
    let resp2: &[u8] = b"HTTP/1.1 201 Created\r\nContent-Length: 1\r\n\r\nb";
    push(&mut table, &rev, 1, resp1, 1100);
    push(&mut table, &rev, 1 + resp1.len() as u32, resp2, 1110);

    let txns = transactions(drain(table, rx));
    assert_eq!(txns.len(), 2);
    // the displaced first request never pairs: the next response takes the
    // surviving second request, the one after that finds the table empty
    assert_eq!(txns[0].request.as_ref().unwrap().method, "POST");
    assert_eq!(txns[0].response.status, 200);
    assert!(txns[1].request.is_none());
    assert_eq!(txns[1].request_time, None);
    assert_eq!(txns[1].response.status, 201);
}

#[test]
fn chunked_response_body() {
    let config = CaptureConfig::default();
    let (mut table, requests, rx) = session(&config);
    let fwd = key("10.0.0.1:54321", "10.0.0.2:80");

    push(&mut table, &fwd, 1, REQUEST, 1000);
    wait_for("request parked", || requests.len() == 1);
    let chunked: &[u8] =
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nfoo\r\n0\r\n\r\n";
    push(&mut table, &fwd.reverse(), 1, chunked, 1100);

    let txns = transactions(drain(table, rx));
    assert_eq!(txns.len(), 1);
    assert_eq!(txns[0].response.body, b"foo");
}

#[test]
fn ipv6_flow() {
    let config = CaptureConfig::default();
    let (mut table, requests, rx) = session(&config);
    let fwd = key("[2001:db8::1]:54321", "[2001:db8::2]:80");

    push(&mut table, &fwd, 1, REQUEST, 1000);
    wait_for("request parked", || requests.len() == 1);
    push(&mut table, &fwd.reverse(), 1, RESPONSE, 1100);

    let txns = transactions(drain(table, rx));
    assert_eq!(txns.len(), 1);
    assert_eq!(txns[0].client, "[2001:db8::1]:54321".parse().unwrap());
    assert_eq!(txns[0].server, "[2001:db8::2]:80".parse().unwrap());
    assert_eq!(txns[0].response.body, b"hello");
}

#[test]
fn cancelled_session_emits_nothing() {
    let config = CaptureConfig::default();
    let (mut table, requests, rx) = session(&config);
    let fwd = key("10.0.0.1:54321", "10.0.0.2:80");

    push(&mut table, &fwd, 1, REQUEST, 1000);
    wait_for("request parked", || requests.len() == 1);

    // tearing the table down stands in for cancellation: pipes close, the
    // parser sees end-of-stream, and nothing half-done is emitted
    let events = drain(table, rx);
    assert!(events.is_empty());
    // the unanswered request stays parked until the session state goes away
    assert_eq!(requests.len(), 1);
}

#[test]
fn lone_response() {
    let config = CaptureConfig::default();
    let (mut table, _requests, rx) = session(&config);
    let rev = key("10.0.0.2:80", "10.0.0.1:54321");

    push(&mut table, &rev, 1, RESPONSE, 1100);

    let txns = transactions(drain(table, rx));
    assert_eq!(txns.len(), 1);
    let txn = &txns[0];
    assert!(txn.request.is_none());
    assert_eq!(txn.request_time, None);
    assert_eq!(txn.response_time, ts(1100));
    assert_eq!(txn.response.status, 200);
    assert_eq!(txn.client, "10.0.0.1:54321".parse().unwrap());
    assert_eq!(txn.server, "10.0.0.2:80".parse().unwrap());
}

#[test]
fn lone_response_suppressed_by_config() {
    let config = CaptureConfig {
        emit_lone_responses: false,
        ..CaptureConfig::default()
    };
    let (mut table, _requests, rx) = session(&config);
    let rev = key("10.0.0.2:80", "10.0.0.1:54321");

    push(&mut table, &rev, 1, RESPONSE, 1100);

    let events = drain(table, rx);
    assert!(events.is_empty());
}

#[test]
fn truncated_response_body_reports_parse_error() {
    let config = CaptureConfig::default();
    let (mut table, _requests, rx) = session(&config);
    let rev = key("10.0.0.2:80", "10.0.0.1:54321");

    // Content-Length promises 5 bytes, the connection dies after 3
    push_fin(
        &mut table,
        &rev,
        1,
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nabc",
        1100,
    );

    let events = drain(table, rx);
    assert_eq!(events.len(), 1);
    match &events[0] {
        CaptureEvent::Error(err) => {
            assert!(matches!(err.kind, ErrorKind::ResponseParse { .. }));
            assert_eq!(err.time, ts(1100));
        }
        CaptureEvent::Transaction(txn) => panic!("unexpected transaction: {}", txn),
    }
}

#[test]
fn unfilled_gap_ages_out_silently() {
    let config = CaptureConfig {
        idle_timeout: Duration::ZERO,
        ..CaptureConfig::default()
    };
    let (mut table, _requests, rx) = session(&config);
    let fwd = key("10.0.0.1:54321", "10.0.0.2:80");

    push(&mut table, &fwd, 1, b"GET", 1000);
    // the rest of the head never arrives in order
    push(&mut table, &fwd, 100, b"orphan bytes", 1001);
    table.sweep_idle();
    assert_eq!(table.len(), 0);

    let events = drain(table, rx);
    assert!(events.is_empty());
}

#[test]
fn overflow_reports_and_keeps_capturing() {
    let config = CaptureConfig {
        max_buffered_bytes: 4,
        ..CaptureConfig::default()
    };
    let (mut table, _requests, rx) = session(&config);
    let fwd = key("10.0.0.1:54321", "10.0.0.2:80");

    push(&mut table, &fwd, 1, b"x", 1000);
    push(&mut table, &fwd, 1000, b"too many buffered bytes", 1001);

    // the flow survives the overflow; a lone response still goes through
    let rev = fwd.reverse();
    push(&mut table, &rev, 1, RESPONSE, 1100);

    let events = drain(table, rx);
    let mut saw_overflow = false;
    let mut saw_transaction = false;
    for event in events {
        match event {
            CaptureEvent::Error(err) => {
                assert!(matches!(
                    err.kind,
                    ErrorKind::ReassemblyOverflow { dropped: 23, .. }
                ));
                saw_overflow = true;
            }
            CaptureEvent::Transaction(txn) => {
                assert_eq!(txn.response.status, 200);
                saw_transaction = true;
            }
        }
    }
    assert!(saw_overflow);
    assert!(saw_transaction);
}

#[test]
fn fin_ends_the_stream_cleanly() {
    let config = CaptureConfig::default();
    let (mut table, requests, rx) = session(&config);
    let fwd = key("10.0.0.1:54321", "10.0.0.2:80");

    push(&mut table, &fwd, 1, REQUEST, 1000);
    wait_for("request parked", || requests.len() == 1);
    // close-delimited response: the body runs until FIN
    push(&mut table, &fwd.reverse(), 1, b"HTTP/1.0 200 OK\r\n\r\npartial", 1100);
    push_fin(&mut table, &fwd.reverse(), 27, b" content", 1101);
    assert_eq!(table.len(), 1); // response direction torn down, request side remains

    let txns = transactions(drain(table, rx));
    assert_eq!(txns.len(), 1);
    assert_eq!(txns[0].response.body, b"partial content");
}
