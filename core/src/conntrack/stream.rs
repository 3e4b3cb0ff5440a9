//! Buffered reader over a half-flow's reassembly pipe.
//!
//! The reassembler pushes [`Reassembled`] runs into a bounded channel; the
//! stream parser pulls them through a [`StreamReader`], which buffers bytes,
//! supports peeking without consumption, and remembers the capture timestamp
//! of the most recent run pulled in. That timestamp is what transactions are
//! stamped with.

use crate::conntrack::reassembly::Reassembled;

use crossbeam_channel::Receiver;

use std::time::SystemTime;

/// How many reassembled runs a half-flow pipe holds before the reassembler
/// blocks. Keeps per-flow memory bounded; a slow consumer backpressures all
/// the way to the capture driver.
pub const PIPE_DEPTH: usize = 32;

const COMPACT_THRESHOLD: usize = 4096;

pub struct StreamReader {
    rx: Receiver<Reassembled>,
    buf: Vec<u8>,
    pos: usize,
    last_seen: SystemTime,
    eof: bool,
}

impl StreamReader {
    pub fn new(rx: Receiver<Reassembled>) -> Self {
        StreamReader {
            rx,
            buf: Vec::new(),
            pos: 0,
            last_seen: SystemTime::UNIX_EPOCH,
            eof: false,
        }
    }

    /// Capture timestamp of the last run pulled off the pipe.
    pub fn last_seen(&self) -> SystemTime {
        self.last_seen
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Blocks for one more run from the reassembler. Returns `false` once
    /// the pipe is closed and drained.
    pub fn fill_more(&mut self) -> bool {
        if self.eof {
            return false;
        }
        match self.rx.recv() {
            Ok(run) => {
                self.last_seen = run.seen;
                self.buf.extend_from_slice(&run.bytes);
                true
            }
            Err(_) => {
                self.eof = true;
                false
            }
        }
    }

    /// Returns the next `n` bytes without consuming them, or `None` if the
    /// stream ends before `n` bytes are available.
    pub fn peek(&mut self, n: usize) -> Option<&[u8]> {
        while self.buffered().len() < n {
            if !self.fill_more() {
                return None;
            }
        }
        Some(&self.buf[self.pos..self.pos + n])
    }

    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.buffered().len());
        self.pos += n;
        if self.pos >= COMPACT_THRESHOLD && self.pos * 2 >= self.buf.len() {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }

    /// Consumes and returns exactly `n` bytes, or `None` on early
    /// end-of-stream.
    pub fn take(&mut self, n: usize) -> Option<Vec<u8>> {
        while self.buffered().len() < n {
            if !self.fill_more() {
                return None;
            }
        }
        let bytes = self.buf[self.pos..self.pos + n].to_vec();
        self.consume(n);
        Some(bytes)
    }

    /// Consumes everything up to end-of-stream.
    pub fn take_to_eof(&mut self) -> Vec<u8> {
        while self.fill_more() {}
        let bytes = self.buf[self.pos..].to_vec();
        let len = self.buffered().len();
        self.consume(len);
        bytes
    }

    /// Consumes one CRLF-terminated line, excluding the terminator. Fails
    /// with `None` on end-of-stream or once the line exceeds `max` bytes.
    pub fn read_line(&mut self, max: usize) -> Option<Vec<u8>> {
        loop {
            if let Some(at) = find_crlf(self.buffered()) {
                let line = self.buf[self.pos..self.pos + at].to_vec();
                self.consume(at + 2);
                return Some(line);
            }
            if self.buffered().len() > max || !self.fill_more() {
                return None;
            }
        }
    }
}

fn find_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|pair| pair == b"\r\n")
}
