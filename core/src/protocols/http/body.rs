//! Body framing.
//!
//! Decides how many body bytes belong to a message and drains them from the
//! stream: `Content-Length`, `Transfer-Encoding: chunked`, connection-close
//! delimited, or no body at all. The framing rules are deliberately
//! permissive; only genuinely ambiguous messages are rejected.

use crate::conntrack::stream::StreamReader;
use crate::protocols::http::{Header, ParseError};

use std::str;

const MAX_CHUNK_LINE: usize = 1024;

/// How the body of one message is delimited.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BodyFraming {
    /// Exactly this many bytes follow the head.
    Length(usize),
    Chunked,
    /// Body runs to end of stream (responses on closing connections).
    Close,
    Empty,
}

/// Framing for a request. Requests carry a body only when they say so
/// explicitly; a transfer encoding other than chunked leaves no way to find
/// the message end.
pub fn request_framing(headers: &[Header]) -> Result<BodyFraming, ParseError> {
    match transfer_encoding(headers) {
        TransferEncoding::Chunked => Ok(BodyFraming::Chunked),
        TransferEncoding::Other(value) => Err(ParseError::UnsupportedTransferEncoding(value)),
        TransferEncoding::None => match content_length(headers)? {
            Some(0) | None => Ok(BodyFraming::Empty),
            Some(n) => Ok(BodyFraming::Length(n)),
        },
    }
}

/// Framing for a response, which additionally depends on the status code
/// and on the method of the request it answers.
pub fn response_framing(
    status: u16,
    request_method: Option<&str>,
    headers: &[Header],
) -> Result<BodyFraming, ParseError> {
    if (100..200).contains(&status) || status == 204 || status == 304 {
        return Ok(BodyFraming::Empty);
    }
    if matches!(request_method, Some(m) if m.eq_ignore_ascii_case("HEAD")) {
        return Ok(BodyFraming::Empty);
    }
    match transfer_encoding(headers) {
        TransferEncoding::Chunked => Ok(BodyFraming::Chunked),
        // An unknown transfer coding on a response ends with the connection.
        TransferEncoding::Other(_) => Ok(BodyFraming::Close),
        TransferEncoding::None => match content_length(headers)? {
            Some(n) => Ok(BodyFraming::Length(n)),
            None => Ok(BodyFraming::Close),
        },
    }
}

/// Drains the body according to `framing`. Chunked trailers are appended to
/// `headers`.
pub fn read_body(
    reader: &mut StreamReader,
    framing: BodyFraming,
    headers: &mut Vec<Header>,
) -> Result<Vec<u8>, ParseError> {
    match framing {
        BodyFraming::Empty => Ok(Vec::new()),
        BodyFraming::Close => Ok(reader.take_to_eof()),
        BodyFraming::Length(expected) => {
            reader.take(expected).ok_or_else(|| ParseError::TruncatedBody {
                expected,
                got: reader.buffered().len(),
            })
        }
        BodyFraming::Chunked => read_chunked(reader, headers),
    }
}

enum TransferEncoding {
    None,
    Chunked,
    Other(String),
}

/// The applied transfer coding is the last one listed; `chunked` anywhere
/// else is as good as absent for framing purposes.
fn transfer_encoding(headers: &[Header]) -> TransferEncoding {
    let mut last_token: Option<String> = None;
    for header in headers.iter().filter(|h| h.name.eq_ignore_ascii_case("transfer-encoding")) {
        let value = String::from_utf8_lossy(&header.value);
        for token in value.split(',') {
            let token = token.trim();
            if !token.is_empty() {
                last_token = Some(token.to_ascii_lowercase());
            }
        }
    }
    match last_token {
        None => TransferEncoding::None,
        Some(token) if token == "chunked" => TransferEncoding::Chunked,
        Some(token) => TransferEncoding::Other(token),
    }
}

/// All `Content-Length` occurrences must agree.
fn content_length(headers: &[Header]) -> Result<Option<usize>, ParseError> {
    let mut seen: Option<usize> = None;
    for header in headers.iter().filter(|h| h.name.eq_ignore_ascii_case("content-length")) {
        let value = str::from_utf8(&header.value).map_err(|_| ParseError::InvalidContentLength)?;
        for token in value.split(',') {
            let parsed: usize = token
                .trim()
                .parse()
                .map_err(|_| ParseError::InvalidContentLength)?;
            match seen {
                Some(prev) if prev != parsed => return Err(ParseError::ConflictingContentLength),
                _ => seen = Some(parsed),
            }
        }
    }
    Ok(seen)
}

fn read_chunked(reader: &mut StreamReader, headers: &mut Vec<Header>) -> Result<Vec<u8>, ParseError> {
    let mut body = Vec::new();
    loop {
        let line = reader
            .read_line(MAX_CHUNK_LINE)
            .ok_or(ParseError::InvalidChunkSize)?;
        let size = parse_chunk_size(&line)?;
        if size == 0 {
            read_trailers(reader, headers)?;
            return Ok(body);
        }
        let chunk = reader.take(size).ok_or(ParseError::UnexpectedEof)?;
        body.extend_from_slice(&chunk);
        match reader.take(2) {
            Some(crlf) if crlf == b"\r\n" => {}
            _ => return Err(ParseError::MissingChunkDelimiter),
        }
    }
}

/// Chunk size line: hex digits, optionally followed by `;extension`.
fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    let line = str::from_utf8(line).map_err(|_| ParseError::InvalidChunkSize)?;
    let digits = line.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(digits, 16).map_err(|_| ParseError::InvalidChunkSize)
}

/// Trailer section after the last chunk: header lines up to an empty line.
fn read_trailers(reader: &mut StreamReader, headers: &mut Vec<Header>) -> Result<(), ParseError> {
    loop {
        let line = reader
            .read_line(MAX_CHUNK_LINE)
            .ok_or(ParseError::UnexpectedEof)?;
        if line.is_empty() {
            return Ok(());
        }
        if let Some(colon) = line.iter().position(|&b| b == b':') {
            let name = match str::from_utf8(&line[..colon]) {
                Ok(name) => name.trim().to_string(),
                Err(_) => continue,
            };
            let value = trim_ascii(&line[colon + 1..]).to_vec();
            headers.push(Header { name, value });
        }
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::reassembly::Reassembled;
    use crossbeam_channel::unbounded;
    use std::time::UNIX_EPOCH;

    fn reader(bytes: &[u8]) -> StreamReader {
        let (tx, rx) = unbounded();
        tx.send(Reassembled {
            bytes: bytes.to_vec(),
            seen: UNIX_EPOCH,
        })
        .unwrap();
        StreamReader::new(rx)
    }

    fn headers(pairs: &[(&str, &str)]) -> Vec<Header> {
        pairs
            .iter()
            .map(|(n, v)| Header::new(*n, v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn request_framing_rules() {
        assert_eq!(request_framing(&[]).unwrap(), BodyFraming::Empty);
        assert_eq!(
            request_framing(&headers(&[("Content-Length", "12")])).unwrap(),
            BodyFraming::Length(12)
        );
        assert_eq!(
            request_framing(&headers(&[("Transfer-Encoding", "chunked")])).unwrap(),
            BodyFraming::Chunked
        );
        assert!(matches!(
            request_framing(&headers(&[("Transfer-Encoding", "gzip")])),
            Err(ParseError::UnsupportedTransferEncoding(_))
        ));
    }

    #[test]
    fn response_framing_rules() {
        assert_eq!(
            response_framing(200, None, &headers(&[("Content-Length", "5")])).unwrap(),
            BodyFraming::Length(5)
        );
        assert_eq!(
            response_framing(200, None, &[]).unwrap(),
            BodyFraming::Close
        );
        assert_eq!(
            response_framing(204, None, &headers(&[("Content-Length", "5")])).unwrap(),
            BodyFraming::Empty
        );
        assert_eq!(response_framing(304, None, &[]).unwrap(), BodyFraming::Empty);
        assert_eq!(response_framing(100, None, &[]).unwrap(), BodyFraming::Empty);
        assert_eq!(
            response_framing(200, Some("HEAD"), &headers(&[("Content-Length", "5")])).unwrap(),
            BodyFraming::Empty
        );
        assert_eq!(
            response_framing(200, None, &headers(&[("Transfer-Encoding", "gzip, chunked")]))
                .unwrap(),
            BodyFraming::Chunked
        );
    }

    #[test]
    fn conflicting_lengths_rejected() {
        let hs = headers(&[("Content-Length", "5"), ("Content-Length", "6")]);
        assert!(matches!(
            content_length(&hs),
            Err(ParseError::ConflictingContentLength)
        ));
        let hs = headers(&[("Content-Length", "5"), ("Content-Length", "5")]);
        assert_eq!(content_length(&hs).unwrap(), Some(5));
        let hs = headers(&[("Content-Length", "nope")]);
        assert!(content_length(&hs).is_err());
    }

    #[test]
    fn fixed_length_body() {
        let mut r = reader(b"hellorest");
        let mut hs = Vec::new();
        let body = read_body(&mut r, BodyFraming::Length(5), &mut hs).unwrap();
        assert_eq!(body, b"hello");
        assert_eq!(r.buffered(), b"rest");
    }

    #[test]
    fn truncated_length_body() {
        let mut r = reader(b"abc");
        let mut hs = Vec::new();
        match read_body(&mut r, BodyFraming::Length(5), &mut hs) {
            Err(ParseError::TruncatedBody { expected: 5, got: 3 }) => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn chunked_body() {
        let mut r = reader(b"3\r\nfoo\r\n0\r\n\r\n");
        let mut hs = Vec::new();
        let body = read_body(&mut r, BodyFraming::Chunked, &mut hs).unwrap();
        assert_eq!(body, b"foo");
        assert!(hs.is_empty());
    }

    #[test]
    fn chunked_body_with_extension_and_trailer() {
        let mut r = reader(b"4;ext=1\r\nwiki\r\n5\r\npedia\r\n0\r\nExpires: never\r\n\r\n");
        let mut hs = Vec::new();
        let body = read_body(&mut r, BodyFraming::Chunked, &mut hs).unwrap();
        assert_eq!(body, b"wikipedia");
        assert_eq!(hs, vec![Header::new("Expires", b"never".to_vec())]);
    }

    #[test]
    fn chunked_missing_delimiter() {
        let mut r = reader(b"3\r\nfooXX0\r\n\r\n");
        let mut hs = Vec::new();
        assert!(matches!(
            read_body(&mut r, BodyFraming::Chunked, &mut hs),
            Err(ParseError::MissingChunkDelimiter)
        ));
    }

    #[test]
    fn close_delimited_body() {
        let mut r = reader(b"whatever bytes remain");
        let mut hs = Vec::new();
        let body = read_body(&mut r, BodyFraming::Close, &mut hs).unwrap();
        assert_eq!(body, b"whatever bytes remain");
    }
}
