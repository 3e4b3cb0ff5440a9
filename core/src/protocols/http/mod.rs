//! HTTP/1.x messages.
//!
//! Owned representations of one parsed request or response, with the body
//! already buffered in full. The wire parser lives in [`parser`]; body
//! framing rules in [`body`].

pub mod body;
pub mod parser;

use serde::ser::{SerializeStruct, Serializer};
use serde::Serialize;

use std::fmt;

use thiserror::Error;

/// One header field, order-preserving, value kept as raw bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Header {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A parsed request with its full body.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    /// Minor version: `0` for HTTP/1.0, `1` for HTTP/1.1.
    pub version: u8,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// First value of the named header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        find_header(&self.headers, name)
    }

    pub fn request_line(&self) -> String {
        format!("{} {} HTTP/1.{}", self.method, self.target, self.version)
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.request_line())
    }
}

/// A parsed response with its full body.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    /// Minor version: `0` for HTTP/1.0, `1` for HTTP/1.1.
    pub version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        find_header(&self.headers, name)
    }

    pub fn status_line(&self) -> String {
        format!("HTTP/1.{} {} {}", self.version, self.status, self.reason)
    }
}

impl fmt::Display for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status_line())
    }
}

/// Why a message could not be parsed off the stream.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{0}")]
    Head(#[from] httparse::Error),
    #[error("message head too large")]
    HeadTooLarge,
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("invalid content length")]
    InvalidContentLength,
    #[error("conflicting content lengths")]
    ConflictingContentLength,
    #[error("unsupported transfer encoding {0:?}")]
    UnsupportedTransferEncoding(String),
    #[error("invalid chunk size line")]
    InvalidChunkSize,
    #[error("missing chunk delimiter")]
    MissingChunkDelimiter,
    #[error("truncated body: expected {expected} bytes, got {got}")]
    TruncatedBody { expected: usize, got: usize },
}

pub(crate) fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_slice())
}

fn serialize_headers<S>(headers: &[Header], state: &mut S) -> Result<(), S::Error>
where
    S: SerializeStruct,
{
    let rendered: Vec<(String, String)> = headers
        .iter()
        .map(|h| (h.name.clone(), String::from_utf8_lossy(&h.value).into_owned()))
        .collect();
    state.serialize_field("headers", &rendered)
}

impl Serialize for HttpRequest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("HttpRequest", 5)?;
        state.serialize_field("method", &self.method)?;
        state.serialize_field("target", &self.target)?;
        state.serialize_field("version", &format!("HTTP/1.{}", self.version))?;
        serialize_headers(&self.headers, &mut state)?;
        state.serialize_field("body", &String::from_utf8_lossy(&self.body))?;
        state.end()
    }
}

impl Serialize for HttpResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("HttpResponse", 5)?;
        state.serialize_field("version", &format!("HTTP/1.{}", self.version))?;
        state.serialize_field("status", &self.status)?;
        state.serialize_field("reason", &self.reason)?;
        serialize_headers(&self.headers, &mut state)?;
        state.serialize_field("body", &String::from_utf8_lossy(&self.body))?;
        state.end()
    }
}
