//! Transport-layer segment view.

use std::time::SystemTime;

/// A TCP segment lifted out of a captured frame.
///
/// The payload borrows from the frame buffer; bytes are copied only when the
/// reassembler retains them.
#[derive(Clone, Debug)]
pub struct TcpSegment<'a> {
    /// Sequence number of the first payload byte (of the SYN itself if the
    /// SYN flag is set).
    pub seq: u32,
    pub payload: &'a [u8],
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    /// Capture timestamp of the frame that carried this segment.
    pub ts: SystemTime,
}
