//! Capture backends.
//!
//! A [`PacketSource`] produces timestamped link-layer frames for one device.
//! Two implementations exist behind the trait: [`pcap_dev::PcapCapture`]
//! drives libpcap, and [`sock::SockCapture`] reads a raw `AF_PACKET` socket
//! with the BPF filter installed in-kernel. Handles are owned by exactly one
//! ingest thread and release the device on drop.

pub mod pcap_dev;
#[cfg(target_os = "linux")]
pub mod sock;

use crate::errors::SetupError;

use std::time::SystemTime;

/// Link-layer framing of a capture handle, by libpcap DLT number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkKind {
    /// DLT_EN10MB: 14-byte ethernet header, optionally VLAN-tagged.
    Ethernet,
    /// DLT_NULL: BSD loopback, 4-byte host-order address family.
    Null,
    /// DLT_LOOP: like `Null` but big-endian.
    Loop,
    /// DLT_RAW: bare IP.
    Raw,
    /// DLT_LINUX_SLL: "cooked" header libpcap uses for the `any` device.
    LinuxSll,
    /// DLT_LINUX_SLL2.
    LinuxSll2,
    Unsupported(i32),
}

impl LinkKind {
    pub fn from_dlt(dlt: i32) -> Self {
        match dlt {
            0 => LinkKind::Null,
            1 => LinkKind::Ethernet,
            12 | 101 => LinkKind::Raw,
            108 => LinkKind::Loop,
            113 => LinkKind::LinuxSll,
            276 => LinkKind::LinuxSll2,
            other => LinkKind::Unsupported(other),
        }
    }
}

/// One poll of a capture handle.
pub enum Poll<'a> {
    /// A captured frame and the driver's timestamp for it.
    Frame { data: &'a [u8], ts: SystemTime },
    /// The driver's read timeout elapsed; a chance to observe cancellation
    /// and sweep idle flows.
    TimedOut,
    /// The source is exhausted.
    Closed,
}

/// A device yielding timestamped link-layer frames.
///
/// `set_filter` is idempotent; the last expression wins. Implementations
/// release the device when dropped.
pub trait PacketSource: Send {
    /// Compiles and applies a BPF filter expression.
    fn set_filter(&mut self, expr: &str) -> Result<(), SetupError>;

    /// Blocks for the next frame, up to the configured read timeout.
    fn poll(&mut self) -> anyhow::Result<Poll<'_>>;

    fn link_kind(&self) -> LinkKind;

    /// Device name, for diagnostics.
    fn device(&self) -> &str;
}
