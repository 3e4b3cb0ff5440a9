//! Portable capture backend: a raw `AF_PACKET` socket.
//!
//! Works without a capture library at runtime, at the cost of being
//! linux-only. The BPF filter expression is compiled to bytecode against a
//! dead pcap handle and installed on the socket with `SO_ATTACH_FILTER`, so
//! filtering happens in-kernel before the first byte is copied out.
//!
//! This backend has no `any` pseudo-device; the runtime enumerates
//! interfaces with [`all_devices`] and opens one socket per interface.

use crate::capture::{LinkKind, PacketSource, Poll};
use crate::config::CaptureConfig;
use crate::errors::SetupError;

use anyhow::Context;

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, SystemTime};

fn os_error(context: &str) -> anyhow::Error {
    anyhow::Error::new(io::Error::last_os_error()).context(context.to_string())
}

pub struct SockCapture {
    fd: RawFd,
    device: String,
    buf: Vec<u8>,
}

impl SockCapture {
    pub fn open(device: &str, config: &CaptureConfig) -> Result<Self, SetupError> {
        Self::open_inner(device, config).map_err(|source| SetupError::DeviceOpen {
            device: device.to_string(),
            source,
        })
    }

    fn open_inner(device: &str, config: &CaptureConfig) -> anyhow::Result<Self> {
        let index = interface_index(device)?;
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                i32::from((libc::ETH_P_ALL as u16).to_be()),
            )
        };
        if fd < 0 {
            return Err(os_error("open packet socket"));
        }
        // Constructed before the remaining setup so the fd is closed on any
        // failure below.
        let sock = SockCapture {
            fd,
            device: device.to_string(),
            buf: vec![0; config.snaplen.max(256) as usize],
        };
        sock.bind(index)?;
        if config.promisc {
            sock.enable_promisc(index)?;
        }
        if !config.read_timeout.is_zero() {
            sock.set_read_timeout(config.read_timeout)?;
        }
        Ok(sock)
    }

    fn bind(&self, index: u32) -> anyhow::Result<()> {
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        addr.sll_ifindex = index as i32;
        let rc = unsafe {
            libc::bind(
                self.fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(os_error("bind packet socket"));
        }
        Ok(())
    }

    fn enable_promisc(&self, index: u32) -> anyhow::Result<()> {
        let mut mreq: libc::packet_mreq = unsafe { std::mem::zeroed() };
        mreq.mr_ifindex = index as i32;
        mreq.mr_type = libc::PACKET_MR_PROMISC as libc::c_ushort;
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_PACKET,
                libc::PACKET_ADD_MEMBERSHIP,
                &mreq as *const libc::packet_mreq as *const libc::c_void,
                std::mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(os_error("enable promiscuous mode"));
        }
        Ok(())
    }

    fn set_read_timeout(&self, timeout: Duration) -> anyhow::Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: libc::suseconds_t::from(timeout.subsec_micros()),
        };
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(os_error("set read timeout"));
        }
        Ok(())
    }

    fn install_filter(&self, expr: &str) -> anyhow::Result<()> {
        let dead = pcap::Capture::dead(pcap::Linktype(1))
            .context("open dead capture for filter compilation")?;
        let program = dead
            .compile(expr, true)
            .with_context(|| format!("compile filter {expr:?}"))?;
        let instructions = program.get_instructions();
        // BpfInstruction is #[repr(C)] and layout-compatible with the
        // kernel's sock_filter.
        let fprog = libc::sock_fprog {
            len: instructions.len() as libc::c_ushort,
            filter: instructions.as_ptr() as *mut libc::sock_filter,
        };
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &fprog as *const libc::sock_fprog as *const libc::c_void,
                std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(os_error("attach filter"));
        }
        Ok(())
    }
}

impl PacketSource for SockCapture {
    fn set_filter(&mut self, expr: &str) -> Result<(), SetupError> {
        self.install_filter(expr)
            .map_err(|source| SetupError::FilterCompile {
                expr: expr.to_string(),
                source,
            })
    }

    fn poll(&mut self) -> anyhow::Result<Poll<'_>> {
        let n = unsafe {
            libc::recv(
                self.fd,
                self.buf.as_mut_ptr() as *mut libc::c_void,
                self.buf.len(),
                0,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock
                | io::ErrorKind::TimedOut
                | io::ErrorKind::Interrupted => Ok(Poll::TimedOut),
                _ => Err(anyhow::Error::new(err).context("read packet socket")),
            };
        }
        Ok(Poll::Frame {
            data: &self.buf[..n as usize],
            ts: SystemTime::now(),
        })
    }

    fn link_kind(&self) -> LinkKind {
        LinkKind::Ethernet
    }

    fn device(&self) -> &str {
        &self.device
    }
}

impl Drop for SockCapture {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Names of all usable interfaces, for capturing on `any`.
pub fn all_devices() -> Vec<String> {
    pnet::datalink::interfaces()
        .into_iter()
        .filter(|iface| iface.is_up() && iface.index != 0)
        .map(|iface| iface.name)
        .collect()
}

fn interface_index(name: &str) -> anyhow::Result<u32> {
    pnet::datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .map(|iface| iface.index)
        .ok_or_else(|| anyhow::anyhow!("no such device: {name}"))
}
