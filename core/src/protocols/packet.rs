//! Frame-to-segment extraction.
//!
//! Decodes link, network and transport layers of a captured frame and
//! produces the `(FlowKey, TcpSegment)` pair the reassembler consumes.
//! Everything that is not TCP over IPv4/IPv6 is dropped without an error;
//! only endpoint bytes with an impossible shape are reported upward.
//!
//! Decoding borrows from the frame buffer throughout; nothing is copied
//! here.

use crate::capture::LinkKind;
use crate::conntrack::flow_id::{endpoint_from_raw, EndpointError, FlowKey};
use crate::conntrack::pdu::TcpSegment;

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Flags, Ipv4Packet};
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::{TcpFlags, TcpPacket};
use pnet::packet::vlan::VlanPacket;
use pnet::packet::Packet;

use std::time::SystemTime;

/// Network-layer bytes plus how the link layer said to interpret them.
enum IpHint<'a> {
    V4(&'a [u8]),
    V6(&'a [u8]),
    /// Bare IP with no link-layer hint; the version nibble decides.
    Either(&'a [u8]),
}

/// Extracts the TCP segment from one captured frame.
///
/// `Ok(None)` means the frame is not usable TCP (wrong ethertype, non-TCP
/// transport, truncated or fragmented packet) and is silently dropped.
pub fn extract<'a>(
    link: LinkKind,
    frame: &'a [u8],
    ts: SystemTime,
) -> Result<Option<(FlowKey, TcpSegment<'a>)>, EndpointError> {
    let hint = match strip_link(link, frame) {
        Some(hint) => hint,
        None => return Ok(None),
    };
    let (tcp_bytes, src_addr, dst_addr) = match hint {
        IpHint::V4(bytes) => match strip_ipv4(bytes) {
            Some(parts) => parts,
            None => return Ok(None),
        },
        IpHint::V6(bytes) => match strip_ipv6(bytes) {
            Some(parts) => parts,
            None => return Ok(None),
        },
        IpHint::Either(bytes) => {
            let version = match bytes.first() {
                Some(byte) => byte >> 4,
                None => return Ok(None),
            };
            let parts = match version {
                4 => strip_ipv4(bytes),
                6 => strip_ipv6(bytes),
                _ => None,
            };
            match parts {
                Some(parts) => parts,
                None => return Ok(None),
            }
        }
    };

    let tcp = match TcpPacket::new(tcp_bytes) {
        Some(tcp) => tcp,
        None => return Ok(None),
    };
    let offset = tcp.get_data_offset() as usize * 4;
    if offset < 20 || offset > tcp_bytes.len() {
        return Ok(None);
    }

    let src = endpoint_from_raw(src_addr, &tcp_bytes[0..2])?;
    let dst = endpoint_from_raw(dst_addr, &tcp_bytes[2..4])?;

    let flags = tcp.get_flags();
    let segment = TcpSegment {
        seq: tcp.get_sequence(),
        payload: &tcp_bytes[offset..],
        syn: flags & TcpFlags::SYN != 0,
        fin: flags & TcpFlags::FIN != 0,
        rst: flags & TcpFlags::RST != 0,
        ts,
    };
    Ok(Some((FlowKey::new(src, dst), segment)))
}

fn strip_link(link: LinkKind, frame: &[u8]) -> Option<IpHint<'_>> {
    match link {
        LinkKind::Ethernet => {
            let eth = EthernetPacket::new(frame)?;
            match eth.get_ethertype() {
                EtherTypes::Ipv4 => Some(IpHint::V4(&frame[14..])),
                EtherTypes::Ipv6 => Some(IpHint::V6(&frame[14..])),
                EtherTypes::Vlan => {
                    let vlan = VlanPacket::new(eth.payload())?;
                    match vlan.get_ethertype() {
                        EtherTypes::Ipv4 => Some(IpHint::V4(&frame[18..])),
                        EtherTypes::Ipv6 => Some(IpHint::V6(&frame[18..])),
                        _ => None,
                    }
                }
                _ => None,
            }
        }
        LinkKind::Null | LinkKind::Loop => {
            if frame.len() < 4 {
                return None;
            }
            let raw: [u8; 4] = frame[0..4].try_into().ok()?;
            let family = match link {
                LinkKind::Null => u32::from_ne_bytes(raw),
                _ => u32::from_be_bytes(raw),
            };
            match family {
                2 => Some(IpHint::V4(&frame[4..])),
                24 | 28 | 30 => Some(IpHint::V6(&frame[4..])),
                _ => None,
            }
        }
        LinkKind::Raw => Some(IpHint::Either(frame)),
        LinkKind::LinuxSll => {
            if frame.len() < 16 {
                return None;
            }
            ethertype_hint(u16::from_be_bytes([frame[14], frame[15]]), &frame[16..])
        }
        LinkKind::LinuxSll2 => {
            if frame.len() < 20 {
                return None;
            }
            ethertype_hint(u16::from_be_bytes([frame[0], frame[1]]), &frame[20..])
        }
        LinkKind::Unsupported(_) => None,
    }
}

fn ethertype_hint(ethertype: u16, rest: &[u8]) -> Option<IpHint<'_>> {
    match ethertype {
        0x0800 => Some(IpHint::V4(rest)),
        0x86DD => Some(IpHint::V6(rest)),
        _ => None,
    }
}

/// Validates an IPv4 header and returns `(tcp bytes, src bytes, dst bytes)`.
/// The payload is trimmed to the header's total length; ethernet frames are
/// padded to their minimum size and the padding must not reach TCP.
fn strip_ipv4(bytes: &[u8]) -> Option<(&[u8], &[u8], &[u8])> {
    let ip = Ipv4Packet::new(bytes)?;
    if ip.get_version() != 4 {
        return None;
    }
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
        return None;
    }
    // Fragment reassembly is the capture layer's problem; drop fragments.
    if ip.get_fragment_offset() > 0 || ip.get_flags() & Ipv4Flags::MoreFragments != 0 {
        return None;
    }
    let header_len = ip.get_header_length() as usize * 4;
    let total_len = (ip.get_total_length() as usize).min(bytes.len());
    if header_len < 20 || total_len < header_len {
        return None;
    }
    Some((
        &bytes[header_len..total_len],
        &bytes[12..16],
        &bytes[16..20],
    ))
}

/// Validates an IPv6 header and returns `(tcp bytes, src bytes, dst bytes)`.
/// Packets carrying extension headers before TCP are dropped.
fn strip_ipv6(bytes: &[u8]) -> Option<(&[u8], &[u8], &[u8])> {
    let ip = Ipv6Packet::new(bytes)?;
    if ip.get_version() != 6 {
        return None;
    }
    if ip.get_next_header() != IpNextHeaderProtocols::Tcp {
        return None;
    }
    let end = (40 + ip.get_payload_length() as usize).min(bytes.len());
    Some((&bytes[40..end], &bytes[8..24], &bytes[24..40]))
}
