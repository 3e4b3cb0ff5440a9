//! Native capture backend, driving libpcap.

use crate::capture::{LinkKind, PacketSource, Poll};
use crate::config::CaptureConfig;
use crate::errors::SetupError;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A live libpcap handle. The special device name `any` is passed through;
/// libpcap serves it with a "cooked" pseudo-device on platforms that have
/// one.
pub struct PcapCapture {
    inner: pcap::Capture<pcap::Active>,
    link: LinkKind,
    device: String,
}

impl PcapCapture {
    pub fn open(device: &str, config: &CaptureConfig) -> Result<Self, SetupError> {
        let inner = Self::open_live(device, config).map_err(|err| SetupError::DeviceOpen {
            device: device.to_string(),
            source: err.into(),
        })?;
        let link = LinkKind::from_dlt(inner.get_datalink().0);
        Ok(PcapCapture {
            inner,
            link,
            device: device.to_string(),
        })
    }

    fn open_live(
        device: &str,
        config: &CaptureConfig,
    ) -> Result<pcap::Capture<pcap::Active>, pcap::Error> {
        pcap::Capture::from_device(device)?
            .snaplen(config.snaplen)
            .promisc(config.promisc)
            .timeout(config.read_timeout.as_millis() as i32)
            .open()
    }
}

impl PacketSource for PcapCapture {
    fn set_filter(&mut self, expr: &str) -> Result<(), SetupError> {
        self.inner
            .filter(expr, true)
            .map_err(|err| SetupError::FilterCompile {
                expr: expr.to_string(),
                source: err.into(),
            })
    }

    fn poll(&mut self) -> anyhow::Result<Poll<'_>> {
        match self.inner.next_packet() {
            Ok(packet) => {
                let ts = timeval_to_system(packet.header.ts);
                Ok(Poll::Frame {
                    data: packet.data,
                    ts,
                })
            }
            Err(pcap::Error::TimeoutExpired) => Ok(Poll::TimedOut),
            Err(pcap::Error::NoMorePackets) => Ok(Poll::Closed),
            Err(err) => Err(err.into()),
        }
    }

    fn link_kind(&self) -> LinkKind {
        self.link
    }

    fn device(&self) -> &str {
        &self.device
    }
}

fn timeval_to_system(tv: libc::timeval) -> SystemTime {
    if tv.tv_sec < 0 {
        return UNIX_EPOCH;
    }
    let micros = tv.tv_usec.clamp(0, 999_999) as u32;
    UNIX_EPOCH + Duration::new(tv.tv_sec as u64, micros * 1_000)
}
