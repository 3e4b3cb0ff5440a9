//! Capture session runtime.
//!
//! A [`Capturer`] owns one packet source per device and runs the full
//! pipeline: one ingest thread per source feeds its own flow table, every
//! half-flow gets a parser thread, and all of them share one request table
//! and one result channel. [`Capturer::capture`] blocks until every ingest
//! loop has stopped; parser threads drain out on their own once their pipes
//! close.

use crate::capture::pcap_dev::PcapCapture;
#[cfg(target_os = "linux")]
use crate::capture::sock::{self, SockCapture};
use crate::capture::{PacketSource, Poll};
use crate::config::CaptureConfig;
use crate::conntrack::request_table::RequestTable;
use crate::conntrack::FlowTable;
use crate::errors::{CaptureError, ErrorKind, SetupError};
use crate::protocols::packet;
use crate::subscription::CaptureEvent;

use crossbeam_channel::Sender;
use log::{debug, error, info};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

/// Which capture implementation to open devices with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// libpcap.
    Native,
    /// Raw `AF_PACKET` sockets with an in-kernel BPF filter.
    #[cfg(target_os = "linux")]
    Portable,
}

/// Cooperative cancellation signal, shared between the caller and every
/// ingest loop. Cancellation is observed at the latest after one driver
/// read timeout.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An opened capture session, ready to filter and run.
pub struct Capturer {
    sources: Vec<Box<dyn PacketSource>>,
    config: CaptureConfig,
}

impl Capturer {
    /// Opens the device named in `config`. The name `any` means all
    /// interfaces: libpcap handles that itself, the portable backend opens
    /// one socket per interface.
    pub fn open(config: &CaptureConfig, backend: Backend) -> Result<Self, SetupError> {
        let devices = resolve_devices(&config.device, backend);
        Self::open_multi(&devices, config, backend)
    }

    /// Opens one capture per named device, fanning into a single session.
    pub fn open_multi(
        devices: &[String],
        config: &CaptureConfig,
        backend: Backend,
    ) -> Result<Self, SetupError> {
        if devices.is_empty() {
            return Err(SetupError::DeviceOpen {
                device: config.device.clone(),
                source: anyhow::anyhow!("no usable capture devices"),
            });
        }
        let mut sources: Vec<Box<dyn PacketSource>> = Vec::with_capacity(devices.len());
        for device in devices {
            let source: Box<dyn PacketSource> = match backend {
                Backend::Native => Box::new(PcapCapture::open(device, config)?),
                #[cfg(target_os = "linux")]
                Backend::Portable => Box::new(SockCapture::open(device, config)?),
            };
            sources.push(source);
        }
        Ok(Capturer {
            sources,
            config: config.clone(),
        })
    }

    /// Applies one filter expression to every device. Idempotent; the last
    /// expression wins.
    pub fn set_filter(&mut self, expr: &str) -> Result<(), SetupError> {
        for source in &mut self.sources {
            source.set_filter(expr)?;
        }
        Ok(())
    }

    /// Runs the capture until cancellation or until every source is
    /// exhausted. The result channel is not closed on return; it drains as
    /// the remaining parser threads finish.
    pub fn capture(self, cancel: CancelToken, sink: Sender<CaptureEvent>) {
        let requests = Arc::new(RequestTable::new());
        let mut workers = Vec::with_capacity(self.sources.len());
        for source in self.sources {
            let config = self.config.clone();
            let cancel = cancel.clone();
            let requests = Arc::clone(&requests);
            let sink = sink.clone();
            let name = format!("httap-ingest {}", source.device());
            let spawned = thread::Builder::new()
                .name(name)
                .spawn(move || ingest_loop(source, config, cancel, requests, sink));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => error!("spawn ingest thread: {}", err),
            }
        }
        for worker in workers {
            let _ = worker.join();
        }
    }
}

fn resolve_devices(device: &str, backend: Backend) -> Vec<String> {
    match backend {
        Backend::Native => vec![device.to_string()],
        #[cfg(target_os = "linux")]
        Backend::Portable => {
            if device == "any" {
                sock::all_devices()
            } else {
                vec![device.to_string()]
            }
        }
    }
}

fn ingest_loop(
    mut source: Box<dyn PacketSource>,
    config: CaptureConfig,
    cancel: CancelToken,
    requests: Arc<RequestTable>,
    sink: Sender<CaptureEvent>,
) {
    let link = source.link_kind();
    let device = source.device().to_string();
    let mut flows = FlowTable::new(requests, sink.clone(), &config);
    info!("capture started on {}", device);
    loop {
        if cancel.is_cancelled() {
            debug!("capture cancelled on {}", device);
            break;
        }
        match source.poll() {
            Ok(Poll::Frame { data, ts }) => {
                match packet::extract(link, data, ts) {
                    Ok(Some((key, segment))) => flows.process(key, &segment),
                    Ok(None) => {}
                    Err(err) => {
                        let record =
                            CaptureError::new(ts, ErrorKind::BadAddress(err.to_string()));
                        if sink.send(CaptureEvent::Error(record)).is_err() {
                            break;
                        }
                    }
                }
                flows.sweep_idle();
            }
            Ok(Poll::TimedOut) => flows.sweep_idle(),
            Ok(Poll::Closed) => {
                debug!("capture source {} exhausted", device);
                break;
            }
            Err(err) => {
                error!("capture read failed on {}: {:#}", device, err);
                let record = CaptureError::new(
                    SystemTime::now(),
                    ErrorKind::PeekFailure(format!("{:#}", err)),
                );
                let _ = sink.send(CaptureEvent::Error(record));
                break;
            }
        }
    }
    info!("capture stopped on {}", device);
    // Dropping the flow table closes every half-flow pipe; parsers observe
    // end-of-stream and finish on their own.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn open_rejects_empty_device_list() {
        let config = CaptureConfig::default();
        let result = Capturer::open_multi(&[], &config, Backend::Native);
        assert!(matches!(result, Err(SetupError::DeviceOpen { .. })));
    }
}
