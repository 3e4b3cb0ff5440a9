//! Passive HTTP/1.x capture.
//!
//! httap attaches to one or more network interfaces in packet-capture mode,
//! reassembles TCP byte streams, parses each direction as HTTP/1.x and pairs
//! every request with the response observed on the reverse flow. Completed
//! transactions (and non-fatal per-stream faults) are delivered as
//! [`CaptureEvent`] records on a caller-supplied channel.
//!
//! ## Example
//! ```no_run
//! use httap_core::{Backend, CancelToken, CaptureConfig, CaptureEvent, Capturer};
//!
//! let config = CaptureConfig::default();
//! let mut capturer = Capturer::open(&config, Backend::Native)?;
//! capturer.set_filter(&config.filter)?;
//!
//! let cancel = CancelToken::new();
//! let (tx, rx) = crossbeam_channel::bounded(0);
//! std::thread::spawn(move || capturer.capture(cancel, tx));
//! for event in rx.iter() {
//!     match event {
//!         CaptureEvent::Transaction(txn) => println!("{}", txn),
//!         CaptureEvent::Error(err) => eprintln!("{}", err),
//!     }
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod capture;
pub mod config;
pub mod conntrack;
pub mod errors;
pub mod protocols;
pub mod runtime;
pub mod subscription;

pub use crate::config::{load_config, CaptureConfig};
pub use crate::errors::{CaptureError, ErrorKind, SetupError};
pub use crate::runtime::{Backend, CancelToken, Capturer};
pub use crate::subscription::{CaptureEvent, Transaction};
