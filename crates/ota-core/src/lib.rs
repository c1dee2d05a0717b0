//! ota-core: OTA firmware-update client for constrained wireless nodes.
//!
//! Implements the client side of a block-oriented firmware distribution
//! protocol over lossy mesh links: server discovery, image negotiation,
//! unicast and multicast download, streaming reassembly of the image
//! container, integrity validation and the hand-off to the bootloader.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: command codes, statuses, wire message codecs
//! - **Image**: the firmware container format (header + sub-elements)
//! - **Session**: the per-attempt record, state enums, reassembly helpers
//! - **Client**: the event-driven state machine
//! - **Transport / Storage / Timer**: collaborator traits with
//!   production (UDP, file, thread) and mock implementations
//! - **Events**: the event-loop input type and an observer surface
//!
//! # Example
//!
//! ```no_run
//! use std::sync::mpsc;
//! use ota_core::{ClientConfig, FileStore, OtaClient, ThreadTimer, UdpTransport};
//!
//! let (tx, rx) = mpsc::channel();
//! let transport = UdpTransport::bind("[::]:5683".parse().unwrap(), tx.clone()).unwrap();
//! let store = FileStore::new("./ota-store", 4 * 1024 * 1024);
//! let timer = ThreadTimer::new(tx);
//!
//! let mut client = OtaClient::new(ClientConfig::default(), transport, store, timer);
//! client.init().unwrap();
//! client.start_discovery().unwrap();
//! client.run(&rx).unwrap();
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod image;
pub mod protocol;
pub mod session;
pub mod signature;
pub mod storage;
pub mod timer;
pub mod transport;

// Re-exports for convenience
pub use client::{OtaClient, Outcome};
pub use config::ClientConfig;
pub use error::OtaError;
pub use events::{Event, NullObserver, OtaEvent, OtaObserver, TimerToken, TracingObserver};
pub use image::{ImageHeader, SubElementHeader};
pub use protocol::{FileStatus, TransferType};
pub use session::{BlockReqState, MulticastState, Session, SessionState};
pub use signature::ImageSignature;
pub use storage::{FileStore, ImageStore, MemoryStore, StoreError};
pub use timer::{MockTimer, ThreadTimer, TimerService};
pub use transport::{MockTransport, Transport, TransportError, UdpTransport};
