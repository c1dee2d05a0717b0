//! Event types for the client loop, plus the observer surface for UIs.
//!
//! All inbound stimulus reaches the client as an [`Event`] on a single
//! channel: transport callbacks and timer expiry alike. The observer
//! side decouples status display (CLI, LEDs, a TUI) from protocol logic.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::FileStatus;

/// Reason a one-shot timer was armed. Carried back on expiry so the
/// client knows which delayed action to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerToken {
    /// Transmit the next protocol request. `immediate` distinguishes the
    /// jitter-delay phase (false) from the actual transmit phase (true).
    SendNext { immediate: bool },
    /// No valid response arrived in time; escalate.
    DeclareError,
    /// Multicast receive-phase silence ran out.
    MulticastWait,
    /// Server-scheduled switch-over into the new image.
    Reboot,
}

/// One unit of work for the client loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// Inbound message on the request/response path.
    Control { src: SocketAddr, payload: Vec<u8> },
    /// Inbound datagram on the bulk block socket.
    Datagram { src: SocketAddr, payload: Vec<u8> },
    /// A timer armed with `start_once` expired.
    Timer(TimerToken),
}

/// Session phases reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaPhase {
    Idle,
    ServerDiscovery,
    QueryImage,
    Download,
    Reboot,
    Fault,
}

impl fmt::Display for OtaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaPhase::Idle => write!(f, "Idle"),
            OtaPhase::ServerDiscovery => write!(f, "Server Discovery"),
            OtaPhase::QueryImage => write!(f, "Query Image"),
            OtaPhase::Download => write!(f, "Download"),
            OtaPhase::Reboot => write!(f, "Reboot"),
            OtaPhase::Fault => write!(f, "Fault"),
        }
    }
}

/// Events emitted by the OTA client.
#[derive(Debug, Clone)]
pub enum OtaEvent {
    /// A server was locked for this session.
    ServerLocked { addr: SocketAddr },
    /// Session phase changed.
    PhaseChanged { from: OtaPhase, to: OtaPhase },
    /// A download attempt began.
    DownloadStarted { file_version: u32, file_size: u32 },
    /// Download progress in bytes of the image file.
    Progress { offset: u32, total: u32 },
    /// The image was validated and committed.
    ImageCommitted,
    /// The session was torn down with the given report status.
    Aborted { status: FileStatus },
    /// Reboot into the new image is scheduled.
    RebootScheduled { delay: Duration },
}

/// Observer trait for receiving OTA client events.
pub trait OtaObserver: Send + Sync {
    fn on_event(&self, event: &OtaEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl OtaObserver for NullObserver {
    fn on_event(&self, _event: &OtaEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl OtaObserver for TracingObserver {
    fn on_event(&self, event: &OtaEvent) {
        match event {
            OtaEvent::ServerLocked { addr } => {
                tracing::info!(server = %addr, "Update server locked");
            }
            OtaEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            OtaEvent::DownloadStarted {
                file_version,
                file_size,
            } => {
                tracing::info!(version = file_version, size = file_size, "Download started");
            }
            OtaEvent::Progress { offset, total } => {
                let pct = if *total > 0 {
                    (*offset as u64 * 100) / *total as u64
                } else {
                    0
                };
                tracing::debug!(offset = offset, total = total, progress = %format!("{pct}%"), "Progress");
            }
            OtaEvent::ImageCommitted => {
                tracing::info!("Image validated and committed");
            }
            OtaEvent::Aborted { status } => {
                tracing::warn!(status = ?status, "Session aborted");
            }
            OtaEvent::RebootScheduled { delay } => {
                tracing::info!(delay_ms = delay.as_millis() as u64, "Reboot scheduled");
            }
        }
    }
}
