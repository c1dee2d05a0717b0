//! OTA client state machine.
//!
//! Single-threaded and event-driven: inbound messages and timer expiries
//! arrive as [`Event`]s on one channel, every handler runs to completion,
//! and exactly one timer is outstanding at any time. Stale timer fires
//! land in handlers that re-validate session state before acting.

mod download;
mod handlers;
mod multicast;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::events::{Event, OtaEvent, OtaObserver, OtaPhase, TimerToken, TracingObserver};
use crate::error::OtaError;
use crate::protocol::{
    self, BlockReq, FileStatus, QueryImageReq, ServerDiscovery, TransferType, UpgradeEndReq,
};
use crate::session::{BlockReqState, FaultKind, MulticastState, Session, SessionState};
use crate::storage::ImageStore;
use crate::timer::TimerService;
use crate::transport::Transport;

/// Why the event loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The reboot timer fired; the caller should restart into the new image.
    Reboot,
    /// The event channel closed.
    Stopped,
}

/// The OTA download client. Owns the session record and all collaborator
/// handles; there is no other accessor context.
pub struct OtaClient<T: Transport, S: ImageStore, W: TimerService> {
    config: ClientConfig,
    transport: T,
    store: S,
    timer: W,
    observer: Arc<dyn OtaObserver>,
    session: Session,
}

impl<T: Transport, S: ImageStore, W: TimerService> OtaClient<T, S, W> {
    pub fn new(config: ClientConfig, transport: T, store: S, timer: W) -> Self {
        Self::with_observer(config, transport, store, timer, Arc::new(TracingObserver))
    }

    pub fn with_observer(
        config: ClientConfig,
        transport: T,
        store: S,
        timer: W,
        observer: Arc<dyn OtaObserver>,
    ) -> Self {
        Self {
            config,
            transport,
            store,
            timer,
            observer,
            session: Session::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    #[cfg(test)]
    pub(crate) fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn timer(&self) -> &W {
        &self.timer
    }

    pub fn timer_mut(&mut self) -> &mut W {
        &mut self.timer
    }

    /// Bring the client up: claim the timer slot, initialize the store
    /// and make the session ready for a download.
    pub fn init(&mut self) -> Result<(), OtaError> {
        if self.session.state != SessionState::NotInit {
            return Err(OtaError::AlreadyStarted);
        }
        if !self.timer.reserve() {
            return Err(OtaError::NoTimers);
        }
        self.store.init()?;
        self.session.reset();
        info!("OTA client initialized");
        Ok(())
    }

    /// Begin looking for an update server. If one is already known the
    /// session skips straight to querying it for an image. The first
    /// request goes out after a random delay so a fleet of nodes woken by
    /// the same broadcast does not all transmit at once.
    pub fn start_discovery(&mut self) -> Result<(), OtaError> {
        match self.session.state {
            SessionState::Idle | SessionState::ServerDiscovery => {
                let next = if self.session.server.is_some() {
                    SessionState::QueryImage
                } else {
                    SessionState::ServerDiscovery
                };
                self.goto_state(next);
                let delay_ms =
                    rand::thread_rng().gen_range(0..=protocol::DISCOVERY_MIN_DELAY_MS);
                self.timer.start_once(
                    Duration::from_millis(delay_ms),
                    TimerToken::SendNext { immediate: false },
                );
                Ok(())
            }
            _ => Err(OtaError::AlreadyStarted),
        }
    }

    /// Pre-seed the server address, e.g. from network data.
    pub fn set_server(&mut self, addr: SocketAddr) {
        self.session.server = Some(addr);
    }

    /// Drive the client until it reboots or the channel closes. Fatal
    /// errors (unrecoverable flash failure) propagate out.
    pub fn run(&mut self, rx: &Receiver<Event>) -> Result<Outcome, OtaError> {
        loop {
            match rx.recv() {
                Ok(event) => {
                    if let Some(outcome) = self.handle_event(event)? {
                        return Ok(outcome);
                    }
                }
                Err(_) => return Ok(Outcome::Stopped),
            }
        }
    }

    /// Process one event. Returns an outcome when the loop should stop.
    pub fn handle_event(&mut self, event: Event) -> Result<Option<Outcome>, OtaError> {
        match event {
            Event::Control { src, payload } => {
                self.on_control(src, &payload)?;
                Ok(None)
            }
            Event::Datagram { src, payload } => {
                self.on_datagram(src, &payload)?;
                Ok(None)
            }
            Event::Timer(token) => self.on_timer(token),
        }
    }

    fn on_control(&mut self, src: SocketAddr, payload: &[u8]) -> Result<(), OtaError> {
        let Some(&cmd) = payload.first() else {
            return Ok(());
        };
        // Packets from anyone but the locked server are dropped without
        // touching session state or the pending timer. Before a server is
        // locked, only an ImageNotify may start a session, and not while
        // a fault is being reported.
        match self.session.server {
            Some(server) if server.ip() != src.ip() => {
                debug!(src = %src, "dropping packet from unexpected source");
                return Ok(());
            }
            None if cmd != protocol::CMD_IMAGE_NOTIFY || self.session.state.is_fault() => {
                debug!(cmd = cmd, "dropping packet, no server locked");
                return Ok(());
            }
            _ => {}
        }

        self.timer.stop();
        let result = match cmd {
            protocol::CMD_IMAGE_NOTIFY => self.on_image_notify(src, payload),
            protocol::CMD_QUERY_IMAGE_RSP => self.on_query_image_rsp(src, payload),
            protocol::CMD_BLOCK_RSP => self.on_block_rsp(payload),
            protocol::CMD_UPGRADE_END_RSP => self.on_upgrade_end_rsp(payload),
            other => {
                debug!(cmd = other, "unhandled command");
                self.send_next(false);
                Ok(())
            }
        };

        match result {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                debug!(error = %e, "handler failed, arming declare-error timer");
                self.timer.start_once(
                    Duration::from_millis(protocol::DECLARE_ERROR_DELAY_MS),
                    TimerToken::DeclareError,
                );
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn on_datagram(&mut self, src: SocketAddr, payload: &[u8]) -> Result<(), OtaError> {
        if payload.first() != Some(&protocol::CMD_BLOCK_RSP) {
            return Ok(());
        }
        let Some(server) = self.session.server else {
            return Ok(());
        };
        if server.ip() != src.ip() {
            debug!(src = %src, "dropping block datagram from unexpected source");
            return Ok(());
        }
        self.timer.stop();
        match self.on_block_rsp(payload) {
            Err(e) if e.is_fatal() => Err(e),
            _ => Ok(()),
        }
    }

    fn on_timer(&mut self, token: TimerToken) -> Result<Option<Outcome>, OtaError> {
        match token {
            TimerToken::SendNext { immediate } => {
                self.send_next(immediate);
                Ok(None)
            }
            TimerToken::DeclareError => {
                self.on_declare_error();
                Ok(None)
            }
            TimerToken::MulticastWait => {
                self.on_multicast_wait();
                Ok(None)
            }
            TimerToken::Reboot => {
                if self.session.state == SessionState::Reboot {
                    info!("reboot timer fired, handing over to the new image");
                    Ok(Some(Outcome::Reboot))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// No valid response arrived in time. Count the failure, resend, and
    /// give up once the ceiling is crossed.
    fn on_declare_error(&mut self) {
        if self.session.state == SessionState::Idle {
            self.abort_session();
        } else if self.session.retries > self.config.max_retries {
            self.abort_with_report();
        } else {
            self.session.retries += 1;
            self.send_next(false);
        }
    }

    /// Central outbound dispatcher: maps session state to the next
    /// protocol message. Suppressed while passively receiving a multicast
    /// stream, where the client must stay quiet.
    pub(crate) fn send_next(&mut self, immediate: bool) {
        let allowed = self.session.transfer == TransferType::Unicast
            || (self.session.transfer == TransferType::Multicast
                && self.session.multicast_state == MulticastState::SyncChunks)
            || self.session.state.is_fault();
        if !allowed {
            return;
        }

        let mut scheduled = true;
        match self.session.state {
            SessionState::ServerDiscovery => {
                let msg = ServerDiscovery {
                    manufacturer_code: self.config.manufacturer_code,
                    image_type: self.config.image_type,
                }
                .encode();
                let dest = self.config.discovery_addr;
                self.send_control(dest, &msg);
            }
            SessionState::QueryImage => {
                if immediate {
                    let msg = QueryImageReq {
                        manufacturer_code: self.config.manufacturer_code,
                        image_type: self.config.image_type,
                        file_version: self.config.current_file_version,
                        hardware_version: self.config.hardware_version,
                    }
                    .encode();
                    if let Some(dest) = self.server_control_addr() {
                        self.send_control(dest, &msg);
                    }
                } else {
                    self.arm_jittered_send();
                }
            }
            SessionState::BlockReq => {
                if self.session.block_state == BlockReqState::ValidateSignature
                    && self.session.accum.remaining() == 0
                {
                    self.send_upgrade_end();
                } else if immediate {
                    self.send_block_req();
                } else {
                    self.arm_jittered_send();
                }
            }
            SessionState::Reboot | SessionState::Fault(_) => {
                self.send_upgrade_end();
            }
            SessionState::Idle | SessionState::NotInit => {
                scheduled = false;
            }
        }

        if scheduled && !self.timer.is_active() && !self.timer.is_pending() {
            self.timer.start_once(
                Duration::from_millis(protocol::DECLARE_ERROR_DELAY_MS),
                TimerToken::DeclareError,
            );
        }
    }

    fn send_block_req(&mut self) {
        let max_data_size = if self.session.transfer == TransferType::Multicast {
            self.session.fragment_size
        } else {
            self.config.max_block_size
        };
        let msg = BlockReq {
            manufacturer_code: self.config.manufacturer_code,
            image_type: self.config.image_type,
            file_version: self.session.download_version,
            file_offset: self.session.file_offset,
            max_data_size,
        }
        .encode();
        if let Some(server) = self.session.server {
            let dest = SocketAddr::new(server.ip(), self.session.download_port);
            if let Err(e) = self.transport.send_block(dest, &msg) {
                warn!(error = %e, "block request send failed");
            }
        }
    }

    /// Report the end of the session to the server. The status depends on
    /// where the session stands; fault states tear the session down after
    /// reporting.
    pub(crate) fn send_upgrade_end(&mut self) {
        let mut back_to_idle = false;
        let status = match self.session.state {
            SessionState::Reboot => FileStatus::Success,
            SessionState::BlockReq
                if self.session.block_state == BlockReqState::ValidateSignature =>
            {
                back_to_idle = true;
                FileStatus::InvalidImage
            }
            SessionState::Fault(kind) => fault_status(kind),
            _ => FileStatus::Abort,
        };
        let msg = UpgradeEndReq {
            status,
            manufacturer_code: self.config.manufacturer_code,
            image_type: self.config.image_type,
            file_version: self.session.download_version,
        }
        .encode();
        if let Some(dest) = self.server_control_addr() {
            self.send_control(dest, &msg);
        }
        if self.session.state.is_fault() {
            self.abort_session();
        } else if back_to_idle {
            self.goto_state(SessionState::Idle);
        }
    }

    /// Schedule the next attempt after a busy response, or tear the
    /// session down for every other non-success status.
    pub(crate) fn prepare_next(&mut self, status: FileStatus, delay_ms: u64) {
        if status == FileStatus::ServerBusy {
            self.timer.start_once(
                Duration::from_millis(delay_ms),
                TimerToken::SendNext { immediate: false },
            );
        } else if status != FileStatus::Success {
            self.abort_session();
        }
    }

    /// Report the abort and reset. Used when the retry ceiling is crossed.
    pub(crate) fn abort_with_report(&mut self) {
        self.send_upgrade_end();
        if self.session.state != SessionState::Idle {
            self.abort_session();
        }
    }

    /// The single teardown: every owned buffer, the staged image and the
    /// block socket go; the session returns to `Idle`.
    pub(crate) fn abort_session(&mut self) {
        let status = match self.session.state {
            SessionState::Fault(kind) => fault_status(kind),
            _ => FileStatus::Abort,
        };
        self.observer.on_event(&OtaEvent::Aborted { status });
        self.session.reset();
        self.transport.close_block_socket();
        self.store.cancel_image();
    }

    pub(crate) fn goto_state(&mut self, new: SessionState) {
        if self.session.state == new {
            return;
        }
        info!(from = %self.session.state, to = %new, "state transition");
        let from = phase_of(self.session.state);
        let to = phase_of(new);
        self.session.state = new;
        if from != to {
            self.observer.on_event(&OtaEvent::PhaseChanged { from, to });
        }
    }

    pub(crate) fn emit(&self, event: OtaEvent) {
        self.observer.on_event(&event);
    }

    fn server_control_addr(&self) -> Option<SocketAddr> {
        self.session
            .server
            .map(|s| SocketAddr::new(s.ip(), self.config.server_control_port))
    }

    fn send_control(&mut self, dest: SocketAddr, payload: &[u8]) {
        if let Err(e) = self
            .transport
            .send_request(dest, protocol::OTA_SERVER_URI, payload)
        {
            warn!(error = %e, dest = %dest, "request send failed");
        }
    }

    fn arm_jittered_send(&mut self) {
        let delay = self.jitter();
        self.timer
            .start_once(delay, TimerToken::SendNext { immediate: true });
    }

    /// Per-state transmit delay, randomized to spread load across nodes.
    fn jitter(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let ms = match self.session.state {
            SessionState::QueryImage => {
                rng.gen_range(protocol::QUERY_MIN_DELAY_MS..=protocol::QUERY_MAX_DELAY_MS)
            }
            SessionState::ServerDiscovery => {
                rng.gen_range(protocol::DISCOVERY_MIN_DELAY_MS..=protocol::DISCOVERY_MAX_DELAY_MS)
            }
            SessionState::BlockReq => {
                rng.gen_range(protocol::BLOCK_MIN_DELAY_MS..=protocol::BLOCK_MAX_DELAY_MS)
            }
            _ => rng.gen_range(protocol::NEXT_REQ_MIN_DELAY_MS..=protocol::NEXT_REQ_MAX_DELAY_MS),
        };
        Duration::from_millis(ms)
    }

    pub(crate) fn arm_multicast_wait(&mut self) {
        let ms = rand::thread_rng().gen_range(
            protocol::MULTICAST_WAIT_MS
                ..=protocol::MULTICAST_WAIT_MS + protocol::MULTICAST_WAIT_JITTER_MS,
        );
        self.timer
            .start_once(Duration::from_millis(ms), TimerToken::MulticastWait);
    }

    /// Receive-phase silence ran out: switch to explicit block requests
    /// for the fragments still missing.
    fn on_multicast_wait(&mut self) {
        if self.session.transfer != TransferType::Multicast
            || self.session.state != SessionState::BlockReq
            || self.session.multicast_state != MulticastState::ReceiveImage
        {
            return;
        }
        let resume = self
            .session
            .chunk_bitmask
            .first_clear_in(0, self.session.chunk_total)
            .unwrap_or(0);
        self.session.multicast_state = MulticastState::SyncChunks;
        self.session.file_offset = resume as u32 * self.session.fragment_size as u32;
        info!(fragment = resume, "multicast stream lapsed, resyncing");
        self.send_next(false);
    }
}

fn phase_of(state: SessionState) -> OtaPhase {
    match state {
        SessionState::NotInit | SessionState::Idle => OtaPhase::Idle,
        SessionState::ServerDiscovery => OtaPhase::ServerDiscovery,
        SessionState::QueryImage => OtaPhase::QueryImage,
        SessionState::BlockReq => OtaPhase::Download,
        SessionState::Reboot => OtaPhase::Reboot,
        SessionState::Fault(_) => OtaPhase::Fault,
    }
}

fn fault_status(kind: FaultKind) -> FileStatus {
    match kind {
        FaultKind::Generic => FileStatus::ClientError,
        FaultKind::Operation => FileStatus::InvalidOperation,
        FaultKind::Parameter => FileStatus::InvalidParameter,
        FaultKind::Flash => FileStatus::FlashError,
        FaultKind::Image => FileStatus::ImageTooLarge,
        FaultKind::Integrity => FileStatus::InvalidImage,
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::image::{
        HEADER_SIZE, ImageHeader, SubElementHeader, TAG_CRC, TAG_SECTOR_BITMAP, TAG_UPGRADE_IMAGE,
    };
    use crate::signature::ImageSignature;
    use crate::storage::MemoryStore;
    use crate::timer::MockTimer;
    use crate::transport::MockTransport;

    pub(crate) type TestClient = OtaClient<MockTransport, MemoryStore, MockTimer>;

    pub(crate) fn server_addr() -> SocketAddr {
        "10.0.0.1:5683".parse().unwrap()
    }

    pub(crate) fn make_client() -> TestClient {
        let config = ClientConfig {
            current_file_version: 3,
            max_block_size: 2048,
            ..ClientConfig::default()
        };
        let mut client = OtaClient::with_observer(
            config,
            MockTransport::new(),
            MemoryStore::new(),
            MockTimer::new(),
            Arc::new(crate::events::NullObserver),
        );
        client.init().unwrap();
        client
    }

    /// Encode a complete image file: header, upgrade-image payload,
    /// sector bitmap, trailing CRC sub-element.
    pub(crate) fn build_image(version: u32, payload: &[u8], bitmap: &[u8]) -> Vec<u8> {
        build_image_with_extra(version, payload, bitmap, None)
    }

    /// Same, with an optional unknown sub-element inserted before the CRC.
    pub(crate) fn build_image_with_extra(
        version: u32,
        payload: &[u8],
        bitmap: &[u8],
        extra: Option<(u16, &[u8])>,
    ) -> Vec<u8> {
        let config = ClientConfig::default();
        let body_len = HEADER_SIZE
            + 6
            + payload.len()
            + 6
            + bitmap.len()
            + extra.map_or(0, |(_, d)| 6 + d.len());
        let total = body_len + 6 + 4;

        let header = ImageHeader {
            identifier: crate::image::FILE_IDENTIFIER,
            header_version: 0x0100,
            header_length: HEADER_SIZE as u16,
            field_control: 0,
            manufacturer_code: config.manufacturer_code,
            image_type: config.image_type,
            file_version: version,
            stack_version: 2,
            header_string: [0u8; 32],
            total_image_size: total as u32,
        };

        let mut file = header.encode();
        file.extend_from_slice(
            &SubElementHeader {
                tag: TAG_UPGRADE_IMAGE,
                length: payload.len() as u32,
            }
            .encode(),
        );
        file.extend_from_slice(payload);
        file.extend_from_slice(
            &SubElementHeader {
                tag: TAG_SECTOR_BITMAP,
                length: bitmap.len() as u32,
            }
            .encode(),
        );
        file.extend_from_slice(bitmap);
        if let Some((tag, data)) = extra {
            file.extend_from_slice(
                &SubElementHeader {
                    tag,
                    length: data.len() as u32,
                }
                .encode(),
            );
            file.extend_from_slice(data);
        }
        let crc = ImageSignature::checksum(&file);
        file.extend_from_slice(
            &SubElementHeader {
                tag: TAG_CRC,
                length: 4,
            }
            .encode(),
        );
        file.extend_from_slice(&crc.to_le_bytes());
        file
    }
}
