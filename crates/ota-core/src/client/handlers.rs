//! Inbound message handlers.
//!
//! Each handler validates session-state applicability, then the payload
//! fields, then advances the session and schedules the next action. A
//! returned error makes the dispatcher arm the declare-error timer; the
//! retry counter is only ever reset by a state-advancing success or a
//! server-busy response.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, info};

use super::OtaClient;
use crate::error::OtaError;
use crate::events::{OtaEvent, TimerToken};
use crate::protocol::{
    BlockBody, BlockRsp, FileStatus, ImageNotify, QueryImageBody, QueryImageRsp, TransferType,
    UpgradeEndBody, UpgradeEndRsp,
};
use crate::session::{BlockReqState, MulticastState, SessionState};
use crate::storage::ImageStore;
use crate::timer::TimerService;
use crate::transport::Transport;

impl<T: Transport, S: ImageStore, W: TimerService> OtaClient<T, S, W> {
    /// A server announced an image. Locks the server and either queries
    /// it (unicast) or arms the multicast receive phase.
    pub(super) fn on_image_notify(
        &mut self,
        src: SocketAddr,
        payload: &[u8],
    ) -> Result<(), OtaError> {
        if !matches!(
            self.session.state,
            SessionState::Idle | SessionState::ServerDiscovery
        ) {
            return Err(OtaError::NotPermitted);
        }
        let notify = match ImageNotify::parse(payload) {
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "ignoring malformed image notify");
                return Ok(());
            }
        };
        if notify.image_type != self.config.image_type
            || notify.manufacturer_code != self.config.manufacturer_code
            || notify.file_version == self.config.current_file_version
        {
            debug!(
                version = notify.file_version,
                "image notify does not apply to this node"
            );
            return Ok(());
        }

        info!(version = notify.file_version, transfer = ?notify.transfer_type, "image offered");
        self.goto_state(SessionState::QueryImage);
        self.session.file_length = notify.file_size;
        self.session.server = Some(src);
        self.session.download_port = notify.server_port;
        self.session.transfer = notify.transfer_type;
        self.emit(OtaEvent::ServerLocked { addr: src });

        match notify.transfer_type {
            TransferType::Multicast => self.begin_multicast(&notify),
            TransferType::Unicast => {
                self.send_next(false);
                Ok(())
            }
        }
    }

    /// The server answered our image query: start the block download, or
    /// wait out a busy period, or fold the session.
    pub(super) fn on_query_image_rsp(
        &mut self,
        src: SocketAddr,
        payload: &[u8],
    ) -> Result<(), OtaError> {
        if self.session.state != SessionState::QueryImage {
            return Err(OtaError::NotPermitted);
        }
        let rsp = QueryImageRsp::parse(payload)?;
        match rsp.status {
            FileStatus::Success => {
                let QueryImageBody::Success {
                    manufacturer_code,
                    image_type,
                    file_version,
                    file_size,
                    server_port,
                } = rsp.body
                else {
                    return Err(OtaError::InvalidParameter);
                };
                if manufacturer_code != self.config.manufacturer_code
                    || image_type != self.config.image_type
                {
                    return Err(OtaError::Failed);
                }
                self.transport.open_block_socket(self.config.download_port)?;
                self.session.file_offset = 0;
                self.session.download_version = file_version;
                self.session.file_length = file_size;
                self.session.server = Some(src);
                self.session.download_port = server_port;
                self.goto_state(SessionState::BlockReq);
                self.session.block_state = BlockReqState::StartDownload;
                self.emit(OtaEvent::DownloadStarted {
                    file_version,
                    file_size,
                });
                self.send_next(false);
                Ok(())
            }
            FileStatus::ServerBusy => {
                self.session.retries = 0;
                let delay = match rsp.body {
                    QueryImageBody::Wait(hint) => {
                        hint.request_time.saturating_sub(hint.current_time) as u64
                    }
                    _ => 0,
                };
                self.prepare_next(FileStatus::ServerBusy, delay);
                Ok(())
            }
            status => {
                // No image, abort, wait-for-data: nothing to download now.
                self.prepare_next(status, 0);
                Ok(())
            }
        }
    }

    /// One block of image data arrived. Validates accounting, then feeds
    /// the payload to the stream parser or the multicast reassembler.
    pub(super) fn on_block_rsp(&mut self, payload: &[u8]) -> Result<(), OtaError> {
        let mut result: Result<(), OtaError> = Ok(());

        if self.session.state != SessionState::BlockReq {
            self.session.retries += 1;
            result = Err(OtaError::InvalidParameter);
        } else {
            match BlockRsp::parse(payload) {
                Err(e) => {
                    self.session.retries += 1;
                    result = Err(e.into());
                }
                Ok(rsp) if rsp.status != FileStatus::Success => {
                    self.session.retries += 1;
                    let mut delay = 0;
                    if rsp.status == FileStatus::ServerBusy {
                        self.session.retries = 0;
                        if let BlockBody::Wait(hint) = rsp.body {
                            delay = hint.request_time.saturating_sub(hint.current_time) as u64;
                        }
                    }
                    if self.session.retries <= self.config.max_retries {
                        self.prepare_next(rsp.status, delay);
                    }
                }
                Ok(rsp) => {
                    result = self.apply_block(rsp)?;
                }
            }
        }

        if self.session.retries > self.config.max_retries {
            self.abort_with_report();
            return Err(OtaError::Failed);
        }
        if result.is_err() {
            self.send_next(false);
        }
        result
    }

    /// Success-status half of `on_block_rsp`. The outer `Result` carries
    /// only fatal errors; the inner one feeds the retry bookkeeping.
    fn apply_block(&mut self, rsp: BlockRsp) -> Result<Result<(), OtaError>, OtaError> {
        let BlockBody::Success {
            file_offset,
            file_version,
            data,
        } = rsp.body
        else {
            self.session.retries += 1;
            return Ok(Err(OtaError::InvalidParameter));
        };

        if file_version != self.session.download_version {
            self.session.retries += 1;
            return Ok(Err(OtaError::InvalidParameter));
        }

        let strict = self.session.transfer == TransferType::Unicast
            || self.session.multicast_state == MulticastState::SyncChunks;
        if strict
            && (file_offset != self.session.file_offset
                || data.len() as u32 > self.requested_block_size()
                || file_offset + data.len() as u32 > self.session.file_length)
        {
            debug!(
                got = file_offset,
                want = self.session.file_offset,
                len = data.len(),
                "block accounting mismatch"
            );
            self.session.retries += 1;
            return Ok(Err(OtaError::InvalidParameter));
        }

        let processed = if self.session.transfer == TransferType::Multicast {
            self.process_multicast_block(file_offset, &data)
        } else {
            self.process_block(&data)
        };
        match processed {
            Ok(()) => {
                self.session.retries = 0;
                self.emit(OtaEvent::Progress {
                    offset: self.session.file_offset,
                    total: self.session.file_length,
                });
                Ok(Ok(()))
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.session.retries += 1;
                Ok(Err(e))
            }
        }
    }

    fn requested_block_size(&self) -> u32 {
        if self.session.transfer == TransferType::Multicast {
            self.session.fragment_size as u32
        } else {
            self.config.max_block_size as u32
        }
    }

    /// The server acknowledged the end of the download. An abort status
    /// is honored immediately whatever the session is doing; a success
    /// schedules the reboot.
    pub(super) fn on_upgrade_end_rsp(&mut self, payload: &[u8]) -> Result<(), OtaError> {
        let rsp = UpgradeEndRsp::parse(payload)?;

        if rsp.status == FileStatus::Abort {
            info!("server aborted the session");
            self.abort_session();
            return Err(OtaError::Failed);
        }
        if self.session.state != SessionState::Reboot {
            self.send_next(false);
            return Err(OtaError::InvalidParameter);
        }

        match rsp.status {
            FileStatus::Success => {
                let UpgradeEndBody::Success {
                    upgrade_time,
                    current_time,
                } = rsp.body
                else {
                    return Err(OtaError::InvalidParameter);
                };
                let delay = Duration::from_millis(upgrade_time.saturating_sub(current_time) as u64);
                self.store.set_new_image_flag();
                self.emit(OtaEvent::RebootScheduled { delay });
                // This timer must outlive any transition into low power;
                // the timer service owns that guarantee.
                self.timer.start_once(delay, TimerToken::Reboot);
                Ok(())
            }
            status => {
                self.session.retries += 1;
                let mut delay = 0;
                if status == FileStatus::ServerBusy {
                    self.session.retries = 0;
                    if let UpgradeEndBody::Wait(hint) = rsp.body {
                        delay = hint.request_time.saturating_sub(hint.current_time) as u64;
                    }
                }
                if self.session.retries <= self.config.max_retries {
                    self.prepare_next(status, delay);
                    Ok(())
                } else {
                    self.abort_with_report();
                    Err(OtaError::Failed)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::events::Event;
    use crate::protocol::{self, WaitHint};

    fn control(payload: Vec<u8>) -> Event {
        Event::Control {
            src: server_addr(),
            payload,
        }
    }

    fn notify(version: u32, transfer_type: TransferType) -> ImageNotify {
        ImageNotify {
            manufacturer_code: 0x1037,
            image_type: 0x0001,
            file_version: version,
            file_size: 256,
            image_size: 128,
            fragment_size: 64,
            transfer_type,
            server_port: 61631,
        }
    }

    fn query_success(version: u32, file_size: u32) -> Vec<u8> {
        QueryImageRsp {
            status: FileStatus::Success,
            body: QueryImageBody::Success {
                manufacturer_code: 0x1037,
                image_type: 0x0001,
                file_version: version,
                file_size,
                server_port: 61631,
            },
        }
        .encode()
    }

    /// Drive a fresh client into BlockReq via notify + query response.
    fn start_unicast_download(client: &mut TestClient, version: u32, file_size: u32) {
        client
            .handle_event(control(notify(version, TransferType::Unicast).encode()))
            .unwrap();
        client
            .handle_event(control(query_success(version, file_size)))
            .unwrap();
        assert_eq!(client.session().state, SessionState::BlockReq);
    }

    #[test]
    fn test_image_notify_newer_version_starts_query() {
        let mut client = make_client();
        client
            .handle_event(control(notify(5, TransferType::Unicast).encode()))
            .unwrap();
        let session = client.session();
        assert_eq!(session.state, SessionState::QueryImage);
        assert_eq!(session.server, Some(server_addr()));
        assert_eq!(session.download_port, 61631);
        // The query request waits behind the jitter timer.
        let (_, token) = client.timer().armed.unwrap();
        assert_eq!(token, TimerToken::SendNext { immediate: true });

        let token = client.timer_mut().fire().unwrap();
        client.handle_event(Event::Timer(token)).unwrap();
        assert_eq!(
            client.transport().last_request_cmd(),
            Some(protocol::CMD_QUERY_IMAGE_REQ)
        );
    }

    #[test]
    fn test_image_notify_running_version_ignored() {
        let mut client = make_client();
        client
            .handle_event(control(notify(3, TransferType::Unicast).encode()))
            .unwrap();
        assert_eq!(client.session().state, SessionState::Idle);
        assert!(client.session().server.is_none());
    }

    #[test]
    fn test_image_notify_wrong_identity_ignored() {
        let mut client = make_client();
        let mut n = notify(5, TransferType::Unicast);
        n.manufacturer_code = 0x2222;
        client.handle_event(control(n.encode())).unwrap();
        assert_eq!(client.session().state, SessionState::Idle);
    }

    #[test]
    fn test_image_notify_rejected_mid_download() {
        let mut client = make_client();
        start_unicast_download(&mut client, 5, 256);
        client
            .handle_event(control(notify(6, TransferType::Unicast).encode()))
            .unwrap();
        // Session untouched, failure escalated to the declare-error timer.
        assert_eq!(client.session().download_version, 5);
        let (_, token) = client.timer().armed.unwrap();
        assert_eq!(token, TimerToken::DeclareError);
    }

    #[test]
    fn test_query_rsp_success_opens_download() {
        let mut client = make_client();
        client
            .handle_event(control(notify(5, TransferType::Unicast).encode()))
            .unwrap();
        client
            .handle_event(control(query_success(5, 512)))
            .unwrap();
        let session = client.session();
        assert_eq!(session.state, SessionState::BlockReq);
        assert_eq!(session.block_state, BlockReqState::StartDownload);
        assert_eq!(session.download_version, 5);
        assert_eq!(session.file_length, 512);
        assert_eq!(client.transport().socket_port, Some(61630));
    }

    #[test]
    fn test_query_rsp_busy_resets_retries_and_waits() {
        let mut client = make_client();
        client
            .handle_event(control(notify(5, TransferType::Unicast).encode()))
            .unwrap();
        client.session_mut().retries = 7;
        let rsp = QueryImageRsp {
            status: FileStatus::ServerBusy,
            body: QueryImageBody::Wait(WaitHint {
                request_time: 5000,
                current_time: 1000,
            }),
        };
        client.handle_event(control(rsp.encode())).unwrap();
        assert_eq!(client.session().retries, 0);
        let (delay, token) = client.timer().armed.unwrap();
        assert_eq!(token, TimerToken::SendNext { immediate: false });
        assert_eq!(delay, Duration::from_millis(4000));
    }

    #[test]
    fn test_query_rsp_no_image_folds_session() {
        let mut client = make_client();
        client
            .handle_event(control(notify(5, TransferType::Unicast).encode()))
            .unwrap();
        let rsp = QueryImageRsp {
            status: FileStatus::NoImageAvailable,
            body: QueryImageBody::None,
        };
        client.handle_event(control(rsp.encode())).unwrap();
        assert_eq!(client.session().state, SessionState::Idle);
        assert!(client.session().server.is_none());
    }

    #[test]
    fn test_block_rsp_offset_mismatch_counts_retry_writes_nothing() {
        let mut client = make_client();
        start_unicast_download(&mut client, 5, 256);
        let rsp = BlockRsp {
            status: FileStatus::Success,
            body: BlockBody::Success {
                file_offset: 48,
                file_version: 5,
                data: vec![0u8; 16],
            },
        };
        client.handle_event(control(rsp.encode())).unwrap();
        assert_eq!(client.session().retries, 1);
        assert!(!client.store().is_staged());
        assert!(client.store().committed.is_none());
    }

    #[test]
    fn test_block_rsp_version_mismatch_counts_retry() {
        let mut client = make_client();
        start_unicast_download(&mut client, 5, 256);
        let rsp = BlockRsp {
            status: FileStatus::Success,
            body: BlockBody::Success {
                file_offset: 0,
                file_version: 6,
                data: vec![0u8; 16],
            },
        };
        client.handle_event(control(rsp.encode())).unwrap();
        assert_eq!(client.session().retries, 1);
    }

    #[test]
    fn test_block_rsp_overrun_counts_retry() {
        let mut client = make_client();
        start_unicast_download(&mut client, 5, 64);
        let rsp = BlockRsp {
            status: FileStatus::Success,
            body: BlockBody::Success {
                file_offset: 0,
                file_version: 5,
                data: vec![0u8; 80],
            },
        };
        client.handle_event(control(rsp.encode())).unwrap();
        assert_eq!(client.session().retries, 1);
    }

    #[test]
    fn test_block_rsp_busy_resets_retry_counter() {
        let mut client = make_client();
        start_unicast_download(&mut client, 5, 256);
        client.session_mut().retries = 9;
        let rsp = BlockRsp {
            status: FileStatus::ServerBusy,
            body: BlockBody::Wait(WaitHint {
                request_time: 300,
                current_time: 100,
            }),
        };
        client.handle_event(control(rsp.encode())).unwrap();
        assert_eq!(client.session().retries, 0);
        let (delay, token) = client.timer().armed.unwrap();
        assert_eq!(token, TimerToken::SendNext { immediate: false });
        assert_eq!(delay, Duration::from_millis(200));
    }

    #[test]
    fn test_retry_ceiling_aborts_with_report() {
        let mut client = make_client();
        start_unicast_download(&mut client, 5, 256);
        client.session_mut().retries = client.config().max_retries;
        let rsp = BlockRsp {
            status: FileStatus::Success,
            body: BlockBody::Success {
                file_offset: 99,
                file_version: 5,
                data: vec![0u8; 8],
            },
        };
        client.handle_event(control(rsp.encode())).unwrap();

        let (_, _, last) = client.transport().requests.last().unwrap().clone();
        assert_eq!(last[0], protocol::CMD_UPGRADE_END_REQ);
        assert_eq!(last[1], protocol::STATUS_ABORT);
        assert_eq!(client.session().state, SessionState::Idle);
        assert!(!client.transport().block_socket_open());
    }

    #[test]
    fn test_upgrade_end_abort_honored_mid_download() {
        let mut client = make_client();
        start_unicast_download(&mut client, 5, 256);
        let rsp = UpgradeEndRsp {
            status: FileStatus::Abort,
            body: UpgradeEndBody::None,
        };
        client.handle_event(control(rsp.encode())).unwrap();
        assert_eq!(client.session().state, SessionState::Idle);
        assert!(client.session().server.is_none());
        assert!(!client.transport().block_socket_open());
        assert!(client.store().cancels > 0);
    }

    #[test]
    fn test_upgrade_end_success_schedules_reboot() {
        let mut client = make_client();
        start_unicast_download(&mut client, 5, 256);
        client.session_mut().state = SessionState::Reboot;
        let rsp = UpgradeEndRsp {
            status: FileStatus::Success,
            body: UpgradeEndBody::Success {
                upgrade_time: 5_000,
                current_time: 2_000,
            },
        };
        client.handle_event(control(rsp.encode())).unwrap();
        assert!(client.store().new_image_flag);
        let (delay, token) = client.timer().armed.unwrap();
        assert_eq!(token, TimerToken::Reboot);
        assert_eq!(delay, Duration::from_millis(3000));

        let token = client.timer_mut().fire().unwrap();
        let outcome = client.handle_event(Event::Timer(token)).unwrap();
        assert_eq!(outcome, Some(crate::client::Outcome::Reboot));
    }

    #[test]
    fn test_packets_from_other_sources_dropped() {
        let mut client = make_client();
        start_unicast_download(&mut client, 5, 256);
        let stranger: std::net::SocketAddr = "10.0.0.99:5683".parse().unwrap();
        let stops_before = client.timer().stops;
        let rsp = UpgradeEndRsp {
            status: FileStatus::Abort,
            body: UpgradeEndBody::None,
        };
        client
            .handle_event(Event::Control {
                src: stranger,
                payload: rsp.encode(),
            })
            .unwrap();
        // Neither the session nor the pending timer was touched.
        assert_eq!(client.session().state, SessionState::BlockReq);
        assert_eq!(client.timer().stops, stops_before);
    }
}
