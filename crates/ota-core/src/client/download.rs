//! Streaming image parser.
//!
//! Consumes image bytes as they arrive in blocks of arbitrary size and
//! reconstructs the container structure without assuming block
//! boundaries align with structural boundaries. Each sub-state consumes
//! what it can from the current block and reports exactly how many bytes
//! it took, so the outer loop can advance its cursor.

use tracing::{debug, info};

use super::OtaClient;
use crate::error::OtaError;
use crate::image::{
    ImageHeader, SUB_ELEMENT_HEADER_SIZE, SubElementHeader, TAG_CRC, TAG_INTEGRITY_CODE,
    TAG_SECTOR_BITMAP, TAG_UPGRADE_IMAGE,
};
use crate::events::OtaEvent;
use crate::session::{BlockReqState, SessionState};
use crate::storage::ImageStore;
use crate::timer::TimerService;
use crate::transport::Transport;

impl<T: Transport, S: ImageStore, W: TimerService> OtaClient<T, S, W> {
    /// Feed one unicast (or multicast-sync) block through the parser.
    /// Failures escalate to the matching fault state and report to the
    /// server; success requests the next block.
    pub(super) fn process_block(&mut self, data: &[u8]) -> Result<(), OtaError> {
        let result = self.run_parser(data, true);
        match &result {
            Err(e) if e.is_fatal() => {}
            Err(e) => {
                let kind = e.fault_kind();
                debug!(error = %e, fault = ?kind, "block processing failed");
                self.goto_state(SessionState::Fault(kind));
                self.send_upgrade_end();
            }
            Ok(()) => self.send_next(false),
        }
        result
    }

    /// Drive the sub-state machine over one contiguous byte run.
    pub(super) fn run_parser(
        &mut self,
        mut data: &[u8],
        advance_file_offset: bool,
    ) -> Result<(), OtaError> {
        while !data.is_empty() {
            if self.session.state == SessionState::Reboot {
                break;
            }
            let consumed = self.parser_step(data)?;
            data = &data[consumed..];
            if advance_file_offset {
                self.session.file_offset += consumed as u32;
            }
        }
        Ok(())
    }

    fn parser_step(&mut self, data: &[u8]) -> Result<usize, OtaError> {
        match self.session.block_state {
            BlockReqState::StartDownload => self.start_download(data),
            BlockReqState::ProcessHeader => self.process_header(data),
            BlockReqState::UpgradeImage => self.upgrade_image(data),
            BlockReqState::ProcessSubElement => self.process_sub_element(data),
            BlockReqState::SkipSubElement => self.skip_sub_element(data),
            BlockReqState::GetBitmap => self.get_bitmap(data),
            BlockReqState::ValidateSignature => self.validate_signature(data),
            BlockReqState::Idle => Err(OtaError::InvalidOperation),
        }
    }

    /// First bytes of the file: learn the header length, reset the
    /// signature, and start collecting the header. Consumes nothing.
    fn start_download(&mut self, data: &[u8]) -> Result<usize, OtaError> {
        let header_len = ImageHeader::peek_header_length(data)? as usize;
        if header_len < crate::image::HEADER_SIZE {
            return Err(OtaError::InvalidParameter);
        }
        self.session.restart_signature();
        self.session.block_state = BlockReqState::ProcessHeader;
        self.session.accum.begin(header_len);
        Ok(0)
    }

    fn process_header(&mut self, data: &[u8]) -> Result<usize, OtaError> {
        let (consumed, unit) = self.session.accum.step(data);
        if let Some(unit) = unit {
            let bytes = unit.as_slice();
            let header = ImageHeader::parse(bytes)?;
            header.validate(
                self.config.manufacturer_code,
                self.config.image_type,
                self.session.download_version,
            )?;
            self.session.signature.update(bytes);
            self.session.block_state = BlockReqState::ProcessSubElement;
            self.session.accum.begin(SUB_ELEMENT_HEADER_SIZE);
        }
        Ok(consumed)
    }

    /// Image payload streams straight into the persistent store; only
    /// the byte count and signature are tracked here.
    fn upgrade_image(&mut self, data: &[u8]) -> Result<usize, OtaError> {
        if self.session.accum.remaining() > 0 {
            let take = self.session.accum.remaining().min(data.len());
            self.session.signature.update(&data[..take]);
            self.store.push_chunk(&data[..take], None)?;
            self.session.accum.consume_raw(take);
            Ok(take)
        } else {
            self.session.block_state = BlockReqState::ProcessSubElement;
            self.session.accum.begin(SUB_ELEMENT_HEADER_SIZE);
            Ok(0)
        }
    }

    fn process_sub_element(&mut self, data: &[u8]) -> Result<usize, OtaError> {
        let (consumed, unit) = self.session.accum.step(data);
        if let Some(unit) = unit {
            let sub = SubElementHeader::parse(unit.as_slice())?;
            if sub.tag != TAG_CRC && sub.tag != TAG_INTEGRITY_CODE {
                self.session.signature.update(unit.as_slice());
            }
            match sub.tag {
                TAG_UPGRADE_IMAGE => {
                    self.session.block_state = BlockReqState::UpgradeImage;
                    self.store.start_image(sub.length)?;
                }
                TAG_SECTOR_BITMAP => {
                    if sub.length == 0 {
                        return Err(OtaError::InvalidParameter);
                    }
                    self.session.block_state = BlockReqState::GetBitmap;
                }
                TAG_CRC | TAG_INTEGRITY_CODE => {
                    if sub.length == 0 {
                        return Err(OtaError::InvalidParameter);
                    }
                    self.session.block_state = BlockReqState::ValidateSignature;
                }
                other => {
                    debug!(tag = other, length = sub.length, "skipping unknown sub-element");
                    self.session.block_state = BlockReqState::SkipSubElement;
                }
            }
            self.session.accum.begin(sub.length as usize);
        }
        Ok(consumed)
    }

    /// Unknown sub-elements still count into the signature.
    fn skip_sub_element(&mut self, data: &[u8]) -> Result<usize, OtaError> {
        if self.session.accum.remaining() > 0 {
            let take = self.session.accum.remaining().min(data.len());
            self.session.signature.update(&data[..take]);
            self.session.accum.consume_raw(take);
            Ok(take)
        } else {
            self.session.block_state = BlockReqState::ProcessSubElement;
            self.session.accum.begin(SUB_ELEMENT_HEADER_SIZE);
            Ok(0)
        }
    }

    /// The bitmap lives until commit, so it bypasses the scratch buffer
    /// and accumulates in its long-lived allocation.
    fn get_bitmap(&mut self, data: &[u8]) -> Result<usize, OtaError> {
        let target = self.session.accum.target();
        let session = &mut self.session;
        let bitmap = session
            .bitmap
            .get_or_insert_with(|| Vec::with_capacity(target));
        let take = session.accum.remaining().min(data.len());
        bitmap.extend_from_slice(&data[..take]);
        session.accum.consume_raw(take);
        if session.accum.remaining() == 0 {
            session.signature.update(bitmap);
            session.block_state = BlockReqState::ProcessSubElement;
            session.accum.begin(SUB_ELEMENT_HEADER_SIZE);
        }
        Ok(take)
    }

    /// Compare the received integrity code against the running checksum;
    /// a match commits the image, a mismatch discards it.
    fn validate_signature(&mut self, data: &[u8]) -> Result<usize, OtaError> {
        let (consumed, unit) = self.session.accum.step(data);
        if let Some(unit) = unit {
            let bytes = unit.as_slice();
            if bytes.len() != 4 {
                return Err(OtaError::InvalidParameter);
            }
            let received = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let computed = self.session.take_signature();
            if received != computed {
                debug!(
                    received = format!("{received:08X}"),
                    computed = format!("{computed:08X}"),
                    "integrity code mismatch"
                );
                return Err(OtaError::CrcError);
            }
            self.store.commit_image(self.session.bitmap.as_deref())?;
            info!("image integrity verified, committed");
            self.emit(OtaEvent::ImageCommitted);
            self.goto_state(SessionState::Reboot);
        }
        Ok(consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::events::Event;
    use crate::protocol::{
        self, BlockBody, BlockRsp, FileStatus, ImageNotify, QueryImageBody, QueryImageRsp,
        TransferType,
    };

    /// Stand in for the server: deliver `image` over the block socket in
    /// chunks of `chunk` bytes, answering each implied request.
    fn serve_unicast(client: &mut TestClient, image: &[u8], chunk: usize) {
        let version = client.session().download_version;
        let mut offset = 0usize;
        while offset < image.len() {
            if client.session().state != crate::session::SessionState::BlockReq {
                break;
            }
            let end = (offset + chunk).min(image.len());
            let rsp = BlockRsp {
                status: FileStatus::Success,
                body: BlockBody::Success {
                    file_offset: offset as u32,
                    file_version: version,
                    data: image[offset..end].to_vec(),
                },
            };
            client
                .handle_event(Event::Datagram {
                    src: server_addr(),
                    payload: rsp.encode(),
                })
                .unwrap();
            offset = end;
        }
    }

    fn begin_download(client: &mut TestClient, version: u32, file_size: u32) {
        let notify = ImageNotify {
            manufacturer_code: 0x1037,
            image_type: 0x0001,
            file_version: version,
            file_size,
            image_size: 0,
            fragment_size: 0,
            transfer_type: TransferType::Unicast,
            server_port: 61631,
        };
        client
            .handle_event(Event::Control {
                src: server_addr(),
                payload: notify.encode(),
            })
            .unwrap();
        let rsp = QueryImageRsp {
            status: FileStatus::Success,
            body: QueryImageBody::Success {
                manufacturer_code: 0x1037,
                image_type: 0x0001,
                file_version: version,
                file_size,
                server_port: 61631,
            },
        };
        client
            .handle_event(Event::Control {
                src: server_addr(),
                payload: rsp.encode(),
            })
            .unwrap();
    }

    #[test]
    fn test_full_download_commits_image() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(300).collect();
        let bitmap = vec![0xFF, 0xFF, 0x0F];
        let image = build_image(5, &payload, &bitmap);

        let mut client = make_client();
        begin_download(&mut client, 5, image.len() as u32);
        serve_unicast(&mut client, &image, 64);

        assert_eq!(client.session().state, crate::session::SessionState::Reboot);
        assert_eq!(client.store().committed.as_deref(), Some(&payload[..]));
        assert_eq!(client.store().committed_bitmap.as_deref(), Some(&bitmap[..]));

        // Completion reported upstream.
        let (_, _, last) = client.transport().requests.last().unwrap().clone();
        assert_eq!(last[0], protocol::CMD_UPGRADE_END_REQ);
        assert_eq!(last[1], protocol::STATUS_SUCCESS);
    }

    #[test]
    fn test_fragmentation_is_invisible_to_the_result() {
        let payload: Vec<u8> = (7..=91u8).cycle().take(513).collect();
        let bitmap = vec![0xAB; 17];
        let image = build_image(5, &payload, &bitmap);

        let mut committed = Vec::new();
        for chunk in [8usize, 13, 63, 64, 65, image.len()] {
            let mut client = make_client();
            begin_download(&mut client, 5, image.len() as u32);
            serve_unicast(&mut client, &image, chunk);
            assert_eq!(
                client.session().state,
                crate::session::SessionState::Reboot,
                "chunk size {chunk}"
            );
            committed.push(client.store_mut().committed.take().unwrap());
        }
        assert!(committed.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_unknown_sub_element_is_skipped_but_checksummed() {
        let payload = vec![0x11u8; 120];
        let bitmap = vec![0x0F; 4];
        let image = build_image_with_extra(5, &payload, &bitmap, Some((0x7777, &[9u8; 33])));

        let mut client = make_client();
        begin_download(&mut client, 5, image.len() as u32);
        serve_unicast(&mut client, &image, 48);
        assert_eq!(client.session().state, crate::session::SessionState::Reboot);
        assert_eq!(client.store().committed.as_deref(), Some(&payload[..]));
    }

    #[test]
    fn test_bit_flip_discards_image_without_commit() {
        let payload = vec![0x42u8; 200];
        let bitmap = vec![0xFF; 4];
        let mut image = build_image(5, &payload, &bitmap);
        // Flip one payload bit.
        image[crate::image::HEADER_SIZE + 6 + 100] ^= 0x80;

        let mut client = make_client();
        begin_download(&mut client, 5, image.len() as u32);
        serve_unicast(&mut client, &image, 64);

        assert!(client.store().committed.is_none());
        assert!(client.store().cancels > 0);
        assert_eq!(client.session().state, crate::session::SessionState::Idle);
        assert!(client.session().bitmap.is_none());

        let (_, _, last) = client.transport().requests.last().unwrap().clone();
        assert_eq!(last[0], protocol::CMD_UPGRADE_END_REQ);
        assert_eq!(last[1], protocol::STATUS_INVALID_IMAGE);
    }

    #[test]
    fn test_header_identity_mismatch_rejects_download() {
        let payload = vec![0u8; 64];
        let image = build_image(6, &payload, &[0xFF]);

        let mut client = make_client();
        // Server advertises 5 but the file carries 6.
        begin_download(&mut client, 5, image.len() as u32);
        serve_unicast(&mut client, &image, 32);

        assert!(client.store().committed.is_none());
        assert_eq!(client.session().state, crate::session::SessionState::Idle);
        let (_, _, last) = client.transport().requests.last().unwrap().clone();
        assert_eq!(last[0], protocol::CMD_UPGRADE_END_REQ);
        assert_eq!(last[1], protocol::STATUS_INVALID_IMAGE);
    }

    #[test]
    fn test_flash_failure_escalates_flash_fault() {
        let payload = vec![1u8; 64];
        let image = build_image(5, &payload, &[0xFF]);

        let mut client = make_client();
        begin_download(&mut client, 5, image.len() as u32);
        client.store_mut().fail_push = true;
        serve_unicast(&mut client, &image, 64);

        assert!(client.store().committed.is_none());
        assert_eq!(client.session().state, crate::session::SessionState::Idle);
        let (_, _, last) = client.transport().requests.last().unwrap().clone();
        assert_eq!(last[0], protocol::CMD_UPGRADE_END_REQ);
        assert_eq!(last[1], protocol::STATUS_FLASH_ERROR);
    }
}
