//! Multicast reassembly.
//!
//! In receive-phase the client stays quiet and applies whatever
//! fragments arrive, tracking them in the chunk bitmask. Fragment bytes
//! split across three destinations by absolute file offset: pre-image
//! metadata and post-image metadata land in the metadata buffer, the
//! image region streams into the persistent store. Once every fragment
//! is in, the buffered metadata gets an offline pass through the stream
//! parser, with the flashed image read back for the checksum.

use tracing::{debug, info};

use super::OtaClient;
use crate::error::OtaError;
use crate::events::OtaEvent;
use crate::image::{
    HEADER_SIZE, ImageHeader, SUB_ELEMENT_HEADER_SIZE, SubElementHeader, TAG_UPGRADE_IMAGE,
};
use crate::protocol::{ImageNotify, SIGNATURE_READBACK_CHUNK};
use crate::session::{BlockReqState, ChunkBitmask, MulticastState, SessionState};
use crate::storage::{ImageStore, StoreError};
use crate::timer::TimerService;
use crate::transport::Transport;

impl<T: Transport, S: ImageStore, W: TimerService> OtaClient<T, S, W> {
    /// Arm the receive phase announced by a multicast ImageNotify:
    /// metadata buffer, staged flash image, block socket, chunk bitmask.
    pub(super) fn begin_multicast(&mut self, notify: &ImageNotify) -> Result<(), OtaError> {
        let result = self.setup_multicast(notify);
        if let Err(e) = &result {
            self.goto_state(SessionState::Fault(e.fault_kind()));
            self.session.metadata = None;
            self.store.cancel_image();
        }
        result
    }

    fn setup_multicast(&mut self, notify: &ImageNotify) -> Result<(), OtaError> {
        if notify.fragment_size == 0 || notify.image_size > notify.file_size {
            return Err(OtaError::InvalidParameter);
        }
        let metadata_len = (notify.file_size - notify.image_size) as usize;
        if metadata_len < HEADER_SIZE + SUB_ELEMENT_HEADER_SIZE {
            return Err(OtaError::InvalidParameter);
        }
        let total = notify.file_size.div_ceil(notify.fragment_size as u32);
        if total > ChunkBitmask::capacity() {
            return Err(OtaError::Store(StoreError::ImageTooLarge {
                size: notify.file_size,
                max: ChunkBitmask::capacity() * notify.fragment_size as u32,
            }));
        }

        self.session.image_size = notify.image_size;
        self.session.metadata = Some(vec![0u8; metadata_len]);
        self.store.start_image(notify.image_size)?;
        self.transport.open_block_socket(self.config.download_port)?;

        self.session.fragment_size = notify.fragment_size;
        self.session.chunk_bitmask.clear();
        self.session.download_version = notify.file_version;
        self.session.chunk_total = total as u16;
        self.session.chunks_left = total as u16;
        self.session.file_offset = 0;
        self.goto_state(SessionState::BlockReq);
        self.session.block_state = BlockReqState::StartDownload;
        self.session.multicast_state = MulticastState::ReceiveImage;
        self.emit(OtaEvent::DownloadStarted {
            file_version: notify.file_version,
            file_size: notify.file_size,
        });
        info!(
            fragments = total,
            fragment_size = notify.fragment_size,
            "multicast receive phase armed"
        );
        self.arm_multicast_wait();
        Ok(())
    }

    /// Place one fragment. Duplicate fragments in receive-phase only
    /// re-arm the inter-fragment wait.
    pub(super) fn process_multicast_block(
        &mut self,
        file_offset: u32,
        data: &[u8],
    ) -> Result<(), OtaError> {
        let frag = self.session.fragment_size as u32;
        if frag == 0 {
            return Err(OtaError::InvalidOperation);
        }
        let index = (file_offset / frag) as u16;
        if index >= self.session.chunk_total
            || file_offset as u64 + data.len() as u64 > self.session.file_length as u64
        {
            return Err(OtaError::InvalidParameter);
        }
        if self.session.chunk_bitmask.get(index)
            && self.session.multicast_state == MulticastState::ReceiveImage
        {
            debug!(index = index, "duplicate fragment");
            self.arm_multicast_wait();
            return Ok(());
        }

        self.place_fragment(file_offset, data)?;

        let fresh = !self.session.chunk_bitmask.get(index);
        self.session.chunk_bitmask.set(index);
        if fresh {
            self.session.chunks_left -= 1;
        }

        if self.session.chunks_left > 0 {
            if self.session.multicast_state == MulticastState::SyncChunks {
                let from = (self.session.file_offset / frag) as u16;
                let next = self
                    .session
                    .chunk_bitmask
                    .first_clear_in(from, self.session.chunk_total)
                    .or_else(|| {
                        self.session
                            .chunk_bitmask
                            .first_clear_in(0, self.session.chunk_total)
                    })
                    .ok_or(OtaError::Failed)?;
                self.session.file_offset = next as u32 * frag;
                self.send_next(false);
            } else {
                self.arm_multicast_wait();
            }
            Ok(())
        } else {
            self.session.multicast_state = MulticastState::SyncChunks;
            self.process_multicast_image()
        }
    }

    /// Split the fragment byte-range-wise across the metadata buffer and
    /// the flash image region.
    fn place_fragment(&mut self, file_offset: u32, data: &[u8]) -> Result<(), OtaError> {
        let start_image = (HEADER_SIZE + SUB_ELEMENT_HEADER_SIZE) as u32;
        let end_image = start_image + self.session.image_size;

        let mut offset = file_offset;
        let mut rest = data;

        if offset < start_image && !rest.is_empty() {
            let take = ((start_image - offset) as usize).min(rest.len());
            let metadata = self
                .session
                .metadata
                .as_mut()
                .ok_or(OtaError::InvalidOperation)?;
            metadata[offset as usize..offset as usize + take].copy_from_slice(&rest[..take]);
            offset += take as u32;
            rest = &rest[take..];
        }

        if !rest.is_empty() && offset < end_image {
            let take = ((end_image - offset) as usize).min(rest.len());
            // A flash failure mid-chunk cannot be rolled back.
            self.store
                .push_chunk(&rest[..take], Some(offset - start_image))
                .map_err(|e| OtaError::FatalFlash(e.to_string()))?;
            offset += take as u32;
            rest = &rest[take..];
        }

        if !rest.is_empty() {
            let metadata = self
                .session
                .metadata
                .as_mut()
                .ok_or(OtaError::InvalidOperation)?;
            let dst = (offset - self.session.image_size) as usize;
            metadata[dst..dst + rest.len()].copy_from_slice(rest);
        }
        Ok(())
    }

    /// All fragments received: run the buffered metadata through the
    /// stream parser. The image region was flashed verbatim during
    /// receive-phase, so its checksum comes from reading it back.
    pub(super) fn process_multicast_image(&mut self) -> Result<(), OtaError> {
        info!("all fragments received, validating");
        let result = self.run_metadata_pass();
        match &result {
            Err(e) if e.is_fatal() => {}
            Err(e) => {
                let kind = e.fault_kind();
                debug!(error = %e, fault = ?kind, "metadata pass failed");
                self.goto_state(SessionState::Fault(kind));
                self.send_upgrade_end();
            }
            Ok(()) => self.send_next(false),
        }
        result
    }

    fn run_metadata_pass(&mut self) -> Result<(), OtaError> {
        let buf = self
            .session
            .metadata
            .take()
            .ok_or(OtaError::InvalidOperation)?;
        self.session.restart_signature();

        let header_len = ImageHeader::peek_header_length(&buf)? as usize;
        // Fragment placement assumed the fixed header size; anything else
        // means the regions were split wrong.
        if header_len != HEADER_SIZE || buf.len() < HEADER_SIZE + SUB_ELEMENT_HEADER_SIZE {
            return Err(OtaError::InvalidParameter);
        }
        let header = ImageHeader::parse(&buf[..HEADER_SIZE])?;
        header.validate(
            self.config.manufacturer_code,
            self.config.image_type,
            self.session.download_version,
        )?;
        self.session.signature.update(&buf[..HEADER_SIZE]);

        let sub_bytes = &buf[HEADER_SIZE..HEADER_SIZE + SUB_ELEMENT_HEADER_SIZE];
        let sub = SubElementHeader::parse(sub_bytes)?;
        if sub.tag != TAG_UPGRADE_IMAGE || sub.length != self.session.image_size {
            return Err(OtaError::InvalidParameter);
        }
        self.session.signature.update(sub_bytes);
        self.compute_image_signature()?;

        self.session.block_state = BlockReqState::ProcessSubElement;
        self.session.accum.begin(SUB_ELEMENT_HEADER_SIZE);
        self.run_parser(&buf[HEADER_SIZE + SUB_ELEMENT_HEADER_SIZE..], false)
    }

    /// Fold the flashed image region into the running checksum.
    fn compute_image_signature(&mut self) -> Result<(), OtaError> {
        let mut buf = [0u8; SIGNATURE_READBACK_CHUNK];
        let size = self.session.image_size as usize;
        let mut offset = 0usize;
        while size - offset >= SIGNATURE_READBACK_CHUNK {
            self.store.read_back(&mut buf, offset as u32)?;
            self.session.signature.update(&buf);
            offset += SIGNATURE_READBACK_CHUNK;
        }
        let tail = size - offset;
        if tail > 0 {
            self.store.read_back(&mut buf[..tail], offset as u32)?;
            self.session.signature.update(&buf[..tail]);
        }
        Ok(())
    }
}
