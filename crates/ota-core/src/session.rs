//! Download session state.
//!
//! One [`Session`] models one download attempt. It owns every buffer the
//! attempt allocates; `reset` is the single teardown that returns it to
//! `Idle` and releases them all, on success and failure alike.

use std::fmt;
use std::net::SocketAddr;

use crate::protocol::{CHUNK_BITMASK_LEN, TransferType};
use crate::signature::ImageSignature;

/// Top-level session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    NotInit,
    Idle,
    ServerDiscovery,
    QueryImage,
    BlockReq,
    Reboot,
    Fault(FaultKind),
}

/// Terminal error family. Selects the status reported to the server in
/// the closing `UpgradeEndReq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Generic,
    Operation,
    Parameter,
    Flash,
    Image,
    Integrity,
}

impl SessionState {
    pub fn is_fault(&self) -> bool {
        matches!(self, SessionState::Fault(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::NotInit => write!(f, "NOT_INIT"),
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::ServerDiscovery => write!(f, "SERVER_DISCOVERY"),
            SessionState::QueryImage => write!(f, "QUERY_IMAGE"),
            SessionState::BlockReq => write!(f, "BLOCK_REQ"),
            SessionState::Reboot => write!(f, "REBOOT"),
            SessionState::Fault(kind) => write!(f, "FAULT_{kind:?}"),
        }
    }
}

/// Sub-state of the streaming image parser while downloading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockReqState {
    #[default]
    Idle,
    StartDownload,
    ProcessHeader,
    UpgradeImage,
    ProcessSubElement,
    SkipSubElement,
    GetBitmap,
    ValidateSignature,
}

impl fmt::Display for BlockReqState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReqState::Idle => write!(f, "IDLE"),
            BlockReqState::StartDownload => write!(f, "START_DOWNLOAD"),
            BlockReqState::ProcessHeader => write!(f, "PROCESS_HEADER"),
            BlockReqState::UpgradeImage => write!(f, "UPGRADE_IMAGE"),
            BlockReqState::ProcessSubElement => write!(f, "PROCESS_SUB_ELEMENT"),
            BlockReqState::SkipSubElement => write!(f, "SKIP_SUB_ELEMENT"),
            BlockReqState::GetBitmap => write!(f, "GET_BITMAP"),
            BlockReqState::ValidateSignature => write!(f, "VALIDATE_SIGNATURE"),
        }
    }
}

/// Sub-state of a multicast delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MulticastState {
    #[default]
    Idle,
    /// Accept any fragment, track the bitmask.
    ReceiveImage,
    /// Request specific missing fragments sequentially.
    SyncChunks,
}

/// A completed structural unit, either straight out of the caller's
/// fragment (zero-copy) or reassembled in the scratch buffer.
pub enum Unit<'a> {
    Inline(&'a [u8]),
    Buffered(Vec<u8>),
}

impl Unit<'_> {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Unit::Inline(s) => s,
            Unit::Buffered(v) => v,
        }
    }
}

/// Reassembles fixed-size structural units from fragments of arbitrary
/// size. Owns the scratch buffer; the buffer exists only while a unit is
/// split across fragments.
#[derive(Debug, Default)]
pub struct Accumulator {
    buf: Option<Vec<u8>>,
    target: usize,
    remaining: usize,
}

impl Accumulator {
    /// Start collecting a unit of `target` bytes. Drops any stale buffer.
    pub fn begin(&mut self, target: usize) {
        self.buf = None;
        self.target = target;
        self.remaining = target;
    }

    pub fn clear(&mut self) {
        self.begin(0);
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_buffering(&self) -> bool {
        self.buf.is_some()
    }

    /// Feed the next fragment. Returns how many input bytes were consumed
    /// and, once the unit is whole, the unit itself.
    pub fn step<'a>(&mut self, input: &'a [u8]) -> (usize, Option<Unit<'a>>) {
        if self.remaining == 0 {
            return (0, None);
        }
        match &mut self.buf {
            None if input.len() >= self.target => {
                self.remaining = 0;
                (self.target, Some(Unit::Inline(&input[..self.target])))
            }
            None => {
                let mut buf = Vec::with_capacity(self.target);
                buf.extend_from_slice(input);
                self.remaining -= input.len();
                self.buf = Some(buf);
                (input.len(), None)
            }
            Some(buf) => {
                let take = self.remaining.min(input.len());
                buf.extend_from_slice(&input[..take]);
                self.remaining -= take;
                if self.remaining == 0 {
                    let unit = self.buf.take().map(Unit::Buffered);
                    (take, unit)
                } else {
                    (take, None)
                }
            }
        }
    }

    /// Count `n` bytes against the unit without buffering them. Used by
    /// states that stream payload straight through (flash writes, skips).
    pub fn consume_raw(&mut self, n: usize) {
        self.remaining = self.remaining.saturating_sub(n);
    }
}

/// One bit per multicast fragment index; set when the fragment has been
/// durably applied.
#[derive(Clone)]
pub struct ChunkBitmask {
    bits: Vec<u8>,
}

impl ChunkBitmask {
    pub fn new() -> Self {
        Self {
            bits: vec![0; CHUNK_BITMASK_LEN],
        }
    }

    /// Largest fragment count the bitmask can track.
    pub const fn capacity() -> u32 {
        (CHUNK_BITMASK_LEN * 8) as u32
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
    }

    pub fn set(&mut self, index: u16) {
        self.bits[index as usize / 8] |= 1 << (index % 8);
    }

    pub fn get(&self, index: u16) -> bool {
        self.bits[index as usize / 8] & (1 << (index % 8)) != 0
    }

    /// First unset bit in `[start, end)`, if any.
    pub fn first_clear_in(&self, start: u16, end: u16) -> Option<u16> {
        (start..end).find(|&i| !self.get(i))
    }
}

impl Default for ChunkBitmask {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChunkBitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set: usize = self.bits.iter().map(|b| b.count_ones() as usize).sum();
        write!(f, "ChunkBitmask({set} set)")
    }
}

/// The session record: one download attempt.
#[derive(Debug, Default)]
pub struct Session {
    pub state: SessionState,
    pub block_state: BlockReqState,
    pub multicast_state: MulticastState,
    pub transfer: TransferType,

    /// Total length of the image file on the server.
    pub file_length: u32,
    /// Length of the contiguous flash-destined region (multicast only).
    pub image_size: u32,
    /// Next file offset owed to us.
    pub file_offset: u32,
    /// Version the server advertised; the downloaded header must match.
    pub download_version: u32,

    /// Server locked by the triggering notification.
    pub server: Option<SocketAddr>,
    /// Port the server serves block transfers on.
    pub download_port: u16,

    pub retries: u16,
    pub fragment_size: u16,

    /// Scratch reassembly for the structural unit being parsed.
    pub accum: Accumulator,
    /// Sector bitmap sub-element, held until commit or abort.
    pub bitmap: Option<Vec<u8>>,
    /// Non-image bytes of a multicast transfer (header + metadata).
    pub metadata: Option<Vec<u8>>,

    pub chunk_bitmask: ChunkBitmask,
    /// Fragments still owed.
    pub chunks_left: u16,
    /// Total fragments expected.
    pub chunk_total: u16,

    pub signature: ImageSignature,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tear down the attempt: every owned buffer is released and the
    /// session returns to `Idle`, ready for the next notification.
    pub fn reset(&mut self) {
        *self = Session {
            state: SessionState::Idle,
            ..Session::default()
        };
    }

    /// Swap out and finalize the running checksum.
    pub fn take_signature(&mut self) -> u32 {
        std::mem::take(&mut self.signature).finalize()
    }

    /// Restart the running checksum for a fresh pass.
    pub fn restart_signature(&mut self) {
        self.signature = ImageSignature::new();
    }
}
