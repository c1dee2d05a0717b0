//! Client error taxonomy.
//!
//! Four classes of trouble (see the variant docs): protocol-level noise
//! that is silently dropped, retryable conditions, terminal operational
//! failures escalated to a fault state, and integrity failures that
//! discard the image. `FatalFlash` stands apart: a flash write that
//! failed mid-chunk during multicast placement cannot be rolled back and
//! takes the whole client down.

use thiserror::Error;

use crate::image::ImageError;
use crate::protocol::ProtocolError;
use crate::session::FaultKind;
use crate::storage::StoreError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum OtaError {
    #[error("client already started")]
    AlreadyStarted,

    #[error("no timer slot available")]
    NoTimers,

    #[error("message not permitted in current state")]
    NotPermitted,

    #[error("invalid parameter in message")]
    InvalidParameter,

    #[error("invalid operation")]
    InvalidOperation,

    #[error("image checksum mismatch")]
    CrcError,

    #[error("image rejected: {0}")]
    InvalidImage(#[from] ImageError),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("malformed message: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("download failed")]
    Failed,

    #[error("unrecoverable flash failure during multicast placement: {0}")]
    FatalFlash(String),
}

impl OtaError {
    /// Fault state the session lands in when this error escalates.
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            OtaError::Store(StoreError::InvalidOperation) | OtaError::InvalidOperation => {
                FaultKind::Operation
            }
            OtaError::Store(StoreError::ImageTooLarge { .. }) => FaultKind::Image,
            OtaError::Store(_) => FaultKind::Flash,
            OtaError::InvalidParameter => FaultKind::Parameter,
            OtaError::CrcError => FaultKind::Integrity,
            OtaError::InvalidImage(_) => FaultKind::Integrity,
            _ => FaultKind::Generic,
        }
    }

    /// The one condition the session must not try to recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OtaError::FatalFlash(_))
    }
}
