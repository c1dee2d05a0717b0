//! Protocol module - OTA message definitions.

pub mod constants;
pub mod messages;

pub use constants::*;
pub use messages::{
    BlockBody, BlockReq, BlockRsp, FileStatus, ImageNotify, ProtocolError, QueryImageBody,
    QueryImageReq, QueryImageRsp, ServerDiscovery, TransferType, UpgradeEndBody, UpgradeEndReq,
    UpgradeEndRsp, WaitHint,
};
