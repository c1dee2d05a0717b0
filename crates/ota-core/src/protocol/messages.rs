//! Wire message codecs.
//!
//! Every message starts with a one-byte command code followed by
//! fixed-layout big-endian fields. Responses that can carry either a
//! success payload or a server-busy wait payload are modeled as sum
//! types so a handler cannot read the wrong variant.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("message too short: expected at least {expected}, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("unexpected command code 0x{actual:02X}, expected 0x{expected:02X}")]
    WrongCommand { expected: u8, actual: u8 },

    #[error("unknown command code 0x{0:02X}")]
    UnknownCommand(u8),

    #[error("unknown file status 0x{0:02X}")]
    UnknownStatus(u8),

    #[error("unknown transfer type 0x{0:02X}")]
    UnknownTransferType(u8),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// File status carried in responses and in `UpgradeEndReq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Success,
    Abort,
    InvalidImage,
    WaitForData,
    NoImageAvailable,
    ServerBusy,
    InvalidOperation,
    InvalidParameter,
    FlashError,
    ImageTooLarge,
    ClientError,
}

impl FileStatus {
    pub fn from_u8(v: u8) -> Result<Self, ProtocolError> {
        Ok(match v {
            STATUS_SUCCESS => FileStatus::Success,
            STATUS_ABORT => FileStatus::Abort,
            STATUS_INVALID_IMAGE => FileStatus::InvalidImage,
            STATUS_WAIT_FOR_DATA => FileStatus::WaitForData,
            STATUS_NO_IMAGE_AVAILABLE => FileStatus::NoImageAvailable,
            STATUS_SERVER_BUSY => FileStatus::ServerBusy,
            STATUS_INVALID_OPERATION => FileStatus::InvalidOperation,
            STATUS_INVALID_PARAMETER => FileStatus::InvalidParameter,
            STATUS_FLASH_ERROR => FileStatus::FlashError,
            STATUS_IMAGE_TOO_LARGE => FileStatus::ImageTooLarge,
            STATUS_CLIENT_ERROR => FileStatus::ClientError,
            other => return Err(ProtocolError::UnknownStatus(other)),
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            FileStatus::Success => STATUS_SUCCESS,
            FileStatus::Abort => STATUS_ABORT,
            FileStatus::InvalidImage => STATUS_INVALID_IMAGE,
            FileStatus::WaitForData => STATUS_WAIT_FOR_DATA,
            FileStatus::NoImageAvailable => STATUS_NO_IMAGE_AVAILABLE,
            FileStatus::ServerBusy => STATUS_SERVER_BUSY,
            FileStatus::InvalidOperation => STATUS_INVALID_OPERATION,
            FileStatus::InvalidParameter => STATUS_INVALID_PARAMETER,
            FileStatus::FlashError => STATUS_FLASH_ERROR,
            FileStatus::ImageTooLarge => STATUS_IMAGE_TOO_LARGE,
            FileStatus::ClientError => STATUS_CLIENT_ERROR,
        }
    }
}

/// How the server intends to deliver the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferType {
    #[default]
    Unicast,
    Multicast,
}

impl TransferType {
    pub fn from_u8(v: u8) -> Result<Self, ProtocolError> {
        match v {
            0 => Ok(TransferType::Unicast),
            1 => Ok(TransferType::Multicast),
            other => Err(ProtocolError::UnknownTransferType(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            TransferType::Unicast => 0,
            TransferType::Multicast => 1,
        }
    }
}

/// Server-supplied wait hint for busy responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitHint {
    pub request_time: u32,
    pub current_time: u32,
}

impl WaitHint {
    fn read(cursor: &mut Cursor<&[u8]>) -> Result<Self, ProtocolError> {
        Ok(Self {
            request_time: cursor.read_u32::<BigEndian>()?,
            current_time: cursor.read_u32::<BigEndian>()?,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<BigEndian>(self.request_time).ok();
        buf.write_u32::<BigEndian>(self.current_time).ok();
    }
}

fn check_len(data: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if data.len() < expected {
        return Err(ProtocolError::TooShort {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn check_cmd(data: &[u8], expected: u8) -> Result<(), ProtocolError> {
    check_len(data, 1)?;
    if data[0] != expected {
        return Err(ProtocolError::WrongCommand {
            expected,
            actual: data[0],
        });
    }
    Ok(())
}

/// Broadcast probe for any reachable update server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerDiscovery {
    pub manufacturer_code: u16,
    pub image_type: u16,
}

impl ServerDiscovery {
    pub const SIZE: usize = 5;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(CMD_SERVER_DISCOVERY);
        buf.write_u16::<BigEndian>(self.manufacturer_code).ok();
        buf.write_u16::<BigEndian>(self.image_type).ok();
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        check_cmd(data, CMD_SERVER_DISCOVERY)?;
        check_len(data, Self::SIZE)?;
        let mut cursor = Cursor::new(&data[1..]);
        Ok(Self {
            manufacturer_code: cursor.read_u16::<BigEndian>()?,
            image_type: cursor.read_u16::<BigEndian>()?,
        })
    }
}

/// Server announcement that an image is available for download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageNotify {
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    pub file_size: u32,
    pub image_size: u32,
    pub fragment_size: u16,
    pub transfer_type: TransferType,
    pub server_port: u16,
}

impl ImageNotify {
    pub const SIZE: usize = 22;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(CMD_IMAGE_NOTIFY);
        buf.write_u16::<BigEndian>(self.manufacturer_code).ok();
        buf.write_u16::<BigEndian>(self.image_type).ok();
        buf.write_u32::<BigEndian>(self.file_version).ok();
        buf.write_u32::<BigEndian>(self.file_size).ok();
        buf.write_u32::<BigEndian>(self.image_size).ok();
        buf.write_u16::<BigEndian>(self.fragment_size).ok();
        buf.push(self.transfer_type.as_u8());
        buf.write_u16::<BigEndian>(self.server_port).ok();
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        check_cmd(data, CMD_IMAGE_NOTIFY)?;
        check_len(data, Self::SIZE)?;
        let mut cursor = Cursor::new(&data[1..]);
        Ok(Self {
            manufacturer_code: cursor.read_u16::<BigEndian>()?,
            image_type: cursor.read_u16::<BigEndian>()?,
            file_version: cursor.read_u32::<BigEndian>()?,
            file_size: cursor.read_u32::<BigEndian>()?,
            image_size: cursor.read_u32::<BigEndian>()?,
            fragment_size: cursor.read_u16::<BigEndian>()?,
            transfer_type: TransferType::from_u8(cursor.read_u8()?)?,
            server_port: cursor.read_u16::<BigEndian>()?,
        })
    }
}

/// Client query for a newer image than the one it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryImageReq {
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    pub hardware_version: u16,
}

impl QueryImageReq {
    pub const SIZE: usize = 11;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(CMD_QUERY_IMAGE_REQ);
        buf.write_u16::<BigEndian>(self.manufacturer_code).ok();
        buf.write_u16::<BigEndian>(self.image_type).ok();
        buf.write_u32::<BigEndian>(self.file_version).ok();
        buf.write_u16::<BigEndian>(self.hardware_version).ok();
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        check_cmd(data, CMD_QUERY_IMAGE_REQ)?;
        check_len(data, Self::SIZE)?;
        let mut cursor = Cursor::new(&data[1..]);
        Ok(Self {
            manufacturer_code: cursor.read_u16::<BigEndian>()?,
            image_type: cursor.read_u16::<BigEndian>()?,
            file_version: cursor.read_u32::<BigEndian>()?,
            hardware_version: cursor.read_u16::<BigEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryImageBody {
    Success {
        manufacturer_code: u16,
        image_type: u16,
        file_version: u32,
        file_size: u32,
        server_port: u16,
    },
    Wait(WaitHint),
    None,
}

/// Server answer to `QueryImageReq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryImageRsp {
    pub status: FileStatus,
    pub body: QueryImageBody,
}

impl QueryImageRsp {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(CMD_QUERY_IMAGE_RSP);
        buf.push(self.status.as_u8());
        match self.body {
            QueryImageBody::Success {
                manufacturer_code,
                image_type,
                file_version,
                file_size,
                server_port,
            } => {
                buf.write_u16::<BigEndian>(manufacturer_code).ok();
                buf.write_u16::<BigEndian>(image_type).ok();
                buf.write_u32::<BigEndian>(file_version).ok();
                buf.write_u32::<BigEndian>(file_size).ok();
                buf.write_u16::<BigEndian>(server_port).ok();
            }
            QueryImageBody::Wait(hint) => hint.write(&mut buf),
            QueryImageBody::None => {}
        }
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        check_cmd(data, CMD_QUERY_IMAGE_RSP)?;
        check_len(data, 2)?;
        let status = FileStatus::from_u8(data[1])?;
        let mut cursor = Cursor::new(&data[2..]);
        let body = match status {
            FileStatus::Success => {
                check_len(data, 16)?;
                QueryImageBody::Success {
                    manufacturer_code: cursor.read_u16::<BigEndian>()?,
                    image_type: cursor.read_u16::<BigEndian>()?,
                    file_version: cursor.read_u32::<BigEndian>()?,
                    file_size: cursor.read_u32::<BigEndian>()?,
                    server_port: cursor.read_u16::<BigEndian>()?,
                }
            }
            FileStatus::ServerBusy => {
                check_len(data, 10)?;
                QueryImageBody::Wait(WaitHint::read(&mut cursor)?)
            }
            _ => QueryImageBody::None,
        };
        Ok(Self { status, body })
    }
}

/// Request for one block of the image file at a given offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockReq {
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    pub file_offset: u32,
    pub max_data_size: u16,
}

impl BlockReq {
    pub const SIZE: usize = 15;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(CMD_BLOCK_REQ);
        buf.write_u16::<BigEndian>(self.manufacturer_code).ok();
        buf.write_u16::<BigEndian>(self.image_type).ok();
        buf.write_u32::<BigEndian>(self.file_version).ok();
        buf.write_u32::<BigEndian>(self.file_offset).ok();
        buf.write_u16::<BigEndian>(self.max_data_size).ok();
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        check_cmd(data, CMD_BLOCK_REQ)?;
        check_len(data, Self::SIZE)?;
        let mut cursor = Cursor::new(&data[1..]);
        Ok(Self {
            manufacturer_code: cursor.read_u16::<BigEndian>()?,
            image_type: cursor.read_u16::<BigEndian>()?,
            file_version: cursor.read_u32::<BigEndian>()?,
            file_offset: cursor.read_u32::<BigEndian>()?,
            max_data_size: cursor.read_u16::<BigEndian>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockBody {
    Success {
        file_offset: u32,
        file_version: u32,
        data: Vec<u8>,
    },
    Wait(WaitHint),
    None,
}

/// One block of image data, or a wait/abort status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRsp {
    pub status: FileStatus,
    pub body: BlockBody,
}

impl BlockRsp {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(CMD_BLOCK_RSP);
        buf.push(self.status.as_u8());
        match &self.body {
            BlockBody::Success {
                file_offset,
                file_version,
                data,
            } => {
                buf.write_u32::<BigEndian>(*file_offset).ok();
                buf.write_u32::<BigEndian>(*file_version).ok();
                buf.write_u16::<BigEndian>(data.len() as u16).ok();
                buf.extend_from_slice(data);
            }
            BlockBody::Wait(hint) => hint.write(&mut buf),
            BlockBody::None => {}
        }
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        check_cmd(data, CMD_BLOCK_RSP)?;
        check_len(data, 2)?;
        let status = FileStatus::from_u8(data[1])?;
        let mut cursor = Cursor::new(&data[2..]);
        let body = match status {
            FileStatus::Success => {
                check_len(data, 12)?;
                let file_offset = cursor.read_u32::<BigEndian>()?;
                let file_version = cursor.read_u32::<BigEndian>()?;
                let data_size = cursor.read_u16::<BigEndian>()? as usize;
                check_len(data, 12 + data_size)?;
                let start = 12;
                BlockBody::Success {
                    file_offset,
                    file_version,
                    data: data[start..start + data_size].to_vec(),
                }
            }
            FileStatus::ServerBusy => {
                check_len(data, 10)?;
                BlockBody::Wait(WaitHint::read(&mut cursor)?)
            }
            _ => BlockBody::None,
        };
        Ok(Self { status, body })
    }
}

/// Client report that the download ended, successfully or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeEndReq {
    pub status: FileStatus,
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
}

impl UpgradeEndReq {
    pub const SIZE: usize = 10;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(CMD_UPGRADE_END_REQ);
        buf.push(self.status.as_u8());
        buf.write_u16::<BigEndian>(self.manufacturer_code).ok();
        buf.write_u16::<BigEndian>(self.image_type).ok();
        buf.write_u32::<BigEndian>(self.file_version).ok();
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        check_cmd(data, CMD_UPGRADE_END_REQ)?;
        check_len(data, Self::SIZE)?;
        let status = FileStatus::from_u8(data[1])?;
        let mut cursor = Cursor::new(&data[2..]);
        Ok(Self {
            status,
            manufacturer_code: cursor.read_u16::<BigEndian>()?,
            image_type: cursor.read_u16::<BigEndian>()?,
            file_version: cursor.read_u32::<BigEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeEndBody {
    Success { upgrade_time: u32, current_time: u32 },
    Wait(WaitHint),
    None,
}

/// Server answer to `UpgradeEndReq`, scheduling the actual switch-over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeEndRsp {
    pub status: FileStatus,
    pub body: UpgradeEndBody,
}

impl UpgradeEndRsp {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(CMD_UPGRADE_END_RSP);
        buf.push(self.status.as_u8());
        match self.body {
            UpgradeEndBody::Success {
                upgrade_time,
                current_time,
            } => {
                buf.write_u32::<BigEndian>(upgrade_time).ok();
                buf.write_u32::<BigEndian>(current_time).ok();
            }
            UpgradeEndBody::Wait(hint) => hint.write(&mut buf),
            UpgradeEndBody::None => {}
        }
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        check_cmd(data, CMD_UPGRADE_END_RSP)?;
        check_len(data, 2)?;
        let status = FileStatus::from_u8(data[1])?;
        let mut cursor = Cursor::new(&data[2..]);
        let body = match status {
            FileStatus::Success => {
                check_len(data, 10)?;
                UpgradeEndBody::Success {
                    upgrade_time: cursor.read_u32::<BigEndian>()?,
                    current_time: cursor.read_u32::<BigEndian>()?,
                }
            }
            FileStatus::ServerBusy => {
                check_len(data, 10)?;
                UpgradeEndBody::Wait(WaitHint::read(&mut cursor)?)
            }
            _ => UpgradeEndBody::None,
        };
        Ok(Self { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_notify_roundtrip() {
        let notify = ImageNotify {
            manufacturer_code: 0x1037,
            image_type: 0x0001,
            file_version: 5,
            file_size: 2048,
            image_size: 1986,
            fragment_size: 64,
            transfer_type: TransferType::Multicast,
            server_port: 61631,
        };
        let bytes = notify.encode();
        assert_eq!(bytes.len(), ImageNotify::SIZE);
        assert_eq!(ImageNotify::parse(&bytes).unwrap(), notify);
    }

    #[test]
    fn test_block_rsp_success_roundtrip() {
        let rsp = BlockRsp {
            status: FileStatus::Success,
            body: BlockBody::Success {
                file_offset: 128,
                file_version: 5,
                data: vec![0xAA; 64],
            },
        };
        let parsed = BlockRsp::parse(&rsp.encode()).unwrap();
        assert_eq!(parsed, rsp);
    }

    #[test]
    fn test_block_rsp_busy_carries_wait_hint() {
        let rsp = BlockRsp {
            status: FileStatus::ServerBusy,
            body: BlockBody::Wait(WaitHint {
                request_time: 5000,
                current_time: 1000,
            }),
        };
        let parsed = BlockRsp::parse(&rsp.encode()).unwrap();
        match parsed.body {
            BlockBody::Wait(hint) => {
                assert_eq!(hint.request_time, 5000);
                assert_eq!(hint.current_time, 1000);
            }
            other => panic!("expected wait body, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_block_rsp_rejected() {
        let rsp = BlockRsp {
            status: FileStatus::Success,
            body: BlockBody::Success {
                file_offset: 0,
                file_version: 1,
                data: vec![1, 2, 3, 4],
            },
        };
        let mut bytes = rsp.encode();
        bytes.truncate(bytes.len() - 2);
        assert!(BlockRsp::parse(&bytes).is_err());
    }

    #[test]
    fn test_wrong_command_rejected() {
        let req = QueryImageReq {
            manufacturer_code: 1,
            image_type: 1,
            file_version: 1,
            hardware_version: 1,
        };
        let mut bytes = req.encode();
        bytes[0] = CMD_BLOCK_REQ;
        assert!(matches!(
            QueryImageReq::parse(&bytes),
            Err(ProtocolError::WrongCommand { .. })
        ));
    }

    #[test]
    fn test_upgrade_end_rsp_abort_has_no_body() {
        let rsp = UpgradeEndRsp {
            status: FileStatus::Abort,
            body: UpgradeEndBody::None,
        };
        let parsed = UpgradeEndRsp::parse(&rsp.encode()).unwrap();
        assert_eq!(parsed.status, FileStatus::Abort);
        assert_eq!(parsed.body, UpgradeEndBody::None);
    }
}
