//! Firmware image container format.
//!
//! An image file is a 56-byte little-endian header followed by tagged,
//! length-prefixed sub-elements, the last of which carries the integrity
//! code over everything before it. Unlike the network messages, the
//! container uses little-endian fields throughout.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

/// Magic number identifying an upgrade image file.
pub const FILE_IDENTIFIER: u32 = 0x0BEE_F11E;

/// Fixed header size. `header_length` in the header must match.
pub const HEADER_SIZE: usize = 56;

/// Tag plus 32-bit length prefix of every sub-element.
pub const SUB_ELEMENT_HEADER_SIZE: usize = 6;

// Sub-element tags.
pub const TAG_UPGRADE_IMAGE: u16 = 0x0000;
pub const TAG_INTEGRITY_CODE: u16 = 0x0003;
pub const TAG_CRC: u16 = 0xF000;
pub const TAG_SECTOR_BITMAP: u16 = 0xF001;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("buffer too small for image header: expected {expected}, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("bad file identifier 0x{0:08X}")]
    BadIdentifier(u32),

    #[error("image identity mismatch")]
    IdentityMismatch,

    #[error("file version {actual} does not match negotiated {expected}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Image file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub identifier: u32,
    pub header_version: u16,
    pub header_length: u16,
    pub field_control: u16,
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    pub stack_version: u16,
    pub header_string: [u8; 32],
    pub total_image_size: u32,
}

impl ImageHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ImageError> {
        if data.len() < HEADER_SIZE {
            return Err(ImageError::TooShort {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let identifier = cursor.read_u32::<LittleEndian>()?;
        let header_version = cursor.read_u16::<LittleEndian>()?;
        let header_length = cursor.read_u16::<LittleEndian>()?;
        let field_control = cursor.read_u16::<LittleEndian>()?;
        let manufacturer_code = cursor.read_u16::<LittleEndian>()?;
        let image_type = cursor.read_u16::<LittleEndian>()?;
        let file_version = cursor.read_u32::<LittleEndian>()?;
        let stack_version = cursor.read_u16::<LittleEndian>()?;
        let mut header_string = [0u8; 32];
        std::io::Read::read_exact(&mut cursor, &mut header_string)?;
        let total_image_size = cursor.read_u32::<LittleEndian>()?;
        Ok(Self {
            identifier,
            header_version,
            header_length,
            field_control,
            manufacturer_code,
            image_type,
            file_version,
            stack_version,
            header_string,
            total_image_size,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.write_u32::<LittleEndian>(self.identifier).ok();
        buf.write_u16::<LittleEndian>(self.header_version).ok();
        buf.write_u16::<LittleEndian>(self.header_length).ok();
        buf.write_u16::<LittleEndian>(self.field_control).ok();
        buf.write_u16::<LittleEndian>(self.manufacturer_code).ok();
        buf.write_u16::<LittleEndian>(self.image_type).ok();
        buf.write_u32::<LittleEndian>(self.file_version).ok();
        buf.write_u16::<LittleEndian>(self.stack_version).ok();
        buf.extend_from_slice(&self.header_string);
        buf.write_u32::<LittleEndian>(self.total_image_size).ok();
        buf
    }

    /// Check the header against this client's identity and the version the
    /// server advertised for the download.
    pub fn validate(
        &self,
        manufacturer_code: u16,
        image_type: u16,
        expected_version: u32,
    ) -> Result<(), ImageError> {
        if self.identifier != FILE_IDENTIFIER {
            return Err(ImageError::BadIdentifier(self.identifier));
        }
        if self.manufacturer_code != manufacturer_code || self.image_type != image_type {
            return Err(ImageError::IdentityMismatch);
        }
        if self.file_version != expected_version {
            return Err(ImageError::VersionMismatch {
                expected: expected_version,
                actual: self.file_version,
            });
        }
        Ok(())
    }

    /// Peek the `header_length` field out of a raw fragment prefix.
    ///
    /// Only the first 8 bytes need to have arrived.
    pub fn peek_header_length(data: &[u8]) -> Result<u16, ImageError> {
        if data.len() < 8 {
            return Err(ImageError::TooShort {
                expected: 8,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(&data[6..8]);
        Ok(cursor.read_u16::<LittleEndian>()?)
    }
}

/// Tag and length prefix of one sub-element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubElementHeader {
    pub tag: u16,
    pub length: u32,
}

impl SubElementHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ImageError> {
        if data.len() < SUB_ELEMENT_HEADER_SIZE {
            return Err(ImageError::TooShort {
                expected: SUB_ELEMENT_HEADER_SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            tag: cursor.read_u16::<LittleEndian>()?,
            length: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SUB_ELEMENT_HEADER_SIZE);
        buf.write_u16::<LittleEndian>(self.tag).ok();
        buf.write_u32::<LittleEndian>(self.length).ok();
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> ImageHeader {
        let mut header_string = [0u8; 32];
        header_string[..9].copy_from_slice(b"node-fw-5");
        ImageHeader {
            identifier: FILE_IDENTIFIER,
            header_version: 0x0100,
            header_length: HEADER_SIZE as u16,
            field_control: 0,
            manufacturer_code: 0x1037,
            image_type: 0x0001,
            file_version: 5,
            stack_version: 2,
            header_string,
            total_image_size: 2048,
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let bytes = header.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(ImageHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn test_peek_header_length() {
        let bytes = sample_header().encode();
        assert_eq!(
            ImageHeader::peek_header_length(&bytes).unwrap(),
            HEADER_SIZE as u16
        );
    }

    #[test]
    fn test_validate_accepts_matching_identity() {
        assert!(sample_header().validate(0x1037, 0x0001, 5).is_ok());
    }

    #[test]
    fn test_validate_rejects_identity_mismatch() {
        let header = sample_header();
        assert!(matches!(
            header.validate(0x1038, 0x0001, 5),
            Err(ImageError::IdentityMismatch)
        ));
        assert!(matches!(
            header.validate(0x1037, 0x0002, 5),
            Err(ImageError::IdentityMismatch)
        ));
        assert!(matches!(
            header.validate(0x1037, 0x0001, 6),
            Err(ImageError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_identifier() {
        let mut header = sample_header();
        header.identifier = 0xDEADBEEF;
        assert!(matches!(
            header.validate(0x1037, 0x0001, 5),
            Err(ImageError::BadIdentifier(_))
        ));
    }

    #[test]
    fn test_sub_element_roundtrip() {
        let sub = SubElementHeader {
            tag: TAG_UPGRADE_IMAGE,
            length: 1986,
        };
        let bytes = sub.encode();
        assert_eq!(bytes.len(), SUB_ELEMENT_HEADER_SIZE);
        assert_eq!(SubElementHeader::parse(&bytes).unwrap(), sub);
    }
}
