//! Protocol constants for the OTA client/server exchange.
//!
//! Timing intervals and limits follow the reference deployment for
//! low-power mesh links: request jitter avoids synchronized bursts after
//! a broadcast notification, and the retry ceiling bounds how long a
//! client keeps hammering an unresponsive server.

// ============================================================================
// Command codes (first byte of every protocol message)
// ============================================================================

pub const CMD_IMAGE_NOTIFY: u8 = 0x01;
pub const CMD_QUERY_IMAGE_REQ: u8 = 0x02;
pub const CMD_QUERY_IMAGE_RSP: u8 = 0x03;
pub const CMD_BLOCK_REQ: u8 = 0x04;
pub const CMD_BLOCK_RSP: u8 = 0x05;
pub const CMD_UPGRADE_END_REQ: u8 = 0x06;
pub const CMD_UPGRADE_END_RSP: u8 = 0x07;
pub const CMD_SERVER_DISCOVERY: u8 = 0x08;

// ============================================================================
// File status codes (shared by responses and UpgradeEndReq)
// ============================================================================

pub const STATUS_SUCCESS: u8 = 0x00;
pub const STATUS_ABORT: u8 = 0x95;
pub const STATUS_INVALID_IMAGE: u8 = 0x96;
pub const STATUS_WAIT_FOR_DATA: u8 = 0x97;
pub const STATUS_NO_IMAGE_AVAILABLE: u8 = 0x98;
pub const STATUS_SERVER_BUSY: u8 = 0x99;
pub const STATUS_INVALID_OPERATION: u8 = 0x9A;
pub const STATUS_INVALID_PARAMETER: u8 = 0x9B;
pub const STATUS_FLASH_ERROR: u8 = 0x9C;
pub const STATUS_IMAGE_TOO_LARGE: u8 = 0x9D;
pub const STATUS_CLIENT_ERROR: u8 = 0x9E;

// ============================================================================
// Resource paths
// ============================================================================

/// Resource the client listens on for server-initiated messages.
pub const OTA_CLIENT_URI: &str = "ota/client";
/// Resource client requests are addressed to.
pub const OTA_SERVER_URI: &str = "ota/server";

// ============================================================================
// Ports and sizes
// ============================================================================

/// Local port for the bulk block-transfer socket.
pub const CLIENT_DOWNLOAD_PORT: u16 = 61630;

/// Default server control port for request/response messages.
pub const SERVER_CONTROL_PORT: u16 = 5683;

/// Largest data payload requested per block exchange.
pub const MAX_BLOCK_DATA_SIZE: u16 = 64;

/// Capacity of the per-fragment receive bitmask, in bytes (8 fragments each).
pub const CHUNK_BITMASK_LEN: usize = 1000;

/// Read-back granularity when checksumming the flashed image region.
pub const SIGNATURE_READBACK_CHUNK: usize = 128;

// ============================================================================
// Retry / timing
// ============================================================================

/// Consecutive failed exchanges tolerated before the session aborts.
pub const MAX_RETRIES: u16 = 0x0A00;

pub const DISCOVERY_MIN_DELAY_MS: u64 = 15_000;
pub const DISCOVERY_MAX_DELAY_MS: u64 = 30_000;

pub const QUERY_MIN_DELAY_MS: u64 = 1_000;
pub const QUERY_MAX_DELAY_MS: u64 = 15_000;

pub const BLOCK_MIN_DELAY_MS: u64 = 100;
pub const BLOCK_MAX_DELAY_MS: u64 = 400;

pub const NEXT_REQ_MIN_DELAY_MS: u64 = 1_000;
pub const NEXT_REQ_MAX_DELAY_MS: u64 = 2_000;

/// Grace period after a request before the exchange counts as failed.
pub const DECLARE_ERROR_DELAY_MS: u64 = 3_000;

/// Receive-phase silence tolerated before a multicast client resyncs.
pub const MULTICAST_WAIT_MS: u64 = 60_000;
pub const MULTICAST_WAIT_JITTER_MS: u64 = 10_000;
