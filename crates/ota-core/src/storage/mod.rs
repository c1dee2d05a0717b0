//! Persistent image store module.
//!
//! The store stages exactly one incoming image at a time: `start_image`
//! opens the staging area, `push_chunk` appends or patches bytes,
//! `commit_image` makes the image eligible for boot and `cancel_image`
//! discards the staging area. `set_new_image_flag` marks the committed
//! image for the bootloader.

pub mod file;
pub mod mock;

use thiserror::Error;

pub use file::FileStore;
pub use mock::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("operation not valid in current store state")]
    InvalidOperation,

    #[error("image of {size} bytes exceeds capacity {max}")]
    ImageTooLarge { size: u32, max: u32 },

    #[error("flash error: {0}")]
    Flash(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistent destination for the upgrade image.
pub trait ImageStore {
    /// Bring the store subsystem up. Called once during client init.
    fn init(&mut self) -> Result<(), StoreError>;

    /// Open a staging area for an image of `size` bytes.
    fn start_image(&mut self, size: u32) -> Result<(), StoreError>;

    /// Write a chunk. `offset_hint` positions the write explicitly;
    /// without it, writes are sequential.
    fn push_chunk(&mut self, data: &[u8], offset_hint: Option<u32>) -> Result<(), StoreError>;

    /// Finalize the staged image, recording the sector bitmap when one
    /// was delivered with the file.
    fn commit_image(&mut self, bitmap: Option<&[u8]>) -> Result<(), StoreError>;

    /// Discard the staging area. No-op when nothing is staged.
    fn cancel_image(&mut self);

    /// Mark the committed image for pickup on the next boot.
    fn set_new_image_flag(&mut self);

    /// Read staged bytes back, `buf.len()` bytes starting at `offset`.
    fn read_back(&mut self, buf: &mut [u8], offset: u32) -> Result<(), StoreError>;
}
