//! In-memory image store for tests.

use super::{ImageStore, StoreError};

/// Stages the image in a `Vec`, captures the commit, and lets tests
/// inject every failure class the trait can produce.
#[derive(Default)]
pub struct MemoryStore {
    data: Vec<u8>,
    staged: bool,
    cursor: u32,
    /// Committed image contents, set by `commit_image`.
    pub committed: Option<Vec<u8>>,
    /// Bitmap passed at commit time.
    pub committed_bitmap: Option<Vec<u8>>,
    /// Number of `cancel_image` calls.
    pub cancels: usize,
    /// Whether the new-image flag was set.
    pub new_image_flag: bool,

    pub fail_init: bool,
    pub fail_start: Option<StartFailure>,
    pub fail_push: bool,
    pub fail_commit: bool,
}

/// Which way `start_image` should fail.
#[derive(Debug, Clone, Copy)]
pub enum StartFailure {
    InvalidOperation,
    Flash,
    TooLarge,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes pushed so far (staged, not yet committed).
    pub fn staged_data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_staged(&self) -> bool {
        self.staged
    }
}

impl ImageStore for MemoryStore {
    fn init(&mut self) -> Result<(), StoreError> {
        if self.fail_init {
            return Err(StoreError::Flash("injected init failure".into()));
        }
        Ok(())
    }

    fn start_image(&mut self, size: u32) -> Result<(), StoreError> {
        match self.fail_start {
            Some(StartFailure::InvalidOperation) => return Err(StoreError::InvalidOperation),
            Some(StartFailure::Flash) => {
                return Err(StoreError::Flash("injected start failure".into()));
            }
            Some(StartFailure::TooLarge) => {
                return Err(StoreError::ImageTooLarge { size, max: 0 });
            }
            None => {}
        }
        if self.staged {
            return Err(StoreError::InvalidOperation);
        }
        self.staged = true;
        self.cursor = 0;
        self.data = vec![0; size as usize];
        Ok(())
    }

    fn push_chunk(&mut self, data: &[u8], offset_hint: Option<u32>) -> Result<(), StoreError> {
        if !self.staged {
            return Err(StoreError::InvalidOperation);
        }
        if self.fail_push {
            return Err(StoreError::Flash("injected push failure".into()));
        }
        let offset = offset_hint.unwrap_or(self.cursor) as usize;
        if offset + data.len() > self.data.len() {
            return Err(StoreError::Flash("write beyond staged size".into()));
        }
        self.data[offset..offset + data.len()].copy_from_slice(data);
        if offset_hint.is_none() {
            self.cursor += data.len() as u32;
        }
        Ok(())
    }

    fn commit_image(&mut self, bitmap: Option<&[u8]>) -> Result<(), StoreError> {
        if !self.staged {
            return Err(StoreError::InvalidOperation);
        }
        if self.fail_commit {
            return Err(StoreError::Flash("injected commit failure".into()));
        }
        self.staged = false;
        self.committed = Some(std::mem::take(&mut self.data));
        self.committed_bitmap = bitmap.map(|b| b.to_vec());
        Ok(())
    }

    fn cancel_image(&mut self) {
        if self.staged {
            self.staged = false;
            self.data.clear();
        }
        self.cancels += 1;
    }

    fn set_new_image_flag(&mut self) {
        self.new_image_flag = true;
    }

    fn read_back(&mut self, buf: &mut [u8], offset: u32) -> Result<(), StoreError> {
        let offset = offset as usize;
        if !self.staged && self.committed.is_none() {
            return Err(StoreError::InvalidOperation);
        }
        let source = if self.staged {
            &self.data
        } else {
            self.committed.as_ref().unwrap()
        };
        if offset + buf.len() > source.len() {
            return Err(StoreError::Flash("read beyond staged size".into()));
        }
        buf.copy_from_slice(&source[offset..offset + buf.len()]);
        Ok(())
    }
}
