//! File-backed image store.
//!
//! Stages the incoming image as `image.partial` inside the store
//! directory and renames it to `image.bin` on commit, so a crashed
//! download never leaves a half image where the bootloader looks.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::{ImageStore, StoreError};

const PARTIAL_NAME: &str = "image.partial";
const IMAGE_NAME: &str = "image.bin";
const BITMAP_NAME: &str = "image.bitmap";
const FLAG_NAME: &str = "upgrade.flag";

struct Staged {
    file: File,
    size: u32,
    cursor: u32,
}

pub struct FileStore {
    dir: PathBuf,
    max_image_size: u32,
    staged: Option<Staged>,
}

impl FileStore {
    pub fn new(dir: impl AsRef<Path>, max_image_size: u32) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            max_image_size,
            staged: None,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl ImageStore for FileStore {
    fn init(&mut self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        // A partial image from a previous run is worthless.
        let partial = self.path(PARTIAL_NAME);
        if partial.exists() {
            fs::remove_file(&partial)?;
        }
        Ok(())
    }

    fn start_image(&mut self, size: u32) -> Result<(), StoreError> {
        if self.staged.is_some() {
            return Err(StoreError::InvalidOperation);
        }
        if size > self.max_image_size {
            return Err(StoreError::ImageTooLarge {
                size,
                max: self.max_image_size,
            });
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.path(PARTIAL_NAME))?;
        file.set_len(size as u64)?;
        debug!(size = size, "image staging started");
        self.staged = Some(Staged {
            file,
            size,
            cursor: 0,
        });
        Ok(())
    }

    fn push_chunk(&mut self, data: &[u8], offset_hint: Option<u32>) -> Result<(), StoreError> {
        let staged = self.staged.as_mut().ok_or(StoreError::InvalidOperation)?;
        let offset = offset_hint.unwrap_or(staged.cursor);
        if offset as u64 + data.len() as u64 > staged.size as u64 {
            return Err(StoreError::Flash(format!(
                "write of {} bytes at {offset} beyond staged size {}",
                data.len(),
                staged.size
            )));
        }
        staged.file.seek(SeekFrom::Start(offset as u64))?;
        staged.file.write_all(data)?;
        if offset_hint.is_none() {
            staged.cursor += data.len() as u32;
        }
        Ok(())
    }

    fn commit_image(&mut self, bitmap: Option<&[u8]>) -> Result<(), StoreError> {
        let staged = self.staged.take().ok_or(StoreError::InvalidOperation)?;
        staged.file.sync_all()?;
        drop(staged);
        if let Some(bitmap) = bitmap {
            fs::write(self.path(BITMAP_NAME), bitmap)?;
        }
        fs::rename(self.path(PARTIAL_NAME), self.path(IMAGE_NAME))?;
        info!(path = %self.path(IMAGE_NAME).display(), "image committed");
        Ok(())
    }

    fn cancel_image(&mut self) {
        if self.staged.take().is_some() {
            if let Err(e) = fs::remove_file(self.path(PARTIAL_NAME)) {
                warn!(error = %e, "failed to remove partial image");
            }
        }
    }

    fn set_new_image_flag(&mut self) {
        if let Err(e) = fs::write(self.path(FLAG_NAME), b"1") {
            warn!(error = %e, "failed to write upgrade flag");
        }
    }

    fn read_back(&mut self, buf: &mut [u8], offset: u32) -> Result<(), StoreError> {
        let staged = self.staged.as_mut().ok_or(StoreError::InvalidOperation)?;
        staged.file.seek(SeekFrom::Start(offset as u64))?;
        staged.file.read_exact(buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(tag: &str) -> FileStore {
        let dir = std::env::temp_dir().join(format!("ota-store-test-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        FileStore::new(dir, 1 << 20)
    }

    #[test]
    fn test_stage_commit_cycle() {
        let mut store = temp_store("commit");
        store.init().unwrap();
        store.start_image(16).unwrap();
        store.push_chunk(&[1, 2, 3, 4, 5, 6, 7, 8], None).unwrap();
        store.push_chunk(&[9, 10, 11, 12, 13, 14, 15, 16], None).unwrap();

        let mut back = [0u8; 4];
        store.read_back(&mut back, 4).unwrap();
        assert_eq!(back, [5, 6, 7, 8]);

        store.commit_image(Some(&[0xFF, 0x0F])).unwrap();
        let image = fs::read(store.path(IMAGE_NAME)).unwrap();
        assert_eq!(image, (1..=16u8).collect::<Vec<_>>());
        assert_eq!(fs::read(store.path(BITMAP_NAME)).unwrap(), vec![0xFF, 0x0F]);
        let _ = fs::remove_dir_all(&store.dir);
    }

    #[test]
    fn test_offset_hint_writes_out_of_order() {
        let mut store = temp_store("offset");
        store.init().unwrap();
        store.start_image(8).unwrap();
        store.push_chunk(&[5, 6, 7, 8], Some(4)).unwrap();
        store.push_chunk(&[1, 2, 3, 4], Some(0)).unwrap();
        store.commit_image(None).unwrap();
        let image = fs::read(store.path(IMAGE_NAME)).unwrap();
        assert_eq!(image, (1..=8u8).collect::<Vec<_>>());
        let _ = fs::remove_dir_all(&store.dir);
    }

    #[test]
    fn test_guard_rails() {
        let mut store = temp_store("guards");
        store.init().unwrap();
        // No staged image yet.
        assert!(matches!(
            store.push_chunk(&[0], None),
            Err(StoreError::InvalidOperation)
        ));
        assert!(matches!(
            store.commit_image(None),
            Err(StoreError::InvalidOperation)
        ));

        store.start_image(4).unwrap();
        // Double start.
        assert!(matches!(
            store.start_image(4),
            Err(StoreError::InvalidOperation)
        ));
        // Write past the staged size.
        assert!(matches!(
            store.push_chunk(&[0; 8], None),
            Err(StoreError::Flash(_))
        ));

        store.cancel_image();
        assert!(!store.path(PARTIAL_NAME).exists());
        let _ = fs::remove_dir_all(&store.dir);
    }

    #[test]
    fn test_oversized_image_rejected() {
        let mut store = temp_store("oversize");
        store.init().unwrap();
        store.max_image_size = 64;
        assert!(matches!(
            store.start_image(65),
            Err(StoreError::ImageTooLarge { .. })
        ));
        let _ = fs::remove_dir_all(&store.dir);
    }
}
