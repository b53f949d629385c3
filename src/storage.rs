//! Storage driver boundary.
//!
//! The update region is secondary storage distinct from the running firmware
//! image, so a failed or interrupted transfer can never corrupt the image the
//! device is currently executing. `FlashStore` hands out write targets into
//! that region; `WriteTarget` appends bytes in arrival order and, once the
//! image has been verified, marks the staged image as the next boot target.
//!
//! `FileFlash` is the implementation for hosts where the update region is a
//! file on disk and the boot target is a marker file read by the boot
//! supervisor. Firmware platforms implement the same pair of traits over
//! their partition API.

use crate::session::UpdateError;
use anyhow::{Context, Result};
use log::{debug, info};
use std::{
    fs::{self, File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

/// Length of the fixed image header: magic, payload length, payload CRC32.
pub const IMAGE_HEADER_LEN: usize = 12;

/// Magic bytes every firmware image starts with.
pub const IMAGE_MAGIC: [u8; 4] = *b"EMB1";

/// Self-declared metadata embedded at the start of every firmware image.
///
/// Layout (all integers little-endian):
///
/// ```text
/// offset 0..4   magic  b"EMB1"
/// offset 4..8   payload length in bytes (excluding this header)
/// offset 8..12  CRC32 (ISO-HDLC) of the payload
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageHeader {
    pub payload_len: u32,
    pub crc32: u32,
}

impl ImageHeader {
    /// Parse the header from the first bytes of an image.
    pub fn parse(raw: &[u8; IMAGE_HEADER_LEN]) -> Result<Self, UpdateError> {
        if raw[0..4] != IMAGE_MAGIC {
            return Err(UpdateError::IntegrityMismatch);
        }
        Ok(Self {
            payload_len: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            crc32: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
        })
    }

    pub fn to_bytes(self) -> [u8; IMAGE_HEADER_LEN] {
        let mut raw = [0u8; IMAGE_HEADER_LEN];
        raw[0..4].copy_from_slice(&IMAGE_MAGIC);
        raw[4..8].copy_from_slice(&self.payload_len.to_le_bytes());
        raw[8..12].copy_from_slice(&self.crc32.to_le_bytes());
        raw
    }
}

/// Wrap a raw firmware payload into a complete image (header + payload).
///
/// Used by image producers and by the test suite; the device itself only ever
/// parses headers.
pub fn encode_image(payload: &[u8]) -> Vec<u8> {
    let header = ImageHeader {
        payload_len: payload.len() as u32,
        crc32: crate::session::payload_crc32(payload),
    };
    let mut image = Vec::with_capacity(IMAGE_HEADER_LEN + payload.len());
    image.extend_from_slice(&header.to_bytes());
    image.extend_from_slice(payload);
    image
}

/// The update region of secondary storage.
pub trait FlashStore: Send + Sync {
    /// Total capacity of the update region in bytes.
    fn capacity(&self) -> u64;

    /// Open a write target of at least `min_size` bytes.
    ///
    /// Fails with [`UpdateError::StorageFull`] when `min_size` exceeds the
    /// region capacity, so oversized images are refused before any byte is
    /// streamed.
    fn open_write_target(&self, min_size: u64) -> Result<Box<dyn WriteTarget>, UpdateError>;
}

/// An open handle into the update region.
pub trait WriteTarget: Send {
    /// Program `data` at `offset`. Callers write strictly in arrival order.
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), UpdateError>;

    /// Flush the staged image and mark it as the next boot target.
    fn mark_boot_target(&mut self) -> Result<(), UpdateError>;
}

/// File-backed update region: a staging file plus a boot-target marker file,
/// both under one directory.
pub struct FileFlash {
    dir: PathBuf,
    capacity: u64,
}

impl FileFlash {
    /// File the incoming image is streamed into.
    pub const STAGED_IMAGE: &'static str = "staged.bin";
    /// Marker read by the boot supervisor on the next restart.
    pub const BOOT_MARKER: &'static str = "boot_target";

    pub fn new(dir: &Path, capacity: u64) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create update region dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            capacity,
        })
    }

    /// Currently marked boot target, if any image has been committed.
    pub fn boot_target(&self) -> Option<PathBuf> {
        let marker = self.dir.join(Self::BOOT_MARKER);
        fs::read_to_string(marker)
            .ok()
            .map(|s| PathBuf::from(s.trim()))
    }
}

impl FlashStore for FileFlash {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn open_write_target(&self, min_size: u64) -> Result<Box<dyn WriteTarget>, UpdateError> {
        if min_size > self.capacity {
            return Err(UpdateError::StorageFull);
        }

        let path = self.dir.join(Self::STAGED_IMAGE);
        debug!("opening update write target {}", path.display());

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| UpdateError::StorageWrite(e.to_string()))?;

        Ok(Box::new(FileTarget {
            file,
            path,
            marker: self.dir.join(Self::BOOT_MARKER),
            capacity: self.capacity,
        }))
    }
}

struct FileTarget {
    file: File,
    path: PathBuf,
    marker: PathBuf,
    capacity: u64,
}

impl WriteTarget for FileTarget {
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), UpdateError> {
        if offset + data.len() as u64 > self.capacity {
            return Err(UpdateError::StorageFull);
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(data))
            .map_err(|e| UpdateError::StorageWrite(e.to_string()))
    }

    fn mark_boot_target(&mut self) -> Result<(), UpdateError> {
        self.file
            .sync_all()
            .map_err(|e| UpdateError::StorageWrite(e.to_string()))?;

        // Write the marker to a temp file first so the boot target switches
        // atomically: the supervisor either sees the old marker or the new
        // one, never a partial write.
        let tmp = self.marker.with_extension("tmp");
        fs::write(&tmp, format!("{}\n", self.path.display()))
            .and_then(|()| fs::rename(&tmp, &self.marker))
            .map_err(|e| UpdateError::StorageWrite(e.to_string()))?;

        info!("boot target set to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn header_roundtrip() {
        let header = ImageHeader {
            payload_len: 512 * 1024,
            crc32: 0xdead_beef,
        };
        let parsed = ImageHeader::parse(&header.to_bytes()).expect("should parse");
        assert_eq!(parsed, header);
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut raw = ImageHeader {
            payload_len: 4,
            crc32: 0,
        }
        .to_bytes();
        raw[0] = b'X';
        assert_eq!(
            ImageHeader::parse(&raw),
            Err(UpdateError::IntegrityMismatch)
        );
    }

    #[test]
    fn open_beyond_capacity_is_storage_full() {
        let dir = TempDir::new().expect("tempdir");
        let flash = FileFlash::new(dir.path(), 1024).expect("flash");
        assert!(matches!(
            flash.open_write_target(2048),
            Err(UpdateError::StorageFull)
        ));
    }

    #[test]
    fn write_beyond_capacity_is_storage_full() {
        let dir = TempDir::new().expect("tempdir");
        let flash = FileFlash::new(dir.path(), 16).expect("flash");
        let mut target = flash.open_write_target(16).expect("target");
        target.write(0, &[0u8; 16]).expect("in-bounds write");
        assert_eq!(target.write(16, &[0u8; 1]), Err(UpdateError::StorageFull));
    }

    #[test]
    fn commit_sets_boot_marker() {
        let dir = TempDir::new().expect("tempdir");
        let flash = FileFlash::new(dir.path(), 1024).expect("flash");
        assert_eq!(flash.boot_target(), None);

        let mut target = flash.open_write_target(4).expect("target");
        target.write(0, b"fw!!").expect("write");
        target.mark_boot_target().expect("commit");

        assert_eq!(
            flash.boot_target(),
            Some(dir.path().join(FileFlash::STAGED_IMAGE))
        );
        assert_eq!(
            fs::read(dir.path().join(FileFlash::STAGED_IMAGE)).expect("staged image"),
            b"fw!!"
        );
    }

    #[test]
    fn uncommitted_write_leaves_boot_target_unchanged() {
        let dir = TempDir::new().expect("tempdir");
        let flash = FileFlash::new(dir.path(), 1024).expect("flash");
        let mut target = flash.open_write_target(4).expect("target");
        target.write(0, b"junk").expect("write");
        drop(target);
        assert_eq!(flash.boot_target(), None);
    }
}
