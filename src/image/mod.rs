//! Disk image files and byte-level content placement.

pub mod assemble;

pub use assemble::{create_volume_image, place_bare_content, BareBlob, VolumeImage};

use crate::error::ImageError;
use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const COPY_CHUNK: usize = 64 * 1024;

/// A fixed-size image file.
#[derive(Debug, Clone)]
pub struct Image {
    path: PathBuf,
}

impl Image {
    /// Create (or reset) `path` as a zero-filled sparse file of `size` bytes.
    pub fn allocate(path: &Path, size: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("creating image '{}'", path.display()))?;
        // Shrinking to zero first guarantees every byte reads back as zero.
        file.set_len(0)
            .and_then(|_| file.set_len(size))
            .with_context(|| format!("sizing image '{}' to {} bytes", path.display(), size))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Wrap an existing image without touching its contents.
    pub fn open(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)
            .with_context(|| format!("reading size of '{}'", self.path.display()))?
            .len())
    }

    /// Copy `blob` into the image at `offset`, at most `limit` bytes.
    ///
    /// All-zero chunks are skipped so the target stays sparse. Returns the
    /// number of bytes taken from the blob.
    pub fn copy_blob(&self, blob: &Path, offset: u64, limit: Option<u64>) -> Result<u64> {
        let mut src =
            File::open(blob).with_context(|| format!("opening '{}'", blob.display()))?;
        let mut dst = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .with_context(|| format!("opening image '{}'", self.path.display()))?;

        let mut buf = vec![0u8; COPY_CHUNK];
        let mut copied = 0u64;
        loop {
            let want = match limit {
                Some(limit) if limit - copied < COPY_CHUNK as u64 => (limit - copied) as usize,
                _ => COPY_CHUNK,
            };
            if want == 0 {
                break;
            }
            let read = src
                .read(&mut buf[..want])
                .with_context(|| format!("reading '{}'", blob.display()))?;
            if read == 0 {
                break;
            }
            let chunk = &buf[..read];
            if chunk.iter().any(|&b| b != 0) {
                dst.seek(SeekFrom::Start(offset + copied))?;
                dst.write_all(chunk).with_context(|| {
                    format!("writing '{}' into '{}'", blob.display(), self.path.display())
                })?;
            }
            copied += read as u64;
        }

        // Trailing zero chunks were skipped; make sure the file still
        // reaches the end of the copied region.
        let end = offset + copied;
        if dst.metadata()?.len() < end {
            dst.set_len(end)?;
        }
        Ok(copied)
    }

    /// Write `value` as a little-endian u32 at `offset`.
    ///
    /// Never extends the file.
    pub fn write_value_at_offset(&self, value: u32, offset: u64) -> Result<()> {
        let file_size = self.size()?;
        if offset.checked_add(4).map_or(true, |end| end > file_size) {
            return Err(ImageError::OffsetOutOfRange { offset, file_size }.into());
        }
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .with_context(|| format!("opening image '{}'", self.path.display()))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&value.to_le_bytes())?;
        Ok(())
    }
}
