//! Disk layout arithmetic.
//!
//! Resolves every structure of a volume to a concrete byte range, checks
//! the ranges for overlap, and derives the disk image size. Nothing here
//! touches the disk except [`estimate_dir_size`], which walks a content
//! tree to size the rootfs.

use crate::config::{ImageSize, VolumeKey};
use crate::error::LayoutError;
use crate::gadget::size::mib;
use crate::gadget::{StructureRole, StructureSpec, VolumeSpec};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

/// Structures without an explicit offset never start below this.
pub const MIN_STRUCTURE_OFFSET: u64 = mib(1);

/// ext4 metadata on a ~100MiB filesystem is a little over 7MiB.
pub const ROOTFS_PADDING: u64 = mib(8);

/// Trailing space reserved for the backup GPT (34 sectors, rounded).
pub const BACKUP_GPT_RESERVE_KIB: u64 = 17;

const ALIGNMENT: u64 = 512;

/// Resolved byte range of one structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureLayout {
    pub offset: u64,
    pub size: u64,
}

impl StructureLayout {
    /// End of the range. [`calculate`] only returns layouts whose ends fit
    /// in a `u64`.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }

    fn checked_end(&self, what: impl FnOnce() -> String) -> Result<u64, LayoutError> {
        self.offset
            .checked_add(self.size)
            .ok_or_else(|| LayoutError::OutOfRange {
                what: what(),
                offset: self.offset,
                size: self.size,
            })
    }
}

/// Resolved layout of a volume, indexed like `VolumeSpec::structures`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeLayout {
    pub structures: Vec<StructureLayout>,
    /// Farthest `offset + size` across all structures.
    pub farthest_end: u64,
}

impl VolumeLayout {
    /// Minimum disk image size that holds every structure plus the
    /// backup GPT.
    pub fn minimum_image_size(&self) -> u64 {
        (self.farthest_end.div_ceil(1024) + BACKUP_GPT_RESERVE_KIB) * 1024
    }
}

/// Compute offsets and sizes for every structure of `volume`.
///
/// `rootfs_size` is the measured size of the root filesystem contents;
/// `system-data`/`system-seed` structures grow to hold it.
pub fn calculate(volume: &VolumeSpec, rootfs_size: u64) -> Result<VolumeLayout, LayoutError> {
    let sizes: Vec<u64> = volume
        .structures
        .iter()
        .map(|structure| resolve_size(structure, rootfs_size))
        .collect();

    let mut layouts = vec![StructureLayout { offset: 0, size: 0 }; volume.structures.len()];
    let mut previous_end = 0;
    let mut farthest_end = 0;
    for (index, structure) in volume.structures.iter().enumerate() {
        if structure.implicit {
            continue;
        }
        let offset = match structure.offset {
            Some(offset) => offset,
            None if structure.has_role(StructureRole::Mbr) => 0,
            None => previous_end.max(MIN_STRUCTURE_OFFSET),
        };
        layouts[index] = StructureLayout {
            offset,
            size: sizes[index],
        };
        previous_end = layouts[index].checked_end(|| structure.identity())?;
        farthest_end = farthest_end.max(previous_end);
    }
    for (index, structure) in volume.structures.iter().enumerate() {
        if !structure.implicit {
            continue;
        }
        layouts[index] = StructureLayout {
            offset: farthest_end.max(MIN_STRUCTURE_OFFSET),
            size: sizes[index],
        };
        farthest_end = layouts[index].checked_end(|| structure.identity())?;
    }
    // The image also carries the backup GPT past the farthest structure.
    if farthest_end > u64::MAX - (BACKUP_GPT_RESERVE_KIB + 1) * 1024 {
        return Err(LayoutError::OutOfRange {
            what: volume.name.clone(),
            offset: farthest_end,
            size: BACKUP_GPT_RESERVE_KIB * 1024,
        });
    }

    check_overlap(volume, &layouts)?;

    for (structure, layout) in volume.structures.iter().zip(&layouts) {
        if layout.offset % ALIGNMENT != 0 || layout.size % ALIGNMENT != 0 {
            warn!(
                "structure {} in volume {} is not aligned to {} bytes (offset {}, size {})",
                structure.identity(),
                volume.name,
                ALIGNMENT,
                layout.offset,
                layout.size
            );
        }
    }

    Ok(VolumeLayout {
        structures: layouts,
        farthest_end,
    })
}

fn resolve_size(structure: &StructureSpec, rootfs_size: u64) -> u64 {
    let rootfs_role = structure.role.is_some_and(StructureRole::is_rootfs);
    match structure.size {
        None if rootfs_role => rootfs_size,
        Some(size) if rootfs_role && size < rootfs_size => {
            warn!(
                "rootfs partition size ({}) smaller than actual rootfs contents {}",
                size, rootfs_size
            );
            rootfs_size
        }
        Some(size) => size,
        None => 0,
    }
}

fn check_overlap(volume: &VolumeSpec, layouts: &[StructureLayout]) -> Result<(), LayoutError> {
    let mut order: Vec<usize> = (0..layouts.len()).collect();
    order.sort_by_key(|&index| layouts[index].offset);
    let mut previous_end = 0;
    for index in order {
        let layout = layouts[index];
        if layout.offset < previous_end {
            return Err(LayoutError::Overlap {
                what: volume.structures[index].identity(),
                offset: layout.offset,
                previous_end,
            });
        }
        previous_end = layout.end();
    }
    Ok(())
}

/// Pick the final image size for a volume.
///
/// A requested size below the computed minimum is ignored with a warning.
pub fn select_image_size(
    minimum: u64,
    requested: Option<&ImageSize>,
    volume_index: usize,
    volume_name: &str,
) -> u64 {
    let wanted = match requested {
        None => return minimum,
        Some(ImageSize::Single(size)) => *size,
        Some(ImageSize::PerVolume(sizes)) => {
            let by_index = sizes.iter().find_map(|(key, size)| match key {
                VolumeKey::Index(index) if *index == volume_index => Some(*size),
                _ => None,
            });
            let by_name = sizes.iter().find_map(|(key, size)| match key {
                VolumeKey::Name(name) if name == volume_name => Some(*size),
                _ => None,
            });
            match (by_index, by_name) {
                (Some(_), Some(_)) => {
                    warn!("Ignoring ambiguous volume size; index+name given");
                    return minimum;
                }
                (Some(size), None) | (None, Some(size)) => size,
                (None, None) => return minimum,
            }
        }
    };
    if wanted < minimum {
        warn!(
            "Ignoring image size smaller than minimum required size: vol[{}]:{} {} < {}",
            volume_index, volume_name, wanted, minimum
        );
        minimum
    } else {
        wanted
    }
}

/// Estimate the space a directory tree needs inside a filesystem: the sum
/// of regular file sizes times 1.5, rounded up.
pub fn estimate_dir_size(path: &Path) -> Result<u64> {
    let mut total: u64 = 0;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.with_context(|| format!("walking '{}'", path.display()))?;
        if entry.file_type().is_file() {
            let metadata = entry
                .metadata()
                .with_context(|| format!("reading metadata of '{}'", entry.path().display()))?;
            total += metadata.len();
        }
    }
    Ok((total * 3).div_ceil(2))
}

/// Size of the root filesystem image for a populated rootfs tree.
pub fn rootfs_size(path: &Path) -> Result<u64> {
    Ok(estimate_dir_size(path)? + ROOTFS_PADDING)
}

/// Fail with `DoesNotFit` when content ending at `end` overruns a structure
/// of `size` bytes.
pub fn check_fit(
    volume_name: &str,
    part_number: usize,
    structure: &StructureSpec,
    end: u64,
    size: u64,
) -> Result<(), LayoutError> {
    if end > size {
        return Err(LayoutError::DoesNotFit {
            part_number,
            part_path: format!("volumes:<{}>:structure:<{}>", volume_name, structure.identity()),
            overage: end - size,
        });
    }
    Ok(())
}
