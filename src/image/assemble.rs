//! Volume image assembly.
//!
//! Partition entries are all created first; part contents and type codes
//! are written in a second pass because committing the table through the
//! partitioner resets type GUIDs and can clobber hybrid MBR regions.

use super::Image;
use crate::error::LayoutError;
use crate::gadget::{OffsetWrite, StructureRole, StructureSpec, VolumeSchema, VolumeSpec};
use crate::layout::{check_fit, VolumeLayout};
use crate::tools::{sectors, PartitionTool, SECTOR_SIZE};
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, enabled, Level};

/// One raw blob destined for a bare structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BareBlob {
    pub path: PathBuf,
    /// Offset inside the structure; defaults to the end of the previous blob.
    pub offset: Option<u64>,
    /// Space reserved for the blob; must hold the whole file.
    pub size: Option<u64>,
}

/// Copy blobs into a structure's private image.
///
/// Blobs land back to back unless an explicit offset moves the cursor. A
/// declared size reserves that many bytes; the gap after the file stays
/// zero.
pub fn place_bare_content(
    image: &Image,
    volume_name: &str,
    part_number: usize,
    structure: &StructureSpec,
    structure_size: u64,
    blobs: &[BareBlob],
) -> Result<()> {
    let mut offset = 0u64;
    for blob in blobs {
        let file_size = fs::metadata(&blob.path)
            .with_context(|| format!("reading '{}'", blob.path.display()))?
            .len();
        let reserved = match blob.size {
            Some(size) if size < file_size => bail!(
                "Declared size {} < actual size {} of: {}",
                size,
                file_size,
                blob.path.display()
            ),
            Some(size) => size,
            None => file_size,
        };
        if let Some(explicit) = blob.offset {
            offset = explicit;
        }
        let end = offset
            .checked_add(reserved)
            .ok_or_else(|| LayoutError::OutOfRange {
                what: structure.identity(),
                offset,
                size: reserved,
            })?;
        check_fit(volume_name, part_number, structure, end, structure_size)?;
        image.copy_blob(&blob.path, offset, None)?;
        offset = end;
    }
    Ok(())
}

/// Everything needed to lay one volume onto disk.
#[derive(Debug, Clone, Copy)]
pub struct VolumeImage<'a> {
    pub volume: &'a VolumeSpec,
    pub layout: &'a VolumeLayout,
    /// Prepared image per structure; `None` for structures left to first
    /// boot.
    pub part_images: &'a [Option<PathBuf>],
    pub image_size: u64,
}

/// Allocate `target` and write the partition table and contents.
pub fn create_volume_image(
    plan: &VolumeImage<'_>,
    target: &Path,
    tool: &mut dyn PartitionTool,
) -> Result<Image> {
    let VolumeImage {
        volume,
        layout,
        part_images,
        image_size,
    } = *plan;
    if volume.structures.len() != layout.structures.len()
        || volume.structures.len() != part_images.len()
    {
        bail!(
            "Volume {} has {} structures but {} placements and {} part images",
            volume.name,
            volume.structures.len(),
            layout.structures.len(),
            part_images.len()
        );
    }

    let image = Image::allocate(target, image_size)?;

    let mut numbers = vec![None; volume.structures.len()];
    for (i, structure) in volume.structures.iter().enumerate() {
        if !structure.is_partition() || part_images[i].is_none() {
            continue;
        }
        let place = &layout.structures[i];
        let bootable =
            volume.schema == VolumeSchema::Mbr && structure.has_role(StructureRole::SystemBoot);
        let name = match (&structure.name, volume.schema) {
            (Some(name), _) => Some(name.as_str()),
            (None, VolumeSchema::Gpt) if structure.has_role(StructureRole::SystemData) => {
                Some("writable")
            }
            (None, _) => None,
        };
        let number = tool.create_partition(place.offset, place.size, name, bootable)?;
        numbers[i] = Some(number);
    }

    for (i, structure) in volume.structures.iter().enumerate() {
        let Some(part_image) = &part_images[i] else {
            continue;
        };
        let place = &layout.structures[i];
        let limit = sectors(place.size) * SECTOR_SIZE;
        image.copy_blob(part_image, place.offset, Some(limit))?;
        if let Some(number) = numbers[i] {
            tool.set_partition_type(number, &structure.structure_type)?;
        }
    }

    for (i, structure) in volume.structures.iter().enumerate() {
        let Some(write) = &structure.offset_write else {
            continue;
        };
        let dest = match write {
            OffsetWrite::Absolute(dest) => *dest,
            OffsetWrite::Relative { label, delta } => {
                let Some(j) = volume
                    .structures
                    .iter()
                    .position(|other| other.name.as_deref() == Some(label.as_str()))
                else {
                    bail!("offset-write refers to unknown structure '{}'", label);
                };
                layout.structures[j]
                    .offset
                    .checked_add(*delta)
                    .with_context(|| {
                        format!("offset-write {}+{} is out of range", label, delta)
                    })?
            }
        };
        let sector = layout.structures[i].offset / SECTOR_SIZE;
        let value = u32::try_from(sector).with_context(|| {
            format!("sector {} of {} does not fit in 32 bits", sector, structure.identity())
        })?;
        image.write_value_at_offset(value, dest)?;
    }

    if enabled!(Level::DEBUG) {
        match tool.diagnostics() {
            Ok(dump) => debug!("Partition table of {}:\n{}", target.display(), dump),
            Err(err) => debug!("No partition table dump for {}: {:#}", target.display(), err),
        }
    }
    Ok(image)
}
