//! Capability interfaces over external OS tooling.
//!
//! The builder never shells out directly; it talks to these traits so the
//! pipeline can run against recording fakes in tests.

pub mod live_build;
pub mod mkfs;
pub mod partition;
pub mod snap;

pub use live_build::LiveBuild;
pub use mkfs::MkfsTools;
pub use partition::{default_partition_tool, Sfdisk, Sgdisk};
pub use snap::SnapPrepareImage;

use crate::gadget::{FileSystemType, StructureType};
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Inputs for producing the unpacked image tree.
#[derive(Debug, Clone, Default)]
pub struct MaterializeRequest {
    /// Model assertion or gadget source.
    pub source: Option<PathBuf>,
    /// Directory the tool populates.
    pub target: PathBuf,
    /// Scratch space for auxiliary files.
    pub workdir: PathBuf,
    pub channel: Option<String>,
    pub snaps: Vec<String>,
    pub cloud_init: Option<PathBuf>,
    pub disable_console_conf: bool,
    pub factory_image: bool,
    /// Extra environment for build scripts.
    pub env: BTreeMap<String, String>,
}

/// Produces a populated root/boot content tree on local storage.
pub trait ContentMaterializer {
    fn materialize(&self, request: &MaterializeRequest) -> Result<()>;
}

/// Creates and fills filesystem images.
pub trait FilesystemBuilder {
    /// Create an empty filesystem of `kind` inside `image`.
    fn format(&self, kind: FileSystemType, image: &Path, label: Option<&str>) -> Result<()>;

    /// Fill `image` with the contents of `dir`, creating the filesystem
    /// first when the tool requires it.
    fn populate(
        &self,
        kind: FileSystemType,
        image: &Path,
        dir: &Path,
        label: Option<&str>,
    ) -> Result<()>;
}

/// Partition table manipulation on an image file.
pub trait PartitionTool {
    /// Create a partition and return its 1-based number.
    fn create_partition(
        &mut self,
        offset: u64,
        size: u64,
        name: Option<&str>,
        bootable: bool,
    ) -> Result<usize>;

    fn set_partition_type(&mut self, number: usize, kind: &StructureType) -> Result<()>;

    /// Human-readable dump of the partition table.
    fn diagnostics(&self) -> Result<String>;
}

pub const SECTOR_SIZE: u64 = 512;

pub(crate) fn sectors(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE)
}
