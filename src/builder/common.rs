//! Base implementation of every pipeline step.
//!
//! Each step does its work against [`BuildState`] and then pushes the step
//! that should follow it. Flavors replace individual entries and reuse the
//! rest.

use super::{BuildState, Step, VolumeArtifacts};
use crate::filesystem::{copy_content, copy_dir_missing, copy_dir_recursive, move_children};
use crate::gadget::{self, BootLoader, ContentSpec, FileSystemType, StructureRole};
use crate::hooks::{HOOK_ROOTFS_ENV, POST_POPULATE_ROOTFS};
use crate::image::{create_volume_image, place_bare_content, BareBlob, Image, VolumeImage};
use crate::layout;
use crate::preflight;
use crate::state_machine::{Queue, StepTable};
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub fn table() -> StepTable<Step, BuildState> {
    StepTable::new()
        .with(Step::MakeTemporaryDirectories, make_temporary_directories)
        .with(Step::PrepareGadgetTree, prepare_gadget_tree)
        .with(Step::PrepareImage, prepare_image)
        .with(Step::LoadGadgetYaml, load_gadget_yaml)
        .with(Step::PopulateRootfsContents, populate_rootfs_contents)
        .with(Step::PopulateRootfsContentsHooks, populate_rootfs_contents_hooks)
        .with(Step::GenerateDiskInfo, generate_disk_info)
        .with(Step::CalculateRootfsSize, calculate_rootfs_size)
        .with(Step::PrePopulateBootfsContents, pre_populate_bootfs_contents)
        .with(Step::PopulateBootfsContents, populate_bootfs_contents)
        .with(Step::PrepareFilesystems, prepare_filesystems)
        .with(Step::PopulateFilesystems, populate_filesystems)
        .with(Step::MakeDisk, make_disk)
        .with(Step::GenerateManifests, generate_manifests)
        .with(Step::Finish, finish)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("creating '{}'", path.display()))
}

fn part_dir(basedir: &Path, index: usize) -> PathBuf {
    basedir.join(format!("part{}", index))
}

pub fn make_temporary_directories(state: &mut BuildState, queue: &mut Queue<Step>) -> Result<()> {
    create_dir(&state.rootfs())?;
    create_dir(&state.unpackdir())?;
    create_dir(&state.volumedir())?;
    queue.push(Step::PrepareGadgetTree);
    Ok(())
}

pub fn prepare_gadget_tree(_state: &mut BuildState, queue: &mut Queue<Step>) -> Result<()> {
    queue.push(Step::PrepareImage);
    Ok(())
}

/// Point the build at the gadget.yaml inside the unpacked gadget tree.
pub fn prepare_image(state: &mut BuildState, queue: &mut Queue<Step>) -> Result<()> {
    state.record.yaml_path = Some(state.gadget_dir().join("meta").join("gadget.yaml"));
    queue.push(Step::LoadGadgetYaml);
    Ok(())
}

pub fn load_gadget_yaml(state: &mut BuildState, queue: &mut Queue<Step>) -> Result<()> {
    let yaml_path = state
        .record
        .yaml_path
        .clone()
        .context("no gadget.yaml location recorded")?;
    let text = fs::read_to_string(&yaml_path)
        .with_context(|| format!("reading '{}'", yaml_path.display()))?;
    fs::copy(&yaml_path, state.workdir.join("gadget.yaml"))
        .with_context(|| format!("preserving '{}'", yaml_path.display()))?;
    let gadget = gadget::parse(&text)?;
    info!(
        "Loaded gadget with {} volume(s){}",
        gadget.volumes.len(),
        if gadget.seeded { ", seeded" } else { "" }
    );
    if state.tools.check_host_tools {
        preflight::check_partition_tools(&gadget)?;
    }

    let volumedir = state.volumedir();
    state.record.volumes = Vec::with_capacity(gadget.volumes.len());
    for volume in &gadget.volumes {
        let basedir = volumedir.join(&volume.name);
        create_dir(&basedir)?;
        state.record.volumes.push(VolumeArtifacts {
            basedir,
            ..VolumeArtifacts::default()
        });
    }
    state.record.gadget = Some(gadget);

    if let Some(preserve) = &state.config.preserve_unpack {
        let dst = preserve.join("unpack");
        info!("Preserving unpack directory in {}", dst.display());
        copy_dir_recursive(&state.unpackdir(), &dst)?;
    }
    queue.push(Step::PopulateRootfsContents);
    Ok(())
}

pub fn populate_rootfs_contents(_state: &mut BuildState, queue: &mut Queue<Step>) -> Result<()> {
    queue.push(Step::PopulateRootfsContentsHooks);
    Ok(())
}

/// Write a nocloud seed with the configured user-data into `root`.
pub fn write_cloud_init_seed(state: &BuildState, root: &Path) -> Result<()> {
    let Some(user_data) = &state.config.cloud_init else {
        return Ok(());
    };
    let seed = root.join("var/lib/cloud/seed/nocloud-net");
    create_dir(&seed)?;
    fs::write(seed.join("meta-data"), "instance-id: nocloud-static\n")
        .with_context(|| format!("writing cloud-init meta-data in '{}'", seed.display()))?;
    fs::copy(user_data, seed.join("user-data"))
        .with_context(|| format!("copying cloud-init user-data '{}'", user_data.display()))?;
    Ok(())
}

pub fn populate_rootfs_contents_hooks(
    state: &mut BuildState,
    queue: &mut Queue<Step>,
) -> Result<()> {
    if state.is_seeded() {
        debug!("Building from a seeded gadget - skipping the {} hook", POST_POPULATE_ROOTFS);
    } else {
        let rootfs = state.rootfs();
        let rootfs = rootfs.to_string_lossy();
        state
            .hooks
            .fire(POST_POPULATE_ROOTFS, &[(HOOK_ROOTFS_ENV, rootfs.as_ref())])?;
    }
    queue.push(Step::GenerateDiskInfo);
    Ok(())
}

pub fn generate_disk_info(state: &mut BuildState, queue: &mut Queue<Step>) -> Result<()> {
    if let Some(disk_info) = &state.config.disk_info {
        let dir = state.rootfs().join(".disk");
        create_dir(&dir)?;
        fs::copy(disk_info, dir.join("info"))
            .with_context(|| format!("copying disk info '{}'", disk_info.display()))?;
    }
    queue.push(Step::CalculateRootfsSize);
    Ok(())
}

pub fn calculate_rootfs_size(state: &mut BuildState, queue: &mut Queue<Step>) -> Result<()> {
    state.record.rootfs_size = layout::rootfs_size(&state.rootfs())?;
    debug!("rootfs size: {} bytes", state.record.rootfs_size);
    queue.push(Step::PrePopulateBootfsContents);
    Ok(())
}

pub fn pre_populate_bootfs_contents(
    state: &mut BuildState,
    queue: &mut Queue<Step>,
) -> Result<()> {
    let gadget = state.gadget()?;
    for (volume, artifacts) in gadget.volumes.iter().zip(&state.record.volumes) {
        for index in 0..volume.structures.len() {
            create_dir(&part_dir(&artifacts.basedir, index))?;
        }
    }
    queue.push(Step::PopulateBootfsContents);
    Ok(())
}

pub fn populate_bootfs_contents(state: &mut BuildState, queue: &mut Queue<Step>) -> Result<()> {
    let gadget = state.gadget()?.clone();
    let unpackdir = state.unpackdir();
    let gadget_dir = state.gadget_dir();
    let rootfs = state.rootfs();

    for (vi, volume) in gadget.volumes.iter().enumerate() {
        let basedir = state.record.volumes[vi].basedir.clone();
        for (index, structure) in volume.structures.iter().enumerate() {
            if gadget.should_skip(structure) {
                continue;
            }
            // The seed partition doubles as the boot partition and shares
            // the rootfs tree.
            let target_dir = if structure.has_role(StructureRole::SystemSeed) {
                rootfs.clone()
            } else {
                part_dir(&basedir, index)
            };

            if structure.has_role(StructureRole::SystemBoot)
                || structure.has_role(StructureRole::SystemSeed)
            {
                state.record.volumes[vi].bootfs = Some(target_dir.clone());
                copy_bootloader_files(&unpackdir, volume.bootloader, &target_dir)?;
            }

            if structure.filesystem == FileSystemType::None {
                continue;
            }
            let resolved = unpackdir
                .join("resolved-content")
                .join(&volume.name)
                .join(format!("part{}", index));
            if resolved.is_dir() {
                copy_dir_missing(&resolved, &target_dir)?;
                continue;
            }
            for content in &structure.content {
                if let ContentSpec::Files { source, target } = content {
                    copy_content(&gadget_dir, source, &target_dir, target)?;
                }
            }
        }
    }
    queue.push(Step::PrepareFilesystems);
    Ok(())
}

fn copy_bootloader_files(
    unpackdir: &Path,
    bootloader: Option<BootLoader>,
    target_dir: &Path,
) -> Result<()> {
    let boot = unpackdir.join("image").join("boot");
    let (src, dst) = match bootloader {
        Some(BootLoader::UBoot) => (boot.join("uboot"), target_dir.to_path_buf()),
        // The signed grub image looks for its files in EFI/ubuntu.
        Some(BootLoader::Grub) => (boot.join("grub"), target_dir.join("EFI").join("ubuntu")),
        Some(BootLoader::Lk) => bail!("Unsupported volume bootloader value: lk"),
        None => bail!("Unsupported volume bootloader value: none"),
    };
    if !src.is_dir() {
        debug!("No bootloader bits prepared in the rootfs - skipping boot copies.");
        return Ok(());
    }
    move_children(&src, &dst, &[])
}

pub fn prepare_filesystems(state: &mut BuildState, queue: &mut Queue<Step>) -> Result<()> {
    let gadget = state.gadget()?.clone();
    let rootfs_size = state.record.rootfs_size;

    for (vi, volume) in gadget.volumes.iter().enumerate() {
        let layout = layout::calculate(volume, rootfs_size)?;
        let basedir = state.record.volumes[vi].basedir.clone();
        let mut part_images = Vec::with_capacity(volume.structures.len());
        for (index, structure) in volume.structures.iter().enumerate() {
            if gadget.should_skip(structure) {
                part_images.push(None);
                continue;
            }
            let path = basedir.join(format!("part{}.img", index));
            Image::allocate(&path, layout.structures[index].size)?;
            // The rootfs filesystem is created and filled in one go later.
            if structure.filesystem == FileSystemType::Vfat
                && !structure.has_role(StructureRole::SystemData)
            {
                state.tools.filesystems.format(
                    FileSystemType::Vfat,
                    &path,
                    structure.filesystem_label.as_deref(),
                )?;
            }
            part_images.push(Some(path));
        }
        let image_size = layout::select_image_size(
            layout.minimum_image_size(),
            state.config.image_size.as_ref(),
            vi,
            &volume.name,
        );
        let artifacts = &mut state.record.volumes[vi];
        artifacts.part_images = part_images;
        artifacts.layout = Some(layout);
        artifacts.image_size = image_size;
    }
    queue.push(Step::PopulateFilesystems);
    Ok(())
}

pub fn populate_filesystems(state: &mut BuildState, queue: &mut Queue<Step>) -> Result<()> {
    let gadget = state.gadget()?.clone();
    let rootfs = state.rootfs();
    let gadget_dir = state.gadget_dir();

    for (vi, volume) in gadget.volumes.iter().enumerate() {
        if volume.bootloader == Some(BootLoader::Lk) {
            // boot.img and snapbootsel.bin become gadget content.
            let lk = state.unpackdir().join("image").join("boot").join("lk");
            if lk.is_dir() {
                copy_dir_recursive(&lk, &gadget_dir)?;
            }
        }
        let artifacts = &state.record.volumes[vi];
        let layout = artifacts
            .layout
            .as_ref()
            .with_context(|| format!("volume {} has no layout yet", volume.name))?;
        for (index, structure) in volume.structures.iter().enumerate() {
            let Some(part_image) = &artifacts.part_images[index] else {
                continue;
            };
            let label = structure.filesystem_label.as_deref();
            let source_dir = if structure.has_role(StructureRole::SystemSeed) {
                rootfs.clone()
            } else {
                part_dir(&artifacts.basedir, index)
            };

            if structure.has_role(StructureRole::SystemData) {
                state.tools.filesystems.populate(
                    FileSystemType::Ext4,
                    part_image,
                    &rootfs,
                    Some(label.unwrap_or("writable")),
                )?;
                continue;
            }
            match structure.filesystem {
                FileSystemType::None => {
                    let blobs: Vec<BareBlob> = structure
                        .content
                        .iter()
                        .filter_map(|content| match content {
                            ContentSpec::Image {
                                image, offset, size, ..
                            } => Some(BareBlob {
                                path: gadget_dir.join(image),
                                offset: *offset,
                                size: *size,
                            }),
                            ContentSpec::Files { .. } => None,
                        })
                        .collect();
                    place_bare_content(
                        &Image::open(part_image),
                        &volume.name,
                        index,
                        structure,
                        layout.structures[index].size,
                        &blobs,
                    )?;
                }
                kind => {
                    state
                        .tools
                        .filesystems
                        .populate(kind, part_image, &source_dir, label)?;
                }
            }
        }
    }
    queue.push(Step::MakeDisk);
    Ok(())
}

pub fn make_disk(state: &mut BuildState, queue: &mut Queue<Step>) -> Result<()> {
    let gadget = state.gadget()?.clone();
    let single_output = match &state.config.output {
        Some(_) if gadget.volumes.len() > 1 => {
            warn!("-o/--output ignored for multiple volumes");
            None
        }
        output => output.clone(),
    };
    if single_output.is_none() {
        create_dir(&state.output_dir)?;
    }

    let mut images = Vec::with_capacity(gadget.volumes.len());
    for (vi, volume) in gadget.volumes.iter().enumerate() {
        let target = match &single_output {
            Some(path) => path.clone(),
            None => state.output_dir.join(format!("{}.img", volume.name)),
        };
        let artifacts = &state.record.volumes[vi];
        let layout = artifacts
            .layout
            .as_ref()
            .with_context(|| format!("volume {} has no layout yet", volume.name))?;
        let plan = VolumeImage {
            volume,
            layout,
            part_images: &artifacts.part_images,
            image_size: artifacts.image_size,
        };
        let mut tool = (state.tools.partitioner)(volume.schema, &target);
        create_volume_image(&plan, &target, tool.as_mut())?;
        info!("Wrote {} ({} bytes)", target.display(), artifacts.image_size);
        images.push(target);
    }
    state.record.images = images;
    queue.push(Step::GenerateManifests);
    Ok(())
}

pub fn generate_manifests(_state: &mut BuildState, queue: &mut Queue<Step>) -> Result<()> {
    queue.push(Step::Finish);
    Ok(())
}

pub fn finish(state: &mut BuildState, _queue: &mut Queue<Step>) -> Result<()> {
    state.record.done = true;
    Ok(())
}
