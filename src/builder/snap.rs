//! Steps specific to images built from a model assertion.

use super::{common, BuildState, Step};
use crate::config::Flavor;
use crate::filesystem::{is_empty_dir, move_children};
use crate::state_machine::{Queue, StepTable};
use crate::tools::MaterializeRequest;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub fn overrides(base: StepTable<Step, BuildState>) -> StepTable<Step, BuildState> {
    base.with(Step::PrepareImage, prepare_image)
        .with(Step::PopulateRootfsContents, populate_rootfs_contents)
        .with(Step::GenerateManifests, generate_manifests)
}

/// Run `snap prepare-image` into the unpack directory.
fn prepare_image(state: &mut BuildState, queue: &mut Queue<Step>) -> Result<()> {
    let Flavor::Snap(options) = &state.config.flavor else {
        bail!("snap step run for a {} build", state.config.flavor.name());
    };
    let request = MaterializeRequest {
        source: options.model_assertion.clone(),
        target: state.unpackdir(),
        workdir: state.workdir.clone(),
        channel: options.channel.clone(),
        snaps: options.snaps.clone(),
        cloud_init: state.config.cloud_init.clone(),
        disable_console_conf: options.disable_console_conf,
        factory_image: options.factory_image,
        ..MaterializeRequest::default()
    };
    state.tools.materializer.materialize(&request)?;
    common::prepare_image(state, queue)
}

fn populate_rootfs_contents(state: &mut BuildState, queue: &mut Queue<Step>) -> Result<()> {
    let unpack = state.unpackdir();
    let dst = if state.is_seeded() {
        let dst = state.rootfs();
        move_children(&unpack.join("system-seed"), &dst, &[])?;
        dst
    } else {
        let dst = state.rootfs().join("system-data");
        // The boot bits go to the boot partition instead.
        move_children(&unpack.join("image"), &dst, &["boot"])?;
        let boot = dst.join("boot");
        fs::create_dir_all(&boot).with_context(|| format!("creating '{}'", boot.display()))?;
        dst
    };
    let cloud = dst.join("etc").join("cloud");
    if cloud.is_dir() && is_empty_dir(&cloud)? {
        fs::remove_dir(&cloud).with_context(|| format!("removing '{}'", cloud.display()))?;
    }
    queue.push(Step::PopulateRootfsContentsHooks);
    Ok(())
}

/// Write `snaps.manifest` and `seed.manifest` next to the images.
fn generate_manifests(state: &mut BuildState, queue: &mut Queue<Step>) -> Result<()> {
    let rootfs = state.rootfs();
    let seed_snaps = if state.is_seeded() {
        rootfs.join("snaps")
    } else {
        rootfs.join("system-data/var/lib/snapd/seed/snaps")
    };
    let sources = [
        ("snaps.manifest", rootfs.join("system-data/var/lib/snapd/snaps")),
        ("seed.manifest", seed_snaps),
    ];
    for (name, dir) in &sources {
        if !dir.is_dir() {
            debug!("No {} to list for {}", dir.display(), name);
            continue;
        }
        let path = state.output_dir.join(name);
        fs::create_dir_all(&state.output_dir)
            .with_context(|| format!("creating '{}'", state.output_dir.display()))?;
        fs::write(&path, snap_manifest(dir)?)
            .with_context(|| format!("writing '{}'", path.display()))?;
        info!("Wrote {}", path.display());
    }
    queue.push(Step::Finish);
    Ok(())
}

/// `name revision` lines for every `name_revision.snap` in `dir`, sorted.
fn snap_manifest(dir: &Path) -> Result<String> {
    let mut lines = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading '{}'", dir.display()))? {
        let file_name = entry?.file_name();
        let file_name = file_name.to_string_lossy();
        if let Some(line) = manifest_line(&file_name) {
            lines.push(line);
        }
    }
    lines.sort();
    Ok(lines.iter().map(|line| format!("{}\n", line)).collect())
}

fn manifest_line(file_name: &str) -> Option<String> {
    let stem = file_name.strip_suffix(".snap")?;
    let (name, revision) = stem.rsplit_once('_')?;
    Some(format!("{} {}", name, revision))
}
