//! Image build pipeline.
//!
//! The pipeline is a fixed set of [`Step`]s run by the generic
//! [`StateMachine`]. [`common`] holds the base implementation of every
//! step; the snap and classic flavors override a few entries of that table.
//!
//! Work directory layout:
//!
//! ```text
//! <workdir>/
//!   root/            root filesystem contents
//!   unpack/          prepare-image / live-build output, gadget tree
//!   volumes/<name>/  per-volume part<N>/ staging dirs and part<N>.img
//!   gadget.yaml      copy of the parsed gadget
//!   .gadget-image.json  checkpoint
//! ```

pub mod classic;
pub mod common;
pub mod snap;

use crate::config::{BuildConfig, Flavor};
use crate::gadget::{GadgetSpec, VolumeSchema};
use crate::hooks::HookManager;
use crate::layout::VolumeLayout;
use crate::state_machine::{self, Checkpoint, Resources, StateMachine, StepTable, Target};
use crate::tools::{
    default_partition_tool, ContentMaterializer, FilesystemBuilder, LiveBuild, MkfsTools,
    PartitionTool, SnapPrepareImage,
};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;

/// Checkpoint file name inside the work directory.
pub const CHECKPOINT_FILE: &str = ".gadget-image.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    MakeTemporaryDirectories,
    PrepareGadgetTree,
    PrepareImage,
    LoadGadgetYaml,
    PopulateRootfsContents,
    PopulateRootfsContentsHooks,
    GenerateDiskInfo,
    CalculateRootfsSize,
    PrePopulateBootfsContents,
    PopulateBootfsContents,
    PrepareFilesystems,
    PopulateFilesystems,
    MakeDisk,
    GenerateManifests,
    Finish,
}

impl Step {
    pub const ALL: [Step; 15] = [
        Step::MakeTemporaryDirectories,
        Step::PrepareGadgetTree,
        Step::PrepareImage,
        Step::LoadGadgetYaml,
        Step::PopulateRootfsContents,
        Step::PopulateRootfsContentsHooks,
        Step::GenerateDiskInfo,
        Step::CalculateRootfsSize,
        Step::PrePopulateBootfsContents,
        Step::PopulateBootfsContents,
        Step::PrepareFilesystems,
        Step::PopulateFilesystems,
        Step::MakeDisk,
        Step::GenerateManifests,
        Step::Finish,
    ];
}

impl state_machine::Step for Step {
    fn name(self) -> &'static str {
        match self {
            Step::MakeTemporaryDirectories => "make-temporary-directories",
            Step::PrepareGadgetTree => "prepare-gadget-tree",
            Step::PrepareImage => "prepare-image",
            Step::LoadGadgetYaml => "load-gadget-yaml",
            Step::PopulateRootfsContents => "populate-rootfs-contents",
            Step::PopulateRootfsContentsHooks => "populate-rootfs-contents-hooks",
            Step::GenerateDiskInfo => "generate-disk-info",
            Step::CalculateRootfsSize => "calculate-rootfs-size",
            Step::PrePopulateBootfsContents => "pre-populate-bootfs-contents",
            Step::PopulateBootfsContents => "populate-bootfs-contents",
            Step::PrepareFilesystems => "prepare-filesystems",
            Step::PopulateFilesystems => "populate-filesystems",
            Step::MakeDisk => "make-disk",
            Step::GenerateManifests => "generate-manifests",
            Step::Finish => "finish",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Step::ALL.into_iter().find(|step| step.name() == name)
    }
}

/// Per-volume results attached during the build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeArtifacts {
    /// `volumes/<name>/` staging directory.
    pub basedir: PathBuf,
    /// Directory holding the boot partition contents, once known.
    pub bootfs: Option<PathBuf>,
    pub layout: Option<VolumeLayout>,
    /// One entry per structure; `None` for structures left to first boot.
    pub part_images: Vec<Option<PathBuf>>,
    pub image_size: u64,
}

/// Build results that survive a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Parsed gadget.yaml this build runs against.
    pub yaml_path: Option<PathBuf>,
    pub gadget: Option<GadgetSpec>,
    /// Indexed like `gadget.volumes`.
    pub volumes: Vec<VolumeArtifacts>,
    pub rootfs_size: u64,
    /// Disk images written, in volume order.
    pub images: Vec<PathBuf>,
    pub done: bool,
}

pub type PartitionerFactory = Box<dyn Fn(VolumeSchema, &Path) -> Box<dyn PartitionTool>>;

/// External tool capabilities used by the steps.
pub struct Toolbox {
    pub materializer: Box<dyn ContentMaterializer>,
    pub filesystems: Box<dyn FilesystemBuilder>,
    pub partitioner: PartitionerFactory,
    /// Verify partitioners exist once the gadget's schemas are known.
    pub check_host_tools: bool,
}

impl Toolbox {
    /// Real tools for the configured flavor.
    pub fn for_config(config: &BuildConfig) -> Self {
        let (materializer, filesystems): (Box<dyn ContentMaterializer>, Box<dyn FilesystemBuilder>) =
            match &config.flavor {
                Flavor::Snap(options) => (
                    Box::new(SnapPrepareImage::new(options.snap_command.clone())),
                    Box::new(MkfsTools::fakeroot()),
                ),
                Flavor::Classic(options) => (
                    Box::new(LiveBuild::new(
                        options.livecd_rootfs_auto_path.clone(),
                        options.qemu_static_path.clone(),
                    )),
                    Box::new(MkfsTools::sudo()),
                ),
            };
        Self {
            materializer,
            filesystems,
            partitioner: Box::new(default_partition_tool),
            check_host_tools: true,
        }
    }
}

/// Mutable state threaded through the steps.
pub struct BuildState {
    pub config: BuildConfig,
    pub workdir: PathBuf,
    pub output_dir: PathBuf,
    pub record: BuildRecord,
    pub hooks: HookManager,
    pub tools: Toolbox,
    temp: Option<TempDir>,
}

impl BuildState {
    pub fn rootfs(&self) -> PathBuf {
        self.workdir.join("root")
    }

    pub fn unpackdir(&self) -> PathBuf {
        self.workdir.join("unpack")
    }

    pub fn volumedir(&self) -> PathBuf {
        self.workdir.join("volumes")
    }

    pub fn gadget_dir(&self) -> PathBuf {
        self.unpackdir().join("gadget")
    }

    pub fn gadget(&self) -> Result<&GadgetSpec> {
        self.record
            .gadget
            .as_ref()
            .context("gadget.yaml has not been loaded yet")
    }

    pub fn is_seeded(&self) -> bool {
        self.record.gadget.as_ref().is_some_and(|gadget| gadget.seeded)
    }
}

impl Resources for BuildState {
    fn close(&mut self) -> Result<()> {
        if let Some(temp) = self.temp.take() {
            let path = temp.path().to_path_buf();
            temp.close()
                .with_context(|| format!("removing work directory '{}'", path.display()))?;
        }
        Ok(())
    }
}

/// Fields written to the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedBuild {
    pub config: BuildConfig,
    pub workdir: PathBuf,
    pub output_dir: PathBuf,
    pub record: BuildRecord,
}

/// Step table for a flavor: the base pipeline plus its overrides.
pub fn step_table(flavor: &Flavor) -> StepTable<Step, BuildState> {
    let base = common::table();
    match flavor {
        Flavor::Snap(_) => snap::overrides(base),
        Flavor::Classic(_) => classic::overrides(base),
    }
}

/// Where a partial run stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stop {
    /// Stop before the target step.
    Until(Target),
    /// Stop after the target step.
    Thru(Target),
}

pub struct Builder {
    machine: StateMachine<Step, BuildState>,
}

impl Builder {
    pub fn new(config: BuildConfig) -> Result<Self> {
        let tools = Toolbox::for_config(&config);
        Self::with_tools(config, tools)
    }

    pub fn with_tools(config: BuildConfig, tools: Toolbox) -> Result<Self> {
        let (workdir, temp) = match &config.workdir {
            Some(dir) => {
                fs::create_dir_all(dir)
                    .with_context(|| format!("creating work directory '{}'", dir.display()))?;
                (dir.clone(), None)
            }
            None => {
                let temp = TempDir::new().context("creating temporary work directory")?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };
        let output_dir = match (&config.output_dir, &config.workdir) {
            (Some(dir), _) => dir.clone(),
            (None, Some(workdir)) => workdir.clone(),
            (None, None) => std::env::current_dir().context("resolving current directory")?,
        };
        let hooks = HookManager::new(&config.hooks_directories)?;
        let table = step_table(&config.flavor);
        let state = BuildState {
            config,
            workdir,
            output_dir,
            record: BuildRecord::default(),
            hooks,
            tools,
            temp,
        };
        Ok(Self {
            machine: StateMachine::new(table, Step::MakeTemporaryDirectories, state),
        })
    }

    /// Reload a build checkpointed in `workdir`.
    pub fn resume(workdir: &Path) -> Result<Self> {
        Self::resume_with_tools(workdir, Toolbox::for_config)
    }

    pub fn resume_with_tools(
        workdir: &Path,
        tools: impl FnOnce(&BuildConfig) -> Toolbox,
    ) -> Result<Self> {
        let path = workdir.join(CHECKPOINT_FILE);
        if !path.is_file() {
            bail!("No checkpoint to resume in '{}'", workdir.display());
        }
        let checkpoint: Checkpoint<SavedBuild> = Checkpoint::load(&path)?;
        let saved = checkpoint.state;
        info!(
            "Resuming build saved at {} with {} step(s) pending",
            checkpoint.saved_at_utc,
            checkpoint.pending.len()
        );
        let tools = tools(&saved.config);
        let hooks = HookManager::new(&saved.config.hooks_directories)?;
        let table = step_table(&saved.config.flavor);
        let state = BuildState {
            config: saved.config,
            workdir: workdir.to_path_buf(),
            output_dir: saved.output_dir,
            record: saved.record,
            hooks,
            tools,
            temp: None,
        };
        Ok(Self {
            machine: StateMachine::restore(table, &checkpoint.pending, checkpoint.debug_step, state)?,
        })
    }

    pub fn run(&mut self, stop: Option<&Stop>) -> Result<()> {
        match stop {
            None => self.machine.run_to_completion(),
            Some(Stop::Until(target)) => self.machine.run_until(target),
            Some(Stop::Thru(target)) => self.machine.run_through(target),
        }
    }

    /// Persist pending steps so a later run can resume.
    ///
    /// Only builds with a persistent work directory can be resumed.
    pub fn save_checkpoint(&self) -> Result<Option<PathBuf>> {
        let state = self.machine.state();
        if state.config.workdir.is_none() {
            return Ok(None);
        }
        let path = state.workdir.join(CHECKPOINT_FILE);
        let saved = SavedBuild {
            config: state.config.clone(),
            workdir: state.workdir.clone(),
            output_dir: state.output_dir.clone(),
            record: state.record.clone(),
        };
        self.machine.checkpoint(saved).save(&path)?;
        Ok(Some(path))
    }

    pub fn state(&self) -> &BuildState {
        self.machine.state()
    }

    pub fn record(&self) -> &BuildRecord {
        &self.machine.state().record
    }

    pub fn pending(&self) -> Vec<String> {
        self.machine.queue().names()
    }

    pub fn close(&mut self) -> Result<()> {
        self.machine.close()
    }
}
