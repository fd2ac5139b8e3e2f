//! Build configuration.
//!
//! [`BuildConfig`] is the single object handed to the builder. It is filled
//! from an optional TOML file and then from command-line flags, and it is
//! saved in the checkpoint so a resumed build sees the same settings.

use crate::gadget::size::parse_size;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Key of a per-volume image size: volume index or volume name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeKey {
    Index(usize),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageSize {
    /// One size for every volume.
    Single(u64),
    PerVolume(Vec<(VolumeKey, u64)>),
}

impl ImageSize {
    /// Parse `4G` or the multi-volume form `0:4G,second:2G`.
    pub fn parse(value: &str) -> Result<Self> {
        let specs: Vec<&str> = value.split(',').collect();
        let mut sizes = Vec::with_capacity(specs.len());
        for spec in &specs {
            let Some((key, size)) = spec.split_once(':') else {
                if specs.len() != 1 {
                    bail!("Invalid multi-volume size specification: {}", spec);
                }
                let size = parse_size(spec).with_context(|| format!("Invalid size: {}", value))?;
                return Ok(ImageSize::Single(size));
            };
            let size = parse_size(size).with_context(|| format!("Invalid size: {}", value))?;
            let key = match key.parse::<usize>() {
                Ok(index) => VolumeKey::Index(index),
                Err(_) => VolumeKey::Name(key.to_string()),
            };
            sizes.push((key, size));
        }
        Ok(ImageSize::PerVolume(sizes))
    }
}

/// Options for images built from a model assertion with `snap prepare-image`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapOptions {
    pub model_assertion: Option<PathBuf>,
    pub channel: Option<String>,
    pub snaps: Vec<String>,
    pub disable_console_conf: bool,
    pub factory_image: bool,
    /// Program used for `prepare-image`.
    pub snap_command: String,
}

/// Options for classic images built with live-build from a gadget tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassicOptions {
    pub gadget_tree: Option<PathBuf>,
    pub project: Option<String>,
    /// Pre-built root filesystem tree used instead of live-build.
    pub filesystem: Option<PathBuf>,
    pub suite: Option<String>,
    pub arch: Option<String>,
    pub subproject: Option<String>,
    pub subarch: Option<String>,
    pub with_proposed: bool,
    pub extra_ppas: Vec<String>,
    /// livecd-rootfs `auto/` scripts; located with dpkg when unset.
    pub livecd_rootfs_auto_path: Option<PathBuf>,
    /// qemu-user-static binary for cross builds; guessed when unset.
    pub qemu_static_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    Snap(SnapOptions),
    Classic(ClassicOptions),
}

impl Flavor {
    pub fn name(&self) -> &'static str {
        match self {
            Flavor::Snap(_) => "snap",
            Flavor::Classic(_) => "classic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub flavor: Flavor,
    /// Persistent working directory; a temporary one is used when unset.
    pub workdir: Option<PathBuf>,
    /// Single image output path, honored only for single-volume gadgets.
    pub output: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub image_size: Option<ImageSize>,
    pub image_file_list: Option<PathBuf>,
    pub hooks_directories: Vec<PathBuf>,
    pub cloud_init: Option<PathBuf>,
    pub disk_info: Option<PathBuf>,
    /// Copy `unpack/` here after loading the gadget.
    pub preserve_unpack: Option<PathBuf>,
    pub debug: bool,
}

impl BuildConfig {
    pub fn new(flavor: Flavor) -> Self {
        Self {
            flavor,
            workdir: None,
            output: None,
            output_dir: None,
            image_size: None,
            image_file_list: None,
            hooks_directories: Vec::new(),
            cloud_init: None,
            disk_info: None,
            preserve_unpack: None,
            debug: false,
        }
    }

    pub fn snap() -> Self {
        Self::new(Flavor::Snap(SnapOptions {
            snap_command: "snap".to_string(),
            ..SnapOptions::default()
        }))
    }

    pub fn classic() -> Self {
        Self::new(Flavor::Classic(ClassicOptions::default()))
    }

    /// Overlay values from a TOML config file.
    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading build config '{}'", path.display()))?;
        let file: ConfigFile = toml::from_str(&text)
            .with_context(|| format!("parsing build config '{}'", path.display()))?;
        self.apply(file)
            .with_context(|| format!("applying build config '{}'", path.display()))
    }

    fn apply(&mut self, file: ConfigFile) -> Result<()> {
        if let Some(build) = file.build {
            set(&mut self.workdir, build.workdir);
            set(&mut self.output, build.output);
            set(&mut self.output_dir, build.output_dir);
            set(&mut self.image_file_list, build.image_file_list);
            set(&mut self.cloud_init, build.cloud_init);
            set(&mut self.disk_info, build.disk_info);
            set(&mut self.preserve_unpack, build.preserve_unpack);
            if let Some(size) = build.image_size {
                self.image_size = Some(ImageSize::parse(&size)?);
            }
            if let Some(dirs) = build.hooks_directories {
                self.hooks_directories = dirs;
            }
            if let Some(debug) = build.debug {
                self.debug = debug;
            }
        }
        match (&mut self.flavor, file.snap, file.classic) {
            (Flavor::Snap(options), Some(snap), _) => {
                set(&mut options.channel, snap.channel);
                if let Some(command) = snap.snap_command {
                    options.snap_command = command;
                }
                if let Some(snaps) = snap.snaps {
                    options.snaps = snaps;
                }
                if let Some(flag) = snap.disable_console_conf {
                    options.disable_console_conf = flag;
                }
                if let Some(flag) = snap.factory_image {
                    options.factory_image = flag;
                }
            }
            (Flavor::Classic(options), _, Some(classic)) => {
                set(&mut options.project, classic.project);
                set(&mut options.filesystem, classic.filesystem);
                set(&mut options.suite, classic.suite);
                set(&mut options.arch, classic.arch);
                set(&mut options.subproject, classic.subproject);
                set(&mut options.subarch, classic.subarch);
                set(
                    &mut options.livecd_rootfs_auto_path,
                    classic.livecd_rootfs_auto_path,
                );
                set(&mut options.qemu_static_path, classic.qemu_static_path);
                if let Some(flag) = classic.with_proposed {
                    options.with_proposed = flag;
                }
                if let Some(ppas) = classic.extra_ppas {
                    options.extra_ppas = ppas;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn set<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

/// Expand a leading `~` and resolve against the current directory.
pub fn expand_user(path: &Path) -> Result<PathBuf> {
    let expanded = match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .context("resolving home directory for '~'")?
            .join(rest),
        Err(_) => path.to_path_buf(),
    };
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(std::env::current_dir()
            .context("resolving current directory")?
            .join(expanded))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    build: Option<BuildSection>,
    snap: Option<SnapSection>,
    classic: Option<ClassicSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildSection {
    workdir: Option<PathBuf>,
    output: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    image_size: Option<String>,
    image_file_list: Option<PathBuf>,
    hooks_directories: Option<Vec<PathBuf>>,
    cloud_init: Option<PathBuf>,
    disk_info: Option<PathBuf>,
    preserve_unpack: Option<PathBuf>,
    debug: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SnapSection {
    channel: Option<String>,
    snaps: Option<Vec<String>>,
    disable_console_conf: Option<bool>,
    factory_image: Option<bool>,
    snap_command: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClassicSection {
    project: Option<String>,
    filesystem: Option<PathBuf>,
    suite: Option<String>,
    arch: Option<String>,
    subproject: Option<String>,
    subarch: Option<String>,
    with_proposed: Option<bool>,
    extra_ppas: Option<Vec<String>>,
    livecd_rootfs_auto_path: Option<PathBuf>,
    qemu_static_path: Option<PathBuf>,
}
