//! Filesystem image creation with `mkfs.vfat`, `mcopy` and `mkfs.ext4`.

use super::FilesystemBuilder;
use crate::filesystem::is_empty_dir;
use crate::gadget::FileSystemType;
use crate::process::Cmd;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use tracing::warn;

pub struct MkfsTools {
    /// Program prefixed to `mkfs.ext4` so the populated tree has the
    /// wanted ownership (`fakeroot-sysv` or `sudo`).
    ext4_wrapper: Option<String>,
}

impl MkfsTools {
    /// Files end up owned by root without needing privileges.
    pub fn fakeroot() -> Self {
        Self {
            ext4_wrapper: Some("fakeroot-sysv".to_string()),
        }
    }

    /// Keep the ownership live-build produced; needs sudo to read it.
    pub fn sudo() -> Self {
        Self {
            ext4_wrapper: Some("sudo".to_string()),
        }
    }

    pub fn plain() -> Self {
        Self { ext4_wrapper: None }
    }

    fn ext4_command(&self) -> Cmd {
        match &self.ext4_wrapper {
            Some(wrapper) => Cmd::new(wrapper).arg("mkfs.ext4"),
            None => Cmd::new("mkfs.ext4"),
        }
    }
}

impl FilesystemBuilder for MkfsTools {
    fn format(&self, kind: FileSystemType, image: &Path, label: Option<&str>) -> Result<()> {
        match kind {
            FileSystemType::Vfat => {
                let mut cmd = Cmd::new("mkfs.vfat").args(["-s", "1", "-S", "512", "-F", "32"]);
                if let Some(label) = label {
                    cmd = cmd.args(["-n", label]);
                }
                cmd.arg_path(image)
                    .error_msg("mkfs.vfat failed")
                    .run()?;
            }
            FileSystemType::Ext4 => {
                self.ext4_command()
                    .args(["-L", label.unwrap_or("writable"), "-T", "default"])
                    .args(["-O", "uninit_bg"])
                    .arg_path(image)
                    .error_msg("mkfs.ext4 failed")
                    .run()?;
            }
            FileSystemType::None => bail!("Cannot format a structure without a filesystem"),
        }
        Ok(())
    }

    fn populate(
        &self,
        kind: FileSystemType,
        image: &Path,
        dir: &Path,
        label: Option<&str>,
    ) -> Result<()> {
        match kind {
            FileSystemType::Vfat => {
                if is_empty_dir(dir)? {
                    return Ok(());
                }
                let mut entries = Vec::new();
                for entry in fs::read_dir(dir)
                    .with_context(|| format!("Failed to read directory: {}", dir.display()))?
                {
                    entries.push(entry?.path());
                }
                entries.sort();
                let mut cmd = Cmd::new("mcopy")
                    .env("MTOOLS_SKIP_CHECK", "1")
                    .arg("-s")
                    .arg("-i")
                    .arg_path(image);
                for entry in &entries {
                    cmd = cmd.arg_path(entry);
                }
                cmd.arg("::").error_msg("mcopy failed").run()?;
            }
            FileSystemType::Ext4 => {
                let label = label.unwrap_or("writable");
                let result = self
                    .ext4_populate_command(image, dir, label)
                    .allow_fail()
                    .run()?;
                if result.success() {
                    return Ok(());
                }
                // e2fsprogs older than 1.43 has no -d; build empty and copy
                // through a loop mount instead.
                warn!(
                    "mkfs.ext4 -d failed ({}), falling back to a loop mount copy",
                    result.stderr_trimmed()
                );
                self.format(FileSystemType::Ext4, image, Some(label))?;
                if is_empty_dir(dir)? {
                    return Ok(());
                }
                self.copy_through_mount(image, dir)?;
            }
            FileSystemType::None => bail!("Cannot populate a structure without a filesystem"),
        }
        Ok(())
    }
}

impl MkfsTools {
    fn ext4_populate_command(&self, image: &Path, dir: &Path, label: &str) -> Cmd {
        self.ext4_command()
            .args(["-L", label])
            .args(["-O", "-metadata_csum", "-T", "default", "-O", "uninit_bg"])
            .arg_path(image)
            .arg("-d")
            .arg_path(dir)
            .error_msg("mkfs.ext4 failed")
    }

    /// Ownership is only kept when the tree was produced as root.
    fn preserve_ownership(&self) -> bool {
        self.ext4_wrapper.as_deref() == Some("sudo")
    }

    fn copy_command(&self, dir: &Path, mountpoint: &Path) -> Cmd {
        let preserve = if self.preserve_ownership() {
            "--preserve=mode,timestamps,ownership"
        } else {
            "--preserve=mode,timestamps"
        };
        Cmd::new("sudo")
            .args(["cp", "-dR", preserve])
            .arg_path(&dir.join("."))
            .arg_path(mountpoint)
            .error_msg("copying rootfs into mounted ext4 image failed")
    }

    fn copy_through_mount(&self, image: &Path, dir: &Path) -> Result<()> {
        let mountpoint = TempDir::new().context("creating mount point")?;
        Cmd::new("sudo")
            .args(["mount", "-o", "loop"])
            .arg_path(image)
            .arg_path(mountpoint.path())
            .error_msg("loop mounting ext4 image failed")
            .run()?;
        let copied = self.copy_command(dir, mountpoint.path()).run();
        let unmounted = Cmd::new("sudo")
            .arg("umount")
            .arg_path(mountpoint.path())
            .error_msg("unmounting ext4 image failed")
            .run();
        copied?;
        unmounted?;
        Ok(())
    }
}
