//! User hook scripts fired at fixed pipeline points.
//!
//! For every configured directory, a hook named `NAME` runs the executables
//! in `NAME.d/` in lexical order and then the single file `NAME`. Entries
//! without an execute bit and subdirectories are skipped. Scripts
//! inherit the process environment plus the variables passed to
//! [`HookManager::fire`].

use crate::config::expand_user;
use crate::error::HookError;
use crate::process::Cmd;
use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const POST_POPULATE_ROOTFS: &str = "post-populate-rootfs";

/// Rootfs directory exported to `post-populate-rootfs`.
pub const HOOK_ROOTFS_ENV: &str = "GADGET_IMAGE_HOOK_ROOTFS";

#[derive(Debug, Clone, Default)]
pub struct HookManager {
    dirs: Vec<PathBuf>,
}

impl HookManager {
    pub fn new(dirs: &[PathBuf]) -> Result<Self> {
        let dirs = dirs
            .iter()
            .map(|dir| expand_user(dir))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { dirs })
    }

    /// Scripts to run for `name`, in execution order.
    pub fn scripts(&self, name: &str) -> Result<Vec<PathBuf>> {
        let mut scripts = Vec::new();
        for dir in &self.dirs {
            if !dir.is_dir() {
                warn!("Hook directory {} does not exist, skipping", dir.display());
                continue;
            }
            let name_d = dir.join(format!("{}.d", name));
            if name_d.is_dir() {
                let mut entries = Vec::new();
                for entry in fs::read_dir(&name_d)
                    .with_context(|| format!("reading hook directory '{}'", name_d.display()))?
                {
                    let path = entry?.path();
                    if is_executable(&path) {
                        entries.push(path);
                    } else {
                        debug!("Skipping non-executable hook entry {}", path.display());
                    }
                }
                entries.sort();
                scripts.extend(entries);
            }
            let single = dir.join(name);
            if is_executable(&single) {
                scripts.push(single);
            }
        }
        Ok(scripts)
    }

    /// Run every script for `name`; the first failure aborts.
    pub fn fire(&self, name: &str, env: &[(&str, &str)]) -> Result<()> {
        for script in self.scripts(name)? {
            run_hook(name, &script, env)?;
        }
        Ok(())
    }
}

/// Regular file (after following links) with any execute bit set.
fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn run_hook(name: &str, path: &Path, env: &[(&str, &str)]) -> Result<()> {
    debug!("Running hook script at path {} for hook named {}.", path.display(), name);
    let result = Cmd::new(path.to_string_lossy())
        .envs(env.iter().copied())
        .allow_fail()
        .run()?;
    if !result.success() {
        return Err(HookError {
            name: name.to_string(),
            path: path.to_path_buf(),
            code: result.code(),
            stderr: result.stderr,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn script(path: &Path, body: &str) {
        fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_directory_hooks_run_before_single_file() {
        let temp = TempDir::new().unwrap();
        let hooks = temp.path().join("hooks");
        let log = temp.path().join("log");
        fs::create_dir_all(hooks.join("post-populate-rootfs.d")).unwrap();
        let append = |tag: &str| format!("echo {} >> \"$HOOK_LOG\"", tag);
        script(&hooks.join("post-populate-rootfs.d/02-second"), &append("second"));
        script(&hooks.join("post-populate-rootfs.d/01-first"), &append("first"));
        script(&hooks.join("post-populate-rootfs"), &append("single"));

        let manager = HookManager::new(&[hooks]).unwrap();
        manager
            .fire(
                POST_POPULATE_ROOTFS,
                &[("HOOK_LOG", log.to_str().unwrap())],
            )
            .unwrap();

        assert_eq!(fs::read_to_string(&log).unwrap(), "first\nsecond\nsingle\n");
    }

    #[test]
    fn test_only_executables_are_queued() {
        let temp = TempDir::new().unwrap();
        let hooks = temp.path().join("hooks");
        let name_d = hooks.join("post-populate-rootfs.d");
        fs::create_dir_all(name_d.join("00-subdir")).unwrap();
        script(&name_d.join("10-run"), "true");
        fs::write(name_d.join("README"), "notes\n").unwrap();
        fs::write(hooks.join("post-populate-rootfs"), "#!/bin/sh\nexit 1\n").unwrap();

        let manager = HookManager::new(&[hooks]).unwrap();
        assert_eq!(
            manager.scripts(POST_POPULATE_ROOTFS).unwrap(),
            vec![name_d.join("10-run")]
        );
        manager.fire(POST_POPULATE_ROOTFS, &[]).unwrap();
    }

    #[test]
    fn test_failing_hook_reports_details() {
        let temp = TempDir::new().unwrap();
        let hooks = temp.path().join("hooks");
        fs::create_dir_all(&hooks).unwrap();
        let path = hooks.join("post-populate-rootfs");
        script(&path, "echo bad things >&2\nexit 5");

        let manager = HookManager::new(&[hooks]).unwrap();
        let err = manager.fire(POST_POPULATE_ROOTFS, &[]).unwrap_err();
        let hook = err.downcast_ref::<HookError>().unwrap();
        assert_eq!(hook.name, POST_POPULATE_ROOTFS);
        assert_eq!(hook.path, path);
        assert_eq!(hook.code, 5);
        assert_eq!(hook.stderr, "bad things\n");
    }

    #[test]
    fn test_missing_directory_is_skipped() {
        let temp = TempDir::new().unwrap();
        let manager = HookManager::new(&[temp.path().join("absent")]).unwrap();
        assert!(manager.scripts(POST_POPULATE_ROOTFS).unwrap().is_empty());
        manager.fire(POST_POPULATE_ROOTFS, &[]).unwrap();
    }
}
