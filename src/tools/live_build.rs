//! live-build content materializer for classic images.
//!
//! Copies the livecd-rootfs `auto/` scripts into the target, then runs
//! `lb config` and `lb build` under sudo with the build environment.

use super::{ContentMaterializer, MaterializeRequest};
use crate::error::DependencyError;
use crate::filesystem::copy_dir_recursive;
use crate::process::Cmd;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct LiveBuild {
    /// livecd-rootfs `auto/` directory; located with dpkg when unset.
    auto_path: Option<PathBuf>,
    /// qemu-user-static binary for cross builds; guessed when unset.
    qemu_static_path: Option<PathBuf>,
    cross_build: bool,
}

impl LiveBuild {
    pub fn new(auto_path: Option<PathBuf>, qemu_static_path: Option<PathBuf>) -> Self {
        Self {
            auto_path,
            qemu_static_path,
            cross_build: true,
        }
    }

    fn auto_scripts(&self) -> Result<PathBuf> {
        if let Some(path) = &self.auto_path {
            return Ok(path.clone());
        }
        let listing = Cmd::new("dpkg")
            .args(["-L", "livecd-rootfs"])
            .error_msg("locating livecd-rootfs scripts")
            .run()?;
        listing
            .stdout
            .lines()
            .find(|line| line.ends_with("/auto"))
            .map(PathBuf::from)
            .context("livecd-rootfs does not ship an auto/ directory")
    }

    fn qemu_static(&self, arch: &str) -> Result<PathBuf> {
        if let Some(path) = &self.qemu_static_path {
            return Ok(path.clone());
        }
        let name = qemu_static_for_arch(arch);
        which::which(&name).map_err(|_| {
            DependencyError {
                name,
                info: "Set qemu_static_path in the build config for non-standard archs or custom paths.".to_string(),
            }
            .into()
        })
    }

    fn lb(&self, env: &BTreeMap<String, String>, action: &str) -> Cmd {
        let mut cmd = Cmd::new("sudo");
        for (key, value) in env {
            cmd = cmd.arg(format!("{}={}", key, value));
        }
        cmd.args(["lb", action])
    }

    fn config_command(&self, request: &MaterializeRequest, host_arch: Option<&str>) -> Result<Cmd> {
        let mut cmd = self.lb(&request.env, "config");
        if let Some(arch) = request.env.get("ARCH") {
            if self.cross_build && host_arch != Some(arch.as_str()) {
                let qemu = self.qemu_static(arch)?;
                cmd = cmd
                    .args(["--bootstrap-qemu-arch", arch.as_str()])
                    .arg("--bootstrap-qemu-static")
                    .arg_path(&qemu)
                    .args(["--architectures", arch.as_str()]);
            }
        }
        Ok(cmd)
    }
}

impl ContentMaterializer for LiveBuild {
    fn materialize(&self, request: &MaterializeRequest) -> Result<()> {
        let target = &request.target;
        fs::create_dir_all(target)
            .with_context(|| format!("creating '{}'", target.display()))?;
        let auto_src = self.auto_scripts()?;
        copy_dir_recursive(&auto_src, &target.join("auto"))?;

        info!("Running live-build in {}", target.display());
        let host = host_arch();
        self.config_command(request, host.as_deref())?
            .dir(target)
            .error_msg("lb config failed")
            .run_interactive()?;
        self.lb(&request.env, "build")
            .dir(target)
            .error_msg("lb build failed")
            .run_interactive()?;
        Ok(())
    }
}

/// Architecture reported by dpkg, if available.
pub fn host_arch() -> Option<String> {
    Cmd::new("dpkg")
        .arg("--print-architecture")
        .allow_fail()
        .run()
        .ok()
        .filter(|result| result.success())
        .map(|result| result.stdout_trimmed().to_string())
}

pub fn qemu_static_for_arch(arch: &str) -> String {
    let qemu = match arch {
        "armhf" => "arm",
        "arm64" => "aarch64",
        "ppc64el" => "ppc64le",
        other => other,
    };
    format!("qemu-{}-static", qemu)
}

/// Chroot tree live-build leaves behind.
pub fn chroot_dir(target: &Path) -> PathBuf {
    target.join("chroot")
}
