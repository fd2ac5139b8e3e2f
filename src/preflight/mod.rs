//! Preflight checks for build validation.
//!
//! Validates that the host system has the tools a build will shell out to,
//! so a missing package fails up front instead of halfway through a build.

use crate::config::{BuildConfig, Flavor};
use crate::error::DependencyError;
use crate::gadget::{GadgetSpec, VolumeSchema};
use anyhow::Result;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools every build needs. Each tuple is (command_name, package_name).
pub const COMMON_TOOLS: &[(&str, &str)] = &[
    ("mkfs.ext4", "e2fsprogs"),
    ("mkfs.vfat", "dosfstools"),
    ("mcopy", "mtools"),
];

pub const SNAP_TOOLS: &[(&str, &str)] = &[("fakeroot-sysv", "fakeroot")];

pub const CLASSIC_TOOLS: &[(&str, &str)] = &[("lb", "live-build"), ("sudo", "sudo")];

/// Check that specific tools are available.
///
/// Fails with a [`DependencyError`] naming every missing tool.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<(&str, &str)> = tools
        .iter()
        .copied()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let names = missing.iter().map(|(t, _)| *t).collect::<Vec<_>>().join(", ");
        let packages = missing.iter().map(|(_, p)| *p).collect::<Vec<_>>().join(" ");
        return Err(DependencyError {
            name: names,
            info: format!("Install: {}", packages),
        }
        .into());
    }

    Ok(())
}

/// Check the tools needed for the selected flavor.
pub fn check_build_tools(config: &BuildConfig) -> Result<()> {
    let mut tools = COMMON_TOOLS.to_vec();
    match &config.flavor {
        Flavor::Snap(options) => {
            tools.extend_from_slice(SNAP_TOOLS);
            tools.push((options.snap_command.as_str(), "snapd"));
        }
        Flavor::Classic(options) => {
            tools.extend_from_slice(CLASSIC_TOOLS);
            if options.filesystem.is_none() {
                tools.push(("dpkg", "dpkg"));
            }
        }
    }
    check_required_tools(&tools)
}

/// Partitioners needed for the schemas the gadget uses.
pub fn partition_tools(gadget: &GadgetSpec) -> Vec<(&'static str, &'static str)> {
    let mut tools = Vec::new();
    let uses = |schema| gadget.volumes.iter().any(|volume| volume.schema == schema);
    if uses(VolumeSchema::Gpt) {
        tools.push(("sgdisk", "gdisk"));
    }
    if uses(VolumeSchema::Mbr) {
        tools.push(("sfdisk", "fdisk"));
    }
    tools
}

pub fn check_partition_tools(gadget: &GadgetSpec) -> Result<()> {
    check_required_tools(&partition_tools(gadget))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("ls"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_missing_tools_are_a_dependency_error() {
        let tools = &[
            ("ls", "coreutils"),
            ("nonexistent_command_xyz", "fake-package"),
            ("nonexistent_command_abc", "other-package"),
        ];
        let err = check_required_tools(tools).unwrap_err();
        let dep = err.downcast_ref::<DependencyError>().unwrap();
        assert_eq!(dep.name, "nonexistent_command_xyz, nonexistent_command_abc");
        assert_eq!(dep.info, "Install: fake-package other-package");
    }

    #[test]
    fn test_partition_tools_follow_schemas() {
        let gadget = crate::gadget::parse(
            "volumes:\n  pc:\n    schema: mbr\n    bootloader: u-boot\n    structure:\n      - type: 0C\n        size: 1M\n",
        )
        .unwrap();
        assert_eq!(partition_tools(&gadget), vec![("sfdisk", "fdisk")]);
    }
}
