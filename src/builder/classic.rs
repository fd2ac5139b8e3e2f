//! Steps specific to classic images built from a gadget tree.

use super::{common, BuildState, Step};
use crate::config::{ClassicOptions, Flavor};
use crate::error::PrivilegeError;
use crate::filesystem::{copy_dir_recursive, move_children};
use crate::process::Cmd;
use crate::state_machine::{Queue, StepTable};
use crate::tools::live_build::chroot_dir;
use crate::tools::MaterializeRequest;
use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use tracing::info;

/// Packages that belong to the live session, not the installed system.
const MANIFEST_EXCLUDES: &[&str] = &["ubiquity", "casper"];

pub fn overrides(base: StepTable<Step, BuildState>) -> StepTable<Step, BuildState> {
    base.with(Step::PrepareGadgetTree, prepare_gadget_tree)
        .with(Step::PrepareImage, prepare_image)
        .with(Step::PopulateRootfsContents, populate_rootfs_contents)
        .with(Step::GenerateManifests, generate_manifests)
}

fn options(state: &BuildState) -> Result<&ClassicOptions> {
    match &state.config.flavor {
        Flavor::Classic(options) => Ok(options),
        other => bail!("classic step run for a {} build", other.name()),
    }
}

fn prepare_gadget_tree(state: &mut BuildState, queue: &mut Queue<Step>) -> Result<()> {
    let tree = options(state)?
        .gadget_tree
        .clone()
        .context("classic builds need a gadget tree")?;
    copy_dir_recursive(&tree, &state.gadget_dir())?;
    queue.push(Step::PrepareImage);
    Ok(())
}

fn prepare_image(state: &mut BuildState, queue: &mut Queue<Step>) -> Result<()> {
    require_root(unsafe { libc::geteuid() })?;
    let options = options(state)?.clone();
    match &options.filesystem {
        Some(tree) => {
            info!("Using prebuilt root filesystem {}", tree.display());
            copy_dir_recursive(tree, &chroot_dir(&state.unpackdir()))?;
        }
        None => {
            let request = MaterializeRequest {
                target: state.unpackdir(),
                workdir: state.workdir.clone(),
                env: live_build_env(&options),
                ..MaterializeRequest::default()
            };
            state.tools.materializer.materialize(&request)?;
        }
    }
    common::prepare_image(state, queue)
}

fn require_root(euid: u32) -> Result<()> {
    if euid != 0 {
        let user = std::env::var("USER").unwrap_or_else(|_| euid.to_string());
        return Err(PrivilegeError { user }.into());
    }
    Ok(())
}

/// Environment for the livecd-rootfs scripts.
fn live_build_env(options: &ClassicOptions) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let mut set = |key: &str, value: Option<String>| {
        if let Some(value) = value {
            env.insert(key.to_string(), value);
        }
    };
    set("PROJECT", options.project.clone());
    set("SUITE", options.suite.clone());
    set("ARCH", options.arch.clone());
    set("SUBPROJECT", options.subproject.clone());
    set("SUBARCH", options.subarch.clone());
    set("PROPOSED", options.with_proposed.then(|| "true".to_string()));
    set(
        "EXTRA_PPAS",
        (!options.extra_ppas.is_empty()).then(|| options.extra_ppas.join(" ")),
    );
    // Only the chroot is wanted; image assembly happens here.
    set("GENERATE_ROOTFS_ONLY", Some("true".to_string()));
    env
}

fn populate_rootfs_contents(state: &mut BuildState, queue: &mut Queue<Step>) -> Result<()> {
    let src = chroot_dir(&state.unpackdir());
    let dst = state.rootfs().join("system-data");
    move_children(&src, &dst, &["boot"])?;
    // grub is installed into the boot partition instead.
    let boot = src.join("boot");
    if boot.is_dir() {
        move_children(&boot, &dst.join("boot"), &["grub"])?;
    }
    common::write_cloud_init_seed(state, &dst)?;
    queue.push(Step::PopulateRootfsContentsHooks);
    Ok(())
}

/// Write `filesystem.manifest` from the packages installed in the rootfs.
fn generate_manifests(state: &mut BuildState, queue: &mut Queue<Step>) -> Result<()> {
    let chroot = state.rootfs().join("system-data");
    let result = Cmd::new("sudo")
        .arg("chroot")
        .arg_path(&chroot)
        .args(["dpkg-query", "-W", "--showformat=${Package} ${Version}\n"])
        .error_msg("listing installed packages")
        .run()?;
    fs::create_dir_all(&state.output_dir)
        .with_context(|| format!("creating '{}'", state.output_dir.display()))?;
    let path = state.output_dir.join("filesystem.manifest");
    fs::write(&path, filter_manifest(&result.stdout))
        .with_context(|| format!("writing '{}'", path.display()))?;
    info!("Wrote {}", path.display());
    queue.push(Step::Finish);
    Ok(())
}

fn filter_manifest(listing: &str) -> String {
    listing
        .lines()
        .filter(|line| !MANIFEST_EXCLUDES.iter().any(|pkg| line.contains(pkg)))
        .map(|line| format!("{}\n", line))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{BuildRecord, Toolbox};
    use crate::config::BuildConfig;
    use crate::hooks::HookManager;
    use tempfile::TempDir;

    fn state(temp: &TempDir, config: BuildConfig) -> BuildState {
        let tools = Toolbox::for_config(&config);
        BuildState {
            config,
            workdir: temp.path().to_path_buf(),
            output_dir: temp.path().join("out"),
            record: BuildRecord::default(),
            hooks: HookManager::default(),
            tools,
            temp: None,
        }
    }

    #[test]
    fn test_require_root() {
        assert!(require_root(0).is_ok());
        let err = require_root(1000).unwrap_err();
        assert!(err.downcast_ref::<PrivilegeError>().is_some());
    }

    #[test]
    fn test_live_build_env() {
        let options = ClassicOptions {
            project: Some("ubuntu-cpc".to_string()),
            suite: Some("jammy".to_string()),
            with_proposed: true,
            extra_ppas: vec!["a/ppa".to_string(), "b/ppa".to_string()],
            ..ClassicOptions::default()
        };
        let env = live_build_env(&options);
        let pairs: Vec<(&str, &str)> = env
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("EXTRA_PPAS", "a/ppa b/ppa"),
                ("GENERATE_ROOTFS_ONLY", "true"),
                ("PROJECT", "ubuntu-cpc"),
                ("PROPOSED", "true"),
                ("SUITE", "jammy"),
            ]
        );

        let options = ClassicOptions {
            arch: Some("arm64".to_string()),
            ..ClassicOptions::default()
        };
        let env = live_build_env(&options);
        assert_eq!(env.get("ARCH").map(String::as_str), Some("arm64"));
        assert!(!env.contains_key("PROPOSED"));
    }

    #[test]
    fn test_filter_manifest() {
        let listing = "bash 5.1\ncasper 1.470\nlinux-image 5.15\nubiquity-casper 1.4\n";
        assert_eq!(filter_manifest(listing), "bash 5.1\nlinux-image 5.15\n");
    }

    #[test]
    fn test_prepare_gadget_tree_copies_tree() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("tree");
        fs::create_dir_all(tree.join("meta")).unwrap();
        fs::write(tree.join("meta/gadget.yaml"), "volumes: {}").unwrap();
        let mut config = BuildConfig::classic();
        if let Flavor::Classic(options) = &mut config.flavor {
            options.gadget_tree = Some(tree);
        }
        let mut state = state(&temp, config);
        let mut queue = Queue::new();

        prepare_gadget_tree(&mut state, &mut queue).unwrap();
        assert!(state.gadget_dir().join("meta/gadget.yaml").is_file());
        assert_eq!(queue.pop(), Some(Step::PrepareImage));
    }

    #[test]
    fn test_populate_rootfs_drops_grub_and_seeds_cloud_init() {
        let temp = TempDir::new().unwrap();
        let user_data = temp.path().join("user-data.yaml");
        fs::write(&user_data, "#cloud-config\n").unwrap();
        let mut config = BuildConfig::classic();
        config.cloud_init = Some(user_data);
        let mut state = state(&temp, config);

        let chroot = chroot_dir(&state.unpackdir());
        fs::create_dir_all(chroot.join("etc")).unwrap();
        fs::write(chroot.join("etc/hostname"), "ubuntu").unwrap();
        fs::create_dir_all(chroot.join("boot/grub")).unwrap();
        fs::write(chroot.join("boot/grub/grub.cfg"), "").unwrap();
        fs::write(chroot.join("boot/vmlinuz"), "kernel").unwrap();
        let mut queue = Queue::new();

        populate_rootfs_contents(&mut state, &mut queue).unwrap();
        let rootfs = state.rootfs().join("system-data");
        assert_eq!(fs::read_to_string(rootfs.join("etc/hostname")).unwrap(), "ubuntu");
        assert!(rootfs.join("boot/vmlinuz").is_file());
        assert!(!rootfs.join("boot/grub").exists());
        let seed = rootfs.join("var/lib/cloud/seed/nocloud-net");
        assert_eq!(
            fs::read_to_string(seed.join("meta-data")).unwrap(),
            "instance-id: nocloud-static\n"
        );
        assert_eq!(
            fs::read_to_string(seed.join("user-data")).unwrap(),
            "#cloud-config\n"
        );
        assert_eq!(queue.pop(), Some(Step::PopulateRootfsContentsHooks));
    }
}
