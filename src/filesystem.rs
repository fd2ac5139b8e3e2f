//! Filesystem helpers for staging volume contents.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Recursively copy a directory, preserving symlinks.
///
/// Existing files in `dst` are replaced.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    copy_tree(src, dst, true)
}

/// Recursively copy a directory, leaving files that already exist in `dst`
/// untouched.
pub fn copy_dir_missing(src: &Path, dst: &Path) -> Result<()> {
    copy_tree(src, dst, false)
}

fn copy_tree(src: &Path, dst: &Path, overwrite: bool) -> Result<()> {
    if !dst.exists() {
        fs::create_dir_all(dst)
            .with_context(|| format!("Failed to create directory: {}", dst.display()))?;
    }

    for entry in fs::read_dir(src)
        .with_context(|| format!("Failed to read directory: {}", src.display()))?
    {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copy_tree(&src_path, &dst_path, overwrite)?;
            continue;
        }
        let present = dst_path.exists() || dst_path.is_symlink();
        if present && !overwrite {
            continue;
        }
        copy_entry(&src_path, &dst_path, file_type.is_symlink(), present)?;
    }

    Ok(())
}

fn copy_entry(src: &Path, dst: &Path, symlink: bool, present: bool) -> Result<()> {
    if symlink {
        let target = fs::read_link(src)?;
        if present {
            fs::remove_file(dst)?;
        }
        std::os::unix::fs::symlink(&target, dst)
            .with_context(|| format!("Failed to create symlink: {}", dst.display()))?;
    } else {
        fs::copy(src, dst)
            .with_context(|| format!("Failed to copy file: {}", src.display()))?;
    }
    Ok(())
}

/// Copy one gadget content entry from `source_root` into `target_root`.
///
/// A `source` ending in `/` copies the directory contents into `target`.
/// Otherwise the file or directory itself is copied, landing inside
/// `target` when that ends in `/`. Existing files are never overwritten.
pub fn copy_content(
    source_root: &Path,
    source: &str,
    target_root: &Path,
    target: &str,
) -> Result<()> {
    let src = source_root.join(source.trim_start_matches('/'));
    let dst_base = target_root.join(target.trim_start_matches('/'));

    if source.ends_with('/') {
        return copy_dir_missing(&src, &dst_base);
    }

    let dst = if target.ends_with('/') {
        let name = src
            .file_name()
            .with_context(|| format!("Content source has no file name: {}", source))?;
        dst_base.join(name)
    } else {
        dst_base
    };

    let meta = fs::symlink_metadata(&src)
        .with_context(|| format!("Content source not found: {}", src.display()))?;
    if meta.is_dir() {
        return copy_dir_missing(&src, &dst);
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let present = dst.exists() || dst.is_symlink();
    if present {
        return Ok(());
    }
    copy_entry(&src, &dst, meta.file_type().is_symlink(), false)
}

/// Move a file or directory by renaming, with fallback to copy+delete.
pub fn move_path(src: &Path, dst: &Path) -> Result<()> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    let meta = fs::symlink_metadata(src)
        .with_context(|| format!("Failed to stat {}", src.display()))?;
    if meta.is_dir() {
        copy_dir_recursive(src, dst)?;
        fs::remove_dir_all(src)
            .with_context(|| format!("Failed to remove {}", src.display()))?;
    } else {
        copy_entry(src, dst, meta.file_type().is_symlink(), dst.exists())?;
        fs::remove_file(src).with_context(|| format!("Failed to remove {}", src.display()))?;
    }
    Ok(())
}

/// Move every entry of `src` into `dst`, except names listed in `skip`.
pub fn move_children(src: &Path, dst: &Path, skip: &[&str]) -> Result<()> {
    fs::create_dir_all(dst)
        .with_context(|| format!("Failed to create directory: {}", dst.display()))?;
    for entry in fs::read_dir(src)
        .with_context(|| format!("Failed to read directory: {}", src.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        if skip.iter().any(|s| name.as_os_str() == *s) {
            continue;
        }
        move_path(&entry.path(), &dst.join(&name))?;
    }
    Ok(())
}

pub fn is_empty_dir(path: &Path) -> Result<bool> {
    let mut entries = fs::read_dir(path)
        .with_context(|| format!("Failed to read directory: {}", path.display()))?;
    Ok(entries.next().is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_dir_recursive() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");

        fs::create_dir_all(src.join("subdir")).unwrap();
        fs::write(src.join("file.txt"), "hello").unwrap();
        fs::write(src.join("subdir/nested.txt"), "world").unwrap();
        std::os::unix::fs::symlink("file.txt", src.join("link")).unwrap();

        copy_dir_recursive(&src, &dst).unwrap();

        assert!(dst.join("subdir/nested.txt").exists());
        assert!(dst.join("link").is_symlink());
        assert_eq!(fs::read_link(dst.join("link")).unwrap().to_str().unwrap(), "file.txt");
    }

    #[test]
    fn test_copy_dir_missing_keeps_existing() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("config.txt"), "from gadget").unwrap();
        fs::write(src.join("extra.txt"), "new").unwrap();
        fs::write(dst.join("config.txt"), "from bootloader").unwrap();

        copy_dir_missing(&src, &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("config.txt")).unwrap(), "from bootloader");
        assert_eq!(fs::read_to_string(dst.join("extra.txt")).unwrap(), "new");
    }

    #[test]
    fn test_copy_content_forms() {
        let temp = TempDir::new().unwrap();
        let gadget = temp.path().join("gadget");
        let part = temp.path().join("part0");
        fs::create_dir_all(gadget.join("boot-assets/overlays")).unwrap();
        fs::write(gadget.join("boot-assets/config.txt"), "cfg").unwrap();
        fs::write(gadget.join("boot-assets/overlays/a.dtbo"), "dtbo").unwrap();
        fs::write(gadget.join("grubx64.efi"), "efi").unwrap();

        copy_content(&gadget, "boot-assets/", &part, "/").unwrap();
        copy_content(&gadget, "grubx64.efi", &part, "EFI/boot/").unwrap();
        copy_content(&gadget, "grubx64.efi", &part, "EFI/boot/bootx64.efi").unwrap();

        assert!(part.join("config.txt").exists());
        assert!(part.join("overlays/a.dtbo").exists());
        assert!(part.join("EFI/boot/grubx64.efi").exists());
        assert!(part.join("EFI/boot/bootx64.efi").exists());
    }

    #[test]
    fn test_move_children_skips_names() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("image");
        let dst = temp.path().join("root");
        fs::create_dir_all(src.join("boot")).unwrap();
        fs::create_dir_all(src.join("var/lib")).unwrap();
        fs::write(src.join("var/lib/state"), "x").unwrap();

        move_children(&src, &dst, &["boot"]).unwrap();

        assert!(dst.join("var/lib/state").exists());
        assert!(!dst.join("boot").exists());
        assert!(src.join("boot").exists());
        assert!(!src.join("var").exists());
    }

    #[test]
    fn test_is_empty_dir() {
        let temp = TempDir::new().unwrap();
        assert!(is_empty_dir(temp.path()).unwrap());
        fs::write(temp.path().join("f"), "").unwrap();
        assert!(!is_empty_dir(temp.path()).unwrap());
    }
}
