//! Typed build failures.
//!
//! Orchestration code returns `anyhow::Result`; these types ride inside the
//! error chain so the command line can downcast them and print the matching
//! diagnostic.

use std::path::PathBuf;
use thiserror::Error;

/// Malformed or semantically invalid gadget.yaml.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GadgetSpecError {
    #[error("Empty gadget.yaml")]
    Empty,

    #[error("gadget.yaml file is not valid YAML")]
    NotYaml,

    /// A key is missing, unknown, or has the wrong shape.
    #[error("Invalid gadget.yaml @ {path}")]
    Invalid { path: String },

    /// Structural decode failure (unknown key, wrong value shape).
    #[error("Invalid gadget.yaml @ {path}: {detail}")]
    Malformed { path: String, detail: String },

    /// An enumerated field holds an unrecognized value.
    #[error("Invalid gadget.yaml value '{value}' @ {path}")]
    InvalidValue { value: String, path: String },

    /// A size or offset string that does not follow `<digits>[M|G]`.
    #[error("Invalid size '{value}' @ {path}")]
    InvalidSize { value: String, path: String },

    #[error("Unsupported gadget.yaml format version: {0}")]
    UnsupportedFormat(String),

    /// A cross-field rule was violated.
    #[error("{0}")]
    Semantic(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid size: {0}")]
pub struct InvalidSize(pub String);

/// Computed layout does not fit the declared volume.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("Volume contents do not fit ({overage}B over): {part_path} [#{part_number}]")]
    DoesNotFit {
        part_number: usize,
        part_path: String,
        overage: u64,
    },

    /// `offset + size` does not fit in a 64-bit byte address.
    #[error("Structure out of range: {what} at offset {offset} with size {size}")]
    OutOfRange { what: String, offset: u64, size: u64 },

    #[error("Structure conflict! {what}: {offset} <  {previous_end}")]
    Overlap {
        what: String,
        offset: u64,
        previous_end: u64,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("write offset beyond end of file: {offset} + 4 > {file_size}")]
    OffsetOutOfRange { offset: u64, file_size: u64 },
}

/// A hook script exited non-zero.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "Hook script in path {} failed for the {name} hook with return code {code}. Output of stderr:\n{stderr}",
    path.display()
)]
pub struct HookError {
    pub name: String,
    pub path: PathBuf,
    pub code: i32,
    pub stderr: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "Current user({user}) does not have root privilege to build classic image. Please run gadget-image as root."
)]
pub struct PrivilegeError {
    pub user: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Required dependency {name} seems to be missing. {info}")]
pub struct DependencyError {
    pub name: String,
    pub info: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_message_format() {
        let err = LayoutError::Overlap {
            what: "dd".to_string(),
            offset: 838860800,
            previous_end: 891289600,
        };
        assert_eq!(
            err.to_string(),
            "Structure conflict! dd: 838860800 <  891289600"
        );
    }

    #[test]
    fn test_hook_error_carries_details() {
        let err = HookError {
            name: "post-populate-rootfs".to_string(),
            path: PathBuf::from("/hooks/post-populate-rootfs"),
            code: 3,
            stderr: "boom\n".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/hooks/post-populate-rootfs"));
        assert!(msg.contains("return code 3"));
        assert!(msg.ends_with("boom\n"));
    }
}
