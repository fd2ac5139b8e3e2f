//! Validated gadget specification tree.
//!
//! A gadget describes one or more volumes (disk images), each an ordered
//! list of structures (partitions or raw regions). [`parse`] turns a
//! gadget.yaml document into a [`GadgetSpec`]; the tree is immutable after
//! that; everything computed during a build lives in the build record.

pub mod parser;
pub mod size;

pub use parser::parse;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// GPT type of the implicit rootfs structure (Linux filesystem data).
pub const LINUX_DATA_GUID: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";

/// Largest raw region an `mbr` structure may occupy (boot code area).
pub const MBR_MAX_SIZE: u64 = 446;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootLoader {
    UBoot,
    Grub,
    Lk,
}

impl BootLoader {
    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "u-boot" => Some(Self::UBoot),
            "grub" => Some(Self::Grub),
            "lk" => Some(Self::Lk),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeSchema {
    #[default]
    Gpt,
    Mbr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StructureRole {
    Mbr,
    SystemBoot,
    SystemData,
    SystemSeed,
    SystemSave,
    SystemRecovery,
}

impl StructureRole {
    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "mbr" => Some(Self::Mbr),
            "system-boot" => Some(Self::SystemBoot),
            "system-data" => Some(Self::SystemData),
            "system-seed" => Some(Self::SystemSeed),
            "system-save" => Some(Self::SystemSave),
            "system-recovery" => Some(Self::SystemRecovery),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mbr => "mbr",
            Self::SystemBoot => "system-boot",
            Self::SystemData => "system-data",
            Self::SystemSeed => "system-seed",
            Self::SystemSave => "system-save",
            Self::SystemRecovery => "system-recovery",
        }
    }

    /// Roles whose size may be omitted and grows to fit the rootfs.
    pub fn is_rootfs(self) -> bool {
        matches!(self, Self::SystemData | Self::SystemSeed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileSystemType {
    #[default]
    None,
    Vfat,
    Ext4,
}

impl FileSystemType {
    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "vfat" => Some(Self::Vfat),
            "ext4" => Some(Self::Ext4),
            _ => None,
        }
    }
}

/// Partition type code of a structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StructureType {
    /// GPT partition type GUID.
    Guid(Uuid),
    /// Two-digit MBR type code, upper-cased.
    Hex(String),
    /// Usable on either schema: `XX,GUID`.
    Hybrid { hex: String, guid: Uuid },
    /// Raw region, not a partition.
    Bare,
    /// Legacy spelling of the `mbr` role.
    Mbr,
}

impl StructureType {
    pub fn is_bare(&self) -> bool {
        matches!(self, Self::Bare)
    }

    /// Type code to hand to the partitioner for the given schema.
    pub fn code_for(&self, schema: VolumeSchema) -> Option<String> {
        match (self, schema) {
            (Self::Guid(guid), VolumeSchema::Gpt) => Some(format_guid(guid)),
            (Self::Hybrid { guid, .. }, VolumeSchema::Gpt) => Some(format_guid(guid)),
            (Self::Hex(hex), VolumeSchema::Mbr) => Some(hex.clone()),
            (Self::Hybrid { hex, .. }, VolumeSchema::Mbr) => Some(hex.clone()),
            _ => None,
        }
    }
}

fn format_guid(guid: &Uuid) -> String {
    guid.hyphenated().to_string().to_uppercase()
}

impl fmt::Display for StructureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Guid(guid) => write!(f, "{}", guid.hyphenated()),
            Self::Hex(hex) => write!(f, "{}", hex),
            Self::Hybrid { hex, guid } => write!(f, "{},{}", hex, guid.hyphenated()),
            Self::Bare => write!(f, "bare"),
            Self::Mbr => write!(f, "mbr"),
        }
    }
}

/// Where a structure's sector offset gets embedded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OffsetWrite {
    /// Absolute byte offset in the volume.
    Absolute(u64),
    /// Byte delta from the start of the named structure.
    Relative { label: String, delta: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentSpec {
    /// Raw blob copied into a bare structure.
    Image {
        image: String,
        offset: Option<u64>,
        offset_write: Option<OffsetWrite>,
        size: Option<u64>,
    },
    /// File or directory copied into a filesystem structure. A `source`
    /// ending in `/` copies the directory contents into `target`.
    Files { source: String, target: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureSpec {
    pub name: Option<String>,
    pub id: Option<Uuid>,
    pub structure_type: StructureType,
    pub role: Option<StructureRole>,
    pub filesystem: FileSystemType,
    pub filesystem_label: Option<String>,
    /// Byte offset; `None` until the layout calculator places it.
    pub offset: Option<u64>,
    pub offset_write: Option<OffsetWrite>,
    /// Byte size; may be `None` only for rootfs roles.
    pub size: Option<u64>,
    pub content: Vec<ContentSpec>,
    /// Synthesized rootfs appended when the gadget declares none.
    pub implicit: bool,
}

impl StructureSpec {
    pub fn has_role(&self, role: StructureRole) -> bool {
        self.role == Some(role)
    }

    /// Human identity for diagnostics: name, else role, else type.
    pub fn identity(&self) -> String {
        match (&self.name, self.role) {
            (Some(name), _) => name.clone(),
            (None, Some(role)) => role.as_str().to_string(),
            (None, None) => self.structure_type.to_string(),
        }
    }

    /// Whether the structure becomes a partition table entry.
    pub fn is_partition(&self) -> bool {
        !self.has_role(StructureRole::Mbr) && !self.structure_type.is_bare()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub schema: VolumeSchema,
    pub bootloader: Option<BootLoader>,
    /// Disk id: a GUID for GPT or a two-digit hex code.
    pub id: Option<String>,
    pub structures: Vec<StructureSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Bool(bool),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub plug: String,
    pub slot: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GadgetSpec {
    /// Top-level bootloader of a legacy single-volume gadget.
    pub bootloader: Option<BootLoader>,
    /// Volumes in declaration order.
    pub volumes: Vec<VolumeSpec>,
    pub defaults: BTreeMap<String, BTreeMap<String, DefaultValue>>,
    pub connections: Vec<Connection>,
    pub device_tree: Option<String>,
    pub device_tree_origin: String,
    pub format: Option<u64>,
    /// True when a `system-seed` structure exists; such images only get
    /// their seed partition, the rest is created on first boot.
    pub seeded: bool,
}

impl GadgetSpec {
    /// Structures a seeded image leaves for first boot to create.
    pub fn should_skip(&self, structure: &StructureSpec) -> bool {
        self.seeded
            && matches!(
                structure.role,
                Some(StructureRole::SystemBoot)
                    | Some(StructureRole::SystemData)
                    | Some(StructureRole::SystemSave)
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes_per_schema() {
        let guid = Uuid::parse_str("0fc63daf-8483-4772-8e79-3d69d8477de4").unwrap();
        let hybrid = StructureType::Hybrid {
            hex: "83".to_string(),
            guid,
        };
        assert_eq!(
            hybrid.code_for(VolumeSchema::Gpt).as_deref(),
            Some(LINUX_DATA_GUID)
        );
        assert_eq!(hybrid.code_for(VolumeSchema::Mbr).as_deref(), Some("83"));
        assert_eq!(StructureType::Bare.code_for(VolumeSchema::Gpt), None);
        assert_eq!(StructureType::Guid(guid).code_for(VolumeSchema::Mbr), None);
    }

    #[test]
    fn test_identity_prefers_name_then_role() {
        let mut structure = StructureSpec {
            name: None,
            id: None,
            structure_type: StructureType::Bare,
            role: None,
            filesystem: FileSystemType::None,
            filesystem_label: None,
            offset: None,
            offset_write: None,
            size: Some(1),
            content: Vec::new(),
            implicit: false,
        };
        assert_eq!(structure.identity(), "bare");
        structure.role = Some(StructureRole::Mbr);
        assert_eq!(structure.identity(), "mbr");
        structure.name = Some("boot-code".to_string());
        assert_eq!(structure.identity(), "boot-code");
    }
}
