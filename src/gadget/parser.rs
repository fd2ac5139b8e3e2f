//! gadget.yaml parsing and validation.
//!
//! Two phases. The document is first decoded into loosely typed `Raw*`
//! structs (`deny_unknown_fields`, so stray keys fail immediately). Each
//! raw node is then checked against the cross-field rules and converted
//! into the validated tree. Both phases stop at the first problem and
//! report the offending path, e.g. `volumes:pc:structure:2:type`.

use super::size::parse_size;
use super::{
    BootLoader, Connection, ContentSpec, DefaultValue, FileSystemType, GadgetSpec, OffsetWrite,
    StructureRole, StructureSpec, StructureType, VolumeSchema, VolumeSpec, LINUX_DATA_GUID,
    MBR_MAX_SIZE,
};
use crate::error::GadgetSpecError;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(u64),
    Text(String),
}

impl Scalar {
    fn text(&self) -> String {
        match self {
            Scalar::Int(value) => value.to_string(),
            Scalar::Text(value) => value.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawGadget {
    volumes: Option<Mapping>,
    bootloader: Option<String>,
    format: Option<Scalar>,
    defaults: Option<BTreeMap<String, BTreeMap<String, Value>>>,
    connections: Option<Vec<RawConnection>>,
    device_tree: Option<String>,
    device_tree_origin: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConnection {
    plug: String,
    slot: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawVolume {
    schema: Option<String>,
    bootloader: Option<String>,
    id: Option<Scalar>,
    structure: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawStructure {
    name: Option<String>,
    #[serde(rename = "type")]
    structure_type: Option<Scalar>,
    role: Option<String>,
    id: Option<String>,
    filesystem: Option<String>,
    filesystem_label: Option<String>,
    offset: Option<Scalar>,
    offset_write: Option<Scalar>,
    size: Option<Scalar>,
    content: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawContent {
    image: Option<String>,
    source: Option<String>,
    target: Option<String>,
    offset: Option<Scalar>,
    offset_write: Option<Scalar>,
    size: Option<Scalar>,
}

/// Parse and validate a gadget.yaml document.
pub fn parse(document: &str) -> Result<GadgetSpec, GadgetSpecError> {
    if document.trim().is_empty() {
        return Err(GadgetSpecError::Empty);
    }
    let value: Value = serde_yaml::from_str(document).map_err(|_| GadgetSpecError::NotYaml)?;
    if value.is_null() {
        return Err(GadgetSpecError::Empty);
    }
    let raw: RawGadget = decode(value, "gadget")?;

    if let Some(format) = &raw.format {
        match format {
            Scalar::Int(0) => {}
            other => return Err(GadgetSpecError::UnsupportedFormat(other.text())),
        }
    }

    let bootloader = raw
        .bootloader
        .as_deref()
        .map(|value| parse_bootloader(value, "bootloader"))
        .transpose()?;

    let raw_volumes = raw.volumes.ok_or_else(|| invalid("volumes"))?;
    if raw_volumes.is_empty() {
        return Err(invalid("volumes"));
    }
    if bootloader.is_some() && raw_volumes.len() != 1 {
        return Err(GadgetSpecError::Semantic(
            "A top-level bootloader requires exactly one volume".to_string(),
        ));
    }

    let mut volumes = Vec::with_capacity(raw_volumes.len());
    for (key, value) in raw_volumes {
        let name = match key {
            Value::String(name) => name,
            Value::Number(number) => number.to_string(),
            _ => return Err(invalid("volumes")),
        };
        let mut volume = parse_volume(&name, value)?;
        if volume.bootloader.is_none() {
            volume.bootloader = bootloader;
        }
        check_boot_structures(&volume)?;
        volumes.push(volume);
    }

    if volumes.iter().all(|volume| volume.bootloader.is_none()) {
        return Err(GadgetSpecError::Semantic(
            "No bootloader structure named".to_string(),
        ));
    }

    let seeded = volumes
        .iter()
        .flat_map(|volume| volume.structures.iter())
        .any(|structure| structure.has_role(StructureRole::SystemSeed));
    let has_rootfs = volumes
        .iter()
        .flat_map(|volume| volume.structures.iter())
        .any(|structure| structure.has_role(StructureRole::SystemData));
    if !seeded && !has_rootfs {
        if let Some(volume) = volumes.iter_mut().find(|volume| volume.bootloader.is_some()) {
            volume.structures.push(implicit_rootfs());
        }
    }

    Ok(GadgetSpec {
        bootloader,
        volumes,
        defaults: convert_defaults(raw.defaults.unwrap_or_default()),
        connections: raw
            .connections
            .unwrap_or_default()
            .into_iter()
            .map(|raw| Connection {
                plug: raw.plug,
                slot: raw.slot,
            })
            .collect(),
        device_tree: raw.device_tree,
        device_tree_origin: raw
            .device_tree_origin
            .unwrap_or_else(|| "gadget".to_string()),
        format: raw.format.map(|_| 0),
        seeded,
    })
}

fn parse_volume(name: &str, value: Value) -> Result<VolumeSpec, GadgetSpecError> {
    let path = format!("volumes:{}", name);
    let raw: RawVolume = decode(value, &path)?;

    let schema = match raw.schema.as_deref() {
        None | Some("gpt") => VolumeSchema::Gpt,
        Some("mbr") => VolumeSchema::Mbr,
        Some(other) => {
            return Err(GadgetSpecError::InvalidValue {
                value: other.to_string(),
                path: format!("{}:schema", path),
            })
        }
    };

    let bootloader = raw
        .bootloader
        .as_deref()
        .map(|value| parse_bootloader(value, &format!("{}:bootloader", path)))
        .transpose()?;

    let id = match raw.id {
        None => None,
        Some(id) => {
            let text = id.text();
            if let Some(hex) = parse_hex2(&text) {
                Some(hex)
            } else if let Ok(guid) = Uuid::parse_str(&text) {
                Some(guid.hyphenated().to_string().to_uppercase())
            } else {
                return Err(invalid(format!("{}:id", path)));
            }
        }
    };

    let raw_structures = match raw.structure {
        Some(structures) if !structures.is_empty() => structures,
        _ => return Err(invalid(format!("{}:structure", path))),
    };

    let mut structures = Vec::with_capacity(raw_structures.len());
    for (index, value) in raw_structures.into_iter().enumerate() {
        let structure_path = format!("{}:structure:{}", path, index);
        structures.push(parse_structure(&structure_path, schema, value)?);
    }

    Ok(VolumeSpec {
        name: name.to_string(),
        schema,
        bootloader,
        id,
        structures,
    })
}

/// Boot and seed partitions receive bootloader files, so only bootloaders
/// that ship such files may own them.
fn check_boot_structures(volume: &VolumeSpec) -> Result<(), GadgetSpecError> {
    let boot_role = volume.structures.iter().any(|structure| {
        structure.has_role(StructureRole::SystemBoot)
            || structure.has_role(StructureRole::SystemSeed)
    });
    let value = match volume.bootloader {
        Some(BootLoader::UBoot) | Some(BootLoader::Grub) => return Ok(()),
        Some(BootLoader::Lk) => "lk",
        None => "none",
    };
    if boot_role {
        return Err(GadgetSpecError::Semantic(format!(
            "Unsupported volume bootloader value: {}",
            value
        )));
    }
    Ok(())
}

fn parse_structure(
    path: &str,
    schema: VolumeSchema,
    value: Value,
) -> Result<StructureSpec, GadgetSpecError> {
    let raw: RawStructure = decode(value, path)?;

    let type_text = raw
        .structure_type
        .as_ref()
        .map(Scalar::text)
        .ok_or_else(|| invalid(format!("{}:type", path)))?;
    let structure_type =
        parse_structure_type(&type_text).ok_or_else(|| invalid(format!("{}:type", path)))?;

    let mut role = raw
        .role
        .as_deref()
        .map(|value| {
            StructureRole::from_name(value).ok_or_else(|| GadgetSpecError::InvalidValue {
                value: value.to_string(),
                path: format!("{}:role", path),
            })
        })
        .transpose()?;

    if structure_type == StructureType::Mbr {
        if role.is_some() {
            return Err(GadgetSpecError::Semantic(
                "Type mbr and role fields assigned at the same time, please use the mbr role instead"
                    .to_string(),
            ));
        }
        role = Some(StructureRole::Mbr);
    }

    match (&structure_type, schema) {
        (StructureType::Guid(_), VolumeSchema::Mbr) => {
            return Err(GadgetSpecError::Semantic(
                "GUID structure type with non-GPT schema".to_string(),
            ))
        }
        (StructureType::Hex(_), VolumeSchema::Gpt) => {
            return Err(GadgetSpecError::Semantic(
                "MBR structure type with non-MBR schema".to_string(),
            ))
        }
        _ => {}
    }

    if structure_type.is_bare()
        && matches!(
            role,
            Some(StructureRole::SystemBoot) | Some(StructureRole::SystemData)
        )
    {
        return Err(GadgetSpecError::Semantic(
            "Invalid gadget.yaml: structure role/type conflict".to_string(),
        ));
    }

    let filesystem_label = raw.filesystem_label.clone().or_else(|| raw.name.clone());
    if role.is_none() {
        role = match raw.filesystem_label.as_deref() {
            Some("system-boot") => Some(StructureRole::SystemBoot),
            Some("system-recovery") => Some(StructureRole::SystemRecovery),
            _ => None,
        };
    }
    if role == Some(StructureRole::SystemData) {
        if let Some(label) = raw.filesystem_label.as_deref() {
            if label != "writable" {
                return Err(GadgetSpecError::Semantic(format!(
                    "`role: system-data` structure must have an implicit label, or 'writable': {}",
                    label
                )));
            }
        }
    }

    let filesystem = match raw.filesystem.as_deref() {
        None => FileSystemType::None,
        Some(value) => {
            FileSystemType::from_name(value).ok_or_else(|| GadgetSpecError::InvalidValue {
                value: value.to_string(),
                path: format!("{}:filesystem", path),
            })?
        }
    };

    let id = raw
        .id
        .as_deref()
        .map(|value| Uuid::parse_str(value).map_err(|_| invalid(format!("{}:id", path))))
        .transpose()?;

    let size = raw
        .size
        .as_ref()
        .map(|value| size_value(value, &format!("{}:size", path)))
        .transpose()?;
    let offset = raw
        .offset
        .as_ref()
        .map(|value| size_value(value, &format!("{}:offset", path)))
        .transpose()?;
    let offset_write = raw
        .offset_write
        .as_ref()
        .map(|value| {
            parse_offset_write(&value.text()).ok_or_else(|| invalid(format!("{}:offset-write", path)))
        })
        .transpose()?;

    if size.is_none() && !role.is_some_and(StructureRole::is_rootfs) {
        return Err(invalid(format!("{}:size", path)));
    }

    if role == Some(StructureRole::Mbr) {
        if filesystem != FileSystemType::None {
            return Err(GadgetSpecError::Semantic(
                "mbr structures must not specify a file system".to_string(),
            ));
        }
        if id.is_some() {
            return Err(GadgetSpecError::Semantic(
                "mbr structures must not specify partition id".to_string(),
            ));
        }
        if size.is_some_and(|size| size > MBR_MAX_SIZE) {
            return Err(GadgetSpecError::Semantic(format!(
                "mbr structures cannot be larger than {} bytes.",
                MBR_MAX_SIZE
            )));
        }
        if offset.is_some_and(|offset| offset != 0) {
            return Err(GadgetSpecError::Semantic(
                "mbr structure must start at offset 0".to_string(),
            ));
        }
    }

    let mut content = Vec::new();
    for (index, value) in raw.content.unwrap_or_default().into_iter().enumerate() {
        let content_path = format!("{}:content:{}", path, index);
        content.push(parse_content(&content_path, filesystem, value)?);
    }

    Ok(StructureSpec {
        name: raw.name,
        id,
        structure_type,
        role,
        filesystem,
        filesystem_label,
        offset,
        offset_write,
        size,
        content,
        implicit: false,
    })
}

fn parse_content(
    path: &str,
    filesystem: FileSystemType,
    value: Value,
) -> Result<ContentSpec, GadgetSpecError> {
    let raw: RawContent = decode(value, path)?;
    match filesystem {
        FileSystemType::None => {
            let image = match (&raw.image, &raw.source, &raw.target) {
                (Some(image), None, None) => image.clone(),
                _ => {
                    return Err(GadgetSpecError::Semantic(
                        "filesystem: none missing image file name".to_string(),
                    ))
                }
            };
            Ok(ContentSpec::Image {
                image,
                offset: raw
                    .offset
                    .as_ref()
                    .map(|value| size_value(value, &format!("{}:offset", path)))
                    .transpose()?,
                offset_write: raw
                    .offset_write
                    .as_ref()
                    .map(|value| {
                        parse_offset_write(&value.text())
                            .ok_or_else(|| invalid(format!("{}:offset-write", path)))
                    })
                    .transpose()?,
                size: raw
                    .size
                    .as_ref()
                    .map(|value| size_value(value, &format!("{}:size", path)))
                    .transpose()?,
            })
        }
        FileSystemType::Vfat | FileSystemType::Ext4 => {
            let (source, target) = match (raw.source, raw.target, &raw.image) {
                (Some(source), Some(target), None) => (source, target),
                _ => {
                    return Err(GadgetSpecError::Semantic(
                        "filesystem: vfat|ext4 missing source/target".to_string(),
                    ))
                }
            };
            if source.ends_with('/') && !target.ends_with('/') {
                return Err(GadgetSpecError::Semantic(format!(
                    "target must end in a slash: {}",
                    target
                )));
            }
            Ok(ContentSpec::Files { source, target })
        }
    }
}

/// `label+N` or an absolute value below 2^32.
fn parse_offset_write(text: &str) -> Option<OffsetWrite> {
    let limit = 1u64 << 32;
    if let Some((label, delta)) = text.rsplit_once('+') {
        if label.is_empty() {
            return None;
        }
        let delta = parse_size(delta).ok()?;
        if delta >= limit {
            return None;
        }
        return Some(OffsetWrite::Relative {
            label: label.to_string(),
            delta,
        });
    }
    let value = parse_size(text).ok()?;
    (value < limit).then_some(OffsetWrite::Absolute(value))
}

fn parse_structure_type(text: &str) -> Option<StructureType> {
    match text {
        "bare" => return Some(StructureType::Bare),
        "mbr" => return Some(StructureType::Mbr),
        _ => {}
    }
    if let Some((hex, guid)) = text.split_once(',') {
        let hex = parse_hex2(hex)?;
        let guid = parse_guid(guid)?;
        return Some(StructureType::Hybrid { hex, guid });
    }
    if let Some(hex) = parse_hex2(text) {
        return Some(StructureType::Hex(hex));
    }
    parse_guid(text).map(StructureType::Guid)
}

fn parse_guid(text: &str) -> Option<Uuid> {
    // Only the canonical 8-4-4-4-12 spelling is a partition type.
    if text.len() != 36 {
        return None;
    }
    Uuid::parse_str(text).ok()
}

fn parse_hex2(text: &str) -> Option<String> {
    (text.len() == 2 && text.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| text.to_ascii_uppercase())
}

fn parse_bootloader(value: &str, path: &str) -> Result<BootLoader, GadgetSpecError> {
    BootLoader::from_name(value).ok_or_else(|| GadgetSpecError::InvalidValue {
        value: value.to_string(),
        path: path.to_string(),
    })
}

fn size_value(value: &Scalar, path: &str) -> Result<u64, GadgetSpecError> {
    match value {
        Scalar::Int(bytes) => Ok(*bytes),
        Scalar::Text(text) => parse_size(text).map_err(|_| GadgetSpecError::InvalidSize {
            value: text.clone(),
            path: path.to_string(),
        }),
    }
}

fn convert_defaults(
    raw: BTreeMap<String, BTreeMap<String, Value>>,
) -> BTreeMap<String, BTreeMap<String, DefaultValue>> {
    raw.into_iter()
        .map(|(snap, values)| {
            let values = values
                .into_iter()
                .map(|(key, value)| {
                    let value = match value {
                        Value::Bool(flag) => DefaultValue::Bool(flag),
                        Value::String(text) => DefaultValue::Text(text),
                        Value::Number(number) => DefaultValue::Text(number.to_string()),
                        Value::Null => DefaultValue::Text(String::new()),
                        other => DefaultValue::Text(
                            serde_yaml::to_string(&other)
                                .map(|text| text.trim_end().to_string())
                                .unwrap_or_default(),
                        ),
                    };
                    (key, value)
                })
                .collect();
            (snap, values)
        })
        .collect()
}

fn implicit_rootfs() -> StructureSpec {
    StructureSpec {
        name: None,
        id: None,
        structure_type: StructureType::Hybrid {
            hex: "83".to_string(),
            guid: Uuid::parse_str(LINUX_DATA_GUID).unwrap_or_default(),
        },
        role: Some(StructureRole::SystemData),
        filesystem: FileSystemType::Ext4,
        filesystem_label: Some("writable".to_string()),
        offset: None,
        offset_write: None,
        size: None,
        content: Vec::new(),
        implicit: true,
    }
}

fn decode<T: DeserializeOwned>(value: Value, path: &str) -> Result<T, GadgetSpecError> {
    serde_yaml::from_value(value).map_err(|err| GadgetSpecError::Malformed {
        path: path.to_string(),
        detail: err.to_string(),
    })
}

fn invalid(path: impl Into<String>) -> GadgetSpecError {
    GadgetSpecError::Invalid { path: path.into() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::size::mib;

    const MINIMAL: &str = "\
volumes:
  first-image:
    bootloader: u-boot
    structure:
        - type: 00000000-0000-0000-0000-0000deadbeef
          size: 400M
";

    fn parse_err(document: &str) -> String {
        parse(document).unwrap_err().to_string()
    }

    #[test]
    fn test_minimal_volume() {
        let gadget = parse(MINIMAL).unwrap();
        assert_eq!(gadget.volumes.len(), 1);
        let volume = &gadget.volumes[0];
        assert_eq!(volume.name, "first-image");
        assert_eq!(volume.schema, VolumeSchema::Gpt);
        assert_eq!(volume.bootloader, Some(BootLoader::UBoot));
        assert_eq!(volume.structures[0].size, Some(mib(400)));
        assert_eq!(volume.structures[0].filesystem, FileSystemType::None);
        assert_eq!(gadget.device_tree_origin, "gadget");
        assert!(!gadget.seeded);
    }

    #[test]
    fn test_parse_is_deterministic() {
        let document = "\
defaults:
  mfq0tsAY:
    some-key: some-value
    other-key: 42
volumes:
  pc:
    bootloader: grub
    structure:
      - name: mbr
        type: mbr
        size: 440
        content:
          - image: pc-boot.img
      - name: EFI System
        type: C12A7328-F81F-11D2-BA4B-00A0C93EC93B
        filesystem: vfat
        filesystem-label: system-boot
        size: 50M
        content:
          - source: grubx64.efi
            target: EFI/boot/grubx64.efi
";
        assert_eq!(parse(document).unwrap(), parse(document).unwrap());
    }

    #[test]
    fn test_implicit_rootfs_appended() {
        let gadget = parse(MINIMAL).unwrap();
        let structures = &gadget.volumes[0].structures;
        assert_eq!(structures.len(), 2);
        let rootfs = &structures[1];
        assert!(rootfs.implicit);
        assert_eq!(rootfs.role, Some(StructureRole::SystemData));
        assert_eq!(rootfs.filesystem, FileSystemType::Ext4);
        assert_eq!(rootfs.filesystem_label.as_deref(), Some("writable"));
        assert_eq!(rootfs.size, None);
        assert_eq!(rootfs.structure_type.to_string(), "83,0fc63daf-8483-4772-8e79-3d69d8477de4");
    }

    #[test]
    fn test_guid_type_requires_gpt_schema() {
        let err = parse_err(
            "\
volumes:
  first-image:
    schema: mbr
    bootloader: u-boot
    structure:
        - type: 00000000-0000-0000-0000-0000deadbeef
          size: 400M
",
        );
        assert_eq!(err, "GUID structure type with non-GPT schema");
    }

    #[test]
    fn test_hex_type_requires_mbr_schema() {
        let err = parse_err(
            "\
volumes:
  first-image:
    schema: gpt
    bootloader: u-boot
    structure:
        - type: 83
          size: 400M
",
        );
        assert_eq!(err, "MBR structure type with non-MBR schema");
    }

    #[test]
    fn test_hybrid_type_works_on_both_schemas() {
        for schema in ["gpt", "mbr"] {
            let document = format!(
                "\
volumes:
  first-image:
    schema: {}
    bootloader: u-boot
    structure:
        - type: EF,C12A7328-F81F-11D2-BA4B-00A0C93EC93B
          size: 50M
",
                schema
            );
            let gadget = parse(&document).unwrap();
            assert!(matches!(
                gadget.volumes[0].structures[0].structure_type,
                StructureType::Hybrid { ref hex, .. } if hex == "EF"
            ));
        }
    }

    #[test]
    fn test_bad_types_report_path() {
        for bad in [
            "00000000-0000-0000-0000-0000deadbeef,80",
            "80,ab",
            "'80,'",
            "zz",
        ] {
            let document = format!(
                "\
volumes:
  first-image:
    bootloader: u-boot
    structure:
        - type: {}
          size: 400M
",
                bad
            );
            assert_eq!(
                parse_err(&document),
                "Invalid gadget.yaml @ volumes:first-image:structure:0:type",
                "type {}",
                bad
            );
        }
    }

    #[test]
    fn test_missing_size() {
        let err = parse_err(
            "\
volumes:
  first-image:
    bootloader: u-boot
    structure:
        - type: 00000000-0000-0000-0000-0000deadbeef
",
        );
        assert_eq!(err, "Invalid gadget.yaml @ volumes:first-image:structure:0:size");
    }

    #[test]
    fn test_rootfs_roles_may_omit_size() {
        let gadget = parse(
            "\
volumes:
  first-image:
    bootloader: u-boot
    structure:
        - type: 83,0FC63DAF-8483-4772-8E79-3D69D8477DE4
          role: system-data
          filesystem: ext4
",
        )
        .unwrap();
        let structures = &gadget.volumes[0].structures;
        assert_eq!(structures.len(), 1);
        assert_eq!(structures[0].size, None);
        assert!(!structures[0].implicit);
    }

    #[test]
    fn test_invalid_size_suffix() {
        let err = parse(
            "\
volumes:
  first-image:
    bootloader: u-boot
    structure:
        - type: 00000000-0000-0000-0000-0000deadbeef
          size: 400K
",
        )
        .unwrap_err();
        assert_eq!(
            err,
            GadgetSpecError::InvalidSize {
                value: "400K".to_string(),
                path: "volumes:first-image:structure:0:size".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = parse(
            "\
volumes:
  first-image:
    bootloader: u-boot
    structure:
        - type: 00000000-0000-0000-0000-0000deadbeef
          size: 400M
          colour: blue
",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            GadgetSpecError::Malformed { ref path, .. } if path == "volumes:first-image:structure:0"
        ));
    }

    #[test]
    fn test_bad_enum_values() {
        let err = parse_err(
            "\
volumes:
  first-image:
    bootloader: u-boat
    structure:
        - type: 00000000-0000-0000-0000-0000deadbeef
          size: 400M
",
        );
        assert_eq!(
            err,
            "Invalid gadget.yaml value 'u-boat' @ volumes:first-image:bootloader"
        );

        let err = parse_err(
            "\
volumes:
  first-image:
    bootloader: u-boot
    structure:
        - type: 00000000-0000-0000-0000-0000deadbeef
          size: 400M
          filesystem: zfs
",
        );
        assert_eq!(
            err,
            "Invalid gadget.yaml value 'zfs' @ volumes:first-image:structure:0:filesystem"
        );
    }

    #[test]
    fn test_mbr_role_rules() {
        let err = parse_err(
            "\
volumes:
  first-image:
    bootloader: u-boot
    structure:
        - role: mbr
          type: bare
          size: 447
",
        );
        assert_eq!(err, "mbr structures cannot be larger than 446 bytes.");

        let err = parse_err(
            "\
volumes:
  first-image:
    bootloader: u-boot
    structure:
        - role: mbr
          type: bare
          size: 446
          filesystem: ext4
",
        );
        assert_eq!(err, "mbr structures must not specify a file system");

        let err = parse_err(
            "\
volumes:
  first-image:
    bootloader: u-boot
    structure:
        - type: mbr
          role: mbr
          size: 446
",
        );
        assert!(err.starts_with("Type mbr and role fields assigned at the same time"));
    }

    #[test]
    fn test_legacy_mbr_type_implies_role() {
        let gadget = parse(
            "\
volumes:
  first-image:
    bootloader: u-boot
    structure:
        - type: mbr
          size: 446
          content:
            - image: pc-boot.img
",
        )
        .unwrap();
        assert_eq!(
            gadget.volumes[0].structures[0].role,
            Some(StructureRole::Mbr)
        );
    }

    #[test]
    fn test_bare_type_conflicts_with_boot_role() {
        let err = parse_err(
            "\
volumes:
  first-image:
    bootloader: u-boot
    structure:
        - type: bare
          role: system-boot
          size: 1M
",
        );
        assert_eq!(err, "Invalid gadget.yaml: structure role/type conflict");
    }

    #[test]
    fn test_label_implies_role() {
        let gadget = parse(
            "\
volumes:
  first-image:
    bootloader: u-boot
    structure:
        - type: 00000000-0000-0000-0000-0000deadbeef
          filesystem: vfat
          filesystem-label: system-boot
          size: 50M
",
        )
        .unwrap();
        assert_eq!(
            gadget.volumes[0].structures[0].role,
            Some(StructureRole::SystemBoot)
        );
    }

    #[test]
    fn test_system_data_label_must_be_writable() {
        let err = parse_err(
            "\
volumes:
  first-image:
    bootloader: u-boot
    structure:
        - type: 00000000-0000-0000-0000-0000deadbeef
          role: system-data
          filesystem-label: foobar
",
        );
        assert_eq!(
            err,
            "`role: system-data` structure must have an implicit label, or 'writable': foobar"
        );
    }

    #[test]
    fn test_content_rules() {
        let err = parse_err(
            "\
volumes:
  first-image:
    bootloader: u-boot
    structure:
        - type: 00000000-0000-0000-0000-0000deadbeef
          size: 400M
          content:
            - source: foo
              target: bar
",
        );
        assert_eq!(err, "filesystem: none missing image file name");

        let err = parse_err(
            "\
volumes:
  first-image:
    bootloader: u-boot
    structure:
        - type: 00000000-0000-0000-0000-0000deadbeef
          size: 400M
          filesystem: ext4
          content:
            - image: foo.img
",
        );
        assert_eq!(err, "filesystem: vfat|ext4 missing source/target");

        let err = parse_err(
            "\
volumes:
  first-image:
    bootloader: u-boot
    structure:
        - type: 00000000-0000-0000-0000-0000deadbeef
          size: 400M
          filesystem: ext4
          content:
            - source: boot-assets/
              target: assets
",
        );
        assert_eq!(err, "target must end in a slash: assets");
    }

    #[test]
    fn test_image_content_fields() {
        let gadget = parse(
            "\
volumes:
  first-image:
    bootloader: u-boot
    structure:
        - type: bare
          size: 150
          content:
            - image: one.img
            - image: two.img
              size: 23
            - image: three.img
              offset: 127
              offset-write: 8
",
        )
        .unwrap();
        let content = &gadget.volumes[0].structures[0].content;
        assert_eq!(
            content[1],
            ContentSpec::Image {
                image: "two.img".to_string(),
                offset: None,
                offset_write: None,
                size: Some(23),
            }
        );
        assert_eq!(
            content[2],
            ContentSpec::Image {
                image: "three.img".to_string(),
                offset: Some(127),
                offset_write: Some(OffsetWrite::Absolute(8)),
                size: None,
            }
        );
    }

    #[test]
    fn test_offset_write_forms() {
        assert_eq!(parse_offset_write("92"), Some(OffsetWrite::Absolute(92)));
        assert_eq!(
            parse_offset_write("mbr+92"),
            Some(OffsetWrite::Relative {
                label: "mbr".to_string(),
                delta: 92
            })
        );
        assert_eq!(parse_offset_write("4294967296"), None);
        assert_eq!(parse_offset_write("+92"), None);
        assert_eq!(parse_offset_write("mbr+ab"), None);
    }

    #[test]
    fn test_no_bootloader() {
        let err = parse_err(
            "\
volumes:
  first-image:
    structure:
        - type: 00000000-0000-0000-0000-0000deadbeef
          size: 400M
",
        );
        assert_eq!(err, "No bootloader structure named");
    }

    #[test]
    fn test_legacy_top_level_bootloader() {
        let gadget = parse(
            "\
bootloader: grub
volumes:
  pc:
    structure:
        - type: 00000000-0000-0000-0000-0000deadbeef
          size: 400M
",
        )
        .unwrap();
        assert_eq!(gadget.bootloader, Some(BootLoader::Grub));
        assert_eq!(gadget.volumes[0].bootloader, Some(BootLoader::Grub));
    }

    #[test]
    fn test_multiple_volumes_keep_order_and_defaults() {
        let gadget = parse(
            "\
defaults:
  mfq0tsAY:
    some-key: some-value
    other-key: 42
    some-key.disable: true
connections:
  - plug: aaaa:bbbb
    slot: cccc:dddd
  - plug: aaaa:bbbb
volumes:
  first-image:
    schema: gpt
    structure:
        - type: 00000000-0000-0000-0000-0000deadbeef
          size: 100
  second-image:
    schema: gpt
    structure:
        - type: 00000000-0000-0000-0000-0000feedface
          size: 200
  third-image:
    schema: gpt
    bootloader: u-boot
    structure:
        - type: 00000000-0000-0000-0000-0000deafbead
          size: 300
",
        )
        .unwrap();
        let names: Vec<&str> = gadget.volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["first-image", "second-image", "third-image"]);
        let defaults = &gadget.defaults["mfq0tsAY"];
        assert_eq!(defaults["some-key"], DefaultValue::Text("some-value".to_string()));
        assert_eq!(defaults["other-key"], DefaultValue::Text("42".to_string()));
        assert_eq!(defaults["some-key.disable"], DefaultValue::Bool(true));
        assert_eq!(gadget.connections.len(), 2);
        assert_eq!(gadget.connections[1].slot, None);
        // The implicit rootfs lands on the volume with the bootloader.
        assert_eq!(gadget.volumes[2].structures.len(), 2);
        assert_eq!(gadget.volumes[0].structures.len(), 1);
    }

    #[test]
    fn test_seeded_gadget_has_no_implicit_rootfs() {
        let gadget = parse(
            "\
volumes:
  pc:
    bootloader: grub
    structure:
        - name: ubuntu-seed
          role: system-seed
          type: EF,C12A7328-F81F-11D2-BA4B-00A0C93EC93B
          filesystem: vfat
          size: 1200M
",
        )
        .unwrap();
        assert!(gadget.seeded);
        assert_eq!(gadget.volumes[0].structures.len(), 1);
    }

    #[test]
    fn test_volume_and_structure_ids() {
        let gadget = parse(
            "\
volumes:
  first-image:
    schema: mbr
    bootloader: u-boot
    id: 80
    structure:
        - type: 83
          size: 400M
",
        )
        .unwrap();
        assert_eq!(gadget.volumes[0].id.as_deref(), Some("80"));

        let err = parse_err(
            "\
volumes:
  first-image:
    bootloader: u-boot
    id: 3g
    structure:
        - type: 00000000-0000-0000-0000-0000deadbeef
          size: 400M
",
        );
        assert_eq!(err, "Invalid gadget.yaml @ volumes:first-image:id");

        let err = parse_err(
            "\
volumes:
  first-image:
    bootloader: u-boot
    structure:
        - type: 00000000-0000-0000-0000-0000deadbeef
          id: 80
          size: 400M
",
        );
        assert!(err.contains("volumes:first-image:structure:0"));
    }

    #[test]
    fn test_boot_roles_need_a_supported_bootloader() {
        let err = parse_err(
            "\
volumes:
  dragonboard:
    schema: mbr
    bootloader: lk
    structure:
        - name: boot
          type: 0C
          role: system-boot
          filesystem: vfat
          size: 64M
",
        );
        assert_eq!(err, "Unsupported volume bootloader value: lk");

        let err = parse_err(
            "\
volumes:
  pc:
    bootloader: grub
    structure:
        - type: 00000000-0000-0000-0000-0000deadbeef
          size: 1M
  extra:
    structure:
        - name: ubuntu-seed
          role: system-seed
          type: 00000000-0000-0000-0000-0000feedface
          filesystem: vfat
          size: 100M
",
        );
        assert_eq!(err, "Unsupported volume bootloader value: none");

        let gadget = parse(
            "\
volumes:
  dragonboard:
    schema: mbr
    bootloader: lk
    structure:
        - name: bootloader
          type: 0C
          size: 1M
",
        )
        .unwrap();
        assert_eq!(gadget.volumes[0].bootloader, Some(BootLoader::Lk));
    }

    #[test]
    fn test_document_level_errors() {
        assert_eq!(parse(""), Err(GadgetSpecError::Empty));
        assert_eq!(
            parse("volumes: [unclosed"),
            Err(GadgetSpecError::NotYaml)
        );
        assert_eq!(
            parse_err("device-tree-origin: kernel\ndevice-tree: dtree\n"),
            "Invalid gadget.yaml @ volumes"
        );
        assert_eq!(
            parse_err(&format!("format: 1\n{}", MINIMAL)),
            "Unsupported gadget.yaml format version: 1"
        );
        assert!(parse(&format!("format: 0\n{}", MINIMAL)).is_ok());
    }
}
