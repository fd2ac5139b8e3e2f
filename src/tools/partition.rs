//! Partition table tools: `sgdisk` for GPT, `sfdisk` for MBR.

use super::{sectors, PartitionTool, SECTOR_SIZE};
use crate::gadget::{StructureType, VolumeSchema};
use crate::process::Cmd;
use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

/// Pick the partitioner matching the volume schema.
pub fn default_partition_tool(schema: VolumeSchema, image: &Path) -> Box<dyn PartitionTool> {
    match schema {
        VolumeSchema::Gpt => Box::new(Sgdisk::new(image)),
        VolumeSchema::Mbr => Box::new(Sfdisk::new(image)),
    }
}

pub struct Sgdisk {
    image: PathBuf,
    created: usize,
}

impl Sgdisk {
    pub fn new(image: &Path) -> Self {
        Self {
            image: image.to_path_buf(),
            created: 0,
        }
    }
}

impl PartitionTool for Sgdisk {
    fn create_partition(
        &mut self,
        offset: u64,
        size: u64,
        name: Option<&str>,
        bootable: bool,
    ) -> Result<usize> {
        let number = self.created + 1;
        let mut cmd = Cmd::new("sgdisk").arg(format!(
            "--new={}:{}:+{}",
            number,
            offset / SECTOR_SIZE,
            sectors(size)
        ));
        if let Some(name) = name {
            cmd = cmd.arg(format!("--change-name={}:{}", number, name));
        }
        if bootable {
            cmd = cmd.arg(format!("--attributes={}:set:2", number));
        }
        cmd.arg_path(&self.image)
            .error_msg("sgdisk failed to create partition")
            .run()?;
        self.created = number;
        Ok(number)
    }

    fn set_partition_type(&mut self, number: usize, kind: &StructureType) -> Result<()> {
        let Some(code) = kind.code_for(VolumeSchema::Gpt) else {
            bail!("Partition type '{}' has no GPT type code", kind);
        };
        Cmd::new("sgdisk")
            .arg(format!("--typecode={}:{}", number, code))
            .arg_path(&self.image)
            .error_msg("sgdisk failed to set partition type")
            .run()?;
        Ok(())
    }

    fn diagnostics(&self) -> Result<String> {
        let result = Cmd::new("sgdisk").arg("--print").arg_path(&self.image).run()?;
        Ok(result.stdout)
    }
}

pub struct Sfdisk {
    image: PathBuf,
    created: usize,
}

impl Sfdisk {
    pub fn new(image: &Path) -> Self {
        Self {
            image: image.to_path_buf(),
            created: 0,
        }
    }

    /// Script line fed to sfdisk on stdin.
    fn script(&self, offset: u64, size: u64, bootable: bool) -> String {
        let mut line = format!("start={}, size={}", offset / SECTOR_SIZE, sectors(size));
        if bootable {
            line.push_str(", bootable");
        }
        if self.created == 0 {
            format!("label: dos\n{}\n", line)
        } else {
            format!("{}\n", line)
        }
    }
}

impl PartitionTool for Sfdisk {
    fn create_partition(
        &mut self,
        offset: u64,
        size: u64,
        _name: Option<&str>,
        bootable: bool,
    ) -> Result<usize> {
        let script = self.script(offset, size, bootable);
        let mut cmd = Cmd::new("sfdisk");
        if self.created > 0 {
            cmd = cmd.arg("--append");
        }
        cmd.arg_path(&self.image)
            .stdin(script)
            .error_msg("sfdisk failed to create partition")
            .run()?;
        self.created += 1;
        Ok(self.created)
    }

    fn set_partition_type(&mut self, number: usize, kind: &StructureType) -> Result<()> {
        let Some(code) = kind.code_for(VolumeSchema::Mbr) else {
            bail!("Partition type '{}' has no MBR type code", kind);
        };
        Cmd::new("sfdisk")
            .arg("--part-type")
            .arg_path(&self.image)
            .arg(number.to_string())
            .arg(code)
            .error_msg("sfdisk failed to set partition type")
            .run()?;
        Ok(())
    }

    fn diagnostics(&self) -> Result<String> {
        let result = Cmd::new("sfdisk").arg("--dump").arg_path(&self.image).run()?;
        Ok(result.stdout)
    }
}
