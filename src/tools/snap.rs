//! `snap prepare-image` content materializer.

use super::{ContentMaterializer, MaterializeRequest};
use crate::process::Cmd;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Extra customizations understood by `prepare-image --customize`.
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
struct Customization {
    #[serde(skip_serializing_if = "Option::is_none")]
    cloud_init_user_data: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    console_conf: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    boot_flags: Vec<String>,
}

impl Customization {
    fn from_request(request: &MaterializeRequest) -> Option<Self> {
        let custom = Customization {
            cloud_init_user_data: request.cloud_init.clone(),
            console_conf: request
                .disable_console_conf
                .then(|| "disabled".to_string()),
            boot_flags: if request.factory_image {
                vec!["factory".to_string()]
            } else {
                Vec::new()
            },
        };
        (custom != Customization::default()).then_some(custom)
    }
}

pub struct SnapPrepareImage {
    command: String,
}

impl SnapPrepareImage {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn command(&self, request: &MaterializeRequest, customize: Option<&Path>) -> Result<Cmd> {
        let model = request
            .source
            .as_deref()
            .context("prepare-image needs a model assertion")?;
        let mut cmd = Cmd::new(&self.command).arg("prepare-image");
        if let Some(channel) = &request.channel {
            cmd = cmd.arg(format!("--channel={}", channel));
        }
        for snap in &request.snaps {
            cmd = cmd.arg(format!("--snap={}", snap));
        }
        if let Some(path) = customize {
            cmd = cmd.arg(format!("--customize={}", path.display()));
        }
        Ok(cmd
            .arg_path(model)
            .arg_path(&request.target)
            .error_msg("snap prepare-image failed"))
    }
}

impl ContentMaterializer for SnapPrepareImage {
    fn materialize(&self, request: &MaterializeRequest) -> Result<()> {
        let customize = match Customization::from_request(request) {
            Some(custom) => {
                let path = request.workdir.join("customization");
                let json = serde_json::to_string(&custom)?;
                fs::write(&path, json)
                    .with_context(|| format!("writing '{}'", path.display()))?;
                Some(path)
            }
            None => None,
        };
        self.command(request, customize.as_deref())?.run_interactive()?;
        Ok(())
    }
}
