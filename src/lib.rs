//! Build bootable disk images from a gadget.yaml volume layout.
//!
//! A gadget describes one or more disk volumes: partition schema,
//! bootloader, and an ordered list of structures with their content. The
//! builder turns that description plus a root filesystem into one image
//! file per volume.
//!
//! - **Gadget model** - parse and validate gadget.yaml into a typed tree
//! - **Layout** - resolve every structure to a byte range and size the image
//! - **Image assembly** - partition tables, filesystem images, raw blobs
//! - **Pipeline** - resumable, named steps with snap and classic variants
//! - **Preflight checks** - host tool validation before builds
//!
//! # Architecture
//!
//! ```text
//! gadget-image (bin)
//!     │
//!     ├── config      BuildConfig from TOML + flags
//!     ├── preflight   which(1) checks per flavor and schema
//!     └── builder     Builder over state_machine::StateMachine
//!            │
//!            ├── common / snap / classic step tables
//!            ├── gadget, layout, image, filesystem
//!            ├── hooks   user scripts
//!            └── tools   traits over snap, live-build, mkfs, sgdisk/sfdisk
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use gadget_image::builder::Builder;
//! use gadget_image::config::{BuildConfig, Flavor};
//!
//! let mut config = BuildConfig::snap();
//! if let Flavor::Snap(options) = &mut config.flavor {
//!     options.model_assertion = Some("pc.model".into());
//! }
//! let mut builder = Builder::new(config)?;
//! builder.run(None)?;
//! println!("{:?}", builder.record().images);
//! ```

pub mod builder;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod gadget;
pub mod hooks;
pub mod image;
pub mod layout;
pub mod preflight;
pub mod process;
pub mod state_machine;
pub mod tools;

pub use builder::{Builder, Step, Stop};
pub use config::BuildConfig;
pub use gadget::GadgetSpec;
