//! Core building blocks shared by dropsafe binaries.
//!
//! Configuration, the status taxonomy, and the volume model live here so the
//! disk pipeline and client crates can focus on their own orchestration.

pub mod config;
pub mod error;
pub mod logging;
pub mod volume;

pub use config::{ClientCfg, ConfigFormat, DiskCfg, DropsafeConfig, DEFAULT_CONFIG_PATH};
pub use error::{ExportError, ExportResult, ExportStatus};
pub use volume::{EncryptionScheme, FoundVolume, MountedVolume, Volume};
