//! Configuration model and helpers used by dropsafe binaries.

use crate::error::{ExportError, ExportResult};
use directories_next::ProjectDirs;
use log::info;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/dropsafe.toml";
const BOOTSTRAP_FILE_NAME: &str = "dropsafe.toml";
const APP_QUALIFIER: &str = "io";
const APP_ORGANIZATION: &str = "Dropsafe";
const APP_NAME: &str = "dropsafe";

pub(crate) fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
}

/// Knobs for the disk export pipeline: tool locations, timeouts, and the
/// directory name created on the target volume.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DiskCfg {
    /// Override for the `udisksctl` binary; autodetected when unset.
    #[serde(default)]
    pub udisksctl_path: Option<String>,

    /// Override for the `lsblk` binary; autodetected when unset.
    #[serde(default)]
    pub lsblk_path: Option<String>,

    /// Timeout applied to every non-interactive external command.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Timeout for each interactive unlock/mount prompt exchange.
    #[serde(default = "default_prompt_timeout_secs")]
    pub prompt_timeout_secs: u64,

    /// Attempts waiting for udisks to recognise a freshly unlocked mapping.
    #[serde(default = "default_mount_settle_attempts")]
    pub mount_settle_attempts: u32,

    #[serde(default = "default_mount_settle_delay_ms")]
    pub mount_settle_delay_ms: u64,

    /// Directory created under the target mountpoint for the payload.
    #[serde(default = "default_target_dirname")]
    pub target_dirname: String,
}

fn default_command_timeout_secs() -> u64 {
    10
}

fn default_prompt_timeout_secs() -> u64 {
    30
}

fn default_mount_settle_attempts() -> u32 {
    3
}

fn default_mount_settle_delay_ms() -> u64 {
    500
}

fn default_target_dirname() -> String {
    "dropsafe-export".to_string()
}

impl Default for DiskCfg {
    fn default() -> Self {
        Self {
            udisksctl_path: None,
            lsblk_path: None,
            command_timeout_secs: default_command_timeout_secs(),
            prompt_timeout_secs: default_prompt_timeout_secs(),
            mount_settle_attempts: default_mount_settle_attempts(),
            mount_settle_delay_ms: default_mount_settle_delay_ms(),
            target_dirname: default_target_dirname(),
        }
    }
}

/// Connection settings for the submission API client.
///
/// This is explicit, injected configuration; nothing here is defaulted from
/// ambient files outside the main config.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClientCfg {
    #[serde(default = "default_server")]
    pub server: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

fn default_server() -> String {
    "http://localhost:8081/".to_string()
}

fn default_request_timeout_secs() -> u64 {
    20
}

fn default_download_timeout_secs() -> u64 {
    60 * 60
}

impl Default for ClientCfg {
    fn default() -> Self {
        Self {
            server: default_server(),
            request_timeout_secs: default_request_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DropsafeConfig {
    #[serde(default)]
    pub disk: DiskCfg,

    #[serde(default)]
    pub client: ClientCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

impl Default for DropsafeConfig {
    fn default() -> Self {
        Self {
            disk: DiskCfg::default(),
            client: ClientCfg::default(),
            path: PathBuf::new(),
            format: ConfigFormat::Toml,
        }
    }
}

/// Tracks whether we parsed TOML or YAML so writes preserve format.
#[derive(Debug, Clone, Copy, Default)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl DropsafeConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Resolve the per-user configuration path used for bootstrapping.
    pub fn user_config_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(BOOTSTRAP_FILE_NAME))
    }

    /// Load configuration from disk, creating a bootstrap copy when missing.
    ///
    /// When the caller requests the global default and the process lacks
    /// permission to create it, a per-user configuration is written to the
    /// platform config directory instead.
    pub fn load_or_bootstrap<P: AsRef<Path>>(path: P) -> ExportResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }

        match ensure_bootstrap_file(target) {
            Ok(created) => {
                if created {
                    info!("dropsafe config bootstrap created at {}", target.display());
                }
                Self::load(target)
            }
            Err(err) => {
                if target != Self::default_path() {
                    return Err(ExportError::Device(format!(
                        "failed to initialise configuration at {}: {err}",
                        target.display()
                    )));
                }

                let user_path = Self::user_config_path().ok_or_else(|| {
                    ExportError::Device(
                        "unable to determine user configuration directory; \
                        create /etc/dropsafe.toml manually"
                            .to_string(),
                    )
                })?;

                let created_user = ensure_bootstrap_file(&user_path).map_err(|io_err| {
                    ExportError::Device(format!(
                        "failed to prepare bootstrap configuration at {}: {io_err}",
                        user_path.display()
                    ))
                })?;

                if created_user {
                    info!(
                        "dropsafe config bootstrap created at {}",
                        user_path.display()
                    );
                }

                Self::load(&user_path)
            }
        }
    }

    /// Read a config file from disk, detect format, and validate basics.
    pub fn load<P: AsRef<Path>>(path: P) -> ExportResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|err| ExportError::Device(format!("read config {}: {err}", path.display())))?;
        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)
                .map_err(|err| ExportError::Device(format!("parse {}: {err}", path.display())))?
        } else {
            serde_yaml::from_str::<Self>(&contents)
                .map_err(|err| ExportError::Device(format!("parse {}: {err}", path.display())))?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_toml {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };

        let issues = cfg.validate();
        if let Some(issue) = issues.first() {
            return Err(ExportError::Device(format!(
                "invalid configuration at {}: {issue}",
                path.display()
            )));
        }

        Ok(cfg)
    }

    /// Perform a best-effort validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.disk.command_timeout_secs == 0 {
            issues.push("disk.command_timeout_secs must be greater than 0".to_string());
        }
        if self.disk.prompt_timeout_secs == 0 {
            issues.push("disk.prompt_timeout_secs must be greater than 0".to_string());
        }
        if self.disk.mount_settle_attempts == 0 {
            issues.push("disk.mount_settle_attempts must be at least 1".to_string());
        }

        let dirname = self.disk.target_dirname.trim();
        if dirname.is_empty() {
            issues.push("disk.target_dirname must not be empty".to_string());
        } else if dirname.contains('/') || dirname == "." || dirname == ".." {
            issues.push(format!(
                "disk.target_dirname must be a plain directory name, got {dirname}"
            ));
        }

        if self.client.server.trim().is_empty() {
            issues.push("client.server must not be empty".to_string());
        }
        if self.client.request_timeout_secs == 0 {
            issues.push("client.request_timeout_secs must be greater than 0".to_string());
        }
        if self.client.download_timeout_secs == 0 {
            issues.push("client.download_timeout_secs must be greater than 0".to_string());
        }

        issues
    }

    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.disk.command_timeout_secs)
    }

    pub fn prompt_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.disk.prompt_timeout_secs)
    }

    pub fn mount_settle_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.disk.mount_settle_delay_ms)
    }

    /// Persist the configuration back to its original on-disk format.
    pub fn save(&self) -> ExportResult<()> {
        let payload = match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(self)
                .map_err(|err| ExportError::Device(format!("serialise config: {err}")))?,
            ConfigFormat::Yaml => serde_yaml::to_string(self)
                .map_err(|err| ExportError::Device(format!("serialise config: {err}")))?,
        };
        fs::write(&self.path, payload)
            .map_err(|err| ExportError::Device(format!("write {}: {err}", self.path.display())))?;
        Ok(())
    }
}

pub fn bootstrap_template() -> String {
    "# Auto-generated dropsafe configuration bootstrap.\n\
     # Customize these values before running exports.\n\
     \n\
     [disk]\n\
     # udisksctl_path = \"/usr/bin/udisksctl\"\n\
     # lsblk_path = \"/usr/bin/lsblk\"\n\
     command_timeout_secs = 10\n\
     prompt_timeout_secs = 30\n\
     mount_settle_attempts = 3\n\
     mount_settle_delay_ms = 500\n\
     target_dirname = \"dropsafe-export\"\n\
     \n\
     [client]\n\
     server = \"http://localhost:8081/\"\n\
     request_timeout_secs = 20\n\
     download_timeout_secs = 3600\n"
        .to_string()
}

fn ensure_bootstrap_file(path: &Path) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    match OpenOptions::new().create_new(true).write(true).open(path) {
        Ok(mut file) => {
            file.write_all(bootstrap_template().as_bytes())?;
            file.flush()?;
            #[cfg(unix)]
            {
                let mode = if path.starts_with("/etc/") { 0o640 } else { 0o600 };
                fs::set_permissions(path, PermissionsExt::from_mode(mode))?;
            }
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}
