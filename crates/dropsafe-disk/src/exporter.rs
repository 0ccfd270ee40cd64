//! System-backed USB export pipeline.
//!
//! Wraps `udisksctl` and `lsblk` to discover, unlock, mount, and tear down a
//! single attached export volume.

use crate::command::{CommandRunner, SystemRunner};
use crate::interact::{PipeSpawner, SessionSpawner};
use crate::probe::{self, BlockDevice};
use dropsafe_core::{
    DropsafeConfig, EncryptionScheme, ExportError, ExportResult, FoundVolume, MountedVolume, Volume,
};
use log::{debug, error, info};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub(crate) const DEV_PREFIX: &str = "/dev/";
pub(crate) const DEVMAPPER_PREFIX: &str = "/dev/mapper/";
const LUKS_FSTYPE: &str = "crypto_LUKS";

const KNOWN_UDISKSCTL_PATHS: &[&str] = &["/usr/bin/udisksctl", "/bin/udisksctl"];
const KNOWN_LSBLK_PATHS: &[&str] = &["/usr/bin/lsblk", "/bin/lsblk"];

/// Drives the export pipeline against one attached USB volume.
///
/// Generic over the command runner and session spawner so the whole flow can
/// be exercised with scripted fakes.
pub struct UsbExporter<R, S> {
    pub(crate) runner: R,
    pub(crate) spawner: S,
    pub(crate) udisksctl: String,
    pub(crate) lsblk: String,
    pub(crate) prompt_timeout: Duration,
    pub(crate) settle_attempts: u32,
    pub(crate) settle_delay: Duration,
    pub(crate) target_dirname: String,
}

impl UsbExporter<SystemRunner, PipeSpawner> {
    /// Build an exporter from configuration, resolving tool paths.
    pub fn from_config(config: &DropsafeConfig) -> ExportResult<Self> {
        let udisksctl = resolve_binary(
            config.disk.udisksctl_path.as_deref(),
            "udisksctl",
            KNOWN_UDISKSCTL_PATHS,
        )?;
        let lsblk = resolve_binary(config.disk.lsblk_path.as_deref(), "lsblk", KNOWN_LSBLK_PATHS)?;

        Ok(Self::with_parts(
            SystemRunner::new(config.command_timeout()),
            PipeSpawner,
            udisksctl,
            lsblk,
            config,
        ))
    }
}

impl<R: CommandRunner, S: SessionSpawner> UsbExporter<R, S> {
    /// Assemble an exporter from explicit parts; tests inject fakes here.
    pub fn with_parts(
        runner: R,
        spawner: S,
        udisksctl: String,
        lsblk: String,
        config: &DropsafeConfig,
    ) -> Self {
        Self {
            runner,
            spawner,
            udisksctl,
            lsblk,
            prompt_timeout: config.prompt_timeout(),
            settle_attempts: config.disk.mount_settle_attempts,
            settle_delay: config.mount_settle_delay(),
            target_dirname: config.disk.target_dirname.clone(),
        }
    }

    /// Search for the single valid connected device.
    ///
    /// Intersects `udisksctl status` (externally attached) with the `lsblk`
    /// topology (writable, suitably partitioned) and applies the selection
    /// rules: exactly one attached device, at most one encrypted partition,
    /// one level of partitioning only.
    pub fn get_volume(&self) -> ExportResult<FoundVolume> {
        info!("checking connected volumes");

        let status = self
            .runner
            .run_checked(&self.udisksctl, &["status"])
            .map_err(|err| ExportError::Device(err.to_string()))?;
        let targets = probe::parse_attached_devices(&status.stdout);

        if targets.is_empty() {
            info!("no USB devices found");
            return Err(ExportError::NoDeviceDetected);
        }
        if targets.len() > 1 {
            error!("too many possibilities; detach a storage device before continuing");
            return Err(ExportError::MultiDeviceDetected);
        }

        let lsblk = self
            .runner
            .run_checked(
                &self.lsblk,
                &["--output", "NAME,RO,TYPE,MOUNTPOINT,FSTYPE", "--json"],
            )
            .map_err(|err| ExportError::Device(err.to_string()))?;
        let devices = probe::parse_topology(&lsblk.stdout)?;

        let mut volumes: Vec<FoundVolume> = Vec::new();
        for device in &devices {
            if !targets.contains(&device.name) || device.ro {
                continue;
            }
            debug!(
                "checking removable, writable device {DEV_PREFIX}{}",
                device.name
            );

            // Inspect partitions or the whole volume. Encrypted partitions
            // are only supported one level deep.
            if device.children.is_empty() {
                if let Some(found) = self.supported_volume(device)? {
                    volumes.push(found);
                }
            } else {
                for partition in &device.children {
                    if let Some(found) = self.supported_volume(partition)? {
                        volumes.push(found);
                    }
                }
            }
        }

        if volumes.len() != 1 {
            error!("need one export target, got {}", volumes.len());
            return Err(ExportError::InvalidDeviceDetected);
        }

        let found = volumes.remove(0);
        debug!("export target is {}", found.device_path().display());
        Ok(found)
    }

    /// Decide whether one `lsblk` node is a usable export target, mounting it
    /// when it is already unlocked but not yet mounted.
    ///
    /// Supported: unlocked VeraCrypt drives, locked or unlocked LUKS drives,
    /// and no more than one encrypted partition (other partitions are
    /// ignored by the caller iterating children).
    fn supported_volume(&self, device: &BlockDevice) -> ExportResult<Option<FoundVolume>> {
        let device_path = format!("{DEV_PREFIX}{}", device.name);
        let mut vol = Volume::new(&device_path, EncryptionScheme::Unknown);

        if device.fstype.as_deref() == Some(LUKS_FSTYPE) {
            debug!("{} is LUKS-encrypted", device.name);
            vol.encryption = EncryptionScheme::Luks;
        }

        if !device.children.is_empty() {
            if device.children.len() != 1 {
                error!("unexpected volume format on {device_path}");
                return Ok(None);
            }
            let child = &device.children[0];
            if child.kind != "crypt" {
                return Ok(None);
            }

            // The drive is unlocked, possibly mounted.
            let mapped_name = format!("{DEVMAPPER_PREFIX}{}", child.name);

            // Unlocked VeraCrypt/TrueCrypt drives still read as Unknown at
            // this point; ask udisks for a better answer.
            if vol.encryption == EncryptionScheme::Unknown {
                vol.encryption = self.classify_encryption(&vol);
            }

            if let Some(mountpoint) = child.mountpoint.as_deref() {
                debug!("{device_path} is mounted");
                return Ok(Some(FoundVolume::Mounted(MountedVolume::new(
                    &vol,
                    mapped_name,
                    mountpoint,
                ))));
            }

            if vol.encryption.is_supported() {
                debug!("{} is unlocked but unmounted; attempting mount", device.name);
                return self
                    .mount_volume(&vol, Path::new(&mapped_name))
                    .map(|mv| Some(FoundVolume::Mounted(mv)));
            }
        }

        // Locked VeraCrypt drives fall through here as Unknown and are
        // rejected: a locked container is indistinguishable from free space.
        if vol.encryption.is_supported() {
            debug!("{device_path} is a supported export target");
            Ok(Some(FoundVolume::Locked(vol)))
        } else {
            debug!("no suitable volume found on {device_path}");
            Ok(None)
        }
    }

    /// Best-effort scheme detection for an already-unlocked drive.
    ///
    /// udisks needs `/etc/udisks2/tcrypt.conf` to report TCRYPT containers;
    /// without it the volume simply stays Unknown. Failures here are not a
    /// showstopper and degrade to Unknown.
    pub(crate) fn classify_encryption(&self, volume: &Volume) -> EncryptionScheme {
        let device = volume.device_path.display().to_string();
        match self
            .runner
            .run_checked(&self.udisksctl, &["info", "--block-device", &device])
        {
            Ok(out) => classify_id_type(&out.stdout),
            Err(err) => {
                debug!("error checking disk info of {device}");
                error!("{err}");
                EncryptionScheme::Unknown
            }
        }
    }
}

/// Map the `IdType` field of `udisksctl info` output onto a scheme.
///
/// A LUKS marker never downgrades to Unknown, so calling this on a LUKS
/// drive is harmless.
pub(crate) fn classify_id_type(info: &str) -> EncryptionScheme {
    for line in info.lines() {
        let line = line.trim();
        let Some(value) = line.strip_prefix("IdType:") else {
            continue;
        };
        return match value.trim() {
            "crypto_TCRYPT" => EncryptionScheme::Veracrypt,
            "crypto_LUKS" => EncryptionScheme::Luks,
            _ => EncryptionScheme::Unknown,
        };
    }
    EncryptionScheme::Unknown
}

fn resolve_binary(
    configured: Option<&str>,
    name: &str,
    known_paths: &[&str],
) -> ExportResult<String> {
    if let Some(path) = configured.map(str::trim).filter(|path| !path.is_empty()) {
        let candidate = Path::new(path);
        if !candidate.exists() {
            return Err(ExportError::Device(format!(
                "{name} binary not found at {path}"
            )));
        }
        return Ok(path.to_string());
    }

    for candidate in known_paths {
        if Path::new(candidate).exists() {
            return Ok((*candidate).to_string());
        }
    }

    find_in_path(name)
        .map(|path| path.to_string_lossy().into_owned())
        .ok_or_else(|| {
            ExportError::Device(format!(
                "unable to locate {name} binary; tried {known_paths:?} and PATH"
            ))
        })
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.exists() {
            Some(candidate)
        } else {
            None
        }
    })
}
