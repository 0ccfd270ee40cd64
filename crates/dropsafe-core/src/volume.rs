//! Data model for candidate and mounted export volumes.

use std::fmt;
use std::path::{Path, PathBuf};

/// Encryption scheme detected on a candidate volume.
///
/// `Unknown` is never exportable; a locked VeraCrypt container is
/// indistinguishable from free space and stays `Unknown` until unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionScheme {
    Luks,
    Veracrypt,
    Unknown,
}

impl EncryptionScheme {
    /// Only LUKS and VeraCrypt volumes may be selected for export.
    pub fn is_supported(&self) -> bool {
        matches!(self, EncryptionScheme::Luks | EncryptionScheme::Veracrypt)
    }
}

impl fmt::Display for EncryptionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EncryptionScheme::Luks => "LUKS",
            EncryptionScheme::Veracrypt => "VeraCrypt",
            EncryptionScheme::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// A raw, possibly-locked block device selected as the export candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub device_path: PathBuf,
    pub encryption: EncryptionScheme,
}

impl Volume {
    pub fn new(device_path: impl Into<PathBuf>, encryption: EncryptionScheme) -> Self {
        Self {
            device_path: device_path.into(),
            encryption,
        }
    }
}

/// An actively mounted filesystem backed by an unlocked volume.
///
/// Constructed only after a successful unlock+mount; teardown converts it
/// back into a bare [`Volume`] reference once the mapping is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedVolume {
    pub device_path: PathBuf,
    pub encryption: EncryptionScheme,
    /// Device-mapper node backing the mount (`/dev/dm-X` or `/dev/mapper/*`).
    pub unlocked_path: PathBuf,
    pub mountpoint: PathBuf,
}

impl MountedVolume {
    pub fn new(
        volume: &Volume,
        unlocked_path: impl Into<PathBuf>,
        mountpoint: impl Into<PathBuf>,
    ) -> Self {
        Self {
            device_path: volume.device_path.clone(),
            encryption: volume.encryption,
            unlocked_path: unlocked_path.into(),
            mountpoint: mountpoint.into(),
        }
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    /// Discard the mount state after teardown.
    pub fn into_volume(self) -> Volume {
        Volume {
            device_path: self.device_path,
            encryption: self.encryption,
        }
    }
}

/// Result of volume selection: the single eligible target, which may already
/// be mounted by the desktop session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoundVolume {
    Locked(Volume),
    Mounted(MountedVolume),
}

impl FoundVolume {
    pub fn device_path(&self) -> &Path {
        match self {
            FoundVolume::Locked(vol) => &vol.device_path,
            FoundVolume::Mounted(mv) => &mv.device_path,
        }
    }

    pub fn encryption(&self) -> EncryptionScheme {
        match self {
            FoundVolume::Locked(vol) => vol.encryption,
            FoundVolume::Mounted(mv) => mv.encryption,
        }
    }
}
