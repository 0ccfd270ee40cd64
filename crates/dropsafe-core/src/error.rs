//! Closed error and status taxonomy for the export pipeline.
//!
//! Every external-command invocation is wrapped and re-raised as exactly one
//! status kind at the boundary of the component that invoked it. The mapping
//! from `ExportError` to `ExportStatus` is total so callers always receive a
//! single terminal outcome.

use thiserror::Error;

/// Terminal outcome of an export attempt.
///
/// `as_str` yields the stable wire codes consumed by operator tooling; the
/// caller is responsible for translating these into user messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStatus {
    Success,
    NoDeviceDetected,
    MultiDeviceDetected,
    InvalidDeviceDetected,
    DeviceError,
    ErrorUnlockGeneric,
    ErrorUnlockLuks,
    ErrorMount,
    ErrorExport,
    ErrorUnmountVolumeBusy,
    ErrorExportCleanup,
}

impl ExportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportStatus::Success => "SUCCESS",
            ExportStatus::NoDeviceDetected => "NO_DEVICE_DETECTED",
            ExportStatus::MultiDeviceDetected => "MULTI_DEVICE_DETECTED",
            ExportStatus::InvalidDeviceDetected => "INVALID_DEVICE_DETECTED",
            ExportStatus::DeviceError => "DEVICE_ERROR",
            ExportStatus::ErrorUnlockGeneric => "ERROR_UNLOCK_GENERIC",
            ExportStatus::ErrorUnlockLuks => "ERROR_UNLOCK_LUKS",
            ExportStatus::ErrorMount => "ERROR_MOUNT",
            ExportStatus::ErrorExport => "ERROR_EXPORT",
            ExportStatus::ErrorUnmountVolumeBusy => "ERROR_UNMOUNT_VOLUME_BUSY",
            ExportStatus::ErrorExportCleanup => "ERROR_EXPORT_CLEANUP",
        }
    }

    /// True for every terminal outcome except `Success`.
    pub fn is_error(&self) -> bool {
        !matches!(self, ExportStatus::Success)
    }
}

impl std::fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One variant per detectable failure mode. There is deliberately no generic
/// catch-all beyond `Device` for unparseable topology data, and no shared
/// "base error" supertype.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no writable USB device detected")]
    NoDeviceDetected,

    #[error("multiple storage devices attached; detach extras before exporting")]
    MultiDeviceDetected,

    #[error("attached device does not hold exactly one exportable volume")]
    InvalidDeviceDetected,

    #[error("device probing failed: {0}")]
    Device(String),

    #[error("could not unlock volume: {0}")]
    UnlockGeneric(String),

    #[error("incorrect passphrase for encrypted volume")]
    UnlockBadPassphrase,

    #[error("could not mount unlocked volume: {0}")]
    Mount(String),

    #[error("writing export payload failed: {0}")]
    Export(String),

    #[error("could not unmount volume (device busy): {0}")]
    UnmountVolumeBusy(String),

    #[error("post-export cleanup failed: {0}")]
    ExportCleanup(String),
}

impl ExportError {
    /// Total mapping into the terminal status enumeration.
    pub fn status(&self) -> ExportStatus {
        match self {
            ExportError::NoDeviceDetected => ExportStatus::NoDeviceDetected,
            ExportError::MultiDeviceDetected => ExportStatus::MultiDeviceDetected,
            ExportError::InvalidDeviceDetected => ExportStatus::InvalidDeviceDetected,
            ExportError::Device(_) => ExportStatus::DeviceError,
            ExportError::UnlockGeneric(_) => ExportStatus::ErrorUnlockGeneric,
            ExportError::UnlockBadPassphrase => ExportStatus::ErrorUnlockLuks,
            ExportError::Mount(_) => ExportStatus::ErrorMount,
            ExportError::Export(_) => ExportStatus::ErrorExport,
            ExportError::UnmountVolumeBusy(_) => ExportStatus::ErrorUnmountVolumeBusy,
            ExportError::ExportCleanup(_) => ExportStatus::ErrorExportCleanup,
        }
    }
}

pub type ExportResult<T> = Result<T, ExportError>;
