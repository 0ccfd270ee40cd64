//! Payload writing and guaranteed teardown.
//!
//! Every path through an export attempt ends with the same teardown steps:
//! flush, remove the staging directory, unmount, and relock. Teardown runs
//! exactly once per attempt, and a lock is attempted even when the unmount
//! before it failed.

use crate::command::CommandRunner;
use crate::exporter::UsbExporter;
use crate::interact::SessionSpawner;
use dropsafe_core::{ExportError, ExportResult, ExportStatus, FoundVolume, MountedVolume, Volume};
use log::{debug, error, info, warn};
use std::path::Path;

/// Subdirectory of the staging area holding the files to copy out.
pub const EXPORT_DATA_DIRNAME: &str = "export_data";

impl<R: CommandRunner, S: SessionSpawner> UsbExporter<R, S> {
    /// Run one full export attempt and collapse the outcome into a single
    /// terminal status.
    pub fn run_export(&self, passphrase: &str, staging: &Path) -> ExportStatus {
        match self.try_export(passphrase, staging) {
            Ok(()) => ExportStatus::Success,
            Err(err) => {
                error!("export failed: {err}");
                err.status()
            }
        }
    }

    /// Discover, unlock if needed, write, and tear down.
    ///
    /// Failures before a mountpoint exists still discard the staging area
    /// (best effort); after that point `write_data` owns the teardown.
    pub fn try_export(&self, passphrase: &str, staging: &Path) -> ExportResult<()> {
        let found = match self.get_volume() {
            Ok(found) => found,
            Err(err) => {
                self.discard_staging(staging);
                return Err(err);
            }
        };

        let mounted = match found {
            FoundVolume::Mounted(mv) => {
                info!("volume already mounted at {}", mv.mountpoint.display());
                mv
            }
            FoundVolume::Locked(vol) => match self.unlock_volume(&vol, passphrase) {
                Ok(mv) => mv,
                Err(err) => {
                    self.discard_staging(staging);
                    return Err(err);
                }
            },
        };

        self.write_data(mounted, staging).map(|_| ())
    }

    /// Copy the staged payload onto the mounted volume, then tear down.
    ///
    /// Teardown always runs. When the copy failed, the copy error is the one
    /// returned; a teardown error on top of it is logged and discarded so the
    /// reported status names the first thing that went wrong.
    pub fn write_data(&self, mounted: MountedVolume, staging: &Path) -> ExportResult<Volume> {
        let copy_result = self.copy_payload(&mounted, staging);
        let is_error = copy_result.is_err();
        let cleanup_result = self.cleanup(mounted, staging, is_error);

        match (copy_result, cleanup_result) {
            (Ok(()), Ok(volume)) => {
                info!("export complete, drive relocked");
                Ok(volume)
            }
            (Ok(()), Err(cleanup_err)) => Err(cleanup_err),
            (Err(copy_err), Ok(_)) => Err(copy_err),
            (Err(copy_err), Err(cleanup_err)) => {
                error!("cleanup also failed after export error: {cleanup_err}");
                Err(copy_err)
            }
        }
    }

    /// Copy `staging/export_data/` into a fresh directory on the mountpoint.
    fn copy_payload(&self, mounted: &MountedVolume, staging: &Path) -> ExportResult<()> {
        let target = mounted.mountpoint.join(&self.target_dirname);
        let target_str = target.display().to_string();
        let source = staging.join(EXPORT_DATA_DIRNAME);
        // `cp -r` recreates `export_data` itself under the target directory.
        let source_str = format!("{}/", source.display());

        info!("copying files to {target_str}");
        self.runner
            .run_checked("mkdir", &[&target_str])
            .map_err(|err| ExportError::Export(err.to_string()))?;
        self.runner
            .run_checked("cp", &["-r", &source_str, &target_str])
            .map_err(|err| ExportError::Export(err.to_string()))?;

        info!("files written to {target_str}");
        Ok(())
    }

    /// Flush writes, remove the staging area, and close the volume.
    ///
    /// `is_error` records whether the copy already failed: in that case the
    /// flush and removal steps report `ERROR_EXPORT` rather than masking the
    /// earlier failure behind a cleanup status.
    fn cleanup(
        &self,
        mounted: MountedVolume,
        staging: &Path,
        is_error: bool,
    ) -> ExportResult<Volume> {
        debug!("syncing filesystem buffers");
        let sync_result = self.runner.run_checked("sync", &[]);
        let removal_result = sync_result.and_then(|_| self.remove_staging(staging));

        if let Err(err) = removal_result {
            warn!("cleanup before unmount failed: {err}");
            let message = err.to_string();
            // Closing the volume still has to happen before reporting.
            let close_err = self.close_volume(mounted).err();
            if let Some(close_err) = close_err {
                error!("volume teardown also failed: {close_err}");
            }
            return if is_error {
                Err(ExportError::Export(message))
            } else {
                Err(ExportError::ExportCleanup(message))
            };
        }

        self.close_volume(mounted)
    }

    fn remove_staging(&self, staging: &Path) -> Result<(), crate::command::CommandError> {
        let staging_str = staging.display().to_string();
        debug!("removing staging directory {staging_str}");
        self.runner
            .run_checked("rm", &["-rf", &staging_str])
            .map(|_| ())
    }

    /// Unmount and relock the volume.
    ///
    /// The lock is attempted even when the unmount fails, so a drive pulled
    /// out of a busy state is never left with the mapping open. When both
    /// steps fail the unmount error is the one reported.
    pub fn close_volume(&self, mounted: MountedVolume) -> ExportResult<Volume> {
        let mut unmount_err = None;

        if mounted.mountpoint.exists() {
            debug!("unmounting drive");
            let unlocked = mounted.unlocked_path.display().to_string();
            if let Err(err) = self
                .runner
                .run_checked(&self.udisksctl, &["unmount", "--block-device", &unlocked])
            {
                error!("error unmounting {}: {err}", mounted.mountpoint.display());
                unmount_err = Some(ExportError::UnmountVolumeBusy(err.to_string()));
            }
        } else {
            info!("{} is already unmounted", mounted.mountpoint.display());
        }

        if mounted.unlocked_path.exists() {
            debug!("locking drive");
            let device = mounted.device_path.display().to_string();
            if let Err(err) = self
                .runner
                .run_checked(&self.udisksctl, &["lock", "--block-device", &device])
            {
                error!("error locking {device}: {err}");
                if unmount_err.is_none() {
                    return Err(ExportError::ExportCleanup(err.to_string()));
                }
            }
        } else {
            info!(
                "{} is already locked",
                mounted.unlocked_path.display()
            );
        }

        match unmount_err {
            Some(err) => Err(err),
            None => Ok(mounted.into_volume()),
        }
    }

    /// Best-effort disposal of the staging area when the attempt failed
    /// before anything was mounted. Never masks the original error.
    fn discard_staging(&self, staging: &Path) {
        if let Err(err) = self
            .runner
            .run_checked("sync", &[])
            .and_then(|_| self.remove_staging(staging))
        {
            warn!("could not discard staging directory: {err}");
        }
    }
}
