//! Unlock and mount orchestration over `udisksctl`.
//!
//! The pattern tables live here, separated from the session plumbing in
//! `interact`, so the protocol can be driven by scripted fakes in tests.

use crate::command::CommandRunner;
use crate::exporter::UsbExporter;
use crate::interact::{ExpectOutcome, SessionSpawner};
use dropsafe_core::{ExportError, ExportResult, MountedVolume, Volume};
use log::{debug, error, info, warn};
use regex::Regex;
use std::path::Path;
use std::thread;

/// Prompt emitted by `udisksctl unlock` before reading the passphrase.
pub(crate) fn unlock_prompt_patterns() -> Vec<Regex> {
    vec![Regex::new("Passphrase: ").expect("static pattern")]
}

/// Result messages after the passphrase is sent, in match priority order:
/// freshly unlocked, already unlocked, incorrect passphrase.
pub(crate) fn unlock_result_patterns(device: &str) -> Vec<Regex> {
    let dev = regex::escape(device);
    vec![
        Regex::new(&format!(r"Unlocked {dev} as (\S+?)\.?[\r\n]")).expect("static pattern"),
        Regex::new(&format!(
            r"Device {dev} is already unlocked as (\S+?)\.?[\r\n]"
        ))
        .expect("static pattern"),
        Regex::new(r"Failed to activate device: Incorrect passphrase").expect("static pattern"),
    ]
}

/// `udisksctl info` recognises the device once the unlocked mapping settled.
pub(crate) fn preferred_device_pattern(device: &str) -> Regex {
    let dev = regex::escape(device);
    Regex::new(&format!(r"PreferredDevice:[^\r\n]*{dev}[\r\n]")).expect("static pattern")
}

/// Result messages of `udisksctl mount`: freshly mounted, already mounted
/// (udisks may report the mapping under an alias), device not ready.
pub(crate) fn mount_result_patterns() -> Vec<Regex> {
    vec![
        Regex::new(r"Mounted \S+ at ([^\r\n]+?)\.?[\r\n]").expect("static pattern"),
        Regex::new(r"Device (\S+) is already mounted at `([^']+)'").expect("static pattern"),
        Regex::new(r"Error looking up object for device").expect("static pattern"),
    ]
}

impl<R: CommandRunner, S: SessionSpawner> UsbExporter<R, S> {
    /// Unlock and mount an encrypted volume. If the volume is already
    /// unlocked the existing mapping is reused rather than failing.
    pub fn unlock_volume(&self, volume: &Volume, passphrase: &str) -> ExportResult<MountedVolume> {
        let device = volume.device_path.display().to_string();
        debug!("unlocking volume {device}");

        let mut session = self
            .spawner
            .spawn(&self.udisksctl, &["unlock", "--block-device", &device])
            .map_err(|err| ExportError::UnlockGeneric(err.to_string()))?;

        let prompt = session
            .expect(&unlock_prompt_patterns(), self.prompt_timeout)
            .map_err(|err| ExportError::UnlockGeneric(err.to_string()))?;
        if !matches!(prompt, ExpectOutcome::Matched { index: 0, .. }) {
            error!("did not receive disk unlock prompt");
            let _ = session.close();
            return Err(ExportError::UnlockGeneric(
                "did not receive disk unlock prompt".to_string(),
            ));
        }

        debug!("passing key");
        session
            .send_line(passphrase)
            .map_err(|err| ExportError::UnlockGeneric(err.to_string()))?;

        let outcome = session
            .expect(&unlock_result_patterns(&device), self.prompt_timeout)
            .map_err(|err| ExportError::UnlockGeneric(err.to_string()))?;

        match outcome {
            ExpectOutcome::Matched { index, captures } if index == 0 || index == 1 => {
                let mapper = captures
                    .first()
                    .map(|name| name.trim_end_matches('.').trim().to_string())
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| {
                        ExportError::UnlockGeneric(
                            "unlock reported success without a mapper name".to_string(),
                        )
                    })?;
                debug!("device is unlocked as {mapper}");

                // udisks occasionally exits with unexpected codes even after
                // a clean unlock message; tolerated with a warning.
                if let Some(code) = session.close() {
                    if code != 0 && code != 1 {
                        warn!("unlock child exited with {code}");
                    }
                }

                self.mount_volume(volume, Path::new(&mapper))
            }
            ExpectOutcome::Matched { index: 2, .. } => {
                debug!("bad volume passphrase");
                let _ = session.close();
                Err(ExportError::UnlockBadPassphrase)
            }
            other => {
                let _ = session.close();
                error!("error encountered while unlocking {device}: {other:?}");
                Err(ExportError::UnlockGeneric(format!(
                    "unexpected unlock outcome: {other:?}"
                )))
            }
        }
    }

    /// Mount an unlocked volume and return the resulting `MountedVolume`.
    ///
    /// The unlocked name may be `/dev/mapper/$id` or `/dev/dm-X`; udisks may
    /// know the mapping under either alias, so we first poll `udisksctl info`
    /// until the original device is recognised as the preferred device.
    pub(crate) fn mount_volume(
        &self,
        volume: &Volume,
        unlocked_path: &Path,
    ) -> ExportResult<MountedVolume> {
        let device = volume.device_path.display().to_string();
        let preferred = preferred_device_pattern(&device);

        debug!(
            "check that udisks identified {device} (unlocked as {})",
            unlocked_path.display()
        );
        for attempt in 0..self.settle_attempts {
            match self
                .runner
                .run_checked(&self.udisksctl, &["info", "--block-device", &device])
            {
                Ok(out) if preferred.is_match(&out.stdout) => {
                    debug!("udisks found {device}");
                    break;
                }
                Ok(_) => debug!("udisks can't identify {device} yet, retrying"),
                Err(err) => debug!("udisks info for {device} failed: {err}"),
            }
            if attempt + 1 < self.settle_attempts {
                thread::sleep(self.settle_delay);
            }
        }

        info!("mount {} using udisksctl", unlocked_path.display());
        let unlocked = unlocked_path.display().to_string();
        let mut session = self
            .spawner
            .spawn(&self.udisksctl, &["mount", "--block-device", &unlocked])
            .map_err(|err| ExportError::Mount(err.to_string()))?;

        let outcome = session
            .expect(&mount_result_patterns(), self.prompt_timeout)
            .map_err(|err| ExportError::Mount(err.to_string()))?;

        let mut full_unlocked_name = unlocked.clone();
        let mut mountpoint = None;
        match outcome {
            ExpectOutcome::Matched { index: 0, captures } => {
                mountpoint = captures
                    .first()
                    .map(|mp| mp.trim_end_matches('.').trim().to_string());
                if let Some(mp) = &mountpoint {
                    debug!("successfully mounted device at {mp}");
                }
            }
            ExpectOutcome::Matched { index: 1, captures } => {
                // Trust the names udisks reports over what we passed in.
                if let Some(name) = captures.first().filter(|name| !name.is_empty()) {
                    full_unlocked_name = name.clone();
                }
                mountpoint = captures.get(1).map(|mp| mp.to_string());
                if let Some(mp) = &mountpoint {
                    debug!("device already mounted at {mp}");
                }
            }
            ExpectOutcome::Matched { index: 2, .. } => {
                debug!("device is not ready");
            }
            other => {
                debug!("unexpected mount outcome: {other:?}");
            }
        }
        let _ = session.close();

        match mountpoint.filter(|mp| !mp.is_empty()) {
            Some(mp) => Ok(MountedVolume::new(volume, full_unlocked_name, mp)),
            None => {
                error!("could not get mountpoint for {unlocked}");
                Err(ExportError::Mount(format!(
                    "no mountpoint reported for {unlocked}"
                )))
            }
        }
    }
}
