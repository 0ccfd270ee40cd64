use dropsafe_core::{
    DropsafeConfig, EncryptionScheme, ExportError, ExportStatus, FoundVolume, MountedVolume,
    Volume,
};
use dropsafe_disk::{
    CommandError, CommandRunner, ExpectOutcome, Output, PromptSession, SessionSpawner, UsbExporter,
};
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{tempdir, TempDir};

const STATUS_HEADER: &str = "\
MODEL                     REVISION  SERIAL               DEVICE\n\
--------------------------------------------------------------------------\n";

const STATUS_ONE_DEVICE: &str = "\
MODEL                     REVISION  SERIAL               DEVICE\n\
--------------------------------------------------------------------------\n\
Kingston DataTraveler 3.0 PMAP      08606E6D418DEF31     sda\n";

const STATUS_TWO_DEVICES: &str = "\
MODEL                     REVISION  SERIAL               DEVICE\n\
--------------------------------------------------------------------------\n\
Kingston DataTraveler 3.0 PMAP      08606E6D418DEF31     sda\n\
Generic Flash Disk        8.07      123456789            sdb\n";

const LSBLK_LOCKED_LUKS: &str = r#"{
    "blockdevices": [
        {
            "name": "sda", "ro": false, "type": "disk",
            "mountpoint": null, "fstype": null,
            "children": [
                {
                    "name": "sda1", "ro": false, "type": "part",
                    "mountpoint": null, "fstype": "crypto_LUKS"
                }
            ]
        }
    ]
}"#;

const LSBLK_MOUNTED_LUKS: &str = r#"{
    "blockdevices": [
        {
            "name": "sda", "ro": false, "type": "disk",
            "mountpoint": null, "fstype": null,
            "children": [
                {
                    "name": "sda1", "ro": false, "type": "part",
                    "mountpoint": null, "fstype": "crypto_LUKS",
                    "children": [
                        {
                            "name": "luks-f235e", "ro": false, "type": "crypt",
                            "mountpoint": "/media/usb", "fstype": "ext4"
                        }
                    ]
                }
            ]
        }
    ]
}"#;

const LSBLK_UNLOCKED_UNMOUNTED_TCRYPT: &str = r#"{
    "blockdevices": [
        {
            "name": "sda", "ro": false, "type": "disk",
            "mountpoint": null, "fstype": null,
            "children": [
                {
                    "name": "sda1", "ro": false, "type": "part",
                    "mountpoint": null, "fstype": null,
                    "children": [
                        {
                            "name": "tcrypt-2", "ro": false, "type": "crypt",
                            "mountpoint": null, "fstype": "vfat"
                        }
                    ]
                }
            ]
        }
    ]
}"#;

#[test]
fn no_attached_device_reports_no_device_detected() {
    let runner = FakeRunner::default();
    runner.respond_ok("udisksctl status", STATUS_HEADER);
    let exporter = exporter(&runner, &FakeSpawner::default());

    let err = exporter.get_volume().unwrap_err();
    assert!(matches!(err, ExportError::NoDeviceDetected));
    assert_eq!(err.status(), ExportStatus::NoDeviceDetected);
}

#[test]
fn extra_attached_devices_report_multi_device_detected() {
    let runner = FakeRunner::default();
    runner.respond_ok("udisksctl status", STATUS_TWO_DEVICES);
    let exporter = exporter(&runner, &FakeSpawner::default());

    let err = exporter.get_volume().unwrap_err();
    assert_eq!(err.status(), ExportStatus::MultiDeviceDetected);
}

#[test]
fn failed_export_still_discards_the_staging_directory() {
    let runner = FakeRunner::default();
    runner.respond_ok("udisksctl status", STATUS_HEADER);
    let exporter = exporter(&runner, &FakeSpawner::default());

    let staging = tempdir().unwrap();
    let status = exporter.run_export("passphrase", staging.path());

    assert_eq!(status, ExportStatus::NoDeviceDetected);
    let calls = runner.calls();
    assert!(calls.iter().any(|call| call.starts_with("sync")));
    assert!(calls.iter().any(|call| call.starts_with("rm -rf")));
}

#[test]
fn locked_luks_partition_is_selected() {
    let runner = FakeRunner::default();
    runner.respond_ok("udisksctl status", STATUS_ONE_DEVICE);
    runner.respond_ok("lsblk", LSBLK_LOCKED_LUKS);
    let exporter = exporter(&runner, &FakeSpawner::default());

    let found = exporter.get_volume().unwrap();
    match found {
        FoundVolume::Locked(vol) => {
            assert_eq!(vol.device_path.to_str(), Some("/dev/sda1"));
            assert_eq!(vol.encryption, EncryptionScheme::Luks);
        }
        other => panic!("expected a locked volume, got {other:?}"),
    }
}

#[test]
fn already_mounted_volume_is_reused_without_prompting() {
    let runner = FakeRunner::default();
    runner.respond_ok("udisksctl status", STATUS_ONE_DEVICE);
    runner.respond_ok("lsblk", LSBLK_MOUNTED_LUKS);
    let spawner = FakeSpawner::default();
    let exporter = exporter(&runner, &spawner);

    let found = exporter.get_volume().unwrap();
    match found {
        FoundVolume::Mounted(mv) => {
            assert_eq!(mv.mountpoint.to_str(), Some("/media/usb"));
            assert_eq!(mv.unlocked_path.to_str(), Some("/dev/mapper/luks-f235e"));
            assert_eq!(mv.encryption, EncryptionScheme::Luks);
        }
        other => panic!("expected a mounted volume, got {other:?}"),
    }
    assert!(spawner.spawned().is_empty());
}

#[test]
fn unreadable_disk_info_degrades_to_unknown_and_rejects_the_device() {
    let runner = FakeRunner::default();
    runner.respond_ok("udisksctl status", STATUS_ONE_DEVICE);
    runner.respond_ok("lsblk", LSBLK_UNLOCKED_UNMOUNTED_TCRYPT);
    runner.fail("udisksctl info", "no object for block device");
    let exporter = exporter(&runner, &FakeSpawner::default());

    let err = exporter.get_volume().unwrap_err();
    assert_eq!(err.status(), ExportStatus::InvalidDeviceDetected);
}

#[test]
fn unlocked_veracrypt_volume_is_mounted_during_selection() {
    let runner = FakeRunner::default();
    runner.respond_ok("udisksctl status", STATUS_ONE_DEVICE);
    runner.respond_ok("lsblk", LSBLK_UNLOCKED_UNMOUNTED_TCRYPT);
    // First info call classifies the scheme, second satisfies the settle poll.
    runner.respond_ok("udisksctl info", "  IdType:                     crypto_TCRYPT\n");
    runner.respond_ok(
        "udisksctl info",
        "  PreferredDevice:            /dev/sda1\n",
    );

    let spawner = FakeSpawner::default();
    spawner.push_session(ScriptedSession::new(&[
        "Mounted /dev/mapper/tcrypt-2 at /media/veracrypt1\n",
    ]));
    let exporter = exporter(&runner, &spawner);

    let found = exporter.get_volume().unwrap();
    match found {
        FoundVolume::Mounted(mv) => {
            assert_eq!(mv.encryption, EncryptionScheme::Veracrypt);
            assert_eq!(mv.mountpoint.to_str(), Some("/media/veracrypt1"));
        }
        other => panic!("expected a mounted volume, got {other:?}"),
    }
    assert_eq!(
        spawner.spawned(),
        vec!["udisksctl mount --block-device /dev/mapper/tcrypt-2".to_string()]
    );
}

#[test]
fn wrong_passphrase_reports_unlock_luks_and_never_mounts() {
    let runner = FakeRunner::default();
    runner.respond_ok("udisksctl status", STATUS_ONE_DEVICE);
    runner.respond_ok("lsblk", LSBLK_LOCKED_LUKS);

    let spawner = FakeSpawner::default();
    spawner.push_session(ScriptedSession::new(&[
        "Passphrase: ",
        "GDBus.Error:org.freedesktop.UDisks2.Error.Failed: Error unlocking /dev/sda1: \
         Failed to activate device: Incorrect passphrase\n",
    ]));
    let exporter = exporter(&runner, &spawner);

    let staging = tempdir().unwrap();
    let status = exporter.run_export("wrong horse battery staple", staging.path());

    assert_eq!(status, ExportStatus::ErrorUnlockLuks);
    // Only the unlock conversation happened; no mount was attempted.
    assert_eq!(spawner.spawned().len(), 1);
    assert!(spawner.spawned()[0].starts_with("udisksctl unlock"));
}

#[test]
fn already_unlocked_volume_reuses_the_existing_mapping() {
    let runner = FakeRunner::default();
    runner.respond_ok(
        "udisksctl info",
        "  PreferredDevice:            /dev/sda1\n",
    );

    let spawner = FakeSpawner::default();
    spawner.push_session(ScriptedSession::new(&[
        "Passphrase: ",
        "GDBus.Error:org.freedesktop.UDisks2.Error.Failed: \
         Device /dev/sda1 is already unlocked as /dev/dm-3.\n",
    ]));
    spawner.push_session(ScriptedSession::new(&[
        "Error mounting /dev/dm-3: GDBus.Error:org.freedesktop.UDisks2.Error.AlreadyMounted: \
         Device /dev/dm-3 is already mounted at `/media/usb'.\n",
    ]));
    let exporter = exporter(&runner, &spawner);

    let vol = Volume::new("/dev/sda1", EncryptionScheme::Luks);
    let mounted = exporter
        .unlock_volume(&vol, "correct horse battery staple")
        .unwrap();

    // The mapping udisks already holds is reused as-is.
    assert_eq!(mounted.unlocked_path.to_str(), Some("/dev/dm-3"));
    assert_eq!(mounted.mountpoint.to_str(), Some("/media/usb"));

    // One unlock conversation, one mount attempt against the existing
    // mapper, and nothing else.
    let spawned = spawner.spawned();
    assert_eq!(
        spawned,
        vec![
            "udisksctl unlock --block-device /dev/sda1".to_string(),
            "udisksctl mount --block-device /dev/dm-3".to_string(),
        ]
    );
}

#[test]
fn successful_export_unmounts_then_relocks_exactly_once() {
    let scratch = tempdir().unwrap();
    let mapper = scratch.path().join("dm-0");
    fs::write(&mapper, "").unwrap();
    let mountpoint = scratch.path().join("mnt");
    fs::create_dir(&mountpoint).unwrap();
    let mapper_str = mapper.display().to_string();
    let mountpoint_str = mountpoint.display().to_string();

    let runner = FakeRunner::default();
    runner.respond_ok("udisksctl status", STATUS_ONE_DEVICE);
    runner.respond_ok("lsblk", LSBLK_LOCKED_LUKS);
    runner.respond_ok(
        "udisksctl info",
        "  PreferredDevice:            /dev/sda1\n",
    );

    let spawner = FakeSpawner::default();
    let unlock = ScriptedSession::new(&[
        "Passphrase: ",
        &format!("Unlocked /dev/sda1 as {mapper_str}\n"),
    ]);
    let sent = unlock.sent_lines();
    spawner.push_session(unlock);
    spawner.push_session(ScriptedSession::new(&[&format!(
        "Mounted {mapper_str} at {mountpoint_str}\n"
    )]));
    let exporter = exporter(&runner, &spawner);

    let staging = tempdir().unwrap();
    let status = exporter.run_export("correct horse battery staple", staging.path());
    assert_eq!(status, ExportStatus::Success);
    assert_eq!(
        sent.lock().unwrap().as_slice(),
        ["correct horse battery staple"]
    );

    let calls = runner.calls();
    let position = |needle: &str| {
        calls
            .iter()
            .position(|call| call.starts_with(needle))
            .unwrap_or_else(|| panic!("missing call {needle}: {calls:?}"))
    };

    // Copy, flush, remove staging, unmount, lock, in that order.
    assert!(position("mkdir") < position("cp -r"));
    assert!(position("cp -r") < position("sync"));
    assert!(position("sync") < position("rm -rf"));
    assert!(position("rm -rf") < position(&format!("udisksctl unmount --block-device {mapper_str}")));
    assert!(
        position(&format!("udisksctl unmount --block-device {mapper_str}"))
            < position("udisksctl lock --block-device /dev/sda1")
    );
    assert_eq!(calls.iter().filter(|c| c.starts_with("sync")).count(), 1);
    assert_eq!(calls.iter().filter(|c| c.starts_with("rm -rf")).count(), 1);
}

#[test]
fn busy_unmount_still_attempts_to_relock() {
    let scratch = tempdir().unwrap();
    let mounted = mounted_fixture(&scratch);

    let runner = FakeRunner::default();
    runner.fail("udisksctl unmount", "target is busy");
    let exporter = exporter(&runner, &FakeSpawner::default());

    let staging = tempdir().unwrap();
    let err = exporter.write_data(mounted, staging.path()).unwrap_err();
    assert_eq!(err.status(), ExportStatus::ErrorUnmountVolumeBusy);

    let calls = runner.calls();
    assert!(calls
        .iter()
        .any(|call| call.starts_with("udisksctl lock --block-device /dev/sda1")));
}

#[test]
fn copy_failure_keeps_error_export_even_when_sync_also_fails() {
    let scratch = tempdir().unwrap();
    let mounted = mounted_fixture(&scratch);

    let runner = FakeRunner::default();
    runner.fail("cp", "no space left on device");
    runner.fail("sync", "input/output error");
    let exporter = exporter(&runner, &FakeSpawner::default());

    let staging = tempdir().unwrap();
    let err = exporter.write_data(mounted, staging.path()).unwrap_err();
    assert_eq!(err.status(), ExportStatus::ErrorExport);
}

#[test]
fn cleanup_failure_after_a_good_copy_is_export_cleanup() {
    let scratch = tempdir().unwrap();
    let mounted = mounted_fixture(&scratch);

    let runner = FakeRunner::default();
    runner.fail("sync", "input/output error");
    let exporter = exporter(&runner, &FakeSpawner::default());

    let staging = tempdir().unwrap();
    let err = exporter.write_data(mounted, staging.path()).unwrap_err();
    assert_eq!(err.status(), ExportStatus::ErrorExportCleanup);
}

fn test_config() -> DropsafeConfig {
    let mut cfg = DropsafeConfig::default();
    cfg.disk.mount_settle_attempts = 1;
    cfg.disk.mount_settle_delay_ms = 1;
    cfg
}

fn exporter(runner: &FakeRunner, spawner: &FakeSpawner) -> UsbExporter<FakeRunner, FakeSpawner> {
    UsbExporter::with_parts(
        runner.clone(),
        spawner.clone(),
        "udisksctl".to_string(),
        "lsblk".to_string(),
        &test_config(),
    )
}

/// A mounted volume whose mountpoint and mapper node really exist, so the
/// teardown path exercises both the unmount and the lock.
fn mounted_fixture(scratch: &TempDir) -> MountedVolume {
    let mapper = scratch.path().join("dm-0");
    fs::write(&mapper, "").unwrap();
    let mountpoint = scratch.path().join("mnt");
    fs::create_dir(&mountpoint).unwrap();

    let vol = Volume::new("/dev/sda1", EncryptionScheme::Luks);
    MountedVolume::new(&vol, mapper, mountpoint)
}

#[derive(Clone, Default)]
struct FakeRunner {
    inner: Arc<Mutex<FakeRunnerState>>,
}

#[derive(Default)]
struct FakeRunnerState {
    canned: HashMap<String, VecDeque<Output>>,
    calls: Vec<String>,
}

impl FakeRunner {
    fn respond_ok(&self, key: &str, stdout: &str) {
        self.push(
            key,
            Output {
                stdout: stdout.to_string(),
                stderr: String::new(),
                status: 0,
            },
        );
    }

    fn fail(&self, key: &str, stderr: &str) {
        self.push(
            key,
            Output {
                stdout: String::new(),
                stderr: stderr.to_string(),
                status: 1,
            },
        );
    }

    fn push(&self, key: &str, out: Output) {
        self.inner
            .lock()
            .unwrap()
            .canned
            .entry(key.to_string())
            .or_default()
            .push_back(out);
    }

    fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }
}

/// Responses are keyed by program (plus subcommand for `udisksctl`);
/// anything without a canned response succeeds silently.
fn response_key(program: &str, args: &[&str]) -> String {
    if program == "udisksctl" {
        format!("{program} {}", args.first().copied().unwrap_or_default())
    } else {
        program.to_string()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<Output, CommandError> {
        let mut state = self.inner.lock().unwrap();
        state
            .calls
            .push(format!("{program} {}", args.join(" ")).trim().to_string());

        let key = response_key(program, args);
        if let Some(queue) = state.canned.get_mut(&key) {
            if let Some(out) = queue.pop_front() {
                return Ok(out);
            }
        }
        Ok(Output {
            stdout: String::new(),
            stderr: String::new(),
            status: 0,
        })
    }
}

#[derive(Clone, Default)]
struct FakeSpawner {
    inner: Arc<Mutex<FakeSpawnerState>>,
}

#[derive(Default)]
struct FakeSpawnerState {
    sessions: VecDeque<ScriptedSession>,
    spawned: Vec<String>,
}

impl FakeSpawner {
    fn push_session(&self, session: ScriptedSession) {
        self.inner.lock().unwrap().sessions.push_back(session);
    }

    fn spawned(&self) -> Vec<String> {
        self.inner.lock().unwrap().spawned.clone()
    }
}

impl SessionSpawner for FakeSpawner {
    fn spawn(&self, program: &str, args: &[&str]) -> Result<Box<dyn PromptSession>, CommandError> {
        let mut state = self.inner.lock().unwrap();
        state.spawned.push(format!("{program} {}", args.join(" ")));
        state
            .sessions
            .pop_front()
            .map(|session| Box::new(session) as Box<dyn PromptSession>)
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_string(),
                source: io::Error::other("no scripted session queued"),
            })
    }
}

/// Replays scripted output chunks and applies the caller's patterns to them,
/// so the real pattern tables are exercised end to end.
struct ScriptedSession {
    chunks: VecDeque<String>,
    buffer: String,
    sent: Arc<Mutex<Vec<String>>>,
    exit_code: Option<i32>,
}

impl ScriptedSession {
    fn new(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|chunk| chunk.to_string()).collect(),
            buffer: String::new(),
            sent: Arc::new(Mutex::new(Vec::new())),
            exit_code: Some(0),
        }
    }

    fn sent_lines(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.sent)
    }
}

impl PromptSession for ScriptedSession {
    fn expect(
        &mut self,
        patterns: &[Regex],
        _timeout: Duration,
    ) -> Result<ExpectOutcome, CommandError> {
        loop {
            for (index, pattern) in patterns.iter().enumerate() {
                if let Some(found) = pattern.captures(&self.buffer) {
                    let captures = found
                        .iter()
                        .skip(1)
                        .map(|group| group.map(|m| m.as_str().to_string()).unwrap_or_default())
                        .collect();
                    let end = found.get(0).map(|m| m.end()).unwrap_or(0);
                    self.buffer.drain(..end);
                    return Ok(ExpectOutcome::Matched { index, captures });
                }
            }
            match self.chunks.pop_front() {
                Some(chunk) => self.buffer.push_str(&chunk),
                None => return Ok(ExpectOutcome::Eof),
            }
        }
    }

    fn send_line(&mut self, line: &str) -> Result<(), CommandError> {
        self.sent.lock().unwrap().push(line.to_string());
        Ok(())
    }

    fn close(&mut self) -> Option<i32> {
        self.exit_code
    }
}
