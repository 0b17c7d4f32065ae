#![forbid(unsafe_code)]

//! System-wide identifier rotation.
//!
//! Only Windows carries a rotatable identifier (`MachineGuid`). Every other platform is
//! served by [`NoopSystemIdentifierBackend`], which the rotator reports as an explicit
//! skip rather than a silent success.
//!
//! Rotation is backup-then-write. A failed write does not restore the original value;
//! the backup file written beforehand is the recovery path.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use idreset_kernel_contracts::identity::SystemIdentifierBackup;
use idreset_kernel_contracts::{PlatformFamily, ResetError};
use tracing::{info, warn};

use crate::idgen::IdentityGenerator;

const MACHINE_GUID_KEY: &str = r"HKEY_LOCAL_MACHINE\SOFTWARE\Microsoft\Cryptography";
const MACHINE_GUID_VALUE: &str = "MachineGuid";
const MAX_BACKUP_NAME_ATTEMPTS: u32 = 1_000;

pub trait SystemIdentifierBackend: Send + Sync {
    fn platform(&self) -> PlatformFamily;

    /// False for the explicit no-op backend.
    fn is_active(&self) -> bool;

    /// Used as the backup file name prefix.
    fn identifier_name(&self) -> &'static str;

    fn read_current(&self) -> Result<String, ResetError>;

    fn write_replacement(&self, value: &str) -> Result<(), ResetError>;
}

impl<T: SystemIdentifierBackend + ?Sized> SystemIdentifierBackend for Arc<T> {
    fn platform(&self) -> PlatformFamily {
        (**self).platform()
    }

    fn is_active(&self) -> bool {
        (**self).is_active()
    }

    fn identifier_name(&self) -> &'static str {
        (**self).identifier_name()
    }

    fn read_current(&self) -> Result<String, ResetError> {
        (**self).read_current()
    }

    fn write_replacement(&self, value: &str) -> Result<(), ResetError> {
        (**self).write_replacement(value)
    }
}

/// Selects the backend for `platform`. Called once at startup.
pub fn backend_for(platform: PlatformFamily) -> Box<dyn SystemIdentifierBackend> {
    match platform {
        PlatformFamily::Windows => Box::new(WindowsMachineGuidBackend),
        other => Box::new(NoopSystemIdentifierBackend::new(other)),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsMachineGuidBackend;

impl SystemIdentifierBackend for WindowsMachineGuidBackend {
    fn platform(&self) -> PlatformFamily {
        PlatformFamily::Windows
    }

    fn is_active(&self) -> bool {
        true
    }

    fn identifier_name(&self) -> &'static str {
        MACHINE_GUID_VALUE
    }

    fn read_current(&self) -> Result<String, ResetError> {
        let out = Command::new("reg")
            .args(["query", MACHINE_GUID_KEY, "/v", MACHINE_GUID_VALUE])
            .stderr(Stdio::null())
            .output()
            .map_err(|e| {
                ResetError::IdentifierReadFailed(format!("failed to run reg query: {e}"))
            })?;
        if !out.status.success() {
            return Err(ResetError::IdentifierReadFailed(format!(
                "reg query exited with {}",
                out.status
            )));
        }
        parse_reg_query_value(&String::from_utf8_lossy(&out.stdout), MACHINE_GUID_VALUE)
            .ok_or_else(|| {
                ResetError::IdentifierReadFailed(
                    "failed to extract current MachineGuid".to_string(),
                )
            })
    }

    fn write_replacement(&self, value: &str) -> Result<(), ResetError> {
        let status = Command::new("reg")
            .args([
                "add",
                MACHINE_GUID_KEY,
                "/v",
                MACHINE_GUID_VALUE,
                "/t",
                "REG_SZ",
                "/d",
                value,
                "/f",
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| format!("failed to run reg add: {e}"));
        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(format!("reg add exited with {status}")),
            Err(reason) => Err(reason),
        }
        .map_err(|reason| ResetError::IdentifierWriteFailed {
            backup_path: PathBuf::new(),
            reason,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NoopSystemIdentifierBackend {
    platform: PlatformFamily,
}

impl NoopSystemIdentifierBackend {
    pub fn new(platform: PlatformFamily) -> Self {
        Self { platform }
    }
}

impl SystemIdentifierBackend for NoopSystemIdentifierBackend {
    fn platform(&self) -> PlatformFamily {
        self.platform
    }

    fn is_active(&self) -> bool {
        false
    }

    fn identifier_name(&self) -> &'static str {
        "none"
    }

    fn read_current(&self) -> Result<String, ResetError> {
        Err(ResetError::UnsupportedPlatform {
            platform: self.platform.to_string(),
        })
    }

    fn write_replacement(&self, _value: &str) -> Result<(), ResetError> {
        Err(ResetError::UnsupportedPlatform {
            platform: self.platform.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    Rotated {
        backup: SystemIdentifierBackup,
        new_value: String,
    },
    Skipped {
        platform: PlatformFamily,
    },
}

impl RotationOutcome {
    pub fn rotated(&self) -> bool {
        matches!(self, Self::Rotated { .. })
    }

    pub fn backup(&self) -> Option<&SystemIdentifierBackup> {
        match self {
            Self::Rotated { backup, .. } => Some(backup),
            Self::Skipped { .. } => None,
        }
    }
}

pub struct SystemIdentifierRotator {
    backend: Box<dyn SystemIdentifierBackend>,
    backup_dir: PathBuf,
}

impl SystemIdentifierRotator {
    pub fn new(backend: Box<dyn SystemIdentifierBackend>, backup_dir: PathBuf) -> Self {
        Self {
            backend,
            backup_dir,
        }
    }

    pub fn platform(&self) -> PlatformFamily {
        self.backend.platform()
    }

    pub fn is_active(&self) -> bool {
        self.backend.is_active()
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Read, back up, derive, write. Each stage completes before the next starts.
    pub fn rotate(
        &self,
        privilege_confirmed: bool,
        generator: &dyn IdentityGenerator,
    ) -> Result<RotationOutcome, ResetError> {
        if !self.backend.is_active() {
            info!(platform = %self.backend.platform(), "system identifier rotation skipped");
            return Ok(RotationOutcome::Skipped {
                platform: self.backend.platform(),
            });
        }
        if !privilege_confirmed {
            return Err(ResetError::PrivilegeRequired {
                remediation: "administrator privileges required for system identifier rotation"
                    .to_string(),
            });
        }

        let original = self.backend.read_current()?;

        let captured_at = Utc::now();
        let backup_path = write_backup(
            &self.backup_dir,
            self.backend.identifier_name(),
            &original,
            captured_at,
        )?;
        info!(path = %backup_path.display(), "system identifier backed up");

        let raw = generator.dev_device_id()?;
        let new_value = normalize_machine_guid(&raw);

        if let Err(err) = self.backend.write_replacement(&new_value) {
            warn!(
                backup = %backup_path.display(),
                error = %err,
                "system identifier write failed; original value is only in the backup"
            );
            return Err(match err {
                ResetError::IdentifierWriteFailed { reason, .. } => {
                    ResetError::IdentifierWriteFailed {
                        backup_path,
                        reason,
                    }
                }
                other => ResetError::IdentifierWriteFailed {
                    backup_path,
                    reason: other.to_string(),
                },
            });
        }
        info!(
            from = %original,
            to = %new_value,
            "system identifier rotated"
        );

        Ok(RotationOutcome::Rotated {
            backup: SystemIdentifierBackup {
                original_value: original,
                captured_at,
                path: backup_path,
            },
            new_value,
        })
    }
}

/// Value of `name` from `reg query` output: the last field of the `REG_SZ` line.
pub fn parse_reg_query_value(output: &str, name: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| line.contains(name) && line.contains("REG_SZ"))
        .find_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 3 {
                parts.last().map(|v| v.to_string())
            } else {
                None
            }
        })
        .filter(|v| !v.is_empty())
}

/// Registry format: separators stripped, letters uppercased.
pub fn normalize_machine_guid(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '-')
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Writes `value` to a new timestamp-named file under `dir`. Existing files are never
/// overwritten; a numeric suffix disambiguates captures within the same second.
pub fn write_backup(
    dir: &Path,
    identifier_name: &str,
    value: &str,
    captured_at: DateTime<Utc>,
) -> Result<PathBuf, ResetError> {
    let backup_err = |path: &Path, e: io::Error| ResetError::BackupWriteFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    fs::create_dir_all(dir).map_err(|e| backup_err(dir, e))?;

    let stem = format!(
        "{identifier_name}.backup_{}",
        captured_at.format("%Y%m%d_%H%M%S")
    );
    for attempt in 0..MAX_BACKUP_NAME_ATTEMPTS {
        let name = if attempt == 0 {
            stem.clone()
        } else {
            format!("{stem}_{attempt}")
        };
        let path = dir.join(name);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(backup_err(&path, e)),
        };
        file.write_all(value.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| backup_err(&path, e))?;
        return Ok(path);
    }
    Err(ResetError::BackupWriteFailed {
        path: dir.join(stem),
        reason: "no free backup file name".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idgen::RandomIdentityGenerator;
    use idreset_kernel_contracts::ResetErrorKind;
    use std::sync::Mutex;

    const REG_OUTPUT: &str = concat!(
        "\r\nHKEY_LOCAL_MACHINE\\SOFTWARE\\Microsoft\\Cryptography\r\n",
        "    MachineGuid    REG_SZ    6f1e2a3b-0000-4c4c-8888-123456789abc\r\n\r\n",
    );

    /// Windows-like backend that records whether a backup existed when written to.
    struct RecordingBackend {
        current: Option<String>,
        backup_dir: PathBuf,
        fail_write: bool,
        written: Mutex<Option<String>>,
        backup_seen_before_write: Mutex<bool>,
        reads: Mutex<u32>,
    }

    impl RecordingBackend {
        fn new(current: Option<&str>, backup_dir: &Path, fail_write: bool) -> Self {
            Self {
                current: current.map(str::to_string),
                backup_dir: backup_dir.to_path_buf(),
                fail_write,
                written: Mutex::new(None),
                backup_seen_before_write: Mutex::new(false),
                reads: Mutex::new(0),
            }
        }
    }

    impl SystemIdentifierBackend for RecordingBackend {
        fn platform(&self) -> PlatformFamily {
            PlatformFamily::Windows
        }

        fn is_active(&self) -> bool {
            true
        }

        fn identifier_name(&self) -> &'static str {
            MACHINE_GUID_VALUE
        }

        fn read_current(&self) -> Result<String, ResetError> {
            *self.reads.lock().unwrap() += 1;
            self.current
                .clone()
                .ok_or_else(|| ResetError::IdentifierReadFailed("absent".to_string()))
        }

        fn write_replacement(&self, value: &str) -> Result<(), ResetError> {
            let original = self.current.clone().unwrap_or_default();
            let seen = fs::read_dir(&self.backup_dir)
                .map(|entries| {
                    entries.filter_map(Result::ok).any(|e| {
                        fs::read_to_string(e.path())
                            .map(|v| v == original)
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false);
            *self.backup_seen_before_write.lock().unwrap() = seen;
            if self.fail_write {
                return Err(ResetError::IdentifierWriteFailed {
                    backup_path: PathBuf::new(),
                    reason: "access denied".to_string(),
                });
            }
            *self.written.lock().unwrap() = Some(value.to_string());
            Ok(())
        }
    }

    #[test]
    fn at_sysid_01_parses_reg_query_output() {
        assert_eq!(
            parse_reg_query_value(REG_OUTPUT, "MachineGuid").as_deref(),
            Some("6f1e2a3b-0000-4c4c-8888-123456789abc")
        );
        assert!(parse_reg_query_value("ERROR: not found", "MachineGuid").is_none());
    }

    #[test]
    fn at_sysid_02_normalizes_to_registry_format() {
        assert_eq!(
            normalize_machine_guid("6f1e2a3b-0000-4c4c-8888-123456789abc"),
            "6F1E2A3B00004C4C8888123456789ABC"
        );
    }

    #[test]
    fn at_sysid_03_backups_are_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let at = Utc::now();
        let first = write_backup(dir.path(), "MachineGuid", "one", at).unwrap();
        let second = write_backup(dir.path(), "MachineGuid", "two", at).unwrap();
        assert_ne!(first, second);
        assert_eq!(fs::read_to_string(&first).unwrap(), "one");
        assert_eq!(fs::read_to_string(&second).unwrap(), "two");
        assert!(first
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("MachineGuid.backup_"));
    }

    #[test]
    fn at_sysid_04_rotation_backs_up_before_write() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("backups");
        let backend = Arc::new(RecordingBackend::new(
            Some("ORIGINAL-GUID"),
            &backups,
            false,
        ));
        let rotator = SystemIdentifierRotator::new(Box::new(backend.clone()), backups.clone());

        let out = rotator
            .rotate(true, &RandomIdentityGenerator::new())
            .expect("rotation should succeed");
        assert!(out.rotated());
        assert!(*backend.backup_seen_before_write.lock().unwrap());

        let backup = out.backup().unwrap();
        assert_eq!(backup.original_value, "ORIGINAL-GUID");
        assert_eq!(fs::read_to_string(&backup.path).unwrap(), "ORIGINAL-GUID");

        let written = backend.written.lock().unwrap().clone().unwrap();
        assert_eq!(written.len(), 32);
        assert!(!written.contains('-'));
        assert_eq!(written, written.to_ascii_uppercase());
    }

    #[test]
    fn at_sysid_05_without_privilege_nothing_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("backups");
        let backend = Arc::new(RecordingBackend::new(Some("ORIGINAL"), &backups, false));
        let rotator = SystemIdentifierRotator::new(Box::new(backend.clone()), backups.clone());

        let err = rotator
            .rotate(false, &RandomIdentityGenerator::new())
            .expect_err("must require privilege");
        assert_eq!(err.kind(), ResetErrorKind::PrivilegeRequired);
        assert_eq!(*backend.reads.lock().unwrap(), 0);
        assert!(!backups.exists());
    }

    #[test]
    fn at_sysid_06_read_failure_leaves_no_backup() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("backups");
        let backend = Arc::new(RecordingBackend::new(None, &backups, false));
        let rotator = SystemIdentifierRotator::new(Box::new(backend), backups.clone());

        let err = rotator
            .rotate(true, &RandomIdentityGenerator::new())
            .expect_err("read must fail");
        assert_eq!(err.kind(), ResetErrorKind::IdentifierReadFailed);
        assert!(!backups.exists());
    }

    #[test]
    fn at_sysid_07_write_failure_keeps_backup_and_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("backups");
        let backend = Arc::new(RecordingBackend::new(Some("ORIGINAL"), &backups, true));
        let rotator = SystemIdentifierRotator::new(Box::new(backend), backups.clone());

        let err = rotator
            .rotate(true, &RandomIdentityGenerator::new())
            .expect_err("write must fail");
        match err {
            ResetError::IdentifierWriteFailed { backup_path, .. } => {
                assert_eq!(fs::read_to_string(backup_path).unwrap(), "ORIGINAL");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn at_sysid_08_backup_dir_blocked_aborts_before_write() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("backups");
        fs::write(&blocker, "not a directory").unwrap();
        let backend = Arc::new(RecordingBackend::new(Some("ORIGINAL"), &blocker, false));
        let rotator = SystemIdentifierRotator::new(Box::new(backend.clone()), blocker);

        let err = rotator
            .rotate(true, &RandomIdentityGenerator::new())
            .expect_err("backup must fail");
        assert_eq!(err.kind(), ResetErrorKind::BackupWriteFailed);
        assert!(backend.written.lock().unwrap().is_none());
    }

    #[test]
    fn at_sysid_09_noop_backend_is_an_explicit_skip() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = SystemIdentifierRotator::new(
            backend_for(PlatformFamily::Linux),
            dir.path().join("backups"),
        );
        assert!(!rotator.is_active());
        let out = rotator
            .rotate(false, &RandomIdentityGenerator::new())
            .unwrap();
        assert_eq!(
            out,
            RotationOutcome::Skipped {
                platform: PlatformFamily::Linux
            }
        );
        assert!(!out.rotated());
    }
}
