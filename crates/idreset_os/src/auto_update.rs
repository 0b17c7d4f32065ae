#![forbid(unsafe_code)]

//! Disables the target application's self-updater by replacing its working
//! directory with a plain file. On macOS the bundled `app-update.yml` is also
//! swapped for an empty read-only copy; those steps are best effort.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use idreset_engines::host::HostConfig;
use idreset_engines::privilege::PrivilegeGate;
use idreset_kernel_contracts::{PlatformFamily, ResetError};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Criticality {
    Critical,
    Auxiliary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoUpdateReport {
    pub platform: String,
    pub operations: Vec<String>,
    pub paths: Vec<PathBuf>,
}

impl AutoUpdateReport {
    fn new(platform: PlatformFamily) -> Self {
        Self {
            platform: platform.to_string(),
            operations: Vec::new(),
            paths: Vec::new(),
        }
    }

    fn apply(
        &mut self,
        criticality: Criticality,
        operation: &str,
        path: &Path,
        action: impl FnOnce() -> io::Result<()>,
    ) -> Result<(), ResetError> {
        match action() {
            Ok(()) => {
                debug!(operation, path = %path.display(), "auto-update operation applied");
                self.operations.push(operation.to_string());
                self.paths.push(path.to_path_buf());
                Ok(())
            }
            Err(err) if criticality == Criticality::Auxiliary => {
                warn!(
                    operation,
                    path = %path.display(),
                    error = %err,
                    "auto-update operation skipped"
                );
                Ok(())
            }
            Err(err) => Err(ResetError::AutoUpdateBlockFailed {
                path: path.to_path_buf(),
                reason: format!("{operation}: {err}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoUpdateBlocker {
    platform: PlatformFamily,
    updater_path: Option<PathBuf>,
    app_update_yml: Option<PathBuf>,
}

impl AutoUpdateBlocker {
    pub fn new(
        platform: PlatformFamily,
        updater_path: Option<PathBuf>,
        app_update_yml: Option<PathBuf>,
    ) -> Self {
        Self {
            platform,
            updater_path,
            app_update_yml,
        }
    }

    pub fn from_host(config: &HostConfig) -> Self {
        Self::new(
            config.platform,
            config.updater_path.clone(),
            config.app_update_yml.clone(),
        )
    }

    pub fn platform(&self) -> PlatformFamily {
        self.platform
    }

    pub fn disable(&self, privilege: &dyn PrivilegeGate) -> Result<AutoUpdateReport, ResetError> {
        let mut report = AutoUpdateReport::new(self.platform);
        match self.platform {
            PlatformFamily::Windows => {
                privilege.require()?;
                self.block_updater_dir(&mut report, Criticality::Critical)?;
            }
            PlatformFamily::Linux => {
                self.block_updater_dir(&mut report, Criticality::Critical)?;
            }
            PlatformFamily::MacOs => {
                self.replace_app_update_yml(&mut report)?;
                self.block_updater_dir(&mut report, Criticality::Auxiliary)?;
            }
            PlatformFamily::Other(os) => {
                return Err(ResetError::UnsupportedPlatform {
                    platform: os.to_string(),
                })
            }
        }
        info!(
            platform = %self.platform,
            operations = report.operations.len(),
            "auto-update disabled"
        );
        Ok(report)
    }

    fn block_updater_dir(
        &self,
        report: &mut AutoUpdateReport,
        criticality: Criticality,
    ) -> Result<(), ResetError> {
        let Some(path) = self.updater_path.as_deref() else {
            return match criticality {
                Criticality::Critical => Err(ResetError::AutoUpdateBlockFailed {
                    path: PathBuf::new(),
                    reason: "updater location could not be resolved".to_string(),
                }),
                Criticality::Auxiliary => {
                    warn!("updater location could not be resolved");
                    Ok(())
                }
            };
        };

        if path.is_dir() {
            report.apply(criticality, "remove updater directory", path, || {
                fs::remove_dir_all(path)
            })?;
        }
        report.apply(criticality, "create blocking file", path, || {
            write_empty_file(path, false)
        })
    }

    fn replace_app_update_yml(&self, report: &mut AutoUpdateReport) -> Result<(), ResetError> {
        let Some(yml) = self.app_update_yml.as_deref() else {
            return Ok(());
        };
        // Installs without a bundled manifest are left untouched.
        if !yml.is_file() {
            debug!(path = %yml.display(), "update manifest not present");
            return Ok(());
        }
        let backup = backup_path(yml);
        if backup.exists() {
            debug!(path = %backup.display(), "update manifest backup already present");
        } else {
            report.apply(Criticality::Auxiliary, "back up update manifest", &backup, || {
                fs::rename(yml, &backup)
            })?;
        }
        report.apply(
            Criticality::Auxiliary,
            "create read-only update manifest",
            yml,
            || write_empty_file(yml, true),
        )
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

/// Creates or truncates `path`. A read-only file left by an earlier run is made
/// writable first.
fn write_empty_file(path: &Path, read_only: bool) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.is_file() {
        set_writable(path, true)?;
    }
    File::create(path)?;
    if read_only {
        set_writable(path, false)?;
    }
    Ok(())
}

fn set_writable(path: &Path, writable: bool) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if writable { 0o644 } else { 0o444 };
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }
    #[cfg(not(unix))]
    {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_readonly(!writable);
        fs::set_permissions(path, perms)
    }
}
