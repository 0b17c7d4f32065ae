#![forbid(unsafe_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use idreset_kernel_contracts::identity::{IdentifierSet, IdentityRecord};
use idreset_kernel_contracts::{ResetError, Validate};
use serde_json::{Map, Value};
use tracing::{debug, info};

pub const KEY_MAC_MACHINE_ID: &str = "telemetry.macMachineId";
pub const KEY_MACHINE_ID: &str = "telemetry.machineId";
pub const KEY_DEV_DEVICE_ID: &str = "telemetry.devDeviceId";
pub const KEY_SQM_ID: &str = "telemetry.sqmId";
pub const KEY_LAST_MODIFIED: &str = "lastModified";
pub const KEY_VERSION: &str = "version";

pub trait IdentityStore: Send + Sync {
    fn location(&self) -> &Path;

    /// `Ok(None)` when no record has been persisted yet.
    fn read(&self) -> Result<Option<IdentityRecord>, ResetError>;

    /// Replaces the record atomically, optionally leaving the file read-only.
    fn write(&self, record: &IdentityRecord, set_read_only: bool) -> Result<(), ResetError>;
}

impl<T: IdentityStore + ?Sized> IdentityStore for Arc<T> {
    fn location(&self) -> &Path {
        (**self).location()
    }

    fn read(&self) -> Result<Option<IdentityRecord>, ResetError> {
        (**self).read()
    }

    fn write(&self, record: &IdentityRecord, set_read_only: bool) -> Result<(), ResetError> {
        (**self).write(record, set_read_only)
    }
}

/// The target application's `storage.json`. Keys this store does not own are kept
/// untouched on every write.
#[derive(Debug, Clone)]
pub struct JsonFileIdentityStore {
    path: PathBuf,
}

impl JsonFileIdentityStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn persistence_error(&self, reason: impl ToString) -> ResetError {
        ResetError::PersistenceFailed {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }

    fn read_document(&self) -> Result<Option<Map<String, Value>>, ResetError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.persistence_error(err)),
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        match serde_json::from_str::<Value>(&raw).map_err(|e| self.persistence_error(e))? {
            Value::Object(map) => Ok(Some(map)),
            _ => Err(self.persistence_error("storage file is not a JSON object")),
        }
    }
}

impl IdentityStore for JsonFileIdentityStore {
    fn location(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Option<IdentityRecord>, ResetError> {
        let Some(doc) = self.read_document()? else {
            return Ok(None);
        };
        let text = |key: &str| {
            doc.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let last_modified = doc
            .get(KEY_LAST_MODIFIED)
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc));
        Ok(Some(IdentityRecord {
            identifiers: IdentifierSet {
                mac_machine_id: text(KEY_MAC_MACHINE_ID),
                machine_id: text(KEY_MACHINE_ID),
                dev_device_id: text(KEY_DEV_DEVICE_ID),
                sqm_id: text(KEY_SQM_ID),
            },
            last_modified,
            version: text(KEY_VERSION),
        }))
    }

    fn write(&self, record: &IdentityRecord, set_read_only: bool) -> Result<(), ResetError> {
        record.validate().map_err(|v| self.persistence_error(v))?;
        let last_modified = record
            .last_modified
            .ok_or_else(|| self.persistence_error("record has no timestamp"))?;

        // Unparseable content is refused rather than clobbered.
        let mut doc = self.read_document()?.unwrap_or_default();
        let ids = &record.identifiers;
        for (key, value) in [
            (KEY_MAC_MACHINE_ID, ids.mac_machine_id.as_str()),
            (KEY_MACHINE_ID, ids.machine_id.as_str()),
            (KEY_DEV_DEVICE_ID, ids.dev_device_id.as_str()),
            (KEY_SQM_ID, ids.sqm_id.as_str()),
            (KEY_VERSION, record.version.as_str()),
        ] {
            doc.insert(key.to_string(), Value::String(value.to_string()));
        }
        doc.insert(
            KEY_LAST_MODIFIED.to_string(),
            Value::String(last_modified.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.persistence_error(e))?;
            }
        }
        // The service runs elevated; the replacement keeps the user's ownership.
        let attributes =
            FileAttributes::capture(&self.path).map_err(|e| self.persistence_error(e))?;
        debug!(
            path = %self.path.display(),
            uid = attributes.uid,
            gid = attributes.gid,
            mode = %format!("{:o}", attributes.mode),
            "record file attributes captured"
        );
        #[cfg(not(unix))]
        if self.path.exists() {
            debug!(path = %self.path.display(), "clearing read-only bit before write");
            attributes
                .apply(&self.path, false)
                .map_err(|e| self.persistence_error(e))?;
        }
        let serialized =
            serde_json::to_vec_pretty(&Value::Object(doc)).map_err(|e| self.persistence_error(e))?;
        atomic_write(&self.path, &serialized, |tmp| attributes.apply(tmp, set_read_only))
            .map_err(|e| self.persistence_error(e))?;
        info!(
            path = %self.path.display(),
            read_only = set_read_only,
            "identity record persisted"
        );
        Ok(())
    }
}

/// Mode for a record file that did not exist before the first write.
const NEW_FILE_MODE: u32 = 0o644;

/// Owner and permission bits of the record file, reapplied to each replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileAttributes {
    uid: u32,
    gid: u32,
    mode: u32,
}

impl FileAttributes {
    /// A missing file takes the owner of its directory.
    #[cfg(unix)]
    fn capture(path: &Path) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;
        match fs::metadata(path) {
            Ok(meta) => Ok(Self {
                uid: meta.uid(),
                gid: meta.gid(),
                mode: meta.mode() & 0o777,
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                let meta = fs::metadata(dir)?;
                Ok(Self {
                    uid: meta.uid(),
                    gid: meta.gid(),
                    mode: NEW_FILE_MODE,
                })
            }
            Err(err) => Err(err),
        }
    }

    #[cfg(not(unix))]
    fn capture(_path: &Path) -> io::Result<Self> {
        Ok(Self {
            uid: 0,
            gid: 0,
            mode: NEW_FILE_MODE,
        })
    }

    /// Captured mode with the owner write bit set, or every write bit cleared.
    fn mode(&self, read_only: bool) -> u32 {
        if read_only {
            self.mode & !0o222
        } else {
            self.mode | 0o200
        }
    }

    #[cfg(unix)]
    fn apply(&self, path: &Path, read_only: bool) -> io::Result<()> {
        use nix::unistd::{chown, Gid, Uid};
        use std::os::unix::fs::{MetadataExt, PermissionsExt};
        let meta = fs::metadata(path)?;
        if meta.uid() != self.uid || meta.gid() != self.gid {
            chown(
                path,
                Some(Uid::from_raw(self.uid)),
                Some(Gid::from_raw(self.gid)),
            )
            .map_err(io::Error::from)?;
        }
        fs::set_permissions(path, fs::Permissions::from_mode(self.mode(read_only)))
    }

    #[cfg(not(unix))]
    fn apply(&self, path: &Path, read_only: bool) -> io::Result<()> {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_readonly(self.mode(read_only) & 0o200 == 0);
        fs::set_permissions(path, perms)
    }
}

/// Writes `data` beside `path`, runs `prepare` on the temporary file, then renames it
/// into place. The temporary file is removed if any step before the rename fails.
fn atomic_write(
    path: &Path,
    data: &[u8],
    prepare: impl FnOnce(&Path) -> io::Result<()>,
) -> io::Result<()> {
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    let staged = fs::write(&tmp, data).and_then(|_| prepare(&tmp));
    if let Err(err) = staged {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    fs::rename(tmp, path)
}
