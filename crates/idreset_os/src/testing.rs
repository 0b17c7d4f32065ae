#![forbid(unsafe_code)]

//! In-memory collaborators shared by this crate's test suites.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use idreset_engines::identity_store::IdentityStore;
use idreset_engines::idgen::IdentityGenerator;
use idreset_engines::privilege::{ElevationOutcome, PrivilegeGate};
use idreset_engines::process::ProcessControl;
use idreset_engines::system_identifier::SystemIdentifierBackend;
use idreset_kernel_contracts::identity::IdentityRecord;
use idreset_kernel_contracts::{PlatformFamily, ResetError};

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: &str) {
        self.0.lock().unwrap().push(event.to_string());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.0.lock().unwrap().iter().any(|e| e == event)
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|e| e == event)
    }
}

pub struct FakePrivilege {
    elevated: bool,
    log: EventLog,
}

impl FakePrivilege {
    pub fn new(elevated: bool, log: EventLog) -> Self {
        Self { elevated, log }
    }
}

impl PrivilegeGate for FakePrivilege {
    fn check(&self) -> Result<bool, ResetError> {
        self.log.push("privilege.check");
        Ok(self.elevated)
    }

    fn elevate(&self) -> Result<ElevationOutcome, ResetError> {
        if self.elevated {
            Ok(ElevationOutcome::AlreadyElevated)
        } else {
            Err(ResetError::ElevationFailed {
                reason: "manual".to_string(),
                remediation: Some(self.remediation()),
            })
        }
    }

    fn remediation(&self) -> String {
        "restart with sudo".to_string()
    }
}

pub struct FakeProcesses {
    running: Mutex<bool>,
    stop_on_request: bool,
    request_error: Option<String>,
    requests: Mutex<u32>,
    log: EventLog,
}

impl FakeProcesses {
    fn build(running: bool, stop_on_request: bool) -> Self {
        Self {
            running: Mutex::new(running),
            stop_on_request,
            request_error: None,
            requests: Mutex::new(0),
            log: EventLog::default(),
        }
    }

    pub fn not_running() -> Self {
        Self::build(false, true)
    }

    pub fn stops_after_request() -> Self {
        Self::build(true, true)
    }

    pub fn never_stops() -> Self {
        Self::build(true, false)
    }

    pub fn with_request_error(mut self, reason: &str) -> Self {
        self.request_error = Some(reason.to_string());
        self
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    pub fn termination_requests(&self) -> u32 {
        *self.requests.lock().unwrap()
    }
}

impl ProcessControl for FakeProcesses {
    fn target_label(&self) -> String {
        "Cursor".to_string()
    }

    fn is_running(&self) -> bool {
        *self.running.lock().unwrap()
    }

    fn request_termination(&self) -> Result<(), String> {
        self.log.push("process.terminate");
        *self.requests.lock().unwrap() += 1;
        if self.stop_on_request {
            *self.running.lock().unwrap() = false;
        }
        match &self.request_error {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }
}

/// Deterministic, counter-based identifiers.
pub struct SequenceGenerator {
    next: Mutex<u32>,
    fail_field: Option<&'static str>,
    log: EventLog,
}

impl SequenceGenerator {
    pub fn new(log: EventLog) -> Self {
        Self {
            next: Mutex::new(1),
            fail_field: None,
            log,
        }
    }

    pub fn failing_on(mut self, field: &'static str) -> Self {
        self.fail_field = Some(field);
        self
    }

    fn produce(&self, field: &'static str) -> Result<String, ResetError> {
        self.log.push(&format!("generate.{field}"));
        if self.fail_field == Some(field) {
            return Err(ResetError::GenerationFailed {
                field,
                reason: "entropy unavailable".to_string(),
            });
        }
        let mut next = self.next.lock().unwrap();
        let value = format!("{field}-{:04}", *next);
        *next += 1;
        Ok(value)
    }
}

impl IdentityGenerator for SequenceGenerator {
    fn machine_id(&self) -> Result<String, ResetError> {
        self.produce("machine_id")
    }

    fn mac_machine_id(&self) -> Result<String, ResetError> {
        self.produce("mac_machine_id")
    }

    fn dev_device_id(&self) -> Result<String, ResetError> {
        self.produce("dev_device_id")
    }

    fn sqm_id(&self) -> Result<String, ResetError> {
        self.produce("sqm_id")
    }
}

pub struct MemoryStore {
    record: Mutex<Option<IdentityRecord>>,
    read_only: Mutex<Option<bool>>,
    fail_read: bool,
    fail_write: bool,
    log: EventLog,
    path: PathBuf,
}

impl MemoryStore {
    pub fn new(record: Option<IdentityRecord>, log: EventLog) -> Self {
        Self {
            record: Mutex::new(record),
            read_only: Mutex::new(None),
            fail_read: false,
            fail_write: false,
            log,
            path: PathBuf::from("memory://storage.json"),
        }
    }

    pub fn failing_reads(mut self) -> Self {
        self.fail_read = true;
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_write = true;
        self
    }

    pub fn snapshot(&self) -> Option<IdentityRecord> {
        self.record.lock().unwrap().clone()
    }

    pub fn last_read_only(&self) -> Option<bool> {
        *self.read_only.lock().unwrap()
    }
}

impl IdentityStore for MemoryStore {
    fn location(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Option<IdentityRecord>, ResetError> {
        self.log.push("store.read");
        if self.fail_read {
            return Err(ResetError::PersistenceFailed {
                path: self.path.clone(),
                reason: "unreadable".to_string(),
            });
        }
        Ok(self.snapshot())
    }

    fn write(&self, record: &IdentityRecord, set_read_only: bool) -> Result<(), ResetError> {
        self.log.push("store.write");
        if self.fail_write {
            return Err(ResetError::PersistenceFailed {
                path: self.path.clone(),
                reason: "disk full".to_string(),
            });
        }
        *self.record.lock().unwrap() = Some(record.clone());
        *self.read_only.lock().unwrap() = Some(set_read_only);
        Ok(())
    }
}

/// Active backend holding its value in memory; records whether a backup with the
/// original value was on disk at write time.
pub struct MemoryMachineGuid {
    value: Mutex<String>,
    backup_dir: PathBuf,
    backup_seen_before_write: Mutex<Option<bool>>,
    log: EventLog,
}

impl MemoryMachineGuid {
    pub fn new(value: &str, backup_dir: &Path, log: EventLog) -> Self {
        Self {
            value: Mutex::new(value.to_string()),
            backup_dir: backup_dir.to_path_buf(),
            backup_seen_before_write: Mutex::new(None),
            log,
        }
    }

    pub fn current(&self) -> String {
        self.value.lock().unwrap().clone()
    }

    pub fn backup_seen_before_write(&self) -> Option<bool> {
        *self.backup_seen_before_write.lock().unwrap()
    }
}

impl SystemIdentifierBackend for MemoryMachineGuid {
    fn platform(&self) -> PlatformFamily {
        PlatformFamily::Windows
    }

    fn is_active(&self) -> bool {
        true
    }

    fn identifier_name(&self) -> &'static str {
        "MachineGuid"
    }

    fn read_current(&self) -> Result<String, ResetError> {
        self.log.push("sysid.read");
        Ok(self.current())
    }

    fn write_replacement(&self, value: &str) -> Result<(), ResetError> {
        self.log.push("sysid.write");
        let original = self.current();
        let seen = fs::read_dir(&self.backup_dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .any(|e| fs::read_to_string(e.path()).map(|v| v == original).unwrap_or(false))
            })
            .unwrap_or(false);
        *self.backup_seen_before_write.lock().unwrap() = Some(seen);
        *self.value.lock().unwrap() = value.to_string();
        Ok(())
    }
}
