#![forbid(unsafe_code)]

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use idreset_engines::host::HostConfig;
use idreset_engines::identity_store::{IdentityStore, JsonFileIdentityStore};
use idreset_engines::idgen::{IdentityGenerator, RandomIdentityGenerator};
use idreset_engines::privilege::{HostPrivilegeGate, PrivilegeGate};
use idreset_engines::process::{HostProcessControl, ProcessControl};
use idreset_engines::system_identifier::{backend_for, RotationOutcome, SystemIdentifierRotator};
use idreset_kernel_contracts::identity::{
    IdentifierSet, IdentityRecord, ResetRequest, SystemIdentifierBackup,
};
use idreset_kernel_contracts::{PlatformFamily, ResetError, ResetErrorKind};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::process_gate::{ProcessGateOutcome, ProcessLifecycleGate, SETTLE_INTERVAL};

/// Name of the mutual-exclusion scope every mutating operation runs under.
pub const IDENTITY_RESOURCES_SCOPE: &str = "identity-resources";

/// Long-lived collaborators, built once at startup and lent to each orchestration.
pub struct ResetCollaborators {
    pub platform: PlatformFamily,
    pub privilege: Box<dyn PrivilegeGate>,
    pub processes: Box<dyn ProcessControl>,
    pub rotator: SystemIdentifierRotator,
    pub generator: Box<dyn IdentityGenerator>,
    pub store: Box<dyn IdentityStore>,
    mutation_scope: Mutex<()>,
}

impl ResetCollaborators {
    pub fn new(
        platform: PlatformFamily,
        privilege: Box<dyn PrivilegeGate>,
        processes: Box<dyn ProcessControl>,
        rotator: SystemIdentifierRotator,
        generator: Box<dyn IdentityGenerator>,
        store: Box<dyn IdentityStore>,
    ) -> Self {
        Self {
            platform,
            privilege,
            processes,
            rotator,
            generator,
            store,
            mutation_scope: Mutex::new(()),
        }
    }

    pub fn from_host(config: &HostConfig, relaunch_args: Vec<String>) -> Self {
        Self::new(
            config.platform,
            Box::new(HostPrivilegeGate::new(config.platform, relaunch_args)),
            Box::new(HostProcessControl::new(
                config.platform,
                config.process_names.clone(),
            )),
            SystemIdentifierRotator::new(backend_for(config.platform), config.backup_dir.clone()),
            Box::new(RandomIdentityGenerator::new()),
            Box::new(JsonFileIdentityStore::new(config.storage_path.clone())),
        )
    }

    /// Serializes mutating operations within this process. A poisoned scope is
    /// recovered: the guarded data is `()`, so there is no state to distrust.
    pub fn lock_mutations(&self) -> MutexGuard<'_, ()> {
        self.mutation_scope
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResetStep {
    PrivilegeCheck,
    ProcessStop,
    SystemIdentifierRotation,
    IdentityGeneration,
    IdentityPersistence,
}

impl ResetStep {
    pub const ORDER: [ResetStep; 5] = [
        ResetStep::PrivilegeCheck,
        ResetStep::ProcessStop,
        ResetStep::SystemIdentifierRotation,
        ResetStep::IdentityGeneration,
        ResetStep::IdentityPersistence,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrivilegeCheck => "PrivilegeCheck",
            Self::ProcessStop => "ProcessStop",
            Self::SystemIdentifierRotation => "SystemIdentifierRotation",
            Self::IdentityGeneration => "IdentityGeneration",
            Self::IdentityPersistence => "IdentityPersistence",
        }
    }
}

impl fmt::Display for ResetStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetState {
    Idle,
    PrivilegeChecked,
    ProcessesStopped,
    SystemIdentifierRotated,
    IdentityGenerated,
    IdentityPersisted,
    Completed,
    Failed(ResetStep, ResetErrorKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTrace {
    pub step: ResetStep,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetOutcome {
    pub record: IdentityRecord,
    pub system_identifier_rotated: bool,
    pub rotation_backup: Option<SystemIdentifierBackup>,
    pub completed_at: DateTime<Utc>,
    pub trace: Vec<StepTrace>,
}

/// A halted run. Steps in `completed_steps` stay applied; nothing is compensated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("reset failed at {step}: {error}")]
pub struct ResetFailure {
    pub step: ResetStep,
    pub error: ResetError,
    pub completed_steps: Vec<ResetStep>,
    pub system_identifier_rotated: bool,
}

struct ResetRun {
    request: ResetRequest,
    state: ResetState,
    privilege_confirmed: bool,
    rotation: Option<RotationOutcome>,
    record: Option<IdentityRecord>,
    trace: Vec<StepTrace>,
}

impl ResetRun {
    fn new(request: ResetRequest) -> Self {
        Self {
            request,
            state: ResetState::Idle,
            privilege_confirmed: false,
            rotation: None,
            record: None,
            trace: Vec::new(),
        }
    }

    fn rotated(&self) -> bool {
        self.rotation.as_ref().is_some_and(RotationOutcome::rotated)
    }

    fn record_step(&mut self, step: ResetStep, detail: impl Into<String>) {
        self.trace.push(StepTrace {
            step,
            detail: detail.into(),
        });
    }
}

pub struct ResetOrchestrator<'a> {
    deps: &'a ResetCollaborators,
    settle: Duration,
}

impl<'a> ResetOrchestrator<'a> {
    pub fn new(deps: &'a ResetCollaborators) -> Self {
        Self::with_settle(deps, SETTLE_INTERVAL)
    }

    /// Uses `settle` in place of [`SETTLE_INTERVAL`] between termination and re-check.
    pub fn with_settle(deps: &'a ResetCollaborators, settle: Duration) -> Self {
        Self { deps, settle }
    }

    fn process_gate(&self) -> ProcessLifecycleGate<'_> {
        ProcessLifecycleGate::with_settle(self.deps.processes.as_ref(), self.settle)
    }

    /// Full reset. Runs [`ResetStep::ORDER`] and halts on the first failure.
    pub fn reset(&self, request: ResetRequest) -> Result<ResetOutcome, ResetFailure> {
        let _scope = self.deps.lock_mutations();
        let mut run = ResetRun::new(request);
        info!(
            scope = IDENTITY_RESOURCES_SCOPE,
            set_read_only = request.set_read_only,
            "reset started"
        );

        for step in ResetStep::ORDER {
            match self.run_step(step, &mut run) {
                Ok(next) => run.state = next,
                Err(error) => {
                    run.state = ResetState::Failed(step, error.kind());
                    warn!(
                        step = %step,
                        state = ?run.state,
                        error = %error,
                        "reset halted"
                    );
                    return Err(ResetFailure {
                        step,
                        error,
                        completed_steps: run.trace.iter().map(|t| t.step).collect(),
                        system_identifier_rotated: run.rotated(),
                    });
                }
            }
        }
        run.state = ResetState::Completed;
        debug!(state = ?run.state, "all reset steps applied");

        let record = run.record.take().ok_or_else(|| ResetFailure {
            step: ResetStep::IdentityPersistence,
            error: ResetError::PersistenceFailed {
                path: self.deps.store.location().to_path_buf(),
                reason: "no record produced".to_string(),
            },
            completed_steps: run.trace.iter().map(|t| t.step).collect(),
            system_identifier_rotated: run.rotated(),
        })?;
        let rotation_backup = run.rotation.as_ref().and_then(|r| r.backup().cloned());
        info!(
            rotated = rotation_backup.is_some(),
            "reset completed; restart the application for changes to take effect"
        );
        Ok(ResetOutcome {
            system_identifier_rotated: rotation_backup.is_some(),
            completed_at: record.last_modified.unwrap_or_else(Utc::now),
            record,
            rotation_backup,
            trace: run.trace,
        })
    }

    fn run_step(&self, step: ResetStep, run: &mut ResetRun) -> Result<ResetState, ResetError> {
        match step {
            ResetStep::PrivilegeCheck => {
                self.deps.privilege.require()?;
                run.privilege_confirmed = true;
                run.record_step(step, "elevated");
                Ok(ResetState::PrivilegeChecked)
            }
            ResetStep::ProcessStop => {
                let outcome = self.process_gate().ensure_stopped()?;
                run.record_step(
                    step,
                    match outcome {
                        ProcessGateOutcome::NotRunning => "not running",
                        ProcessGateOutcome::Stopped => "stopped",
                    },
                );
                Ok(ResetState::ProcessesStopped)
            }
            ResetStep::SystemIdentifierRotation => {
                let outcome = self
                    .deps
                    .rotator
                    .rotate(run.privilege_confirmed, self.deps.generator.as_ref())?;
                let detail = match &outcome {
                    RotationOutcome::Rotated { backup, .. } => {
                        format!("rotated; backup at {}", backup.path.display())
                    }
                    RotationOutcome::Skipped { platform } => format!("skipped on {platform}"),
                };
                run.record_step(step, detail);
                run.rotation = Some(outcome);
                Ok(ResetState::SystemIdentifierRotated)
            }
            ResetStep::IdentityGeneration => {
                let record = self.generate_record()?;
                run.record_step(step, "generated");
                run.record = Some(record);
                Ok(ResetState::IdentityGenerated)
            }
            ResetStep::IdentityPersistence => {
                let record = run.record.as_ref().ok_or_else(|| ResetError::PersistenceFailed {
                    path: self.deps.store.location().to_path_buf(),
                    reason: "no record generated".to_string(),
                })?;
                self.deps.store.write(record, run.request.set_read_only)?;
                run.record_step(
                    step,
                    format!("written to {}", self.deps.store.location().display()),
                );
                Ok(ResetState::IdentityPersisted)
            }
        }
    }

    /// Fresh identifiers, except `sqm_id` which survives when the prior record had one.
    fn generate_record(&self) -> Result<IdentityRecord, ResetError> {
        let prior = match self.deps.store.read() {
            Ok(prior) => prior,
            Err(err) => {
                warn!(error = %err, "failed to read existing identity record");
                None
            }
        };
        let generator = self.deps.generator.as_ref();
        let machine_id = generator.machine_id()?;
        let mac_machine_id = generator.mac_machine_id()?;
        let dev_device_id = generator.dev_device_id()?;
        let sqm_id = match prior.as_ref().map(IdentityRecord::sqm_id) {
            Some(carried) if !carried.trim().is_empty() => carried.to_string(),
            _ => generator.sqm_id()?,
        };
        let ids = IdentifierSet::v1(mac_machine_id, machine_id, dev_device_id, sqm_id)
            .map_err(|v| ResetError::generation("identifier_set", v))?;
        IdentityRecord::v1(ids, Utc::now())
            .map_err(|v| ResetError::generation("identity_record", v))
    }

    /// Preview: generator only. No process, rotation, or storage access.
    pub fn preview(&self) -> Result<IdentifierSet, ResetError> {
        self.deps.generator.identifier_set()
    }

    /// Privileged stop of the target application, outside of a reset.
    pub fn stop_application(&self) -> Result<ProcessGateOutcome, ResetError> {
        let _scope = self.deps.lock_mutations();
        self.deps.privilege.require()?;
        self.process_gate().ensure_stopped()
    }
}
