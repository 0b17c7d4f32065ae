#![forbid(unsafe_code)]

use std::path::PathBuf;

use serde::Serialize;

use crate::ContractViolation;

/// Fieldless projection of [`ResetError`], reported to clients as `errorKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResetErrorKind {
    PrivilegeRequired,
    UnsupportedPlatform,
    ProcessStillRunning,
    IdentifierReadFailed,
    BackupWriteFailed,
    IdentifierWriteFailed,
    GenerationFailed,
    PersistenceFailed,
    ElevationFailed,
    InvalidRequest,
    AutoUpdateBlockFailed,
}

impl ResetErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrivilegeRequired => "PrivilegeRequired",
            Self::UnsupportedPlatform => "UnsupportedPlatform",
            Self::ProcessStillRunning => "ProcessStillRunning",
            Self::IdentifierReadFailed => "IdentifierReadFailed",
            Self::BackupWriteFailed => "BackupWriteFailed",
            Self::IdentifierWriteFailed => "IdentifierWriteFailed",
            Self::GenerationFailed => "GenerationFailed",
            Self::PersistenceFailed => "PersistenceFailed",
            Self::ElevationFailed => "ElevationFailed",
            Self::InvalidRequest => "InvalidRequest",
            Self::AutoUpdateBlockFailed => "AutoUpdateBlockFailed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResetError {
    #[error("administrator privileges required")]
    PrivilegeRequired { remediation: String },

    #[error("unsupported operating system: {platform}")]
    UnsupportedPlatform { platform: String },

    #[error("{process} is still running after a termination request")]
    ProcessStillRunning { process: String },

    #[error("failed to read current system identifier: {0}")]
    IdentifierReadFailed(String),

    #[error("failed to write system identifier backup to {path}: {reason}")]
    BackupWriteFailed { path: PathBuf, reason: String },

    /// The original value is not restored; `backup_path` holds it for manual recovery.
    #[error("failed to write system identifier (original saved at {backup_path}): {reason}")]
    IdentifierWriteFailed { backup_path: PathBuf, reason: String },

    #[error("failed to generate {field}: {reason}")]
    GenerationFailed { field: &'static str, reason: String },

    #[error("failed to persist identity record at {path}: {reason}")]
    PersistenceFailed { path: PathBuf, reason: String },

    #[error("privilege elevation failed: {reason}")]
    ElevationFailed {
        reason: String,
        remediation: Option<String>,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to disable auto-update at {path}: {reason}")]
    AutoUpdateBlockFailed { path: PathBuf, reason: String },
}

impl ResetError {
    pub fn kind(&self) -> ResetErrorKind {
        match self {
            Self::PrivilegeRequired { .. } => ResetErrorKind::PrivilegeRequired,
            Self::UnsupportedPlatform { .. } => ResetErrorKind::UnsupportedPlatform,
            Self::ProcessStillRunning { .. } => ResetErrorKind::ProcessStillRunning,
            Self::IdentifierReadFailed(_) => ResetErrorKind::IdentifierReadFailed,
            Self::BackupWriteFailed { .. } => ResetErrorKind::BackupWriteFailed,
            Self::IdentifierWriteFailed { .. } => ResetErrorKind::IdentifierWriteFailed,
            Self::GenerationFailed { .. } => ResetErrorKind::GenerationFailed,
            Self::PersistenceFailed { .. } => ResetErrorKind::PersistenceFailed,
            Self::ElevationFailed { .. } => ResetErrorKind::ElevationFailed,
            Self::InvalidRequest(_) => ResetErrorKind::InvalidRequest,
            Self::AutoUpdateBlockFailed { .. } => ResetErrorKind::AutoUpdateBlockFailed,
        }
    }

    /// Platform-specific remediation text, present for privilege failures only.
    pub fn remediation(&self) -> Option<&str> {
        match self {
            Self::PrivilegeRequired { remediation } => Some(remediation),
            Self::ElevationFailed { remediation, .. } => remediation.as_deref(),
            _ => None,
        }
    }

    pub fn generation(field: &'static str, violation: ContractViolation) -> Self {
        Self::GenerationFailed {
            field,
            reason: violation.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_reset_err_01_kind_matches_variant() {
        let err = ResetError::BackupWriteFailed {
            path: PathBuf::from("/tmp/x"),
            reason: "disk full".to_string(),
        };
        assert_eq!(err.kind(), ResetErrorKind::BackupWriteFailed);
        assert_eq!(err.kind().as_str(), "BackupWriteFailed");
        assert!(err.remediation().is_none());
    }

    #[test]
    fn at_reset_err_02_privilege_failure_carries_remediation() {
        let err = ResetError::PrivilegeRequired {
            remediation: "run with sudo".to_string(),
        };
        assert_eq!(err.remediation(), Some("run with sudo"));
        assert_eq!(err.to_string(), "administrator privileges required");
    }
}
