#![forbid(unsafe_code)]

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ContractViolation, SchemaVersion, Validate};

pub const IDENTITY_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Version tag written into every persisted identity record.
pub const IDENTITY_RECORD_VERSION: &str = "1.0.1";

/// The four telemetry identifiers, without persistence metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierSet {
    #[serde(rename = "telemetryMacMachineId")]
    pub mac_machine_id: String,
    #[serde(rename = "telemetryMachineId")]
    pub machine_id: String,
    #[serde(rename = "telemetryDevDeviceId")]
    pub dev_device_id: String,
    #[serde(rename = "telemetrySqmId")]
    pub sqm_id: String,
}

impl IdentifierSet {
    pub fn v1(
        mac_machine_id: String,
        machine_id: String,
        dev_device_id: String,
        sqm_id: String,
    ) -> Result<Self, ContractViolation> {
        let set = Self {
            mac_machine_id,
            machine_id,
            dev_device_id,
            sqm_id,
        };
        set.validate()?;
        Ok(set)
    }
}

impl Validate for IdentifierSet {
    fn validate(&self) -> Result<(), ContractViolation> {
        for (field, value) in [
            ("identifier_set.mac_machine_id", &self.mac_machine_id),
            ("identifier_set.machine_id", &self.machine_id),
            ("identifier_set.dev_device_id", &self.dev_device_id),
            ("identifier_set.sqm_id", &self.sqm_id),
        ] {
            if value.trim().is_empty() {
                return Err(ContractViolation::InvalidValue {
                    field,
                    reason: "must not be empty",
                });
            }
        }
        Ok(())
    }
}

/// Identity record as persisted by the target application.
///
/// Records read back from disk may be partial (missing keys read as empty strings), so
/// only [`IdentityRecord::v1`] enforces the non-empty invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    #[serde(flatten)]
    pub identifiers: IdentifierSet,
    pub last_modified: Option<DateTime<Utc>>,
    pub version: String,
}

impl IdentityRecord {
    pub fn v1(
        identifiers: IdentifierSet,
        last_modified: DateTime<Utc>,
    ) -> Result<Self, ContractViolation> {
        let record = Self {
            identifiers,
            last_modified: Some(last_modified),
            version: IDENTITY_RECORD_VERSION.to_string(),
        };
        record.validate()?;
        Ok(record)
    }

    pub fn sqm_id(&self) -> &str {
        &self.identifiers.sqm_id
    }
}

impl Validate for IdentityRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.identifiers.validate()?;
        if self.last_modified.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "identity_record.last_modified",
                reason: "must be set",
            });
        }
        if self.version.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "identity_record.version",
                reason: "must not be empty",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    #[serde(default)]
    pub set_read_only: bool,
}

/// Durable copy of a system identifier taken before it was replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemIdentifierBackup {
    pub original_value: String,
    pub captured_at: DateTime<Utc>,
    pub path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> IdentifierSet {
        IdentifierSet::v1(
            "mac".to_string(),
            "machine".to_string(),
            "device".to_string(),
            "{SQM}".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn at_contract_01_identifier_set_rejects_blank_fields() {
        let err = IdentifierSet::v1(
            "mac".to_string(),
            "  ".to_string(),
            "device".to_string(),
            "{SQM}".to_string(),
        )
        .expect_err("blank machine id must fail");
        assert_eq!(
            err,
            ContractViolation::InvalidValue {
                field: "identifier_set.machine_id",
                reason: "must not be empty",
            }
        );
    }

    #[test]
    fn at_contract_02_record_v1_stamps_version_and_time() {
        let now = Utc::now();
        let record = IdentityRecord::v1(ids(), now).unwrap();
        assert_eq!(record.version, IDENTITY_RECORD_VERSION);
        assert_eq!(record.last_modified, Some(now));
        assert_eq!(record.sqm_id(), "{SQM}");
    }

    #[test]
    fn at_contract_03_record_serializes_with_flat_telemetry_keys() {
        let record = IdentityRecord::v1(ids(), Utc::now()).unwrap();
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["telemetryMachineId"], "machine");
        assert_eq!(value["telemetrySqmId"], "{SQM}");
        assert_eq!(value["version"], IDENTITY_RECORD_VERSION);
        assert!(value.get("identifiers").is_none());
    }

    #[test]
    fn at_contract_04_reset_request_defaults_read_only_off() {
        let req: ResetRequest = serde_json::from_str("{}").unwrap();
        assert!(!req.set_read_only);
        let req: ResetRequest = serde_json::from_str(r#"{"setReadOnly":true}"#).unwrap();
        assert!(req.set_read_only);
    }
}
