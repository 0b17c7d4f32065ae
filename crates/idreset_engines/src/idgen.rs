#![forbid(unsafe_code)]

use idreset_kernel_contracts::identity::IdentifierSet;
use idreset_kernel_contracts::ResetError;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

const MACHINE_ID_PREFIX: &[u8] = b"auth0|user_";
const MACHINE_ID_LEN: usize = 32;

pub trait IdentityGenerator: Send + Sync {
    fn machine_id(&self) -> Result<String, ResetError>;
    fn mac_machine_id(&self) -> Result<String, ResetError>;
    fn dev_device_id(&self) -> Result<String, ResetError>;
    fn sqm_id(&self) -> Result<String, ResetError>;

    /// Fresh values for all four fields.
    fn identifier_set(&self) -> Result<IdentifierSet, ResetError> {
        let machine_id = self.machine_id()?;
        let mac_machine_id = self.mac_machine_id()?;
        let dev_device_id = self.dev_device_id()?;
        let sqm_id = self.sqm_id()?;
        IdentifierSet::v1(mac_machine_id, machine_id, dev_device_id, sqm_id)
            .map_err(|v| ResetError::generation("identifier_set", v))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIdentityGenerator;

impl RandomIdentityGenerator {
    pub fn new() -> Self {
        Self
    }

    fn random_bytes<const N: usize>(field: &'static str) -> Result<[u8; N], ResetError> {
        let mut buf = [0u8; N];
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| ResetError::GenerationFailed {
                field,
                reason: e.to_string(),
            })?;
        Ok(buf)
    }

    fn random_uuid(field: &'static str) -> Result<Uuid, ResetError> {
        let bytes = Self::random_bytes::<16>(field)?;
        Ok(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }
}

impl IdentityGenerator for RandomIdentityGenerator {
    /// 32 bytes: ASCII prefix followed by random fill, hex-encoded.
    fn machine_id(&self) -> Result<String, ResetError> {
        let mut buf = Self::random_bytes::<MACHINE_ID_LEN>("machine_id")?;
        buf[..MACHINE_ID_PREFIX.len()].copy_from_slice(MACHINE_ID_PREFIX);
        Ok(hex_lower(&buf))
    }

    fn mac_machine_id(&self) -> Result<String, ResetError> {
        let seed = Self::random_bytes::<32>("mac_machine_id")?;
        Ok(hex_lower(&Sha256::digest(seed)))
    }

    fn dev_device_id(&self) -> Result<String, ResetError> {
        Ok(Self::random_uuid("dev_device_id")?.hyphenated().to_string())
    }

    fn sqm_id(&self) -> Result<String, ResetError> {
        let id = Self::random_uuid("sqm_id")?;
        Ok(format!("{{{}}}", id.hyphenated().to_string().to_ascii_uppercase()))
    }
}

pub fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
