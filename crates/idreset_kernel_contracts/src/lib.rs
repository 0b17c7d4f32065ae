#![forbid(unsafe_code)]

pub mod common;
pub mod identity;
pub mod reset;

pub use common::{ContractViolation, PlatformFamily, SchemaVersion, Validate};
pub use reset::{ResetError, ResetErrorKind};
