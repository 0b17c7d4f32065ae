#![forbid(unsafe_code)]

pub mod host;
pub mod identity_store;
pub mod idgen;
pub mod privilege;
pub mod process;
pub mod system_identifier;
