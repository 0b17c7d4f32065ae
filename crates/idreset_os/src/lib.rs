#![forbid(unsafe_code)]

pub mod auto_update;
pub mod process_gate;
pub mod reset;

#[cfg(test)]
pub(crate) mod testing;
