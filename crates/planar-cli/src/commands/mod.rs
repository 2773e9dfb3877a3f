//! CLI command implementations.

pub mod command;
pub mod script;
pub mod send;
pub mod version;
