//! CLI command modules.

pub mod codes;
pub mod http;
pub mod status;
