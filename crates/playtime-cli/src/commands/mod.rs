//! CLI command implementations.

pub mod reset;
pub mod serve;
pub mod status;
pub mod util;
