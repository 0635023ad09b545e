//! Small helpers used by the server lifecycle and dispatch paths.

pub mod addr;
pub mod backoff;
pub mod drain;
pub mod panic;
