//! Stable exit codes for the factory CLI.

/// The run reached a terminal status (success, failed or ci_timeout).
pub const OK: i32 = 0;
/// Invalid arguments or configuration, failed preflight, or an internal error.
pub const INVALID: i32 = 1;
/// The run was interrupted and recorded as cancelled.
pub const CANCELLED: i32 = 130;
