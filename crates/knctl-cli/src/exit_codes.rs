//! Process exit codes
//!
//! Failures are not classified beyond success/failure, except for argument
//! errors which follow sysexits.h.

/// Success - operation completed without errors
pub const SUCCESS: i32 = 0;

/// Any failure of the requested operation
pub const ERROR: i32 = 1;

/// Usage error - invalid arguments or options
pub const USAGE_ERROR: i32 = 64;
