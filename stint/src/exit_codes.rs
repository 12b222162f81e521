//! Stable exit codes for stint CLI commands.

/// Command succeeded, or the session ended `succeeded`.
pub const OK: i32 = 0;
/// Invalid layout, config or arguments, or any other error.
pub const INVALID: i32 = 1;
/// The session ended `failed` (validation budget exhausted or retries declined).
pub const FAILED: i32 = 2;
/// The session ended `aborted`.
pub const ABORTED: i32 = 3;
/// The feature request is not a single boundable feature.
pub const SCOPE_REJECTED: i32 = 4;
