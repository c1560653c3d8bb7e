//! # Innate Primitives
//!
//! Hardcoded limits for the keel CORE.
//!
//! These are compiled into the binary. `EngineConfig` may tighten the
//! predicate depth and channel capacity at runtime, but never disables them.

/// Maximum nesting depth of a predicate (rule `validation` payloads and
/// transition guards).
///
/// - Evaluation past this depth stops with `EvalError::DepthExceeded`.
/// - Pathological definitions become `indeterminate`, they never hang.
pub const MAX_PREDICATE_DEPTH: usize = 32;

/// Maximum length of a single key segment (module, group, option, ...).
pub const MAX_KEY_LENGTH: usize = 128;

/// Characters reserved as separators in rendered identities.
///
/// `video/decoder/hdr#needs-h264`, `video@idle:ENABLE`, `demo:video/decoder/hdr`.
pub const KEY_SEPARATORS: [char; 4] = ['/', ':', '#', '@'];

/// Default capacity of the change-notification broadcast channel.
///
/// Subscribers that fall further behind than this lose the oldest
/// notifications and are told how many were skipped.
pub const NOTIFICATION_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum size of a JSON snapshot accepted by `snapshot_from_json` (64 MB).
///
/// Checked BEFORE parsing.
pub const MAX_SNAPSHOT_BYTES: usize = 64 * 1024 * 1024;

/// Maximum number of modules in a single `assemble` request.
pub const MAX_ASSEMBLE_MODULES: usize = 256;
