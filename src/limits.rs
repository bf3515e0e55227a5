//! Hard limits enforced by the engine and the tenant manager.

use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

pub const MAX_SPACES_PER_TENANT: usize = 10_000;
pub const MAX_RESERVATIONS_PER_SPACE: usize = 100_000;
pub const MAX_PASSES_PER_TENANT: usize = 1_000_000;
pub const MAX_SESSIONS_PER_PASS: u32 = 10_000;
pub const MAX_SESSION_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_TRAINERS_PER_PASS: usize = 32;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CLIENT_ID_LEN: usize = 128;

/// 1970-01-01 .. 2100-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_RESERVATION_DURATION_MS: Ms = 31 * DAY_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

/// How long a single attempt waits for a space or pass write lock.
pub const LOCK_WAIT_MS: u64 = 2_000;
/// Lock attempts before a write gives up with `ConcurrentConflict`.
pub const MAX_LOCK_ATTEMPTS: u32 = 3;
