use crate::model::Ms;

/// One calendar day in ms.
pub const DAY_MS: Ms = 86_400_000;

/// Longest stay a single booking may cover.
pub const MAX_STAY_NIGHTS: i64 = 365;

// 2000-01-01T00:00:00Z .. 2200-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Widest window accepted by free-window queries (two years).
pub const MAX_QUERY_WINDOW_MS: Ms = 2 * 366 * DAY_MS;

pub const MAX_ROOMS_PER_TENANT: usize = 10_000;
pub const MAX_BOOKINGS_PER_ROOM: usize = 50_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_TEXT_LEN: usize = 4096;
pub const MAX_REF_LEN: usize = 256;
pub const MAX_GUESTS: u32 = 64;

/// Highest nightly room price, in minor currency units.
pub const MAX_PRICE: i64 = 1_000_000_000_000;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

/// Bounded retries when a booking moves rooms between index lookup and lock.
pub const MAX_LOCK_RETRIES: usize = 8;
