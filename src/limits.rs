use crate::model::Ms;

// ── Organizations ────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

// ── Resource directory ───────────────────────────────────────────

pub const MAX_RESOURCES_PER_TENANT: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LOCATION_LEN: usize = 256;

// ── Bookings ─────────────────────────────────────────────────────

/// Counts every booking kept on a timeline, cancelled ones included.
pub const MAX_BOOKINGS_PER_RESOURCE: usize = 100_000;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4_096;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single booking may not be longer than 366 days.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

// ── Listing ──────────────────────────────────────────────────────

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 500;
