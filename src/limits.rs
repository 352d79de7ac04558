use crate::model::Ms;

pub const MAX_BATCH_SIZE: usize = 256;
pub const MAX_WINDOWS_PER_PROFESSIONAL: usize = 10_000;
pub const MAX_ACCOUNTS_PER_TENANT: usize = 100_000;
pub const MAX_ATTENDANCES_PER_TENANT: usize = 1_000_000;

/// 24 hours.
pub const MAX_WINDOW_DURATION_MS: Ms = 86_400_000;
/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MAX_NOTE_LEN: usize = 4096;
pub const MAX_FEEDBACK_LEN: usize = 4096;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DURATION_MINUTES: u32 = 1440;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;
