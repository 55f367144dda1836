use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_SLOT_CAPACITY: u32 = 1_000;

pub const MAX_SERVICES_PER_STUDY: usize = 1_000;
pub const MAX_SLOTS_PER_STUDY: usize = 200_000;
pub const MAX_BOOKINGS_PER_STUDY: usize = 1_000_000;
pub const MAX_PARTICIPANTS_PER_STUDY: usize = 200_000;

pub const MAX_STUDIES: usize = 64;
pub const MAX_STUDY_NAME_LEN: usize = 128;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
