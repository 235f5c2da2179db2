/// Bumped whenever a message layout changes. Client and server must agree
/// exactly, otherwise the session stays disabled.
pub const PROTOCOL_VERSION: i32 = 5;

pub const TICKS_PER_SECOND: u64 = 20;

// Wire list caps. Longer lists are truncated by the decoder.
pub const MAX_CHUNK_REQUEST_POSITIONS: usize = 1024;
pub const MAX_CANCEL_BATCH_IDS: usize = 256;
pub const MAX_DIRTY_COLUMN_POSITIONS: usize = 4096;

pub const MAX_DIMENSION_ID_LEN: usize = 256;
pub const MAX_SECTION_DATA_SIZE: usize = 1024 * 1024;

/// One nibble per block of a 16x16x16 section.
pub const LIGHT_LAYER_BYTES: usize = 2048;

/// Approximate per-message overhead added to the payload size when a section
/// is charged against a bandwidth budget.
pub const SECTION_OVERHEAD_BYTES: usize = 20;
pub const COLUMN_UP_TO_DATE_COST: usize = 8;
