//! Freshness markers stored in the header of Anvil region files.
//!
//! Bytes 4096..8192 of `r.<rx>.<rz>.mca` hold one big-endian `u32` epoch
//! second per column, indexed by `(x & 31) + (z & 31) * 32`. Stores backed by
//! region files can answer [`crate::ColumnStore::read_timestamp`] with this
//! instead of decoding the column.

use byteorder::{BigEndian, ReadBytesExt};
use std::{
    fs::File,
    io::{self, Seek, SeekFrom},
    path::{Path, PathBuf},
};
use vek::*;

const TIMESTAMP_TABLE_OFFSET: u64 = 4096;
const REGION_SHIFT: i32 = 5;
const REGION_MASK: i32 = 31;

pub fn region_file_path(region_dir: &Path, key: Vec2<i32>) -> PathBuf {
    region_dir.join(format!(
        "r.{}.{}.mca",
        key.x >> REGION_SHIFT,
        key.y >> REGION_SHIFT
    ))
}

fn timestamp_offset(key: Vec2<i32>) -> u64 {
    let index = (key.x & REGION_MASK) + (key.y & REGION_MASK) * 32;
    TIMESTAMP_TABLE_OFFSET + index as u64 * 4
}

fn try_read_timestamp(region_dir: &Path, key: Vec2<i32>) -> io::Result<i64> {
    let mut file = File::open(region_file_path(region_dir, key))?;
    let offset = timestamp_offset(key);
    if file.metadata()?.len() < offset + 4 {
        return Ok(0);
    }
    file.seek(SeekFrom::Start(offset))?;
    Ok(file.read_u32::<BigEndian>()? as i64)
}

/// Returns the header timestamp of a column, or 0 when the region file is
/// missing, too short or unreadable.
pub fn read_region_timestamp(region_dir: &Path, key: Vec2<i32>) -> i64 {
    try_read_timestamp(region_dir, key).unwrap_or(0)
}
