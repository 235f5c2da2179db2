use crate::{
    error::SerializeError,
    provider::{Column, Section},
};
use common::{
    consts::{MAX_DIMENSION_ID_LEN, MAX_SECTION_DATA_SIZE},
    DimensionId,
};
use common_net::msg::{ChunkSection, LightLayer};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;
use vek::*;

/// Current wall-clock time in epoch seconds, used to stamp columns served
/// straight from memory.
pub fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn serialize_section(
    dimension: &DimensionId,
    key: Vec2<i32>,
    section: &Section,
    column_timestamp: i64,
    send_light: bool,
) -> Result<ChunkSection, SerializeError> {
    if section.data.len() > MAX_SECTION_DATA_SIZE {
        return Err(SerializeError::DataTooLarge {
            len: section.data.len(),
            max: MAX_SECTION_DATA_SIZE,
        });
    }
    let dim_len = dimension.as_str().len();
    if dim_len > MAX_DIMENSION_ID_LEN {
        return Err(SerializeError::DimensionTooLong {
            len: dim_len,
            max: MAX_DIMENSION_ID_LEN,
        });
    }

    let (block_light, sky_light) = if send_light {
        (
            LightLayer::from_nibbles(section.block_light.as_deref()),
            LightLayer::from_nibbles(section.sky_light.as_deref()),
        )
    } else {
        (LightLayer::Absent, LightLayer::Absent)
    };

    Ok(ChunkSection {
        x: key.x,
        section_y: section.y,
        z: key.y,
        dimension: dimension.clone(),
        data: section.data.clone(),
        block_light,
        sky_light,
        column_timestamp,
    })
}

/// Serializes every non-empty section of a column. Sections that cannot be
/// represented are logged and left out.
pub fn serialize_column(
    dimension: &DimensionId,
    key: Vec2<i32>,
    column: &Column,
    column_timestamp: i64,
    send_light: bool,
) -> Vec<ChunkSection> {
    column
        .non_empty_sections()
        .filter_map(
            |section| match serialize_section(dimension, key, section, column_timestamp, send_light) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(%e, ?key, y = section.y, "Skipping section that cannot be sent");
                    None
                },
            },
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::consts::LIGHT_LAYER_BYTES;

    fn section(y: i32, empty: bool) -> Section {
        Section {
            y,
            data: Bytes::from(vec![y as u8; 16]),
            empty,
            block_light: Some(Bytes::from(vec![0x33; LIGHT_LAYER_BYTES])),
            sky_light: None,
        }
    }

    #[test]
    fn skips_empty_and_oversized_sections() {
        let mut oversized = section(3, false);
        oversized.data = Bytes::from(vec![0; MAX_SECTION_DATA_SIZE + 1]);
        let column = Column {
            sections: vec![section(0, false), section(1, true), section(2, false), oversized],
        };
        let dim = DimensionId::new("overworld");
        let out = serialize_column(&dim, Vec2::new(4, -9), &column, 77, true);
        assert_eq!(out.iter().map(|s| s.section_y).collect::<Vec<_>>(), vec![0, 2]);
        assert!(out.iter().all(|s| s.x == 4 && s.z == -9 && s.column_timestamp == 77));
        assert_eq!(out[0].block_light, LightLayer::Uniform(3));
        assert_eq!(out[0].sky_light, LightLayer::Absent);
    }

    #[test]
    fn light_can_be_disabled() {
        let dim = DimensionId::new("overworld");
        let s = serialize_section(&dim, Vec2::zero(), &section(0, false), 1, false).unwrap();
        assert_eq!(s.block_light, LightLayer::Absent);
    }

    #[test]
    fn long_dimension_is_rejected() {
        let dim = DimensionId::new("x".repeat(MAX_DIMENSION_ID_LEN + 1));
        assert!(matches!(
            serialize_section(&dim, Vec2::zero(), &section(0, false), 1, true),
            Err(SerializeError::DimensionTooLong { .. })
        ));
    }
}
