use super::codec::{self, DecodeError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use common::{
    consts::{
        LIGHT_LAYER_BYTES, MAX_DIMENSION_ID_LEN, MAX_DIRTY_COLUMN_POSITIONS,
        MAX_SECTION_DATA_SIZE, SECTION_OVERHEAD_BYTES,
    },
    DimensionId,
};

const TAG_SESSION_CONFIG: u8 = 0;
const TAG_CHUNK_SECTION: u8 = 1;
const TAG_COLUMN_UP_TO_DATE: u8 = 2;
const TAG_REQUEST_COMPLETE: u8 = 3;
const TAG_DIRTY_COLUMNS: u8 = 4;

const LIGHT_BLOCK_FULL: u8 = 0x01;
const LIGHT_SKY_FULL: u8 = 0x02;
const LIGHT_BLOCK_UNIFORM: u8 = 0x04;
const LIGHT_SKY_UNIFORM: u8 = 0x08;

/// Parameters the server advertises in reply to a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub protocol_version: i32,
    pub enabled: bool,
    pub view_distance: i32,
    pub max_requests_per_batch: i32,
    pub max_pending_requests: i32,
    /// Empty columns the client may re-request per batch so they get
    /// generated. 0 means the server will not generate.
    pub generation_budget: i32,
    pub generation_distance: i32,
}

/// One light channel of a section.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LightLayer {
    #[default]
    Absent,
    /// Every block has this light level (low nibble).
    Uniform(u8),
    /// Packed nibbles, exactly [`LIGHT_LAYER_BYTES`] long.
    Full(Bytes),
}

impl LightLayer {
    /// Collapses a nibble array into the most compact representation.
    pub fn from_nibbles(nibbles: Option<&[u8]>) -> Self {
        match nibbles {
            Some(data) if data.len() == LIGHT_LAYER_BYTES => {
                if data.iter().all(|b| *b == data[0]) {
                    Self::Uniform(data[0] & 0x0F)
                } else {
                    Self::Full(Bytes::copy_from_slice(data))
                }
            },
            _ => Self::Absent,
        }
    }

    /// Expands to a full nibble array, as consumers expect it.
    pub fn expand(&self) -> Option<Vec<u8>> {
        match self {
            Self::Absent => None,
            Self::Uniform(v) => {
                let v = v & 0x0F;
                Some(vec![v | (v << 4); LIGHT_LAYER_BYTES])
            },
            Self::Full(data) => Some(data.to_vec()),
        }
    }

    fn flags(&self, full: u8, uniform: u8) -> u8 {
        match self {
            Self::Absent => 0,
            Self::Uniform(_) => uniform,
            Self::Full(_) => full,
        }
    }
}

/// A single serialized section of a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSection {
    pub x: i32,
    pub section_y: i32,
    pub z: i32,
    pub dimension: DimensionId,
    /// Opaque terrain payload, at most [`MAX_SECTION_DATA_SIZE`] bytes.
    pub data: Bytes,
    pub block_light: LightLayer,
    pub sky_light: LightLayer,
    /// Server modification time of the column, epoch seconds.
    pub column_timestamp: i64,
}

impl ChunkSection {
    /// Bytes charged against bandwidth budgets for this section.
    pub fn encoded_cost(&self) -> usize { self.data.len() + SECTION_OVERHEAD_BYTES }

    pub fn light_flags(&self) -> u8 {
        self.block_light.flags(LIGHT_BLOCK_FULL, LIGHT_BLOCK_UNIFORM)
            | self.sky_light.flags(LIGHT_SKY_FULL, LIGHT_SKY_UNIFORM)
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.x);
        buf.put_i32(self.section_y);
        buf.put_i32(self.z);
        codec::put_str(buf, self.dimension.as_str());
        codec::put_byte_array(buf, &self.data);
        buf.put_u8(self.light_flags());
        match &self.block_light {
            LightLayer::Full(data) => buf.put_slice(data),
            LightLayer::Uniform(v) => buf.put_u8(*v),
            LightLayer::Absent => {},
        }
        match &self.sky_light {
            LightLayer::Full(data) => buf.put_slice(data),
            LightLayer::Uniform(v) => buf.put_u8(*v),
            LightLayer::Absent => {},
        }
        buf.put_i64(self.column_timestamp);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        let x = codec::get_i32(buf)?;
        let section_y = codec::get_i32(buf)?;
        let z = codec::get_i32(buf)?;
        let dimension = DimensionId::from(codec::get_str(buf, MAX_DIMENSION_ID_LEN)?);
        let data = Bytes::from(codec::get_byte_array(buf, MAX_SECTION_DATA_SIZE)?);
        let flags = codec::get_u8(buf)?;

        let mut block_light = LightLayer::Absent;
        let mut sky_light = LightLayer::Absent;
        if flags & LIGHT_BLOCK_FULL != 0 {
            block_light = LightLayer::Full(codec::get_fixed(buf, LIGHT_LAYER_BYTES)?.into());
        }
        if flags & LIGHT_BLOCK_UNIFORM != 0 {
            let v = codec::get_u8(buf)?;
            if !matches!(block_light, LightLayer::Full(_)) {
                block_light = LightLayer::Uniform(v);
            }
        }
        if flags & LIGHT_SKY_FULL != 0 {
            sky_light = LightLayer::Full(codec::get_fixed(buf, LIGHT_LAYER_BYTES)?.into());
        }
        if flags & LIGHT_SKY_UNIFORM != 0 {
            let v = codec::get_u8(buf)?;
            if !matches!(sky_light, LightLayer::Full(_)) {
                sky_light = LightLayer::Uniform(v);
            }
        }
        let column_timestamp = if buf.has_remaining() {
            codec::get_i64(buf)?
        } else {
            0
        };

        Ok(Self {
            x,
            section_y,
            z,
            dimension,
            data,
            block_light,
            sky_light,
            column_timestamp,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    Done,
    Cancelled,
    Rejected,
}

impl RequestStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Done => 0,
            Self::Cancelled => 1,
            Self::Rejected => 2,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, DecodeError> {
        match code {
            0 => Ok(Self::Done),
            1 => Ok(Self::Cancelled),
            2 => Ok(Self::Rejected),
            _ => Err(DecodeError::UnknownStatus(code)),
        }
    }
}

/// Messages sent from the server to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerGeneral {
    SessionConfig(SessionConfig),
    ChunkSection(ChunkSection),
    /// The client's cached copy of this column is still current.
    ColumnUpToDate { x: i32, z: i32 },
    RequestComplete { batch_id: i32, status: RequestStatus },
    /// Packed positions saved since the last notice. Clients re-request them
    /// if they hold a copy.
    DirtyColumns { positions: Vec<i64> },
}

impl ServerGeneral {
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Self::SessionConfig(cfg) => {
                buf.put_u8(TAG_SESSION_CONFIG);
                codec::put_varint(buf, cfg.protocol_version);
                buf.put_u8(cfg.enabled as u8);
                codec::put_varint(buf, cfg.view_distance);
                codec::put_varint(buf, cfg.max_requests_per_batch);
                codec::put_varint(buf, cfg.max_pending_requests);
                codec::put_varint(buf, cfg.generation_budget);
                codec::put_varint(buf, cfg.generation_distance);
            },
            Self::ChunkSection(section) => {
                buf.put_u8(TAG_CHUNK_SECTION);
                section.encode(buf);
            },
            Self::ColumnUpToDate { x, z } => {
                buf.put_u8(TAG_COLUMN_UP_TO_DATE);
                buf.put_i32(*x);
                buf.put_i32(*z);
            },
            Self::RequestComplete { batch_id, status } => {
                buf.put_u8(TAG_REQUEST_COMPLETE);
                codec::put_varint(buf, *batch_id);
                codec::put_varint(buf, status.code());
            },
            Self::DirtyColumns { positions } => {
                buf.put_u8(TAG_DIRTY_COLUMNS);
                codec::put_varint(buf, positions.len() as i32);
                for pos in positions {
                    buf.put_i64(*pos);
                }
            },
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        match codec::get_u8(buf)? {
            TAG_SESSION_CONFIG => Ok(Self::SessionConfig(SessionConfig {
                protocol_version: codec::get_varint(buf)?,
                enabled: codec::get_bool(buf)?,
                view_distance: codec::get_varint(buf)?,
                max_requests_per_batch: codec::get_varint(buf)?,
                max_pending_requests: codec::get_varint(buf)?,
                generation_budget: codec::get_varint(buf)?,
                generation_distance: codec::get_varint(buf)?,
            })),
            TAG_CHUNK_SECTION => Ok(Self::ChunkSection(ChunkSection::decode(buf)?)),
            TAG_COLUMN_UP_TO_DATE => Ok(Self::ColumnUpToDate {
                x: codec::get_i32(buf)?,
                z: codec::get_i32(buf)?,
            }),
            TAG_REQUEST_COMPLETE => Ok(Self::RequestComplete {
                batch_id: codec::get_varint(buf)?,
                status: RequestStatus::from_code(codec::get_varint(buf)?)?,
            }),
            TAG_DIRTY_COLUMNS => {
                let (declared, kept) = codec::get_list_len(buf, MAX_DIRTY_COLUMN_POSITIONS)?;
                Ok(Self::DirtyColumns {
                    positions: codec::get_i64_list(buf, declared, kept)?,
                })
            },
            tag => Err(DecodeError::UnknownTag(tag)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(block_light: LightLayer, sky_light: LightLayer) -> ChunkSection {
        ChunkSection {
            x: -3,
            section_y: -4,
            z: 17,
            dimension: DimensionId::new("minecraft:overworld"),
            data: Bytes::from_static(&[1, 2, 3, 4, 5]),
            block_light,
            sky_light,
            column_timestamp: 1_700_000_123,
        }
    }

    #[test]
    fn section_light_variants_roundtrip() {
        let mut gradient = vec![0u8; LIGHT_LAYER_BYTES];
        gradient.iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
        let full = LightLayer::from_nibbles(Some(&gradient));
        assert!(matches!(full, LightLayer::Full(_)));

        for (block, sky) in [
            (LightLayer::Absent, LightLayer::Absent),
            (LightLayer::Uniform(3), LightLayer::Uniform(15)),
            (full.clone(), LightLayer::Uniform(0)),
            (LightLayer::Absent, full),
        ] {
            let msg = ServerGeneral::ChunkSection(section(block, sky));
            let mut bytes = msg.to_bytes();
            assert_eq!(ServerGeneral::decode(&mut bytes), Ok(msg));
            assert!(bytes.is_empty());
        }
    }

    #[test]
    fn light_flags() {
        let sky = LightLayer::Full(Bytes::from(vec![0; LIGHT_LAYER_BYTES]));
        let s = section(LightLayer::Uniform(1), sky);
        assert_eq!(s.light_flags(), LIGHT_BLOCK_UNIFORM | LIGHT_SKY_FULL);
        assert_eq!(s.encoded_cost(), 25);
    }

    #[test]
    fn uniform_light_collapses_and_expands() {
        let data = vec![0x77u8; LIGHT_LAYER_BYTES];
        let layer = LightLayer::from_nibbles(Some(&data));
        assert_eq!(layer, LightLayer::Uniform(7));
        assert_eq!(layer.expand(), Some(data));
        assert_eq!(LightLayer::from_nibbles(Some(&[1, 2])), LightLayer::Absent);
        assert_eq!(LightLayer::from_nibbles(None).expand(), None);
    }

    #[test]
    fn section_without_timestamp() {
        let msg = ServerGeneral::ChunkSection(section(LightLayer::Absent, LightLayer::Absent));
        let bytes = msg.to_bytes();
        let mut short = bytes.slice(..bytes.len() - 8);
        match ServerGeneral::decode(&mut short) {
            Ok(ServerGeneral::ChunkSection(s)) => assert_eq!(s.column_timestamp, 0),
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn oversized_dirty_columns_truncated() {
        let msg = ServerGeneral::DirtyColumns {
            positions: (0..5000).collect(),
        };
        let mut bytes = msg.to_bytes();
        match ServerGeneral::decode(&mut bytes) {
            Ok(ServerGeneral::DirtyColumns { positions }) => {
                assert_eq!(positions.len(), MAX_DIRTY_COLUMN_POSITIONS);
                assert_eq!(positions[4095], 4095);
            },
            other => panic!("unexpected decode result: {:?}", other),
        }
        assert!(bytes.is_empty());
    }

    #[test]
    fn session_config_and_status_roundtrip() {
        let msgs = [
            ServerGeneral::SessionConfig(SessionConfig {
                protocol_version: 5,
                enabled: true,
                view_distance: 128,
                max_requests_per_batch: 256,
                max_pending_requests: 512,
                generation_budget: 8,
                generation_distance: 64,
            }),
            ServerGeneral::RequestComplete {
                batch_id: 99,
                status: RequestStatus::Rejected,
            },
            ServerGeneral::ColumnUpToDate { x: -1, z: i32::MAX },
        ];
        for msg in msgs {
            let mut bytes = msg.to_bytes();
            assert_eq!(ServerGeneral::decode(&mut bytes), Ok(msg));
            assert!(bytes.is_empty());
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_REQUEST_COMPLETE);
        codec::put_varint(&mut buf, 1);
        codec::put_varint(&mut buf, 7);
        let mut bytes = buf.freeze();
        assert_eq!(ServerGeneral::decode(&mut bytes), Err(DecodeError::UnknownStatus(7)));
    }

    #[test]
    fn oversized_dimension_is_rejected() {
        let mut s = section(LightLayer::Absent, LightLayer::Absent);
        s.dimension = DimensionId::new("d".repeat(MAX_DIMENSION_ID_LEN + 1));
        let mut bytes = ServerGeneral::ChunkSection(s).to_bytes();
        assert!(matches!(
            ServerGeneral::decode(&mut bytes),
            Err(DecodeError::TooLong { .. })
        ));
    }
}
