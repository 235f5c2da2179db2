use super::codec::{self, DecodeError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use common::consts::{MAX_CANCEL_BATCH_IDS, MAX_CHUNK_REQUEST_POSITIONS};

const TAG_HANDSHAKE: u8 = 0;
const TAG_CHUNK_REQUEST: u8 = 1;
const TAG_CANCEL_REQUEST: u8 = 2;

/// A batch of packed column positions with the timestamps the client
/// already holds for them (0 when it holds nothing).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkRequest {
    pub batch_id: i32,
    pub positions: Vec<i64>,
    pub timestamps: Vec<i64>,
}

/// Messages sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientGeneral {
    Handshake { protocol_version: i32 },
    ChunkRequest(ChunkRequest),
    CancelRequest { batch_ids: Vec<i32> },
}

impl ClientGeneral {
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Self::Handshake { protocol_version } => {
                buf.put_u8(TAG_HANDSHAKE);
                codec::put_varint(buf, *protocol_version);
            },
            Self::ChunkRequest(req) => {
                buf.put_u8(TAG_CHUNK_REQUEST);
                codec::put_varint(buf, req.batch_id);
                codec::put_varint(buf, req.positions.len() as i32);
                for pos in &req.positions {
                    buf.put_i64(*pos);
                }
                // Timestamps always match the position count on the wire.
                for i in 0..req.positions.len() {
                    buf.put_i64(req.timestamps.get(i).copied().unwrap_or(0));
                }
            },
            Self::CancelRequest { batch_ids } => {
                buf.put_u8(TAG_CANCEL_REQUEST);
                codec::put_varint(buf, batch_ids.len() as i32);
                for id in batch_ids {
                    codec::put_varint(buf, *id);
                }
            },
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes one message from a complete frame. Oversized lists are
    /// truncated to their protocol maximum after all declared elements have
    /// been consumed.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        match codec::get_u8(buf)? {
            TAG_HANDSHAKE => Ok(Self::Handshake {
                protocol_version: codec::get_varint(buf)?,
            }),
            TAG_CHUNK_REQUEST => {
                let batch_id = codec::get_varint(buf)?;
                let (declared, kept) = codec::get_list_len(buf, MAX_CHUNK_REQUEST_POSITIONS)?;
                let positions = codec::get_i64_list(buf, declared, kept)?;
                let timestamps = if buf.has_remaining() {
                    codec::get_i64_list(buf, declared, kept)?
                } else {
                    vec![0; kept]
                };
                Ok(Self::ChunkRequest(ChunkRequest {
                    batch_id,
                    positions,
                    timestamps,
                }))
            },
            TAG_CANCEL_REQUEST => {
                let (declared, kept) = codec::get_list_len(buf, MAX_CANCEL_BATCH_IDS)?;
                let mut batch_ids = Vec::with_capacity(kept);
                for i in 0..declared {
                    let id = codec::get_varint(buf)?;
                    if i < kept {
                        batch_ids.push(id);
                    }
                }
                Ok(Self::CancelRequest { batch_ids })
            },
            tag => Err(DecodeError::UnknownTag(tag)),
        }
    }
}
