pub mod msg;

pub use msg::{
    ChunkRequest, ChunkSection, ClientGeneral, DecodeError, LightLayer, RequestStatus,
    ServerGeneral, SessionConfig,
};
