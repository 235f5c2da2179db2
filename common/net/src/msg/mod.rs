//! Messages exchanged between the streaming client and server.
//!
//! Every message is framed by the transport; inside the frame the first byte
//! is a tag selecting the variant, followed by the variant body.

pub mod client;
mod codec;
pub mod server;

pub use self::{
    client::{ChunkRequest, ClientGeneral},
    codec::DecodeError,
    server::{ChunkSection, LightLayer, RequestStatus, ServerGeneral, SessionConfig},
};
