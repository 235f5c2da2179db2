//! Types shared by the streaming server and client: column addressing,
//! identifiers and the protocol limits both sides agree on.

pub mod consts;
pub mod dimension;
pub mod pos;
pub mod uid;

pub use dimension::DimensionId;
pub use pos::{column_distance, pack_column, unpack_column, within_distance};
pub use uid::ClientId;
