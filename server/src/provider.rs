//! Capabilities the host world exposes to the streaming service.

use crate::error::{SendError, StoreError};
use bytes::Bytes;
use common::{ClientId, DimensionId};
use common_net::msg::ServerGeneral;
use vek::*;

/// One vertical slice of a column as the host serializes it.
#[derive(Clone, Debug, Default)]
pub struct Section {
    pub y: i32,
    /// Opaque serialized terrain.
    pub data: Bytes,
    /// Sections holding nothing but air are never sent.
    pub empty: bool,
    pub block_light: Option<Bytes>,
    pub sky_light: Option<Bytes>,
}

#[derive(Clone, Debug, Default)]
pub struct Column {
    pub sections: Vec<Section>,
}

impl Column {
    pub fn non_empty_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|s| !s.empty)
    }
}

/// A column as found in the persistent store.
#[derive(Clone, Debug, Default)]
pub struct StoredColumn {
    /// Only fully generated columns are served from disk; anything else is
    /// treated as missing so it can be generated.
    pub fully_generated: bool,
    /// Modification time recorded inside the record, epoch seconds.
    pub last_update: i64,
    pub column: Column,
}

/// Access to terrain that is resident in memory or being generated. Only
/// called from the tick thread.
pub trait WorldAccess {
    fn loaded_column(&self, dimension: &DimensionId, key: Vec2<i32>) -> Option<Column>;

    /// Starts generating a column. Completion is observed through
    /// [`WorldAccess::loaded_column`] or a generation notice.
    fn request_generation(&self, dimension: &DimensionId, key: Vec2<i32>);

    /// Drops whatever the host holds to keep a requested column alive.
    fn release_generation(&self, dimension: &DimensionId, key: Vec2<i32>);
}

/// Read access to the persistent column store. Called from disk reader
/// threads.
pub trait ColumnStore: Send + Sync {
    /// Cheap freshness marker of a column in epoch seconds, 0 when unknown.
    fn read_timestamp(&self, dimension: &DimensionId, key: Vec2<i32>) -> i64;

    fn read_column(
        &self,
        dimension: &DimensionId,
        key: Vec2<i32>,
    ) -> Result<Option<StoredColumn>, StoreError>;
}

/// Outbound message path to connected clients.
pub trait ClientSink {
    fn send(&mut self, client: ClientId, msg: ServerGeneral) -> Result<(), SendError>;
}
