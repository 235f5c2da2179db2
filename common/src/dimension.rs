use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// Identifies one world dimension, e.g. `overworld` or `nether`. Cheap to
/// clone since it is attached to every queued job.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DimensionId(Arc<str>);

impl DimensionId {
    pub fn new(id: impl AsRef<str>) -> Self { Self(Arc::from(id.as_ref())) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for DimensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for DimensionId {
    fn from(id: &str) -> Self { Self::new(id) }
}

impl From<String> for DimensionId {
    fn from(id: String) -> Self { Self(Arc::from(id)) }
}
