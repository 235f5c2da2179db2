use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection-scoped client identifier assigned by the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl From<u64> for ClientId {
    fn from(id: u64) -> Self { Self(id) }
}
