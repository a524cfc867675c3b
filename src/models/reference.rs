use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a cook or dish.
///
/// Current catalog records are keyed by UUID. Older carts still carry free-form
/// string ids that never resolve against the catalog or the cook directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reference {
    Id(Uuid),
    Legacy(String),
}

impl Reference {
    pub fn parse(raw: &str) -> Self {
        match Uuid::parse_str(raw.trim()) {
            Ok(id) => Reference::Id(id),
            Err(_) => Reference::Legacy(raw.trim().to_string()),
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Reference::Id(id) => Some(*id),
            Reference::Legacy(_) => None,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Reference::Legacy(_))
    }
}

impl From<Uuid> for Reference {
    fn from(id: Uuid) -> Self {
        Reference::Id(id)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Id(id) => write!(f, "{}", id),
            Reference::Legacy(raw) => write!(f, "{}", raw),
        }
    }
}
