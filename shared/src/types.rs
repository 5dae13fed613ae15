use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MinerId(pub String);

impl MinerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MinerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a candidate block before it is solved: the hash the issuer
/// assigned to it. Broadcast events reference tasks by this value.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PreliminaryHash(pub String);

impl Display for PreliminaryHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PreliminaryHash {
    fn from(value: &str) -> Self {
        PreliminaryHash(value.to_string())
    }
}
