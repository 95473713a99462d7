//! Provenance: diagnostic tags attached to operations.
//!
//! A provenance string carries a human-readable part and an optional
//! machine-readable part, split at the reserved `$` delimiter. Provenance is
//! immutable and shared: many operations issued from the same source
//! location hold one instance. It never influences scheduling decisions.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// An immutable (human string, machine string) diagnostic tag.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Provenance {
    human: String,
    machine: String,
}

/// Wire form of an optional provenance: the leading existence flag is the
/// `Option` discriminant.
pub type PackedProvenance = Option<(String, String)>;

impl Provenance {
    /// Delimiter separating the human part from the machine part.
    pub const DELIMITER: char = '$';

    /// Creates a provenance by splitting `raw` at the first delimiter.
    ///
    /// Text before the delimiter is the human part; text after it is the
    /// machine part. Without a delimiter the whole string is human.
    #[must_use]
    pub fn new(raw: &str) -> Self {
        match raw.split_once(Self::DELIMITER) {
            Some((human, machine)) => Self {
                human: human.to_owned(),
                machine: machine.to_owned(),
            },
            None => Self {
                human: raw.to_owned(),
                machine: String::new(),
            },
        }
    }

    /// Creates a shared provenance from an optional string, the common
    /// construction at operation-initialization sites.
    #[must_use]
    pub fn from_option(raw: Option<&str>) -> Option<Arc<Self>> {
        match raw {
            Some(s) if !s.is_empty() => Some(Arc::new(Self::new(s))),
            _ => None,
        }
    }

    /// Returns the human-readable part.
    #[must_use]
    pub fn human(&self) -> &str {
        &self.human
    }

    /// Returns the machine-readable part.
    #[must_use]
    pub fn machine(&self) -> &str {
        &self.machine
    }

    /// Packs an optional provenance for shipping to a remote node.
    #[must_use]
    pub fn pack(provenance: Option<&Arc<Self>>) -> PackedProvenance {
        provenance.map(|p| (p.human.clone(), p.machine.clone()))
    }

    /// Unpacks a provenance shipped from a remote node.
    #[must_use]
    pub fn unpack(packed: PackedProvenance) -> Option<Arc<Self>> {
        packed.map(|(human, machine)| Arc::new(Self { human, machine }))
    }
}

impl fmt::Debug for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.machine.is_empty() {
            write!(f, "Provenance({:?})", self.human)
        } else {
            write!(f, "Provenance({:?}, {:?})", self.human, self.machine)
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.human)
    }
}

impl Serialize for Provenance {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.human, &self.machine).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Provenance {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (human, machine) = <(String, String)>::deserialize(deserializer)?;
        Ok(Self { human, machine })
    }
}
