// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Opaque identifier types for graph entities.
//!
//! Every node and edge in a story graph carries a randomly generated 128-bit
//! [`uuid::Uuid`] rather than a content-addressed hash: unlike a rewriting
//! engine's nodes, story entities are authored once by name and then mutated
//! in place for the life of a playthrough, so there is nothing stable to hash
//! them from. Digests (see [`crate::patch`] and [`crate::snapshot`]) are
//! computed over the graph's *contents*, keyed by these ids, instead.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a node (an `Entity`) in a story graph.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

/// Identifies an edge connecting two nodes.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub Uuid);

/// Identifies a provisioning requirement.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequirementId(pub Uuid);

/// Identifies a single tick (one `step()` call) within a graph's history.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TickId(pub Uuid);

/// Identifies a story graph instance (a playthrough).
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GraphId(pub Uuid);

macro_rules! impl_id {
    ($ty:ident, $prefix:literal) => {
        impl $ty {
            /// Generates a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID, e.g. one deserialized from a script.
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $ty {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "({})"), self.0)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $ty {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

impl_id!(NodeId, "NodeId");
impl_id!(EdgeId, "EdgeId");
impl_id!(RequirementId, "RequirementId");
impl_id!(TickId, "TickId");
impl_id!(GraphId, "GraphId");

/// A 256-bit BLAKE3 digest, used for canonical patch and snapshot hashes.
pub type Digest = [u8; 32];

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn ids_of_different_kinds_with_the_same_uuid_do_not_compare_equal_across_types() {
        // The type system, not the value, is what keeps these apart: this test
        // just pins down that wrapping is zero-cost and round-trips.
        let raw = Uuid::new_v4();
        let node = NodeId::from(raw);
        let edge = EdgeId::from(raw);
        assert_eq!(node.as_uuid(), raw);
        assert_eq!(edge.as_uuid(), raw);
    }

    #[test]
    fn new_ids_are_unique() {
        assert_ne!(NodeId::new(), NodeId::new());
    }

    #[test]
    fn display_matches_uuid_display() {
        let raw = Uuid::new_v4();
        let id = NodeId::from(raw);
        assert_eq!(id.to_string(), raw.to_string());
    }
}
