//! Stable addresses for reactive elements.
//!
//! Every stage belongs to exactly one reactive block and carries a scoped id
//! unique within that block. Stages are never shared by value; other blocks
//! and the monitor refer to them only through a [`ReactiveIdentifier`].

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a reactive block (the actor owning a set of stages).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(Uuid);

impl BlockId {
    /// Create a new random block id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Short, stable hash used in trace tokens.
    #[must_use]
    pub fn short_hash(&self) -> String {
        let hash = blake3::hash(self.0.as_bytes());
        hash.to_hex().as_str()[..8].to_string()
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.short_hash())
    }
}

/// The part a stage plays in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Produces packets on demand.
    Publisher,
    /// Consumes packets and issues pulls.
    Subscriber,
    /// Both: subscribes upstream, publishes downstream.
    Stream,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Publisher => "publisher",
            Self::Subscriber => "subscriber",
            Self::Stream => "stream",
        };
        f.write_str(s)
    }
}

/// Kind of stage behind an identifier.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Source,
    Map,
    FlatMap,
    Distinct,
    Buffer,
    Merge,
    Sink,
}

impl ElementKind {
    /// Role implied by this kind of stage.
    #[must_use]
    pub const fn role(self) -> Role {
        match self {
            Self::Source => Role::Publisher,
            Self::Sink => Role::Subscriber,
            Self::Map | Self::FlatMap | Self::Distinct | Self::Buffer | Self::Merge => Role::Stream,
        }
    }

    /// Whether stages of this kind accept pulls.
    #[must_use]
    pub const fn publishes(self) -> bool {
        !matches!(self.role(), Role::Subscriber)
    }

    /// Whether stages of this kind accept packets.
    #[must_use]
    pub const fn subscribes(self) -> bool {
        !matches!(self.role(), Role::Publisher)
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Source => "Source",
            Self::Map => "Map",
            Self::FlatMap => "FlatMap",
            Self::Distinct => "Distinct",
            Self::Buffer => "Buffer",
            Self::Merge => "Merge",
            Self::Sink => "Sink",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Address of a stage: `(owner block, element kind, scoped id)`.
///
/// Equality and hashing are structural. The type is `Copy` because it is
/// looked up on every pull and every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReactiveIdentifier {
    owner: BlockId,
    element: ElementKind,
    scoped_id: u64,
}

impl ReactiveIdentifier {
    /// Build an identifier.
    #[must_use]
    pub const fn new(owner: BlockId, element: ElementKind, scoped_id: u64) -> Self {
        Self {
            owner,
            element,
            scoped_id,
        }
    }

    /// The block that owns this stage.
    #[must_use]
    pub const fn owner(&self) -> BlockId {
        self.owner
    }

    /// The stage kind.
    #[must_use]
    pub const fn element(&self) -> ElementKind {
        self.element
    }

    /// The role of the stage.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.element.role()
    }

    /// Id unique within the owning block.
    #[must_use]
    pub const fn scoped_id(&self) -> u64 {
        self.scoped_id
    }
}

impl fmt::Display for ReactiveIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.owner, self.element, self.scoped_id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_identity_is_structural() {
        let block = BlockId::new();
        let a = ReactiveIdentifier::new(block, ElementKind::Map, 3);
        let b = ReactiveIdentifier::new(block, ElementKind::Map, 3);
        let c = ReactiveIdentifier::new(block, ElementKind::Map, 4);
        let d = ReactiveIdentifier::new(BlockId::new(), ElementKind::Map, 3);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);

        let set: HashSet<_> = [a, b, c, d].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_trace_token_is_deterministic() {
        let block = BlockId::from_uuid(Uuid::nil());
        let id = ReactiveIdentifier::new(block, ElementKind::FlatMap, 7);
        let token = id.to_string();
        assert_eq!(token, id.to_string());
        assert!(token.starts_with('@'));
        assert!(token.ends_with(":FlatMap:7"));
        assert_eq!(token.len(), "@".len() + 8 + ":FlatMap:7".len());
    }

    #[test]
    fn test_roles() {
        assert_eq!(ElementKind::Source.role(), Role::Publisher);
        assert_eq!(ElementKind::Sink.role(), Role::Subscriber);
        assert_eq!(ElementKind::Buffer.role(), Role::Stream);
        assert!(ElementKind::Merge.publishes());
        assert!(ElementKind::Merge.subscribes());
        assert!(!ElementKind::Source.subscribes());
        assert!(!ElementKind::Sink.publishes());
    }
}
