//! Per-stage bookkeeping of peers and their pull state.
//!
//! A subscriber tracks its publishers in a [`PublisherRegistry`]; a publisher
//! tracks its subscribers in a [`SubscriberRegistry`]. Both come in two shapes,
//! chosen at construction from the expected number of peers:
//!
//! - `Single`: exactly one peer, no hashing, and a second distinct peer is an error.
//! - `Multi`: an arbitrary set of peers.
//!
//! The pulling flags make "at most one outstanding pull per edge" an enforced
//! invariant. Registries are owned by their stage and confined to the stage's
//! block thread, so they are plain collections without synchronization.

use std::collections::{HashMap, HashSet};

use crate::error::RegistryError;
use crate::reactive::identifier::ReactiveIdentifier;

/// Expected number of peers of a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// Exactly one peer.
    Single,
    /// Any number of peers.
    Multi,
}

/// Operations shared by both registry kinds.
pub trait Registry {
    /// Number of registered peers.
    fn size(&self) -> usize;

    /// Whether `peer` has been registered.
    fn contains(&self, peer: &ReactiveIdentifier) -> bool;

    /// Shape selected at construction.
    fn cardinality(&self) -> Cardinality;
}

#[derive(Debug, Clone)]
enum PeerTable {
    Single(Option<(ReactiveIdentifier, bool)>),
    Multi(HashMap<ReactiveIdentifier, bool>),
}

impl PeerTable {
    fn new(cardinality: Cardinality) -> Self {
        match cardinality {
            Cardinality::Single => Self::Single(None),
            Cardinality::Multi => Self::Multi(HashMap::new()),
        }
    }

    fn add(&mut self, peer: ReactiveIdentifier) -> Result<bool, RegistryError> {
        match self {
            Self::Single(slot) => match slot {
                None => {
                    *slot = Some((peer, false));
                    Ok(true)
                }
                Some((existing, _)) if *existing == peer => Ok(false),
                Some((existing, _)) => Err(RegistryError::SinglePeerViolation {
                    existing: *existing,
                    attempted: peer,
                }),
            },
            Self::Multi(peers) => {
                if peers.contains_key(&peer) {
                    return Ok(false);
                }
                peers.insert(peer, false);
                Ok(true)
            }
        }
    }

    fn flag_mut(&mut self, peer: &ReactiveIdentifier) -> Result<&mut bool, RegistryError> {
        let flag = match self {
            Self::Single(Some((existing, pulling))) if existing == peer => Some(pulling),
            Self::Single(_) => None,
            Self::Multi(peers) => peers.get_mut(peer),
        };
        flag.ok_or(RegistryError::UnknownPeer { peer: *peer })
    }

    fn is_pulling(&self, peer: &ReactiveIdentifier) -> bool {
        match self {
            Self::Single(Some((existing, pulling))) => existing == peer && *pulling,
            Self::Single(None) => false,
            Self::Multi(peers) => peers.get(peer).copied().unwrap_or(false),
        }
    }

    fn set_all(&mut self, value: bool) {
        match self {
            Self::Single(Some((_, pulling))) => *pulling = value,
            Self::Single(None) => {}
            Self::Multi(peers) => peers.values_mut().for_each(|pulling| *pulling = value),
        }
    }

    fn matching(&self, pulling: bool) -> HashSet<ReactiveIdentifier> {
        self.iter().filter(|(_, p)| *p == pulling).map(|(id, _)| id).collect()
    }

    fn iter(&self) -> Box<dyn Iterator<Item = (ReactiveIdentifier, bool)> + '_> {
        match self {
            Self::Single(slot) => Box::new(slot.iter().copied()),
            Self::Multi(peers) => Box::new(peers.iter().map(|(id, p)| (*id, *p))),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Single(slot) => usize::from(slot.is_some()),
            Self::Multi(peers) => peers.len(),
        }
    }

    fn contains(&self, peer: &ReactiveIdentifier) -> bool {
        match self {
            Self::Single(slot) => slot.as_ref().is_some_and(|(existing, _)| existing == peer),
            Self::Multi(peers) => peers.contains_key(peer),
        }
    }

    const fn cardinality(&self) -> Cardinality {
        match self {
            Self::Single(_) => Cardinality::Single,
            Self::Multi(_) => Cardinality::Multi,
        }
    }
}

/// Publishers a subscriber is connected to, and which of them it is pulling.
#[derive(Debug, Clone)]
pub struct PublisherRegistry {
    peers: PeerTable,
}

impl PublisherRegistry {
    /// Registry holding exactly one publisher.
    #[must_use]
    pub fn single() -> Self {
        Self::with_cardinality(Cardinality::Single)
    }

    /// Registry holding any number of publishers.
    #[must_use]
    pub fn multi() -> Self {
        Self::with_cardinality(Cardinality::Multi)
    }

    /// Registry of the given shape.
    #[must_use]
    pub fn with_cardinality(cardinality: Cardinality) -> Self {
        Self {
            peers: PeerTable::new(cardinality),
        }
    }

    /// Register a publisher. Returns whether it was newly added.
    pub fn add(&mut self, publisher: ReactiveIdentifier) -> Result<bool, RegistryError> {
        self.peers.add(publisher)
    }

    /// A packet or completion arrived from `publisher`: it is no longer pulled.
    pub fn record_receive(&mut self, publisher: &ReactiveIdentifier) -> Result<(), RegistryError> {
        *self.peers.flag_mut(publisher)? = false;
        Ok(())
    }

    /// Mark `publisher` as pulled.
    ///
    /// Returns `false` when a pull is already in flight, in which case the
    /// caller must not issue another one.
    pub fn set_pulling(&mut self, publisher: &ReactiveIdentifier) -> Result<bool, RegistryError> {
        let flag = self.peers.flag_mut(publisher)?;
        let newly = !*flag;
        *flag = true;
        Ok(newly)
    }

    /// Every publisher not currently pulled, each of which is now marked pulling.
    pub fn non_pulling(&mut self) -> HashSet<ReactiveIdentifier> {
        let idle = self.peers.matching(false);
        for publisher in &idle {
            if let Ok(flag) = self.peers.flag_mut(publisher) {
                *flag = true;
            }
        }
        idle
    }

    /// Whether a pull to `publisher` is in flight.
    #[must_use]
    pub fn is_pulling(&self, publisher: &ReactiveIdentifier) -> bool {
        self.peers.is_pulling(publisher)
    }

    /// All registered publishers.
    #[must_use]
    pub fn publishers(&self) -> HashSet<ReactiveIdentifier> {
        self.peers.iter().map(|(id, _)| id).collect()
    }
}

impl Registry for PublisherRegistry {
    fn size(&self) -> usize {
        self.peers.len()
    }

    fn contains(&self, peer: &ReactiveIdentifier) -> bool {
        self.peers.contains(peer)
    }

    fn cardinality(&self) -> Cardinality {
        self.peers.cardinality()
    }
}

/// Subscribers of a publisher, and which of them are owed a response.
#[derive(Debug, Clone)]
pub struct SubscriberRegistry {
    peers: PeerTable,
}

impl SubscriberRegistry {
    /// Registry holding exactly one subscriber.
    #[must_use]
    pub fn single() -> Self {
        Self::with_cardinality(Cardinality::Single)
    }

    /// Registry holding any number of subscribers.
    #[must_use]
    pub fn multi() -> Self {
        Self::with_cardinality(Cardinality::Multi)
    }

    /// Registry of the given shape.
    #[must_use]
    pub fn with_cardinality(cardinality: Cardinality) -> Self {
        Self {
            peers: PeerTable::new(cardinality),
        }
    }

    /// Register a subscriber. Returns whether it was newly added.
    pub fn add_subscriber(&mut self, subscriber: ReactiveIdentifier) -> Result<bool, RegistryError> {
        self.peers.add(subscriber)
    }

    /// `subscriber` asked for data. Returns `false` if it was already pulling.
    pub fn record_pull(&mut self, subscriber: &ReactiveIdentifier) -> Result<bool, RegistryError> {
        let flag = self.peers.flag_mut(subscriber)?;
        let newly = !*flag;
        *flag = true;
        Ok(newly)
    }

    /// `subscriber` has been answered.
    pub fn set_not_pulling_for(&mut self, subscriber: &ReactiveIdentifier) -> Result<(), RegistryError> {
        *self.peers.flag_mut(subscriber)? = false;
        Ok(())
    }

    /// Every subscriber has been answered.
    pub fn set_not_pulling(&mut self) {
        self.peers.set_all(false);
    }

    /// Subscribers currently owed a response.
    #[must_use]
    pub fn pulling(&self) -> HashSet<ReactiveIdentifier> {
        self.peers.matching(true)
    }

    /// Whether any subscriber is pulling. No pulling subscriber means no work.
    #[must_use]
    pub fn any_pulling(&self) -> bool {
        self.peers.iter().any(|(_, pulling)| pulling)
    }

    /// Whether `subscriber` is pulling.
    #[must_use]
    pub fn is_pulling(&self, subscriber: &ReactiveIdentifier) -> bool {
        self.peers.is_pulling(subscriber)
    }

    /// All registered subscribers, pulling or not.
    #[must_use]
    pub fn subscribers(&self) -> HashSet<ReactiveIdentifier> {
        self.peers.iter().map(|(id, _)| id).collect()
    }
}

impl Registry for SubscriberRegistry {
    fn size(&self) -> usize {
        self.peers.len()
    }

    fn contains(&self, peer: &ReactiveIdentifier) -> bool {
        self.peers.contains(peer)
    }

    fn cardinality(&self) -> Cardinality {
        self.peers.cardinality()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::identifier::{BlockId, ElementKind};

    fn ids(n: u64) -> Vec<ReactiveIdentifier> {
        let block = BlockId::new();
        (0..n).map(|i| ReactiveIdentifier::new(block, ElementKind::Map, i)).collect()
    }

    #[test]
    fn test_single_rejects_second_publisher() {
        let peers = ids(2);
        let mut registry = PublisherRegistry::single();
        assert!(registry.add(peers[0]).unwrap());
        assert!(!registry.add(peers[0]).unwrap());

        let err = registry.add(peers[1]).unwrap_err();
        assert_eq!(
            err,
            RegistryError::SinglePeerViolation {
                existing: peers[0],
                attempted: peers[1],
            }
        );
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn test_multi_add_is_idempotent() {
        let peers = ids(2);
        let mut registry = PublisherRegistry::multi();
        assert!(registry.add(peers[0]).unwrap());
        assert!(registry.add(peers[1]).unwrap());
        assert!(!registry.add(peers[1]).unwrap());
        assert_eq!(registry.size(), 2);
    }

    #[test]
    fn test_set_pulling_reports_pull_in_flight() {
        let peers = ids(1);
        let mut registry = PublisherRegistry::single();
        registry.add(peers[0]).unwrap();

        assert!(registry.set_pulling(&peers[0]).unwrap());
        assert!(!registry.set_pulling(&peers[0]).unwrap());
        registry.record_receive(&peers[0]).unwrap();
        assert!(registry.set_pulling(&peers[0]).unwrap());
    }

    #[test]
    fn test_unknown_publisher_is_rejected() {
        let peers = ids(2);
        let mut single = PublisherRegistry::single();
        single.add(peers[0]).unwrap();
        assert_eq!(
            single.record_receive(&peers[1]),
            Err(RegistryError::UnknownPeer { peer: peers[1] })
        );

        let mut multi = PublisherRegistry::multi();
        assert!(multi.set_pulling(&peers[0]).is_err());
        assert!(PublisherRegistry::single().record_receive(&peers[0]).is_err());
    }

    #[test]
    fn test_non_pulling_reserves_idle_publishers() {
        let peers = ids(3);
        let mut registry = PublisherRegistry::multi();
        for p in &peers {
            registry.add(*p).unwrap();
        }
        registry.set_pulling(&peers[1]).unwrap();

        let idle = registry.non_pulling();
        assert_eq!(idle, [peers[0], peers[2]].into_iter().collect());
        assert!(registry.non_pulling().is_empty());

        registry.record_receive(&peers[2]).unwrap();
        assert_eq!(registry.non_pulling(), [peers[2]].into_iter().collect());
    }

    #[test]
    fn test_subscriber_pull_lifecycle() {
        let peers = ids(2);
        let mut registry = SubscriberRegistry::multi();
        registry.add_subscriber(peers[0]).unwrap();
        registry.add_subscriber(peers[1]).unwrap();
        assert!(!registry.any_pulling());

        assert!(registry.record_pull(&peers[0]).unwrap());
        assert!(!registry.record_pull(&peers[0]).unwrap());
        assert!(registry.any_pulling());
        assert_eq!(registry.pulling(), [peers[0]].into_iter().collect());

        registry.record_pull(&peers[1]).unwrap();
        registry.set_not_pulling_for(&peers[0]).unwrap();
        assert_eq!(registry.pulling(), [peers[1]].into_iter().collect());

        registry.set_not_pulling();
        assert!(!registry.any_pulling());
        assert_eq!(registry.subscribers().len(), 2);
    }

    #[test]
    fn test_record_pull_requires_registration() {
        let peers = ids(1);
        let mut registry = SubscriberRegistry::single();
        assert_eq!(
            registry.record_pull(&peers[0]),
            Err(RegistryError::UnknownPeer { peer: peers[0] })
        );
    }
}
