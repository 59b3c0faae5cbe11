//! # Identity and Causality
//!
//! This module provides the bookkeeping that makes every mutation in a
//! document globally identifiable and causally comparable.
//!
//! - **[`PeerId`]**: A unique identifier for a replica. Two processes holding
//!   the same document must never share a `PeerId`.
//!
//! - **[`OpId`]**: A globally unique identifier for a single operation (for
//!   example, an insert or a move). It consists of a `PeerId` and a counter,
//!   which is monotonically increasing for that specific peer. Operation
//!   identifiers double as the stable identity of the thing an operation
//!   created: a sequence element is forever named by the `OpId` of its
//!   insertion, a tree node by the `OpId` of its creation.
//!
//! - **[`VersionVector`]**: A map from `PeerId` to the highest counter
//!   observed from that peer. It represents a replica's knowledge of the
//!   document's history. By comparing `VersionVector`s, replicas can
//!   determine which operations are new, which are concurrent, and which
//!   have already been seen.
//!
//! - **[`Stamp`]**: A Lamport timestamp paired with the operation's [`OpId`].
//!   Per-peer counters are dense and say nothing about causality across
//!   peers, so they cannot order conflicting writes. The Lamport component
//!   can: a replica advances it past every timestamp it observes, which
//!   makes a causally-later operation carry a strictly greater stamp.
//!   Stamps order by Lamport time first and peer second, so concurrent
//!   operations are tie-broken deterministically. This is the order applied
//!   wherever two writes compete for the same register.
use std::{cmp::Ordering, collections::BTreeMap, fmt, num::NonZeroU64};

/// A unique identifier for a single replica of a document.
///
/// Peers assign their own operation counters, so reusing a `PeerId` across
/// two live processes breaks the uniqueness of [`OpId`]s and with it every
/// convergence guarantee. How identifiers are allocated (random, assigned by
/// an out-of-band registry, ...) is up to the embedding application.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
#[repr(transparent)]
pub struct PeerId(u64);

impl PeerId {
    pub const fn new(peer: u64) -> Self {
        Self(peer)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for PeerId {
    fn from(peer: u64) -> Self {
        Self(peer)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unique identifier for an operation.
///
/// Every mutation is assigned a fresh `OpId` by the issuing replica's
/// [`VersionVector`]. Identifiers are ordered by counter _first_ and peer
/// _second_; since counters are peer-local, ties are impossible between
/// distinct operations and the order is total.
///
/// This order is arbitrary and exists for deterministic storage and
/// reporting. Conflicting register writes are ordered by [`Stamp`], whose
/// Lamport component reflects causality; a per-peer counter does not.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct OpId {
    peer: PeerId,
    counter: NonZeroU64,
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:?}, {})", self.peer, self.counter)
    }
}

impl Ord for OpId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.peer.cmp(&other.peer))
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl OpId {
    /// Creates a new [`OpId`] out of thin air.
    ///
    /// All real identifiers should be minted through [`VersionVector::next_id`].
    /// This constructor is mainly useful for tests and documentation examples.
    ///
    /// # Panics
    ///
    /// If `counter == 0`.
    pub const fn mint(peer: PeerId, counter: u64) -> Self {
        Self {
            peer,
            counter: if let Some(counter) = NonZeroU64::new(counter) {
                counter
            } else {
                panic!("attempted to construct OpId with counter 0");
            },
        }
    }

    /// Returns the [`PeerId`] of the replica that issued this operation.
    pub const fn peer(&self) -> PeerId {
        self.peer
    }

    /// Returns the per-peer operation index of this identifier.
    pub const fn counter(&self) -> NonZeroU64 {
        self.counter
    }
}

impl From<(u64, u64)> for OpId {
    fn from((peer, counter): (u64, u64)) -> Self {
        Self::mint(PeerId::new(peer), counter)
    }
}

impl PartialEq<(u64, u64)> for OpId {
    fn eq(&self, &(peer, counter): &(u64, u64)) -> bool {
        self.peer.0 == peer && self.counter.get() == counter
    }
}

/// The logical timestamp of an operation: Lamport time plus identity.
///
/// A replica stamps each local operation with a Lamport time one past the
/// highest it has observed, so an operation always carries a strictly
/// greater stamp than everything it causally depends on. Between concurrent
/// operations the Lamport times carry no ordering obligation, and the peer
/// id breaks the tie.
///
/// This makes `>` on stamps the entire last-writer-wins rule: a
/// causally-later write orders above the write it supersedes, and
/// concurrent writes resolve the same way on every replica.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct Stamp {
    lamport: u64,
    id: OpId,
}

impl fmt::Debug for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{:?}", self.lamport, self.id)
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lamport
            .cmp(&other.lamport)
            .then_with(|| self.id.peer().cmp(&other.id.peer()))
            .then_with(|| self.id.counter().cmp(&other.id.counter()))
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Stamp {
    pub const fn new(lamport: u64, id: OpId) -> Self {
        Self { lamport, id }
    }

    /// The Lamport time of the operation.
    pub const fn lamport(&self) -> u64 {
        self.lamport
    }

    /// The identity of the operation.
    pub const fn id(&self) -> OpId {
        self.id
    }

    pub const fn peer(&self) -> PeerId {
        self.id.peer()
    }
}

/// Tracks the highest operation counter observed from each peer.
///
/// A `VersionVector` serves two roles: it is the replica's record of which
/// operations it has seen (used to filter duplicates on import), and the
/// causal-dependency snapshot attached to every outgoing operation (used to
/// order operations during merge).
///
/// Version vectors form a partial order: `a <= b` iff every entry of `a` is
/// less than or equal to the corresponding entry of `b`, with missing entries
/// reading as zero. Two vectors where neither dominates the other describe
/// concurrent histories, and [`PartialOrd::partial_cmp`] returns `None`.
///
/// # Examples
///
/// ```rust
/// use mvdoc::{OpId, PeerId, VersionVector};
///
/// let peer = PeerId::new(1);
/// let mut clock = VersionVector::new();
///
/// // The vector can be used to mint fresh operation ids:
/// let id1 = clock.next_id(peer);
/// // Minting does not implicitly record the id:
/// assert_eq!(clock.next_id(peer), id1);
/// // You must observe it to advance the clock:
/// clock.observe(id1);
/// let id2 = clock.next_id(peer);
/// assert_ne!(id1, id2);
/// clock.observe(id2);
///
/// // The first id minted has counter 1, and later ids order after earlier ones:
/// assert_eq!(id1, (1, 1));
/// assert!(id2 > id1);
///
/// // Observed ids are contained, unobserved ones are not:
/// assert!(clock.contains(id1));
/// assert!(!clock.contains(OpId::mint(PeerId::new(2), 1)));
/// ```
#[derive(Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct VersionVector {
    seen: BTreeMap<PeerId, NonZeroU64>,
}

impl fmt::Debug for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.seen.iter().map(|(peer, counter)| (peer, counter)))
            .finish()
    }
}

impl VersionVector {
    /// Constructs an empty [`VersionVector`] (no operations observed).
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the highest counter observed from `peer`, or 0 if none.
    pub fn get(&self, peer: PeerId) -> u64 {
        self.seen.get(&peer).copied().map(NonZeroU64::get).unwrap_or(0)
    }

    /// Returns whether the operation identified by `id` has been observed.
    pub fn contains(&self, id: OpId) -> bool {
        id.counter().get() <= self.get(id.peer())
    }

    /// Mints the next unused [`OpId`] for `peer`.
    ///
    /// The returned id is not recorded; call [`VersionVector::observe`] once
    /// the corresponding operation has actually been issued.
    pub fn next_id(&self, peer: PeerId) -> OpId {
        OpId::mint(peer, self.get(peer) + 1)
    }

    /// Records `id` as observed.
    ///
    /// Counters only ever move forward; observing an id at or below the
    /// current watermark for its peer is a no-op.
    pub fn observe(&mut self, id: OpId) {
        let counter = id.counter();
        self.seen
            .entry(id.peer())
            .and_modify(|seen| *seen = (*seen).max(counter))
            .or_insert(counter);
    }

    /// Returns whether every entry of `other` is at or below the
    /// corresponding entry of `self`.
    ///
    /// When this holds, every operation `other` describes has been observed
    /// locally; in particular, an operation whose dependency vector is
    /// dominated by the local vector is safe to apply.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other
            .seen
            .iter()
            .all(|(&peer, &counter)| counter.get() <= self.get(peer))
    }

    /// Folds the knowledge recorded in `other` into `self`.
    pub fn merge(&mut self, other: &VersionVector) {
        for (&peer, &counter) in &other.seen {
            self.seen
                .entry(peer)
                .and_modify(|seen| *seen = (*seen).max(counter))
                .or_insert(counter);
        }
    }

    /// Iterates over the `(peer, highest counter)` entries of this vector.
    pub fn iter(&self) -> impl Iterator<Item = (PeerId, u64)> + '_ {
        self.seen
            .iter()
            .map(|(&peer, &counter)| (peer, counter.get()))
    }

    /// Returns whether no operations have been observed.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl PartialOrd for VersionVector {
    /// Compares two vectors under the causal partial order.
    ///
    /// Returns `None` when the vectors describe concurrent histories.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let le = other.dominates(self);
        let ge = self.dominates(other);
        match (le, ge) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }
}

impl FromIterator<OpId> for VersionVector {
    fn from_iter<I: IntoIterator<Item = OpId>>(iter: I) -> Self {
        let mut vv = Self::new();
        for id in iter {
            vv.observe(id);
        }
        vv
    }
}
