//! # mvdoc: An Operation-Based Replicated Document Engine
//!
//! This crate implements an operation-based CRDT document: a set of named
//! containers that any number of replicas can edit independently and merge
//! without coordination, with a guarantee of **strong eventual consistency**
//! -- replicas that have applied the same set of operations hold identical
//! state, no matter the order or grouping in which the operations arrived.
//!
//! Four container kinds are provided:
//!
//! - [`MovableList`](crdts::MovableList): an ordered sequence whose elements
//!   have stable identities and can be concurrently *moved* without being
//!   duplicated or lost.
//! - [`Tree`](crdts::Tree): a forest with reparenting, where concurrent
//!   moves that would jointly form a cycle are resolved by a deterministic
//!   merge-time veto.
//! - [`LwwMap`](crdts::LwwMap): a string-keyed map with last-writer-wins
//!   entries.
//! - [`Text`](crdts::Text): a character sequence with stable character
//!   identities (no moves; insert and delete only).
//!
//! ## How it works
//!
//! Every mutation becomes an **operation** stamped with an [`OpId`] (issuing
//! peer plus per-peer counter), the replica's Lamport time, and the
//! replica's [`VersionVector`] at issue time, recorded in an append-only
//! [`OpLog`](oplog::OpLog).
//! Replicas synchronize by shipping log slices ([`Document::export_ops`])
//! and applying them ([`Document::import_ops`]). Imports are causally
//! ordered, idempotent, and atomic: an internally inconsistent batch is
//! rejected as a whole.
//!
//! Conflicts on a single register (an element's position, a node's parent, a
//! map key) resolve **last-writer-wins** by [`Stamp`]: a causally-later
//! write carries a greater Lamport time and replaces the earlier one, and
//! concurrent writes are tie-broken by peer id, identically everywhere.
//! Structural conflicts no single register can express -- cycles
//! under concurrent tree moves -- are handled by replaying the tree's
//! history in a canonical order and vetoing the move that would close the
//! cycle.
//!
//! ## Getting started: a concurrent move and edit
//!
//! ```rust
//! use mvdoc::{Document, PeerId};
//!
//! // Two replicas of the same document.
//! let mut alice = Document::new(PeerId::new(1));
//! let mut bob = Document::new(PeerId::new(2));
//!
//! // Alice builds a list; Bob receives it.
//! let mut items = alice.list("items")?;
//! items.push("bread")?;
//! items.push("milk")?;
//! bob.import_ops(&alice.export_ops(bob.version()))?;
//!
//! // Concurrently, Alice moves "milk" to the front while Bob rewrites it.
//! alice.list("items")?.mv(1, 0)?;
//! let milk = bob.get_list("items").unwrap().id_at(1).unwrap();
//! bob.list("items")?.set(milk, "oat milk")?;
//!
//! // After exchanging operations both replicas agree: the element moved
//! // *and* carries the new value. Nothing was duplicated or lost, because
//! // both edits addressed the element's identity rather than its index.
//! let to_bob = alice.export_ops(bob.version());
//! let to_alice = bob.export_ops(alice.version());
//! bob.import_ops(&to_bob)?;
//! alice.import_ops(&to_alice)?;
//! assert_eq!(
//!     alice.get_list("items").unwrap().values(),
//!     [&mvdoc::crdts::ScalarValue::from("oat milk"), &"bread".into()],
//! );
//! assert_eq!(
//!     alice.get_list("items").unwrap().values(),
//!     bob.get_list("items").unwrap().values(),
//! );
//! # Ok::<(), mvdoc::Error>(())
//! ```
//!
//! ## Scope of this crate
//!
//! This crate provides the document state machine: operation generation,
//! logging, merge, and materialized reads. **It does not include any
//! networking.** You are responsible for moving [`OpBatch`](oplog::OpBatch)
//! values between replicas; any transport works, because imports tolerate
//! redelivery, reordering of batches, and overlap.
//!
//! ## Features
//!
//! - `json`: Snapshots of a [`Document`] as `serde_json::Value`. Enabled by
//!   default.
//! - `serde`: `serde` support for all operation and state types, for
//!   persisting logs or shipping batches over the wire.
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

use ahash::RandomState;
use std::{
    hash::BuildHasher,
    sync::atomic::{AtomicBool, Ordering},
};

// Fixed seeds, used only when determinism is requested.
pub(crate) const DETERMINISTIC_HASHER: RandomState = RandomState::with_seeds(48, 1516, 23, 42);

pub mod causal;
pub use causal::{OpId, PeerId, Stamp, VersionVector};
pub mod crdts;
mod document;
pub use document::{Document, ListHandle, MapHandle, TextHandle, TreeHandle};
mod error;
pub use error::{BatchIssue, ContainerKind, Error};
#[cfg(feature = "json")]
mod json;
mod merge;
pub mod oplog;

static ENABLE_DETERMINISM: AtomicBool = AtomicBool::new(false);

/// Makes all data structures behave deterministically.
///
/// This should only be enabled for testing, as it increases the odds of DoS
/// scenarios.
#[doc(hidden)]
pub fn enable_determinism() {
    ENABLE_DETERMINISM.store(true, Ordering::Release);
}

/// Checks if determinism is enabled.
///
/// Should be used internally and for testing.
#[doc(hidden)]
pub fn determinism_enabled() -> bool {
    ENABLE_DETERMINISM.load(Ordering::Acquire)
}

/// The hasher state for a new map: seeded randomly, unless
/// `enable_determinism` has been called.
#[inline]
fn make_random_state() -> RandomState {
    if determinism_enabled() {
        DETERMINISTIC_HASHER
    } else {
        RandomState::new()
    }
}

fn create_map<K, V>() -> std::collections::HashMap<K, V, MvdocRandomState> {
    std::collections::HashMap::with_hasher(MvdocRandomState::default())
}

/// The crate's hash-map state: `ahash`, with an opt-in deterministic mode
/// for tests.
#[derive(Clone)]
pub struct MvdocRandomState {
    inner: RandomState,
}

impl Default for MvdocRandomState {
    #[inline]
    fn default() -> Self {
        Self {
            inner: make_random_state(),
        }
    }
}

impl BuildHasher for MvdocRandomState {
    type Hasher = <RandomState as BuildHasher>::Hasher;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        self.inner.build_hasher()
    }
}
