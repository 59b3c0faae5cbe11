//! # Operation Log
//!
//! The append-only record of every operation a replica has applied, local
//! or foreign, and the unit replicas exchange to synchronize.
//!
//! Each [`Op`] is self-describing: it carries its [`OpId`], its Lamport
//! time, the issuing replica's [`VersionVector`] at issue time (its causal
//! dependencies), the
//! name of the container it addresses, and the [`OpPayload`] describing the
//! mutation. A log slice exported for another replica therefore needs no
//! side-channel metadata; the receiver can filter, order, and apply it from
//! the batch alone.
//!
//! Ops from a single peer are stored densely: the op with counter `n` sits
//! at index `n - 1` of that peer's column. The log is single-writer per
//! column -- only the owning replica ever appends its own column, and
//! foreign columns are only ever extended during imports, never mutated.
use crate::{
    OpId, PeerId, Stamp, VersionVector,
    crdts::{
        ScalarValue,
        list::{Anchor, ElementId},
        text::{CharAnchor, CharId},
        tree::{NodeId, Parent},
    },
};
use std::{collections::BTreeMap, fmt};

/// The mutation described by an operation.
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub enum OpPayload {
    /// Insert a new sequence element; the op's own id becomes its identity.
    ListInsert { anchor: Anchor, value: ScalarValue },
    /// Reassign an element's move register.
    ListMove { target: ElementId, anchor: Anchor },
    /// Rewrite an element's value register.
    ListSet {
        target: ElementId,
        value: ScalarValue,
    },
    /// Tombstone an element.
    ListDelete { target: ElementId },
    /// Create a tree node; the op's own id becomes its identity.
    TreeCreate { parent: Parent },
    /// Reassign a node's parent register (subject to the merge-time veto).
    TreeMove { target: NodeId, parent: Parent },
    /// Write a node attribute.
    TreeSet {
        target: NodeId,
        key: String,
        value: ScalarValue,
    },
    /// Write a map entry; `None` removes the key.
    MapSet {
        key: String,
        value: Option<ScalarValue>,
    },
    /// Insert a character; the op's own id becomes its identity.
    TextInsert { anchor: CharAnchor, ch: char },
    /// Tombstone a character.
    TextDelete { target: CharId },
}

/// A single mutating operation, stamped with its identity and causal
/// dependencies.
#[derive(Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct Op {
    pub id: OpId,
    /// The issuing replica's Lamport time: strictly greater than the
    /// lamport of every op this one causally follows.
    pub lamport: u64,
    /// The issuing replica's version vector at issue time. Every operation
    /// this op causally depends on is contained in it.
    pub deps: VersionVector,
    /// The name of the container this op addresses.
    pub container: String,
    pub payload: OpPayload,
}

impl Op {
    /// The op's conflict-resolution stamp: Lamport time plus identity.
    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.lamport, self.id)
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}/{:?} deps={:?}",
            self.stamp(),
            self.container,
            self.payload,
            self.deps
        )
    }
}

/// A self-contained slice of one or more logs, as exchanged between
/// replicas.
///
/// Within a batch, each peer's ops appear in counter order; batches as a
/// whole may be delivered in any order, any number of times.
#[derive(Clone, Default, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct OpBatch {
    pub ops: Vec<Op>,
}

impl OpBatch {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The append-only, per-peer record of all operations known to a replica.
#[derive(Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct OpLog {
    columns: BTreeMap<PeerId, Vec<Op>>,
}

impl fmt::Debug for OpLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.columns.iter()).finish()
    }
}

impl OpLog {
    /// Appends `op` to its peer's column.
    ///
    /// Columns are dense: the caller (the merge driver or the local-edit
    /// path) only appends ops in per-peer counter order.
    pub(crate) fn append(&mut self, op: Op) {
        let column = self.columns.entry(op.id.peer()).or_default();
        debug_assert_eq!(
            column.len() as u64 + 1,
            op.id.counter().get(),
            "log columns are dense and appended in counter order",
        );
        column.push(op);
    }

    /// Looks up an operation by id.
    pub fn get(&self, id: OpId) -> Option<&Op> {
        self.columns
            .get(&id.peer())?
            .get(usize::try_from(id.counter().get()).ok()? - 1)
    }

    /// Returns whether `id` is recorded.
    pub fn contains(&self, id: OpId) -> bool {
        self.get(id).is_some()
    }

    /// The total number of recorded operations.
    pub fn len(&self) -> usize {
        self.columns.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.values().all(Vec::is_empty)
    }

    /// Clones out every op not yet known to `since`, in per-peer counter
    /// order; the full log if `since` is empty.
    pub(crate) fn ops_since(&self, since: &VersionVector) -> Vec<Op> {
        let mut ops = Vec::new();
        for (&peer, column) in &self.columns {
            let known = usize::try_from(since.get(peer)).unwrap_or(usize::MAX);
            let fresh = column.get(known.min(column.len())..).unwrap_or(&[]);
            ops.extend(fresh.iter().cloned());
        }
        ops
    }
}
