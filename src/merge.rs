//! # Merge driver
//!
//! Everything that moves operations between replicas: [`Document::export_ops`]
//! clones out log suffixes, [`Document::import_ops`] admits them.
//!
//! An import runs in four phases over the batch:
//!
//! 1. **Filter**: operations already recorded locally are dropped, so
//!    re-importing a batch (or overlapping batches from different routes) is
//!    harmless. An id claimed by two different operations fails the batch.
//! 2. **Schedule**: the fresh operations are put in a canonical causal order.
//!    An operation becomes ready once the local frontier plus the already
//!    scheduled operations contain all of its dependencies; among ready
//!    operations, the newest [`Stamp`](crate::Stamp) goes first. The schedule
//!    is a pure
//!    function of the operation set, so every replica computes the same one.
//!    If scheduling stalls, some dependency can never be satisfied and the
//!    batch fails.
//! 3. **Validate**: walked in schedule order, every operation must address a
//!    container of the kind its payload expects and targets that either exist
//!    locally or are created earlier in the schedule.
//! 4. **Apply**: only now is state touched, so a batch that fails any earlier
//!    phase leaves the document byte-identical. Tree containers buffer their
//!    operations and rebuild once per import.
use crate::{
    Document, Error, MvdocRandomState, OpId, VersionVector, create_map,
    crdts::{list::Anchor, text::CharAnchor, tree::Parent},
    document::{Container, payload_kind},
    error::{BatchIssue, ContainerKind},
    oplog::{Op, OpBatch, OpPayload},
};
use std::collections::{BTreeSet, HashMap, HashSet};

impl Document {
    /// Clones out every operation not yet covered by `since`, in per-peer
    /// counter order. An empty vector exports the full log.
    pub fn export_ops(&self, since: &VersionVector) -> OpBatch {
        OpBatch {
            ops: self.log.ops_since(since),
        }
    }

    /// Applies a batch of foreign operations and returns how many were new.
    ///
    /// Imports are **atomic**: a malformed batch is rejected as a whole and
    /// the document is left untouched. They are also **idempotent** and
    /// **order-insensitive** across batches, as long as each batch is
    /// causally self-contained with respect to what this replica already
    /// knows.
    pub fn import_ops(&mut self, batch: &OpBatch) -> Result<usize, Error> {
        let fresh = self.filter_fresh(batch)?;
        let order = self.schedule(&fresh)?;
        self.validate(&fresh, &order)?;

        let mut dirty_trees: BTreeSet<String> = BTreeSet::new();
        for &i in &order {
            let op = fresh[i].clone();
            let kind = payload_kind(&op.payload);
            if kind == ContainerKind::Tree {
                dirty_trees.insert(op.container.clone());
            }
            self.containers
                .entry(op.container.clone())
                .or_insert_with(|| Container::empty(kind))
                .apply(&op, false);
            self.clock.observe(op.id);
            // local edits issued after this import must stamp higher than
            // everything it carried
            self.lamport = self.lamport.max(op.lamport);
            self.log.append(op);
        }
        for name in &dirty_trees {
            let Some(Container::Tree(tree)) = self.containers.get_mut(name) else {
                unreachable!("validation admits only tree ops for tree containers");
            };
            tree.rebuild();
        }
        tracing::debug!(
            applied = order.len(),
            skipped = batch.len() - order.len(),
            trees_rebuilt = dirty_trees.len(),
            "imported batch",
        );
        Ok(order.len())
    }

    /// Drops operations already recorded, keeping one copy of each fresh id.
    fn filter_fresh(&self, batch: &OpBatch) -> Result<Vec<Op>, Error> {
        let mut fresh: Vec<Op> = Vec::new();
        let mut claimed = create_map::<OpId, usize>();
        for op in &batch.ops {
            if let Some(recorded) = self.log.get(op.id) {
                if recorded != op {
                    return Err(BatchIssue::DuplicateId(op.id).into());
                }
                continue;
            }
            match claimed.get(&op.id) {
                Some(&idx) => {
                    if fresh[idx] != *op {
                        return Err(BatchIssue::DuplicateId(op.id).into());
                    }
                }
                None => {
                    claimed.insert(op.id, fresh.len());
                    fresh.push(op.clone());
                }
            }
        }
        Ok(fresh)
    }

    /// Computes the canonical causal order of `fresh` as indices into it.
    ///
    /// Readiness additionally requires per-peer counter contiguity, so log
    /// columns stay dense even if a malformed op omits its own predecessor
    /// from its dependencies.
    fn schedule(&self, fresh: &[Op]) -> Result<Vec<usize>, Error> {
        let mut effective = self.clock.clone();
        let mut remaining: Vec<usize> = (0..fresh.len()).collect();
        let mut order = Vec::with_capacity(fresh.len());
        while !remaining.is_empty() {
            let ready = |i: usize| {
                let op = &fresh[i];
                effective.get(op.id.peer()) + 1 == op.id.counter().get()
                    && effective.dominates(&op.deps)
            };
            let Some((slot, &i)) = remaining
                .iter()
                .enumerate()
                .filter(|&(_, &i)| ready(i))
                .max_by_key(|&(_, &i)| fresh[i].stamp())
            else {
                let blocked = remaining
                    .iter()
                    .map(|&i| fresh[i].id)
                    .min()
                    .expect("remaining is non-empty");
                return Err(BatchIssue::CausalGap(blocked).into());
            };
            effective.observe(fresh[i].id);
            order.push(i);
            remaining.swap_remove(slot);
        }
        Ok(order)
    }

    /// Checks container kinds and target existence along the schedule,
    /// without touching any state.
    fn validate(&self, fresh: &[Op], order: &[usize]) -> Result<(), Error> {
        // identities and backbone slots each container gains earlier in the
        // schedule; a list insert contributes both, a list move a slot only
        let mut minted: HashMap<&str, HashSet<OpId, MvdocRandomState>, MvdocRandomState> =
            create_map();
        let mut minted_slots: HashMap<&str, HashSet<OpId, MvdocRandomState>, MvdocRandomState> =
            create_map();
        let mut fresh_kinds = create_map::<&str, ContainerKind>();
        for &i in order {
            let op = &fresh[i];
            let name = op.container.as_str();
            let kind = payload_kind(&op.payload);
            let existing = self.containers.get(name);
            let found = match existing {
                Some(container) => Some(container.kind()),
                None => fresh_kinds.get(name).copied(),
            };
            if let Some(found) = found
                && found != kind
            {
                return Err(BatchIssue::KindMismatch {
                    op: op.id,
                    container: name.to_string(),
                    expected: kind,
                    found,
                }
                .into());
            }
            fresh_kinds.insert(name, kind);

            let known = |id: OpId| {
                existing.is_some_and(|container| knows_identity(container, id))
                    || minted.get(name).is_some_and(|ids| ids.contains(&id))
            };
            let require = |id: OpId| {
                if known(id) {
                    Ok(())
                } else {
                    Err(Error::from(BatchIssue::UnknownTarget {
                        op: op.id,
                        target: id,
                    }))
                }
            };
            let require_slot = |id: OpId| {
                let known = existing.is_some_and(|container| knows_slot(container, id))
                    || minted_slots.get(name).is_some_and(|ids| ids.contains(&id));
                if known {
                    Ok(())
                } else {
                    Err(Error::from(BatchIssue::UnknownTarget {
                        op: op.id,
                        target: id,
                    }))
                }
            };
            let mut creates = false;
            let mut creates_slot = false;
            match &op.payload {
                OpPayload::ListInsert { anchor, .. } => {
                    if let Anchor::After(id) = anchor {
                        require_slot(id.op())?;
                    }
                    creates = true;
                    creates_slot = true;
                }
                OpPayload::ListMove { target, anchor } => {
                    require(target.op())?;
                    if let Anchor::After(id) = anchor {
                        require_slot(id.op())?;
                    }
                    creates_slot = true;
                }
                OpPayload::ListSet { target, .. } | OpPayload::ListDelete { target } => {
                    require(target.op())?;
                }
                OpPayload::TreeCreate { parent } => {
                    if let Parent::Node(id) = parent {
                        require(id.op())?;
                    }
                    creates = true;
                }
                OpPayload::TreeMove { target, parent } => {
                    require(target.op())?;
                    if let Parent::Node(id) = parent {
                        require(id.op())?;
                    }
                }
                OpPayload::TreeSet { target, .. } => {
                    require(target.op())?;
                }
                OpPayload::MapSet { .. } => {}
                OpPayload::TextInsert { anchor, .. } => {
                    if let CharAnchor::After(id) = anchor {
                        require(id.op())?;
                    }
                    creates = true;
                }
                OpPayload::TextDelete { target } => {
                    require(target.op())?;
                }
            }
            if creates {
                minted.entry(name).or_default().insert(op.id);
            }
            if creates_slot {
                minted_slots.entry(name).or_default().insert(op.id);
            }
        }
        Ok(())
    }
}

/// Whether `container` already holds the identity minted by `id`.
fn knows_identity(container: &Container, id: OpId) -> bool {
    match container {
        Container::List(list) => list.contains(id.into()),
        Container::Tree(tree) => tree.contains(id.into()),
        Container::Text(text) => text.contains(id.into()),
        // map keys are not identities
        Container::Map(_) => false,
    }
}

/// Whether `container` already holds the backbone slot minted by `id`.
fn knows_slot(container: &Container, id: OpId) -> bool {
    match container {
        Container::List(list) => list.has_slot(id.into()),
        // only sequences have a slot backbone
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PeerId;

    fn sync(from: &Document, into: &mut Document) -> usize {
        into.import_ops(&from.export_ops(into.version())).unwrap()
    }

    #[test]
    fn export_import_converges_two_replicas() {
        let mut alice = Document::new(PeerId::new(1));
        let mut bob = Document::new(PeerId::new(2));

        alice.list("items").unwrap().push("from alice").unwrap();
        bob.list("items").unwrap().push("from bob").unwrap();

        sync(&alice, &mut bob);
        sync(&bob, &mut alice);

        assert_eq!(alice.containers, bob.containers);
        assert_eq!(alice.get_list("items").unwrap().len(), 2);
    }

    #[test]
    fn import_is_idempotent() {
        let mut alice = Document::new(PeerId::new(1));
        alice.map("meta").unwrap().set("k", "v");
        let batch = alice.export_ops(&VersionVector::new());

        let mut bob = Document::new(PeerId::new(2));
        assert_eq!(bob.import_ops(&batch).unwrap(), 1);
        let snapshot = bob.clone();
        assert_eq!(bob.import_ops(&batch).unwrap(), 0);
        assert_eq!(bob, snapshot);
    }

    #[test]
    fn causal_gap_rejects_batch_atomically() {
        let mut alice = Document::new(PeerId::new(1));
        let mut items = alice.list("items").unwrap();
        items.push("one").unwrap();
        items.push("two").unwrap();

        // drop alice's first op from the batch: the second can never apply
        let mut batch = alice.export_ops(&VersionVector::new());
        batch.ops.remove(0);

        let mut bob = Document::new(PeerId::new(2));
        bob.map("meta").unwrap().set("k", "v");
        let snapshot = bob.clone();
        let err = bob.import_ops(&batch).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedBatch(BatchIssue::CausalGap(_))
        ));
        assert_eq!(bob, snapshot, "a rejected batch must leave no trace");
    }

    #[test]
    fn unknown_target_rejects_batch() {
        // an op claiming no dependencies while addressing a foreign element
        let stranger = crate::crdts::list::ElementId::from(OpId::mint(PeerId::new(9), 9));
        let batch = OpBatch {
            ops: vec![Op {
                id: OpId::mint(PeerId::new(1), 1),
                lamport: 1,
                deps: VersionVector::new(),
                container: "items".to_string(),
                payload: OpPayload::ListSet {
                    target: stranger,
                    value: "x".into(),
                },
            }],
        };

        let mut bob = Document::new(PeerId::new(2));
        let err = bob.import_ops(&batch).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedBatch(BatchIssue::UnknownTarget { .. })
        ));
        assert!(bob.log().is_empty());
    }

    #[test]
    fn kind_mismatch_rejects_batch() {
        let mut alice = Document::new(PeerId::new(1));
        alice.list("shared").unwrap().push("x").unwrap();
        let batch = alice.export_ops(&VersionVector::new());

        let mut bob = Document::new(PeerId::new(2));
        bob.map("shared").unwrap().set("k", "v");
        let err = bob.import_ops(&batch).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedBatch(BatchIssue::KindMismatch { .. })
        ));
    }

    #[test]
    fn conflicting_op_under_same_id_is_rejected() {
        let mut alice = Document::new(PeerId::new(1));
        alice.map("meta").unwrap().set("k", "v");
        let mut batch = alice.export_ops(&VersionVector::new());
        let mut forged = batch.ops[0].clone();
        forged.payload = OpPayload::MapSet {
            key: "k".to_string(),
            value: Some("forged".into()),
        };
        batch.ops.push(forged);

        let mut bob = Document::new(PeerId::new(2));
        let err = bob.import_ops(&batch).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedBatch(BatchIssue::DuplicateId(_))
        ));
    }

    #[test]
    fn batches_may_arrive_in_any_order() {
        let mut alice = Document::new(PeerId::new(1));
        alice.list("items").unwrap().push("one").unwrap();
        let early = alice.export_ops(&VersionVector::new());
        let mid = alice.version().clone();
        alice.list("items").unwrap().push("two").unwrap();
        let late = alice.export_ops(&mid);

        // `late` alone has a gap; after `early` lands, a retry succeeds
        let mut bob = Document::new(PeerId::new(2));
        assert!(bob.import_ops(&late).is_err());
        bob.import_ops(&early).unwrap();
        bob.import_ops(&late).unwrap();
        assert_eq!(bob.get_list("items").unwrap().len(), 2);
        assert_eq!(bob.containers, alice.containers);
    }

    #[test]
    fn trees_rebuild_once_and_stay_acyclic() {
        let mut alice = Document::new(PeerId::new(1));
        let (a, d) = {
            let mut tree = alice.tree("nodes").unwrap();
            let a = tree.create(None).unwrap();
            let d = tree.create(None).unwrap();
            (a, d)
        };
        let mut bob = Document::new(PeerId::new(2));
        sync(&alice, &mut bob);

        // valid locally, cyclic jointly
        alice.tree("nodes").unwrap().mv(d, Some(a)).unwrap();
        bob.tree("nodes").unwrap().mv(a, Some(d)).unwrap();
        sync(&alice, &mut bob);
        sync(&bob, &mut alice);

        assert_eq!(alice.containers, bob.containers);
        let tree = alice.get_tree("nodes").unwrap();
        assert!(!tree.is_ancestor(a, a));
        assert!(!tree.is_ancestor(d, d));
        // the moves carry equal lamports, so bob's wins the peer tie-break,
        // is scheduled first, and commits; alice's opposing move is vetoed
        assert_eq!(tree.parent(a), Some(Parent::Node(d)));
        assert_eq!(tree.parent(d), Some(Parent::Root));
    }

    #[test]
    fn register_winner_is_batch_order_independent() {
        // alice writes a key, bob overwrites it having seen alice's write,
        // and carol overwrites it concurrently with both
        let mut alice = Document::new(PeerId::new(1));
        alice.map("meta").unwrap().set("k", "from alice");
        let mut bob = Document::new(PeerId::new(2));
        sync(&alice, &mut bob);
        bob.map("meta").unwrap().set("k", "from bob");
        let mut carol = Document::new(PeerId::new(3));
        carol.map("meta").unwrap().set("k", "from carol");

        let batches = [
            alice.export_ops(&VersionVector::new()),
            bob.export_ops(&VersionVector::new()),
            carol.export_ops(&VersionVector::new()),
        ];

        // bob's write causally follows both the others it conflicts with
        // carol's only by lamport; it must hold the key on every replica no
        // matter which batch lands last
        let mut forward = Document::new(PeerId::new(4));
        for batch in &batches {
            forward.import_ops(batch).unwrap();
        }
        let mut backward = Document::new(PeerId::new(5));
        for batch in batches.iter().rev() {
            backward.import_ops(batch).unwrap();
        }

        assert_eq!(forward.containers, backward.containers);
        assert_eq!(
            forward.get_map("meta").unwrap().get("k"),
            Some(&"from bob".into()),
        );
    }
}
