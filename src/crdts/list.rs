use super::{LwwRegister, ScalarValue};
use crate::{OpId, Stamp, create_map};
use smallvec::SmallVec;
use std::{collections::BTreeMap, fmt};

/// The stable identity of a sequence element: the [`OpId`] of its insertion.
///
/// An identity is valid for the element's whole lifetime, across any number
/// of moves and value rewrites, and remains a valid placement referent even
/// after the element is deleted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct ElementId(OpId);

impl From<OpId> for ElementId {
    fn from(value: OpId) -> Self {
        Self(value)
    }
}

impl fmt::Debug for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ElementId")
            .field(&self.0.peer())
            .field(&self.0.counter())
            .finish()
    }
}

impl ElementId {
    pub fn op(&self) -> OpId {
        self.0
    }
}

/// A position in the sequence backbone: the [`OpId`] of the insert or move
/// operation that created it.
///
/// Slots are the fixed skeleton of the sequence. Every insert and every move
/// creates exactly one, anchored at issue time, and no operation ever
/// repositions or removes one. A slot is visible only while an element's
/// position register points at it; the rest are invisible joints that keep
/// anchors valid forever.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct SlotId(OpId);

impl From<OpId> for SlotId {
    fn from(value: OpId) -> Self {
        Self(value)
    }
}

impl fmt::Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SlotId")
            .field(&self.0.peer())
            .field(&self.0.counter())
            .finish()
    }
}

impl SlotId {
    pub fn op(&self) -> OpId {
        self.0
    }
}

/// The placement of a backbone slot: immediately after another slot, or at
/// the very front of the sequence.
///
/// An anchor is resolved to a slot when the operation is issued and never
/// re-resolved, so applying it later, anywhere, lands it in the same spot.
/// The anchor slot is causally older than the slot it places (it had to
/// exist at issue time), which keeps the backbone a forest: no sequence of
/// concurrent moves can make it unreachable or cyclic.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub enum Anchor {
    /// The head sentinel; the slot goes before everything else.
    Head,
    /// The slot goes immediately after the named one.
    After(SlotId),
}

impl fmt::Debug for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anchor::Head => write!(f, "^"),
            Anchor::After(id) => write!(f, ">{:?}", id),
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
struct Slot {
    stamp: Stamp,
    anchor: Anchor,
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
struct Element {
    value: LwwRegister<ScalarValue>,
    /// Position register: the backbone slot this element currently occupies.
    slot: LwwRegister<SlotId>,
    /// Monotone: once set, never cleared.
    deleted: bool,
}

/// An ordered sequence whose elements can be concurrently repositioned.
///
/// ## Slots and position registers
///
/// Integer indices are unstable under concurrent edits, so position is kept
/// in two layers. The **backbone** is an append-only forest of [`SlotId`]s:
/// every insert and every move contributes one slot, anchored at issue time
/// and fixed forever. On top of it, each element has a **position
/// register** naming the slot it occupies, resolved with the shared
/// last-writer-wins rule.
///
/// An insert creates a slot and an element occupying it. A move creates a
/// fresh slot at the destination and rewrites only the moved element's
/// register -- elements that were inserted after it keep their own slots and
/// stay exactly where they are. When concurrent moves race for one element,
/// one register write wins on every replica and the losing slot remains in
/// the backbone, unoccupied and invisible, still valid as an anchor for
/// anything issued relative to it. A move never creates a second identity,
/// so duplication is structurally impossible.
///
/// ## Materialization
///
/// The visible order is computed on read by walking the backbone from the
/// head: slots anchored at the same spot are visited newest [`Stamp`] first,
/// each followed by the slots anchored after it. An element appears where
/// its winning register points; tombstoned elements are skipped but keep
/// their identity and slots, so anchors through them stay meaningful.
///
/// The engine only applies operations; identifier minting, logging, and
/// duplicate filtering happen in [`Document`](crate::Document).
#[derive(Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct MovableList {
    slots: BTreeMap<SlotId, Slot>,
    elements: BTreeMap<ElementId, Element>,
}

impl fmt::Debug for MovableList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[]{:?}", self.elements)
    }
}

impl MovableList {
    /// Returns whether `id` names an element known to this engine,
    /// tombstoned or not.
    pub fn contains(&self, id: ElementId) -> bool {
        self.elements.contains_key(&id)
    }

    /// Returns whether `id` names a tombstoned element.
    pub fn is_deleted(&self, id: ElementId) -> bool {
        self.elements.get(&id).is_some_and(|e| e.deleted)
    }

    /// The number of visible (non-tombstoned) elements.
    pub fn len(&self) -> usize {
        self.elements.values().filter(|e| !e.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The visible sequence, in order, as `(identity, value)` pairs.
    pub fn to_vec(&self) -> Vec<(ElementId, &ScalarValue)> {
        self.linearize()
            .into_iter()
            .filter_map(|id| {
                let elem = &self.elements[&id];
                (!elem.deleted).then(|| (id, elem.value.value()))
            })
            .collect()
    }

    /// The visible values, in order.
    pub fn values(&self) -> Vec<&ScalarValue> {
        self.to_vec().into_iter().map(|(_, v)| v).collect()
    }

    /// The identity of the visible element at `idx`, if any.
    pub fn id_at(&self, idx: usize) -> Option<ElementId> {
        self.to_vec().get(idx).map(|&(id, _)| id)
    }

    /// The current value of `id`, visible or not.
    pub fn get(&self, id: ElementId) -> Option<&ScalarValue> {
        self.elements.get(&id).map(|e| e.value.value())
    }

    /// The backbone slot `id` currently occupies, visible or not.
    pub(crate) fn slot_of(&self, id: ElementId) -> Option<SlotId> {
        self.elements.get(&id).map(|e| *e.slot.value())
    }

    /// Returns whether `id` names a backbone slot known to this engine.
    pub(crate) fn has_slot(&self, id: SlotId) -> bool {
        self.slots.contains_key(&id)
    }

    pub(crate) fn apply_insert(&mut self, stamp: Stamp, anchor: Anchor, value: ScalarValue) {
        let slot = self.mint_slot(stamp, anchor);
        let prev = self.elements.insert(
            stamp.id().into(),
            Element {
                value: LwwRegister::new(value, stamp),
                slot: LwwRegister::new(slot, stamp),
                deleted: false,
            },
        );
        debug_assert!(prev.is_none(), "insert op ids are unique by construction");
    }

    pub(crate) fn apply_move(&mut self, stamp: Stamp, target: ElementId, anchor: Anchor) {
        // the slot goes into the backbone even if the register write below
        // loses: ops from replicas that saw this move applied may anchor to it
        let slot = self.mint_slot(stamp, anchor);
        self.element_mut(target).slot.write(slot, stamp);
    }

    pub(crate) fn apply_set(&mut self, stamp: Stamp, target: ElementId, value: ScalarValue) {
        // the value register is independent of deletion state: a set racing a
        // delete still records the winning value, but delete wins visibility
        self.element_mut(target).value.write(value, stamp);
    }

    pub(crate) fn apply_delete(&mut self, target: ElementId) {
        self.element_mut(target).deleted = true;
    }

    fn mint_slot(&mut self, stamp: Stamp, anchor: Anchor) -> SlotId {
        let slot = SlotId::from(stamp.id());
        let prev = self.slots.insert(slot, Slot { stamp, anchor });
        debug_assert!(prev.is_none(), "slot op ids are unique by construction");
        slot
    }

    fn element_mut(&mut self, target: ElementId) -> &mut Element {
        self.elements
            .get_mut(&target)
            .expect("target existence is validated before an op is accepted")
    }

    /// Orders all element identities, tombstoned ones included, by walking
    /// the backbone.
    fn linearize(&self) -> Vec<ElementId> {
        let mut buckets = create_map::<Anchor, SmallVec<[SlotId; 4]>>();
        for (&id, slot) in &self.slots {
            buckets.entry(slot.anchor).or_default().push(id);
        }
        // slots contending for the same spot: newest stamp first
        for bucket in buckets.values_mut() {
            bucket.sort_unstable_by(|a, b| self.slots[b].stamp.cmp(&self.slots[a].stamp));
        }
        let mut occupant = create_map::<SlotId, ElementId>();
        for (&id, elem) in &self.elements {
            occupant.insert(*elem.slot.value(), id);
        }

        let mut order = Vec::with_capacity(self.elements.len());
        let mut walked = 0_usize;
        let mut stack: Vec<SlotId> = Vec::new();
        if let Some(first) = buckets.get(&Anchor::Head) {
            stack.extend(first.iter().rev());
        }
        while let Some(slot) = stack.pop() {
            walked += 1;
            if let Some(&id) = occupant.get(&slot) {
                order.push(id);
            }
            if let Some(children) = buckets.get(&Anchor::After(slot)) {
                stack.extend(children.iter().rev());
            }
        }
        debug_assert_eq!(walked, self.slots.len(), "slot anchors are acyclic");
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PeerId;

    fn stamp(lamport: u64, peer: u64, counter: u64) -> Stamp {
        Stamp::new(lamport, OpId::mint(PeerId::new(peer), counter))
    }

    #[track_caller]
    fn assert_values(list: &MovableList, expected: &[&str]) {
        let values = list.values();
        assert_eq!(values.len(), expected.len(), "{values:?} != {expected:?}");
        for (value, expected) in values.iter().zip(expected) {
            assert!(**value == **expected, "{values:?} != {expected:?}");
        }
    }

    /// Builds `[A, B, C, D, E]` inserted by peer 1 (lamports 1 through 5)
    /// and returns the list plus the element and slot ids.
    fn abcde() -> (MovableList, Vec<ElementId>, Vec<SlotId>) {
        let mut list = MovableList::default();
        let mut ids = Vec::new();
        let mut slots = Vec::new();
        let mut anchor = Anchor::Head;
        for (i, value) in ["A", "B", "C", "D", "E"].into_iter().enumerate() {
            let s = stamp(i as u64 + 1, 1, i as u64 + 1);
            list.apply_insert(s, anchor, value.into());
            ids.push(ElementId::from(s.id()));
            slots.push(SlotId::from(s.id()));
            anchor = Anchor::After(s.id().into());
        }
        (list, ids, slots)
    }

    #[test]
    fn insert_orders_after_anchor() {
        let (list, ids, _) = abcde();
        assert_values(&list, &["A", "B", "C", "D", "E"]);
        assert_eq!(list.id_at(2), Some(ids[2]));
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn concurrent_inserts_at_same_anchor_tie_break_on_peer() {
        let mut list = MovableList::default();
        list.apply_insert(stamp(1, 1, 1), Anchor::Head, "low".into());
        list.apply_insert(stamp(1, 2, 1), Anchor::Head, "high".into());
        assert_values(&list, &["high", "low"]);
    }

    #[test]
    fn move_carries_only_the_moved_element() {
        let (mut list, ids, _) = abcde();
        // C to the front; D and E keep their own slots and stay in place
        list.apply_move(stamp(6, 1, 6), ids[2], Anchor::Head);
        assert_values(&list, &["C", "A", "B", "D", "E"]);
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn later_move_supersedes_despite_lower_counter() {
        let (base, ids, slots) = abcde();
        // peer 5 moves C to the front; peer 2, having seen that, moves it
        // after E with a tiny per-peer counter but a higher lamport
        let first = (stamp(6, 5, 1), ids[2], Anchor::Head);
        let second = (stamp(7, 2, 1), ids[2], Anchor::After(slots[4]));

        let mut forward = base.clone();
        for (s, target, anchor) in [first, second] {
            forward.apply_move(s, target, anchor);
        }
        let mut backward = base;
        for (s, target, anchor) in [second, first] {
            backward.apply_move(s, target, anchor);
        }

        assert_eq!(forward, backward);
        assert_values(&forward, &["A", "B", "D", "E", "C"]);
    }

    #[test]
    fn concurrent_moves_of_same_element_converge() {
        let (base, ids, slots) = abcde();
        let head = (stamp(6, 2, 6), ids[2], Anchor::Head);
        let tail = (stamp(6, 3, 6), ids[2], Anchor::After(slots[4]));

        let mut forward = base.clone();
        for (s, target, anchor) in [head, tail] {
            forward.apply_move(s, target, anchor);
        }
        let mut backward = base;
        for (s, target, anchor) in [tail, head] {
            backward.apply_move(s, target, anchor);
        }

        assert_eq!(forward.values(), backward.values());
        // peer 3's move wins the register, so C sits after E on both replicas
        assert_values(&forward, &["A", "B", "D", "E", "C"]);
    }

    #[test]
    fn concurrent_mutual_moves_lose_nothing() {
        let (base, ids, slots) = abcde();
        // peer 2 places B after E while peer 3 places E after B's old spot;
        // both destination slots are fixed in the backbone, so nothing can
        // become unreachable
        let m1 = (stamp(6, 2, 6), ids[1], Anchor::After(slots[4]));
        let m2 = (stamp(6, 3, 6), ids[4], Anchor::After(slots[1]));

        let mut forward = base.clone();
        for (s, target, anchor) in [m1, m2] {
            forward.apply_move(s, target, anchor);
        }
        let mut backward = base;
        for (s, target, anchor) in [m2, m1] {
            backward.apply_move(s, target, anchor);
        }

        assert_eq!(forward.values(), backward.values());
        assert_eq!(forward.len(), 5, "no element may be lost");
        assert_values(&forward, &["A", "E", "C", "D", "B"]);
    }

    #[test]
    fn delete_wins_visibility_over_concurrent_set() {
        let (base, ids, _) = abcde();

        let mut replica1 = base.clone();
        replica1.apply_set(stamp(6, 2, 6), ids[3], "X".into());
        replica1.apply_delete(ids[3]);

        let mut replica2 = base;
        replica2.apply_delete(ids[3]);
        replica2.apply_set(stamp(6, 2, 6), ids[3], "X".into());

        for replica in [&replica1, &replica2] {
            assert!(replica.is_deleted(ids[3]));
            assert_eq!(replica.len(), 4);
            // the value register still records the winning set
            assert_eq!(replica.get(ids[3]), Some(&"X".into()));
        }
        assert_eq!(replica1.values(), replica2.values());
    }

    #[test]
    fn tombstoned_element_remains_a_valid_anchor() {
        let (mut list, ids, slots) = abcde();
        list.apply_delete(ids[1]);
        // a new element anchored after the deleted B's slot still lands
        // between B's old neighbours
        list.apply_insert(stamp(6, 2, 6), Anchor::After(slots[1]), "F".into());
        assert_values(&list, &["A", "F", "C", "D", "E"]);
    }

    #[test]
    fn losing_move_slot_still_anchors() {
        let (base, ids, _) = abcde();
        // peer 2 moves C to the front and, having seen its own move land,
        // inserts after the slot that move created; peer 3 concurrently
        // moves C after D and wins the register
        let lost_slot = SlotId::from(stamp(6, 2, 6).id());
        let mut list = base;
        list.apply_move(stamp(6, 2, 6), ids[2], Anchor::Head);
        list.apply_move(stamp(6, 3, 6), ids[2], Anchor::After(SlotId::from(ids[3].op())));
        list.apply_insert(stamp(7, 2, 7), Anchor::After(lost_slot), "F".into());

        // C followed peer 3's winning move, but peer 2's insert still lands
        // where its anchor slot sits: at the front
        assert_values(&list, &["F", "A", "B", "D", "C", "E"]);
    }
}
