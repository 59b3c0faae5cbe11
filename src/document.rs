//! # Document
//!
//! A replica of a replicated document: a set of named containers, the
//! operation log backing them, and the clocks that stamp local edits.
//!
//! All mutation goes through typed handles ([`ListHandle`], [`TreeHandle`],
//! [`MapHandle`], [`TextHandle`]) obtained by container name. A handle
//! validates the edit against local state, mints the next [`OpId`] for this
//! replica, applies the operation, and records it in the log. Foreign
//! operations enter exclusively through [`Document::import_ops`].
use crate::{
    Error, OpId, PeerId, VersionVector,
    crdts::{
        LwwMap, MovableList, ScalarValue, Text, Tree, TreeNode,
        list::{Anchor, ElementId},
        text::{CharAnchor, CharId},
        tree::{NodeId, Parent, TreeAction, TreeOp},
    },
    error::ContainerKind,
    oplog::{Op, OpLog, OpPayload},
};
use std::collections::BTreeMap;

/// One named container and its engine state.
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub(crate) enum Container {
    List(MovableList),
    Tree(Tree),
    Map(LwwMap),
    Text(Text),
}

impl Container {
    pub(crate) fn kind(&self) -> ContainerKind {
        match self {
            Container::List(_) => ContainerKind::List,
            Container::Tree(_) => ContainerKind::Tree,
            Container::Map(_) => ContainerKind::Map,
            Container::Text(_) => ContainerKind::Text,
        }
    }

    pub(crate) fn empty(kind: ContainerKind) -> Self {
        match kind {
            ContainerKind::List => Container::List(MovableList::default()),
            ContainerKind::Tree => Container::Tree(Tree::default()),
            ContainerKind::Map => Container::Map(LwwMap::default()),
            ContainerKind::Text => Container::Text(Text::default()),
        }
    }

    /// Applies an operation whose target validity the caller has already
    /// established. `local` distinguishes the incremental path (local edits
    /// are causally last) from the replay path the tree engine needs for
    /// foreign operations.
    pub(crate) fn apply(&mut self, op: &Op, local: bool) {
        match (self, &op.payload) {
            (Container::List(list), OpPayload::ListInsert { anchor, value }) => {
                list.apply_insert(op.stamp(), *anchor, value.clone());
            }
            (Container::List(list), OpPayload::ListMove { target, anchor }) => {
                list.apply_move(op.stamp(), *target, *anchor);
            }
            (Container::List(list), OpPayload::ListSet { target, value }) => {
                list.apply_set(op.stamp(), *target, value.clone());
            }
            (Container::List(list), OpPayload::ListDelete { target }) => {
                list.apply_delete(*target);
            }
            (Container::Tree(tree), payload) => {
                let action = match payload {
                    OpPayload::TreeCreate { parent } => TreeAction::Create { parent: *parent },
                    OpPayload::TreeMove { target, parent } => TreeAction::Move {
                        target: *target,
                        parent: *parent,
                    },
                    OpPayload::TreeSet { target, key, value } => TreeAction::Set {
                        target: *target,
                        key: key.clone(),
                        value: value.clone(),
                    },
                    _ => unreachable!("op kinds are validated before application"),
                };
                let op = TreeOp {
                    stamp: op.stamp(),
                    deps: op.deps.clone(),
                    action,
                };
                if local {
                    tree.apply_local(op);
                } else {
                    tree.integrate_foreign(op);
                }
            }
            (Container::Map(map), OpPayload::MapSet { key, value }) => {
                map.apply_set(op.stamp(), key, value.clone());
            }
            (Container::Text(text), OpPayload::TextInsert { anchor, ch }) => {
                text.apply_insert(op.stamp(), *anchor, *ch);
            }
            (Container::Text(text), OpPayload::TextDelete { target }) => {
                text.apply_delete(*target);
            }
            _ => unreachable!("op kinds are validated before application"),
        }
    }
}

/// The kind of container a payload addresses.
pub(crate) fn payload_kind(payload: &OpPayload) -> ContainerKind {
    match payload {
        OpPayload::ListInsert { .. }
        | OpPayload::ListMove { .. }
        | OpPayload::ListSet { .. }
        | OpPayload::ListDelete { .. } => ContainerKind::List,
        OpPayload::TreeCreate { .. } | OpPayload::TreeMove { .. } | OpPayload::TreeSet { .. } => {
            ContainerKind::Tree
        }
        OpPayload::MapSet { .. } => ContainerKind::Map,
        OpPayload::TextInsert { .. } | OpPayload::TextDelete { .. } => ContainerKind::Text,
    }
}

/// One replica of a replicated document.
///
/// ```
/// use mvdoc::{Document, PeerId};
///
/// let mut doc = Document::new(PeerId::new(1));
/// let mut items = doc.list("items")?;
/// items.push("milk")?;
/// items.push("eggs")?;
/// items.insert(0, "bread")?;
/// assert_eq!(doc.get_list("items").unwrap().len(), 3);
/// # Ok::<(), mvdoc::Error>(())
/// ```
#[derive(Clone, PartialEq, Debug)]
pub struct Document {
    peer: PeerId,
    /// Everything this replica has applied; local edits depend on all of it.
    pub(crate) clock: VersionVector,
    /// Lamport time: the maximum lamport over every op applied so far.
    pub(crate) lamport: u64,
    pub(crate) log: OpLog,
    pub(crate) containers: BTreeMap<String, Container>,
}

impl Document {
    /// Creates an empty replica writing as `peer`.
    ///
    /// Peer identifiers must be unique among replicas of the same document;
    /// two writers sharing a peer id can mint colliding [`OpId`]s, and no
    /// downstream guarantee survives that.
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            clock: VersionVector::new(),
            lamport: 0,
            log: OpLog::default(),
            containers: BTreeMap::new(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// The frontier of everything this replica has applied.
    pub fn version(&self) -> &VersionVector {
        &self.clock
    }

    pub fn log(&self) -> &OpLog {
        &self.log
    }

    /// Mints the next local [`OpId`], applies `payload`, and records it.
    ///
    /// The handle that calls this has already validated the payload's
    /// targets against local state.
    fn commit_local(&mut self, container: &str, payload: OpPayload) -> OpId {
        let id = self.clock.next_id(self.peer);
        self.lamport += 1;
        let op = Op {
            id,
            lamport: self.lamport,
            deps: self.clock.clone(),
            container: container.to_string(),
            payload,
        };
        let kind = payload_kind(&op.payload);
        self.containers
            .entry(op.container.clone())
            .or_insert_with(|| Container::empty(kind))
            .apply(&op, true);
        self.clock.observe(id);
        self.log.append(op);
        id
    }

    fn open(&mut self, name: &str, kind: ContainerKind) -> Result<(), Error> {
        match self.containers.get(name) {
            Some(container) if container.kind() != kind => Err(Error::InvalidTarget(format!(
                "container {name:?} is a {} not a {kind}",
                container.kind(),
            ))),
            Some(_) => Ok(()),
            None => {
                self.containers
                    .insert(name.to_string(), Container::empty(kind));
                Ok(())
            }
        }
    }

    /// Opens the named movable list for editing, creating it if absent.
    pub fn list(&mut self, name: &str) -> Result<ListHandle<'_>, Error> {
        self.open(name, ContainerKind::List)?;
        Ok(ListHandle {
            doc: self,
            name: name.to_string(),
        })
    }

    /// Opens the named tree for editing, creating it if absent.
    pub fn tree(&mut self, name: &str) -> Result<TreeHandle<'_>, Error> {
        self.open(name, ContainerKind::Tree)?;
        Ok(TreeHandle {
            doc: self,
            name: name.to_string(),
        })
    }

    /// Opens the named map for editing, creating it if absent.
    pub fn map(&mut self, name: &str) -> Result<MapHandle<'_>, Error> {
        self.open(name, ContainerKind::Map)?;
        Ok(MapHandle {
            doc: self,
            name: name.to_string(),
        })
    }

    /// Opens the named text for editing, creating it if absent.
    pub fn text(&mut self, name: &str) -> Result<TextHandle<'_>, Error> {
        self.open(name, ContainerKind::Text)?;
        Ok(TextHandle {
            doc: self,
            name: name.to_string(),
        })
    }

    /// The named list's current state, if the container exists as a list.
    pub fn get_list(&self, name: &str) -> Option<&MovableList> {
        match self.containers.get(name)? {
            Container::List(list) => Some(list),
            _ => None,
        }
    }

    /// The named tree's current state, if the container exists as a tree.
    pub fn get_tree(&self, name: &str) -> Option<&Tree> {
        match self.containers.get(name)? {
            Container::Tree(tree) => Some(tree),
            _ => None,
        }
    }

    /// The named map's current state, if the container exists as a map.
    pub fn get_map(&self, name: &str) -> Option<&LwwMap> {
        match self.containers.get(name)? {
            Container::Map(map) => Some(map),
            _ => None,
        }
    }

    /// The named text's current state, if the container exists as a text.
    pub fn get_text(&self, name: &str) -> Option<&Text> {
        match self.containers.get(name)? {
            Container::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The container names present on this replica, in order.
    pub fn container_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.containers.keys().map(String::as_str)
    }
}

/// Editing handle for a movable list container.
///
/// Index-based conveniences resolve indices against the *visible* sequence
/// at call time and then operate on stable identities, so a handle edit
/// means "the element currently at this position", never "whatever later
/// ends up at this position".
pub struct ListHandle<'a> {
    doc: &'a mut Document,
    name: String,
}

impl ListHandle<'_> {
    fn state(&self) -> &MovableList {
        match &self.doc.containers[&self.name] {
            Container::List(list) => list,
            _ => unreachable!("handle construction checks the container kind"),
        }
    }

    fn require(&self, target: ElementId) -> Result<(), Error> {
        if self.state().contains(target) {
            Ok(())
        } else {
            Err(Error::UnknownIdentity(target.op()))
        }
    }

    /// Resolves an element reference to a backbone anchor: the slot the
    /// element occupies as of this replica's state. The payload carries the
    /// resolved slot, so the placement is fixed at issue time and survives
    /// later moves of the referenced element.
    fn resolve_anchor(&self, anchor: Option<ElementId>) -> Result<Anchor, Error> {
        match anchor {
            None => Ok(Anchor::Head),
            Some(id) => {
                let slot = self
                    .state()
                    .slot_of(id)
                    .ok_or(Error::UnknownIdentity(id.op()))?;
                Ok(Anchor::After(slot))
            }
        }
    }

    /// The anchor naming the slot before visible index `idx`.
    fn anchor_at(&self, idx: usize) -> Result<Anchor, Error> {
        let state = self.state();
        if idx > state.len() {
            return Err(Error::InvalidTarget(format!(
                "index {idx} out of bounds for length {}",
                state.len(),
            )));
        }
        self.resolve_anchor(match idx.checked_sub(1) {
            None => None,
            Some(prev) => Some(state.id_at(prev).expect("index checked above")),
        })
    }

    /// Inserts `value` immediately after `anchor` (`None` for the front)
    /// and returns the new element's identity.
    pub fn insert_after(
        &mut self,
        anchor: Option<ElementId>,
        value: impl Into<ScalarValue>,
    ) -> Result<ElementId, Error> {
        let anchor = self.resolve_anchor(anchor)?;
        let op = self.doc.commit_local(
            &self.name,
            OpPayload::ListInsert {
                anchor,
                value: value.into(),
            },
        );
        Ok(op.into())
    }

    /// Inserts `value` at visible index `idx`.
    pub fn insert(
        &mut self,
        idx: usize,
        value: impl Into<ScalarValue>,
    ) -> Result<ElementId, Error> {
        let anchor = self.anchor_at(idx)?;
        let op = self.doc.commit_local(
            &self.name,
            OpPayload::ListInsert {
                anchor,
                value: value.into(),
            },
        );
        Ok(op.into())
    }

    /// Appends `value` at the end.
    pub fn push(&mut self, value: impl Into<ScalarValue>) -> Result<ElementId, Error> {
        self.insert(self.state().len(), value)
    }

    /// Repositions `target` immediately after `anchor` (`None` for the
    /// front).
    pub fn move_after(
        &mut self,
        target: ElementId,
        anchor: Option<ElementId>,
    ) -> Result<OpId, Error> {
        self.require(target)?;
        let anchor = self.resolve_anchor(anchor)?;
        Ok(self
            .doc
            .commit_local(&self.name, OpPayload::ListMove { target, anchor }))
    }

    /// Moves the element at visible index `from` to visible index `to`,
    /// where `to` is interpreted against the sequence with the element
    /// removed.
    pub fn mv(&mut self, from: usize, to: usize) -> Result<OpId, Error> {
        let state = self.state();
        let target = state.id_at(from).ok_or_else(|| {
            Error::InvalidTarget(format!(
                "index {from} out of bounds for length {}",
                state.len(),
            ))
        })?;
        let mut remaining: Vec<ElementId> =
            state.to_vec().into_iter().map(|(id, _)| id).collect();
        remaining.remove(from);
        if to > remaining.len() {
            return Err(Error::InvalidTarget(format!(
                "destination {to} out of bounds for length {}",
                remaining.len(),
            )));
        }
        let anchor = self.resolve_anchor(match to.checked_sub(1) {
            None => None,
            Some(prev) => Some(remaining[prev]),
        })?;
        Ok(self
            .doc
            .commit_local(&self.name, OpPayload::ListMove { target, anchor }))
    }

    /// Rewrites the value of `target`.
    pub fn set(&mut self, target: ElementId, value: impl Into<ScalarValue>) -> Result<OpId, Error> {
        self.require(target)?;
        Ok(self.doc.commit_local(
            &self.name,
            OpPayload::ListSet {
                target,
                value: value.into(),
            },
        ))
    }

    /// Rewrites the value of the element at visible index `idx`.
    pub fn set_at(&mut self, idx: usize, value: impl Into<ScalarValue>) -> Result<OpId, Error> {
        let target = self.state().id_at(idx).ok_or_else(|| {
            Error::InvalidTarget(format!(
                "index {idx} out of bounds for length {}",
                self.state().len(),
            ))
        })?;
        self.set(target, value)
    }

    /// Tombstones `target`. Deleting a tombstone again is a no-op but still
    /// recorded.
    pub fn delete(&mut self, target: ElementId) -> Result<OpId, Error> {
        self.require(target)?;
        Ok(self
            .doc
            .commit_local(&self.name, OpPayload::ListDelete { target }))
    }

    /// Tombstones the element at visible index `idx`.
    pub fn delete_at(&mut self, idx: usize) -> Result<OpId, Error> {
        let target = self.state().id_at(idx).ok_or_else(|| {
            Error::InvalidTarget(format!(
                "index {idx} out of bounds for length {}",
                self.state().len(),
            ))
        })?;
        self.delete(target)
    }
}

/// Editing handle for a tree container.
pub struct TreeHandle<'a> {
    doc: &'a mut Document,
    name: String,
}

impl TreeHandle<'_> {
    fn state(&self) -> &Tree {
        match &self.doc.containers[&self.name] {
            Container::Tree(tree) => tree,
            _ => unreachable!("handle construction checks the container kind"),
        }
    }

    fn slot(&self, parent: Option<NodeId>) -> Result<Parent, Error> {
        match parent {
            None => Ok(Parent::Root),
            Some(id) => {
                if self.state().contains(id) {
                    Ok(Parent::Node(id))
                } else {
                    Err(Error::UnknownIdentity(id.op()))
                }
            }
        }
    }

    /// Creates a node under `parent` (`None` for the root) and returns its
    /// identity.
    pub fn create(&mut self, parent: Option<NodeId>) -> Result<NodeId, Error> {
        let parent = self.slot(parent)?;
        let op = self
            .doc
            .commit_local(&self.name, OpPayload::TreeCreate { parent });
        Ok(op.into())
    }

    /// Reparents `target` under `parent` (`None` for the root).
    ///
    /// A move that would place a node under itself or one of its own
    /// descendants is rejected here; the merge-time veto exists only for
    /// cycles no single replica could see.
    pub fn mv(&mut self, target: NodeId, parent: Option<NodeId>) -> Result<OpId, Error> {
        if !self.state().contains(target) {
            return Err(Error::UnknownIdentity(target.op()));
        }
        let parent = self.slot(parent)?;
        if let Parent::Node(new_parent) = parent
            && (new_parent == target || self.state().is_ancestor(target, new_parent))
        {
            return Err(Error::InvalidTarget(format!(
                "moving {target:?} under {new_parent:?} would create a cycle"
            )));
        }
        Ok(self
            .doc
            .commit_local(&self.name, OpPayload::TreeMove { target, parent }))
    }

    /// Writes the attribute `key` of `target`.
    pub fn set(
        &mut self,
        target: NodeId,
        key: impl Into<String>,
        value: impl Into<ScalarValue>,
    ) -> Result<OpId, Error> {
        if !self.state().contains(target) {
            return Err(Error::UnknownIdentity(target.op()));
        }
        Ok(self.doc.commit_local(
            &self.name,
            OpPayload::TreeSet {
                target,
                key: key.into(),
                value: value.into(),
            },
        ))
    }

    /// The materialized forest.
    pub fn forest(&self) -> Vec<TreeNode> {
        self.state().forest()
    }
}

/// Editing handle for a map container.
pub struct MapHandle<'a> {
    doc: &'a mut Document,
    name: String,
}

impl MapHandle<'_> {
    /// Writes `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ScalarValue>) -> OpId {
        self.doc.commit_local(
            &self.name,
            OpPayload::MapSet {
                key: key.into(),
                value: Some(value.into()),
            },
        )
    }

    /// Removes `key`. Removal is itself a write, so removing an absent key
    /// is valid and still recorded.
    pub fn remove(&mut self, key: impl Into<String>) -> OpId {
        self.doc.commit_local(
            &self.name,
            OpPayload::MapSet {
                key: key.into(),
                value: None,
            },
        )
    }
}

/// Editing handle for a text container.
pub struct TextHandle<'a> {
    doc: &'a mut Document,
    name: String,
}

impl TextHandle<'_> {
    fn state(&self) -> &Text {
        match &self.doc.containers[&self.name] {
            Container::Text(text) => text,
            _ => unreachable!("handle construction checks the container kind"),
        }
    }

    /// Inserts `s` at visible character index `idx`, one operation per
    /// character, and returns the identity of the first inserted character.
    pub fn insert(&mut self, idx: usize, s: &str) -> Result<Option<CharId>, Error> {
        let state = self.state();
        if idx > state.len() {
            return Err(Error::InvalidTarget(format!(
                "index {idx} out of bounds for length {}",
                state.len(),
            )));
        }
        let mut anchor = match idx.checked_sub(1) {
            None => CharAnchor::Head,
            Some(prev) => CharAnchor::After(state.id_at(prev).expect("index checked above")),
        };
        let mut first = None;
        for ch in s.chars() {
            let op = self
                .doc
                .commit_local(&self.name, OpPayload::TextInsert { anchor, ch });
            let id = CharId::from(op);
            first.get_or_insert(id);
            anchor = CharAnchor::After(id);
        }
        Ok(first)
    }

    /// Appends `s` at the end.
    pub fn push_str(&mut self, s: &str) -> Result<Option<CharId>, Error> {
        self.insert(self.state().len(), s)
    }

    /// Tombstones `len` visible characters starting at index `idx`.
    pub fn delete(&mut self, idx: usize, len: usize) -> Result<(), Error> {
        let state = self.state();
        if idx + len > state.len() {
            return Err(Error::InvalidTarget(format!(
                "range {idx}..{} out of bounds for length {}",
                idx + len,
                state.len(),
            )));
        }
        let targets: Vec<CharId> = state.chars()[idx..idx + len]
            .iter()
            .map(|&(id, _)| id)
            .collect();
        for target in targets {
            self.doc
                .commit_local(&self.name, OpPayload::TextDelete { target });
        }
        Ok(())
    }

    /// Tombstones the character with identity `target`.
    pub fn delete_char(&mut self, target: CharId) -> Result<OpId, Error> {
        if !self.state().contains(target) {
            return Err(Error::UnknownIdentity(target.op()));
        }
        Ok(self
            .doc
            .commit_local(&self.name, OpPayload::TextDelete { target }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_list_edits_round_through_the_log() {
        let mut doc = Document::new(PeerId::new(1));
        let mut items = doc.list("items").unwrap();
        let a = items.push("A").unwrap();
        items.push("B").unwrap();
        items.insert(1, "between").unwrap();
        items.set(a, "a").unwrap();

        let list = doc.get_list("items").unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.get(a), Some(&"a".into()));
        assert_eq!(doc.log().len(), 4);
        assert_eq!(doc.version().get(PeerId::new(1)), 4);
    }

    #[test]
    fn index_based_move_targets_identity() {
        let mut doc = Document::new(PeerId::new(1));
        let mut items = doc.list("items").unwrap();
        for value in ["A", "B", "C"] {
            items.push(value).unwrap();
        }
        items.mv(2, 0).unwrap();
        let values = doc.get_list("items").unwrap().values();
        assert_eq!(values, [&ScalarValue::from("C"), &"A".into(), &"B".into()]);
    }

    #[test]
    fn unknown_identity_is_rejected() {
        let mut doc = Document::new(PeerId::new(1));
        let stranger = ElementId::from(OpId::mint(PeerId::new(9), 1));
        let mut items = doc.list("items").unwrap();
        assert_eq!(
            items.set(stranger, "x"),
            Err(Error::UnknownIdentity(stranger.op())),
        );
        assert_eq!(items.delete(stranger), Err(Error::UnknownIdentity(stranger.op())));
        // nothing was recorded
        assert!(doc.log().is_empty());
    }

    #[test]
    fn local_cycle_forming_tree_move_is_an_error() {
        let mut doc = Document::new(PeerId::new(1));
        let mut tree = doc.tree("nodes").unwrap();
        let a = tree.create(None).unwrap();
        let b = tree.create(Some(a)).unwrap();
        let c = tree.create(Some(b)).unwrap();

        assert!(matches!(tree.mv(a, Some(c)), Err(Error::InvalidTarget(_))));
        assert!(matches!(tree.mv(a, Some(a)), Err(Error::InvalidTarget(_))));
        // the rejected moves left no trace
        assert_eq!(doc.log().len(), 3);
        assert_eq!(doc.get_tree("nodes").unwrap().parent(a), Some(Parent::Root));
    }

    #[test]
    fn container_names_are_kind_stable() {
        let mut doc = Document::new(PeerId::new(1));
        doc.list("shared").unwrap().push("x").unwrap();
        assert!(matches!(doc.tree("shared"), Err(Error::InvalidTarget(_))));
        assert!(doc.list("shared").is_ok());
    }

    #[test]
    fn text_editing_by_index() {
        let mut doc = Document::new(PeerId::new(1));
        let mut text = doc.text("body").unwrap();
        text.push_str("Hello world").unwrap();
        text.delete(5, 6).unwrap();
        text.insert(5, "!").unwrap();
        assert_eq!(doc.get_text("body").unwrap().to_string(), "Hello!");
    }

    #[test]
    fn map_set_and_remove() {
        let mut doc = Document::new(PeerId::new(1));
        let mut meta = doc.map("meta").unwrap();
        meta.set("title", "notes");
        meta.set("count", 3u64);
        meta.remove("count");
        let map = doc.get_map("meta").unwrap();
        assert_eq!(map.get("title"), Some(&"notes".into()));
        assert!(!map.contains_key("count"));
    }
}
