use super::{LwwRegister, ScalarValue};
use crate::{OpId, Stamp, VersionVector};
use smallvec::SmallVec;
use std::{
    collections::{BTreeMap, BinaryHeap},
    fmt,
};

/// The stable identity of a tree node: the [`OpId`] of its creation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct NodeId(OpId);

impl From<OpId> for NodeId {
    fn from(value: OpId) -> Self {
        Self(value)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeId")
            .field(&self.0.peer())
            .field(&self.0.counter())
            .finish()
    }
}

impl NodeId {
    pub fn op(&self) -> OpId {
        self.0
    }
}

/// The parent slot of a tree node: another node, or the root sentinel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub enum Parent {
    /// The node is a top-level root of the forest.
    Root,
    Node(NodeId),
}

impl fmt::Debug for Parent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parent::Root => write!(f, "/"),
            Parent::Node(id) => write!(f, "/{id:?}"),
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
struct Node {
    parent: LwwRegister<Parent>,
    data: BTreeMap<String, LwwRegister<ScalarValue>>,
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub(crate) enum TreeAction {
    Create {
        parent: Parent,
    },
    Move {
        target: NodeId,
        parent: Parent,
    },
    Set {
        target: NodeId,
        key: String,
        value: ScalarValue,
    },
}

/// A tree operation together with its causal stamp, as retained for replay.
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub(crate) struct TreeOp {
    pub(crate) stamp: Stamp,
    pub(crate) deps: VersionVector,
    pub(crate) action: TreeAction,
}

/// A materialized tree node: identity, attached data, and children.
#[derive(Clone, PartialEq, Debug)]
pub struct TreeNode {
    pub id: NodeId,
    pub data: BTreeMap<String, ScalarValue>,
    pub children: Vec<TreeNode>,
}

/// A forest of nodes whose parent edges can be concurrently reassigned.
///
/// ## Parent registers and the cycle veto
///
/// Each node's parent is a register resolved with the shared
/// last-writer-wins rule. That alone is not enough: two peers can
/// concurrently move `X` under `Y` and `Y` under `X`, each move valid where
/// it was issued, and applying both verbatim knots the forest into a cycle.
///
/// The engine therefore keeps the container's full operation history and,
/// whenever foreign operations arrive, replays it in a canonical order:
/// a topological order of the causal partial order, with concurrent
/// operations scheduled newest [`Stamp`] first. Before a move commits, the
/// ancestor chain of the proposed parent is walked; if the moving node
/// appears in it, the move is **vetoed** -- the register is left untouched,
/// but the operation stays recorded and is never retried. The canonical
/// order is a pure function of the operation set, so every replica computes
/// the identical commit/veto sequence no matter how batches arrived, and
/// the forest is acyclic after every merge.
///
/// Local edits are causally after everything already recorded, so they sort
/// last in any canonical order and can be applied incrementally without a
/// replay.
#[derive(Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct Tree {
    nodes: BTreeMap<NodeId, Node>,
    history: BTreeMap<OpId, TreeOp>,
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{tree}}{:?}", self.nodes)
    }
}

impl Tree {
    /// Returns whether `id` names a node known to this engine.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// The number of nodes in the forest.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The current parent slot of `id`.
    pub fn parent(&self, id: NodeId) -> Option<Parent> {
        self.nodes.get(&id).map(|node| *node.parent.value())
    }

    /// The current value of a node attribute.
    pub fn get(&self, id: NodeId, key: &str) -> Option<&ScalarValue> {
        self.nodes.get(&id)?.data.get(key).map(|reg| reg.value())
    }

    /// Returns whether `ancestor` lies on the parent chain of `node`
    /// (a node is not its own ancestor).
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let Some(start) = self.parent(node) else {
            return false;
        };
        Self::chain_contains(&self.nodes, ancestor, start)
    }

    /// The materialized forest: every root node with its data and children,
    /// children ordered by creation identity.
    pub fn forest(&self) -> Vec<TreeNode> {
        let mut children: BTreeMap<Parent, SmallVec<[NodeId; 4]>> = BTreeMap::new();
        for (&id, node) in &self.nodes {
            children.entry(*node.parent.value()).or_default().push(id);
        }
        // BTreeMap iteration already yields each bucket in NodeId order
        self.assemble(&children, Parent::Root)
    }

    fn assemble(
        &self,
        children: &BTreeMap<Parent, SmallVec<[NodeId; 4]>>,
        slot: Parent,
    ) -> Vec<TreeNode> {
        children
            .get(&slot)
            .into_iter()
            .flatten()
            .map(|&id| TreeNode {
                id,
                data: self.nodes[&id]
                    .data
                    .iter()
                    .map(|(key, reg)| (key.clone(), reg.value().clone()))
                    .collect(),
                children: self.assemble(children, Parent::Node(id)),
            })
            .collect()
    }

    /// Applies a locally issued operation.
    ///
    /// A local op depends on every op already in the history, so it is last
    /// in the canonical order and incremental application agrees with a full
    /// replay.
    pub(crate) fn apply_local(&mut self, op: TreeOp) {
        debug_assert!(
            self.history.keys().all(|&prior| op.deps.contains(prior)),
            "local ops must causally follow the entire container history",
        );
        Self::apply(&mut self.nodes, &op);
        self.history.insert(op.stamp.id(), op);
    }

    /// Records a foreign operation for the next [`Tree::rebuild`].
    ///
    /// The caller batches integrations and rebuilds once per import.
    pub(crate) fn integrate_foreign(&mut self, op: TreeOp) {
        self.history.insert(op.stamp.id(), op);
    }

    /// Recomputes the forest by replaying the full history in canonical
    /// order.
    pub(crate) fn rebuild(&mut self) {
        let ops: Vec<&TreeOp> = self.history.values().collect();
        let mut nodes = BTreeMap::new();
        for idx in Self::canonical_order(&ops) {
            Self::apply(&mut nodes, ops[idx]);
        }
        self.nodes = nodes;
    }

    /// Orders `ops` causally, scheduling concurrent operations newest
    /// [`Stamp`] first.
    ///
    /// The result is a pure function of the operation set: ready candidates
    /// and the tie-break never depend on arrival order.
    fn canonical_order(ops: &[&TreeOp]) -> Vec<usize> {
        let n = ops.len();
        // the causal partial order restricted to this container's ops
        let mut dependents: Vec<SmallVec<[usize; 4]>> = vec![SmallVec::new(); n];
        let mut missing: Vec<usize> = vec![0; n];
        for (i, op) in ops.iter().enumerate() {
            for (j, pred) in ops.iter().enumerate() {
                if i != j && op.deps.contains(pred.stamp.id()) {
                    dependents[j].push(i);
                    missing[i] += 1;
                }
            }
        }

        let mut ready: BinaryHeap<(Stamp, usize)> = ops
            .iter()
            .enumerate()
            .filter(|&(i, _)| missing[i] == 0)
            .map(|(i, op)| (op.stamp, i))
            .collect();
        let mut order = Vec::with_capacity(n);
        while let Some((_, i)) = ready.pop() {
            order.push(i);
            for &dep in &dependents[i] {
                missing[dep] -= 1;
                if missing[dep] == 0 {
                    ready.push((ops[dep].stamp, dep));
                }
            }
        }
        debug_assert_eq!(
            order.len(),
            n,
            "imports only admit ops with satisfiable dependencies",
        );
        order
    }

    fn apply(nodes: &mut BTreeMap<NodeId, Node>, op: &TreeOp) {
        match &op.action {
            TreeAction::Create { parent } => {
                let prev = nodes.insert(
                    op.stamp.id().into(),
                    Node {
                        parent: LwwRegister::new(*parent, op.stamp),
                        data: BTreeMap::new(),
                    },
                );
                debug_assert!(prev.is_none(), "create op ids are unique by construction");
            }
            TreeAction::Move { target, parent } => {
                let node = nodes
                    .get(target)
                    .expect("target creation is causally before any move of it");
                if !node.parent.wins(op.stamp) {
                    // lost the register to a concurrent higher move
                    return;
                }
                if let Parent::Node(start) = parent
                    && Self::chain_contains(nodes, *target, Parent::Node(*start))
                {
                    tracing::debug!(op = ?op.stamp, ?target, ?parent, "vetoing cycle-forming move");
                    return;
                }
                let node = nodes.get_mut(target).expect("checked above");
                node.parent.write(*parent, op.stamp);
            }
            TreeAction::Set { target, key, value } => {
                let node = nodes
                    .get_mut(target)
                    .expect("target creation is causally before any write to it");
                match node.data.get_mut(key) {
                    Some(reg) => {
                        reg.write(value.clone(), op.stamp);
                    }
                    None => {
                        node.data
                            .insert(key.clone(), LwwRegister::new(value.clone(), op.stamp));
                    }
                }
            }
        }
    }

    /// Walks the parent chain starting at `slot`; true if `needle` occurs.
    ///
    /// The chain is acyclic by the engine invariant, so the walk terminates.
    fn chain_contains(nodes: &BTreeMap<NodeId, Node>, needle: NodeId, slot: Parent) -> bool {
        let mut cursor = slot;
        while let Parent::Node(id) = cursor {
            if id == needle {
                return true;
            }
            cursor = match nodes.get(&id) {
                Some(node) => *node.parent.value(),
                None => return false,
            };
        }
        false
    }
}
