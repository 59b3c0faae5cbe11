//! Error types surfaced by local edits and by the merge driver.
use crate::OpId;
use std::fmt;

/// The container kind named by an operation or found in a document.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub enum ContainerKind {
    List,
    Tree,
    Map,
    Text,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerKind::List => "list",
            ContainerKind::Tree => "tree",
            ContainerKind::Map => "map",
            ContainerKind::Text => "text",
        };
        f.write_str(name)
    }
}

/// Why an imported batch was rejected.
///
/// A rejected batch leaves the receiving document untouched; the variants
/// describe the first defect found while validating it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum BatchIssue {
    /// The batch plus the local log never satisfies the dependencies of
    /// this op, so it can never be applied.
    CausalGap(OpId),
    /// An op addresses an element, node, or character that neither the
    /// local state nor an earlier op in the batch creates.
    UnknownTarget { op: OpId, target: OpId },
    /// An op addresses an existing container as the wrong kind.
    KindMismatch {
        op: OpId,
        container: String,
        expected: ContainerKind,
        found: ContainerKind,
    },
    /// Two ops in the batch carry the same id with different contents, or
    /// an op contradicts the already-recorded op under its id.
    DuplicateId(OpId),
}

impl fmt::Display for BatchIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchIssue::CausalGap(op) => {
                write!(f, "dependencies of op {op:?} are not satisfiable")
            }
            BatchIssue::UnknownTarget { op, target } => {
                write!(f, "op {op:?} addresses unknown target {target:?}")
            }
            BatchIssue::KindMismatch {
                op,
                container,
                expected,
                found,
            } => write!(
                f,
                "op {op:?} addresses container {container:?} as a {expected} but it is a {found}"
            ),
            BatchIssue::DuplicateId(op) => {
                write!(f, "op id {op:?} is claimed by two different operations")
            }
        }
    }
}

/// Errors returned by [`Document`](crate::Document) operations.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Error {
    /// A local edit named an element, node, or character this replica has
    /// never seen.
    UnknownIdentity(OpId),
    /// A local edit was structurally invalid, for example a tree move that
    /// would place a node under its own descendant.
    InvalidTarget(String),
    /// An imported batch was internally inconsistent and was dropped in
    /// its entirety.
    MalformedBatch(BatchIssue),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnknownIdentity(id) => write!(f, "unknown identity {id:?}"),
            Error::InvalidTarget(why) => write!(f, "invalid target: {why}"),
            Error::MalformedBatch(issue) => write!(f, "malformed batch: {issue}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<BatchIssue> for Error {
    fn from(value: BatchIssue) -> Self {
        Error::MalformedBatch(value)
    }
}
