//! # Container Engines
//!
//! This module provides the conflict-resolving container engines a
//! [`Document`](crate::Document) is composed of:
//!
//! - **[`MovableList`]**: an ordered sequence whose elements have stable
//!   identity and can be concurrently repositioned, rewritten, and deleted.
//!
//! - **[`Tree`]**: a forest of nodes with stable identity whose parent edges
//!   can be concurrently reassigned; merges never produce a cycle.
//!
//! - **[`LwwMap`]**: a string-keyed map with last-writer-wins entries.
//!
//! - **[`Text`]**: an append/delete character stream.
//!
//! All four resolve concurrent writes to the same register with the same
//! rule, implemented once in [`LwwRegister`]: the write with the greater
//! [`Stamp`] holds the register. A causally-later write always carries a
//! greater Lamport time, so it replaces what it supersedes; concurrent
//! writes tie-break on the peer id. Because every replica applies the same
//! rule over the same operation set, replicas converge regardless of
//! delivery order.
//!
//! The engines only ever *apply* operations; minting identifiers, logging,
//! and causal filtering are the [`Document`](crate::Document)'s job.
use crate::Stamp;
use std::fmt;

pub mod list;
pub mod map;
pub mod text;
pub mod tree;

pub use list::MovableList;
pub use map::LwwMap;
pub use text::Text;
pub use tree::{Tree, TreeNode};

/// A primitive value stored in a container.
///
/// This enum represents the leaf values a sequence element, map entry, or
/// tree-node attribute can hold.
// NOTE: Why no U32 or I32? Make this a serialization concern.
#[derive(Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub enum ScalarValue {
    // NOTE: the #[serde] here is needed to get efficient encoding of byte-arrays for
    // protocols that support it (like msgpack):
    // <https://docs.rs/rmp-serde/1/rmp_serde/index.html#efficient-storage-of-u8-types>
    Bytes(#[cfg_attr(feature = "serde", serde(with = "serde_bytes"))] Vec<u8>),
    String(String),
    Double(f64),
    U64(u64),
    I64(i64),
    Bool(bool),
}

impl fmt::Debug for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Bytes(v) => write!(f, "b{v:?}"),
            ScalarValue::String(v) => write!(f, "{v:?}"),
            ScalarValue::Double(v) => write!(f, "{v:?}"),
            ScalarValue::U64(v) => write!(f, "{v:?}"),
            ScalarValue::I64(v) => write!(f, "{v:?}"),
            ScalarValue::Bool(v) => write!(f, "{v:?}"),
        }
    }
}

macro_rules! impl_from {
    (
        $(
            $source:ty => $target:ident $(with $conv:ident)?
        ),* $(,)?
    ) => {
        $(
            impl From<$source> for ScalarValue {
                fn from(value: $source) -> Self {
                    Self::$target(impl_from!(value$(, $conv)?))
                }
            }
        )*
    };

    ($value:ident, $conv:ident) => {
        $value.$conv()
    };

    ($value:ident) => {
        $value
    };
}

impl_from!(
    Vec<u8> => Bytes,
    &[u8] => Bytes with to_vec,
    String => String,
    &str => String with to_string,
    f64 => Double,
    u64 => U64,
    i64 => I64,
    bool => Bool,
);

macro_rules! impl_partial_eq {
    ({$($t:ty),+}) => {
        $(impl_partial_eq!($t);)+
    };

    ($t:ty) => {
        impl PartialEq<$t> for ScalarValue {
            fn eq(&self, other: &$t) -> bool {
                ScalarValue::from(other.to_owned()) == *self
            }
        }
    };
}
impl_partial_eq!({str, &str, bool, f64, u64, i64});

/// A last-writer-wins register, the conflict-resolution primitive shared by
/// every container engine.
///
/// The register remembers the value together with the [`Stamp`] of the
/// operation that wrote it, and an incoming write replaces the current value
/// iff its stamp orders higher. That single comparison covers every case:
/// a causally-later write carries a strictly greater Lamport time, so it
/// supersedes whatever it knew about; concurrent writes tie-break on the
/// peer id, identically on every replica; and a write that arrives after a
/// causally-later one has already landed simply loses.
#[derive(Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub(crate) struct LwwRegister<T> {
    value: T,
    writer: Stamp,
}

impl<T: fmt::Debug> fmt::Debug for LwwRegister<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}={:?}", self.writer, self.value)
    }
}

impl<T> LwwRegister<T> {
    /// Creates a register holding the initial write of `value` by `writer`.
    pub(crate) fn new(value: T, writer: Stamp) -> Self {
        Self { value, writer }
    }

    /// Applies a write, returning whether it won the register.
    pub(crate) fn write(&mut self, value: T, writer: Stamp) -> bool {
        if self.wins(writer) {
            self.value = value;
            self.writer = writer;
            true
        } else {
            false
        }
    }

    /// Returns whether a write stamped `writer` would win this register,
    /// without performing it.
    pub(crate) fn wins(&self, writer: Stamp) -> bool {
        writer > self.writer
    }

    pub(crate) fn value(&self) -> &T {
        &self.value
    }

    /// The [`Stamp`] of the write currently holding the register.
    pub(crate) fn writer(&self) -> Stamp {
        self.writer
    }
}
