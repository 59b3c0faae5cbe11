use crate::{OpId, Stamp, create_map};
use smallvec::SmallVec;
use std::{collections::BTreeMap, fmt};

/// The stable identity of a single character: the [`OpId`] of its insertion.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct CharId(OpId);

impl From<OpId> for CharId {
    fn from(value: OpId) -> Self {
        Self(value)
    }
}

impl fmt::Debug for CharId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CharId")
            .field(&self.0.peer())
            .field(&self.0.counter())
            .finish()
    }
}

impl CharId {
    pub fn op(&self) -> OpId {
        self.0
    }
}

/// The placement target of an inserted character.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub enum CharAnchor {
    /// Before everything else.
    Head,
    /// Immediately after the named character.
    After(CharId),
}

impl fmt::Debug for CharAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CharAnchor::Head => write!(f, "^"),
            CharAnchor::After(id) => write!(f, ">{id:?}"),
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
struct Glyph {
    ch: char,
    stamp: Stamp,
    anchor: CharAnchor,
    /// Monotone: once set, never cleared.
    deleted: bool,
}

/// An append/delete character stream.
///
/// This is the classic replicated-growable-array construction: every
/// character is inserted with a fixed anchor (the character it goes after,
/// chosen at issue time) and deletion tombstones it. Characters are never
/// repositioned, so unlike [`MovableList`](super::MovableList) there is no
/// slot backbone and no position registers: an anchor always names a
/// causally-earlier insertion directly.
///
/// Concurrent insertions at the same anchor are ordered newest [`Stamp`]
/// first, which keeps runs typed by one peer contiguous and puts an insert
/// issued after a tombstone where the writer saw it land.
#[derive(Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct Text {
    glyphs: BTreeMap<CharId, Glyph>,
}

impl fmt::Debug for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.to_string())
    }
}

impl fmt::Display for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for id in self.linearize() {
            let glyph = &self.glyphs[&id];
            if !glyph.deleted {
                write!(f, "{}", glyph.ch)?;
            }
        }
        Ok(())
    }
}

impl Text {
    /// Returns whether `id` names a character known to this engine.
    pub fn contains(&self, id: CharId) -> bool {
        self.glyphs.contains_key(&id)
    }

    /// The number of visible characters.
    pub fn len(&self) -> usize {
        self.glyphs.values().filter(|g| !g.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The visible characters, in order, with their identities.
    pub fn chars(&self) -> Vec<(CharId, char)> {
        self.linearize()
            .into_iter()
            .filter_map(|id| {
                let glyph = &self.glyphs[&id];
                (!glyph.deleted).then_some((id, glyph.ch))
            })
            .collect()
    }

    /// The identity of the visible character at `idx`, if any.
    pub fn id_at(&self, idx: usize) -> Option<CharId> {
        self.chars().get(idx).map(|&(id, _)| id)
    }

    pub(crate) fn apply_insert(&mut self, stamp: Stamp, anchor: CharAnchor, ch: char) {
        let prev = self.glyphs.insert(
            stamp.id().into(),
            Glyph {
                ch,
                stamp,
                anchor,
                deleted: false,
            },
        );
        debug_assert!(prev.is_none(), "insert op ids are unique by construction");
    }

    pub(crate) fn apply_delete(&mut self, target: CharId) {
        self.glyphs
            .get_mut(&target)
            .expect("target existence is validated before an op is accepted")
            .deleted = true;
    }

    fn linearize(&self) -> Vec<CharId> {
        let mut buckets = create_map::<CharAnchor, SmallVec<[CharId; 4]>>();
        for (&id, glyph) in &self.glyphs {
            buckets.entry(glyph.anchor).or_default().push(id);
        }
        for bucket in buckets.values_mut() {
            bucket.sort_unstable_by(|a, b| self.glyphs[b].stamp.cmp(&self.glyphs[a].stamp));
        }

        let mut order = Vec::with_capacity(self.glyphs.len());
        let mut stack: Vec<CharId> = Vec::new();
        if let Some(first) = buckets.get(&CharAnchor::Head) {
            stack.extend(first.iter().rev());
        }
        while let Some(id) = stack.pop() {
            order.push(id);
            if let Some(children) = buckets.get(&CharAnchor::After(id)) {
                stack.extend(children.iter().rev());
            }
        }
        debug_assert_eq!(order.len(), self.glyphs.len(), "anchors are acyclic");
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

    /// Types `s` one character at a time, each insert anchored on the
    /// previous one, lamports and counters ticking from `start`.
    fn type_str(text: &mut Text, peer: u64, start: u64, after: CharAnchor, s: &str) {
        let mut anchor = after;
        let mut counter = start;
        for ch in s.chars() {
            let s = stamp(counter, peer, counter);
            text.apply_insert(s, anchor, ch);
            anchor = CharAnchor::After(s.id().into());
            counter += 1;
        }
    }

    #[test]
    fn insert_and_read() {
        let mut text = Text::default();
        type_str(&mut text, 1, 1, CharAnchor::Head, "Hello");
        assert_eq!(text.to_string(), "Hello");
        assert_eq!(text.len(), 5);
    }

    #[test]
    fn concurrent_prefix_inserts_converge() {
        let mut base = Text::default();
        type_str(&mut base, 1, 1, CharAnchor::Head, "!");

        // two peers concurrently type a greeting before the "!"
        let hello = {
            let mut t = Text::default();
            type_str(&mut t, 2, 1, CharAnchor::Head, "Hello ");
            t
        };
        let hi = {
            let mut t = Text::default();
            type_str(&mut t, 3, 1, CharAnchor::Head, "Hi ");
            t
        };

        let mut forward = base.clone();
        for source in [&hello, &hi] {
            for glyph in source.glyphs.values() {
                forward.apply_insert(glyph.stamp, glyph.anchor, glyph.ch);
            }
        }
        let mut backward = base;
        for source in [&hi, &hello] {
            for glyph in source.glyphs.values() {
                backward.apply_insert(glyph.stamp, glyph.anchor, glyph.ch);
            }
        }

        assert_eq!(forward.to_string(), backward.to_string());
        // each run stays contiguous; equal head stamps tie-break on peer
        assert_eq!(forward.to_string(), "Hi Hello !");
    }

    #[test]
    fn delete_tombstones_but_keeps_anchor() {
        let mut text = Text::default();
        type_str(&mut text, 1, 1, CharAnchor::Head, "abc");
        let b = text.id_at(1).unwrap();
        text.apply_delete(b);
        assert_eq!(text.to_string(), "ac");

        // an insert issued after seeing the deletion lands between the
        // tombstone's old neighbours, not after the surviving "c"
        text.apply_insert(stamp(4, 2, 1), CharAnchor::After(b), 'X');
        assert_eq!(text.to_string(), "aXc");
    }
}
