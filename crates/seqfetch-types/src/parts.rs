use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

use serde::{Deserialize, Serialize};

/// Identifier of an independently loadable chunk within a blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub u32);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk-{}", self.0)
    }
}

/// Bitmask of logical sub-parts of a cache entry.
///
/// The low byte holds the entry's own parts; the second byte holds the
/// parallel "one of my children needs this" bits. [`NeedUpdate::child`]
/// maps own bits onto their child counterparts.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NeedUpdate(u32);

const CHILD_SHIFT: u32 = 8;

impl NeedUpdate {
    pub const NONE: Self = Self(0);
    pub const DESCRIPTION: Self = Self(1 << 0);
    pub const ANNOTATION: Self = Self(1 << 1);
    pub const SEQ_DATA: Self = Self(1 << 2);
    pub const CORE: Self = Self(1 << 3);
    pub const ASSEMBLY: Self = Self(1 << 4);
    /// Every own sub-part.
    pub const ALL: Self = Self(0x1f);

    pub const CHILD_DESCRIPTION: Self = Self(1 << CHILD_SHIFT);
    pub const CHILD_ANNOTATION: Self = Self(1 << (CHILD_SHIFT + 1));
    pub const CHILD_SEQ_DATA: Self = Self(1 << (CHILD_SHIFT + 2));
    pub const CHILD_CORE: Self = Self(1 << (CHILD_SHIFT + 3));
    pub const CHILD_ASSEMBLY: Self = Self(1 << (CHILD_SHIFT + 4));
    /// Every child sub-part.
    pub const ALL_CHILDREN: Self = Self(0x1f << CHILD_SHIFT);

    const NAMES: [(NeedUpdate, &'static str); 10] = [
        (Self::DESCRIPTION, "description"),
        (Self::ANNOTATION, "annotation"),
        (Self::SEQ_DATA, "seq_data"),
        (Self::CORE, "core"),
        (Self::ASSEMBLY, "assembly"),
        (Self::CHILD_DESCRIPTION, "child_description"),
        (Self::CHILD_ANNOTATION, "child_annotation"),
        (Self::CHILD_SEQ_DATA, "child_seq_data"),
        (Self::CHILD_CORE, "child_core"),
        (Self::CHILD_ASSEMBLY, "child_assembly"),
    ];

    /// Raw bit value.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, dropping undefined bits.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & (Self::ALL.0 | Self::ALL_CHILDREN.0))
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if any bit of `other` is set in `self`.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Bits in `self` that are not in `other`.
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// The own-part bits only.
    pub const fn own(self) -> Self {
        Self(self.0 & Self::ALL.0)
    }

    /// The child bits only.
    pub const fn children(self) -> Self {
        Self(self.0 & Self::ALL_CHILDREN.0)
    }

    /// Map own-part bits onto their "a child needs this" counterparts.
    pub const fn child(self) -> Self {
        Self((self.0 & Self::ALL.0) << CHILD_SHIFT)
    }

    /// Map child bits back onto the corresponding own-part bits.
    pub const fn from_child(self) -> Self {
        Self((self.0 & Self::ALL_CHILDREN.0) >> CHILD_SHIFT)
    }

    /// The own-part bits together with their child counterparts, i.e.
    /// "this part, here and anywhere below".
    pub const fn with_children(self) -> Self {
        Self(self.own().0 | self.child().0)
    }
}

impl BitOr for NeedUpdate {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for NeedUpdate {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for NeedUpdate {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for NeedUpdate {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Not for NeedUpdate {
    type Output = Self;
    fn not(self) -> Self {
        Self::from_bits_truncate(!self.0)
    }
}

impl fmt::Debug for NeedUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NeedUpdate({self})")
    }
}

impl fmt::Display for NeedUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_mapping_round_trips() {
        let own = NeedUpdate::ANNOTATION | NeedUpdate::SEQ_DATA;
        let child = own.child();
        assert_eq!(child, NeedUpdate::CHILD_ANNOTATION | NeedUpdate::CHILD_SEQ_DATA);
        assert_eq!(child.from_child(), own);
        assert!(child.own().is_empty());
    }

    #[test]
    fn with_children_covers_both_levels() {
        let mask = NeedUpdate::SEQ_DATA.with_children();
        assert!(mask.contains(NeedUpdate::SEQ_DATA | NeedUpdate::CHILD_SEQ_DATA));
        assert!(!mask.intersects(NeedUpdate::ANNOTATION.with_children()));
    }

    #[test]
    fn child_of_child_bits_is_empty() {
        assert!(NeedUpdate::ALL_CHILDREN.child().is_empty());
    }

    #[test]
    fn set_algebra() {
        let a = NeedUpdate::ANNOTATION | NeedUpdate::CORE;
        assert!(a.contains(NeedUpdate::CORE));
        assert!(!a.contains(NeedUpdate::CORE | NeedUpdate::SEQ_DATA));
        assert!(a.intersects(NeedUpdate::CORE | NeedUpdate::SEQ_DATA));
        assert_eq!(a.difference(NeedUpdate::CORE), NeedUpdate::ANNOTATION);
        assert_eq!((!a).own(), NeedUpdate::DESCRIPTION | NeedUpdate::SEQ_DATA | NeedUpdate::ASSEMBLY);
    }

    #[test]
    fn display_lists_names() {
        assert_eq!(NeedUpdate::NONE.to_string(), "none");
        let mask = NeedUpdate::ANNOTATION | NeedUpdate::CHILD_SEQ_DATA;
        assert_eq!(mask.to_string(), "annotation|child_seq_data");
    }

    #[test]
    fn from_bits_truncate_drops_unknown() {
        assert_eq!(NeedUpdate::from_bits_truncate(0xffff_ffff), NeedUpdate::ALL | NeedUpdate::ALL_CHILDREN);
    }
}
