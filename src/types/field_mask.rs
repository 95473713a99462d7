//! Field masks: bitsets over the fields of a region.
//!
//! Dependence analysis is scoped by field: two operations touching the same
//! region conflict only on the fields they both name. A mask supports up to
//! 128 fields per field space, which matches the default limit of the
//! external region tree.

use crate::types::FieldId;
use core::fmt;
use serde::{Deserialize, Serialize};

/// A bitset over the fields of a field space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FieldMask(u128);

impl FieldMask {
    /// The empty mask.
    pub const EMPTY: Self = Self(0);

    /// The mask with every field set.
    pub const FULL: Self = Self(u128::MAX);

    /// Maximum number of fields representable in one mask.
    pub const MAX_FIELDS: u32 = 128;

    /// Creates a mask with a single field set.
    #[must_use]
    pub const fn single(field: FieldId) -> Self {
        debug_assert!(field.0 < Self::MAX_FIELDS);
        Self(1u128 << field.0)
    }

    /// Creates a mask from a list of fields.
    #[must_use]
    pub fn from_fields(fields: &[FieldId]) -> Self {
        let mut mask = Self::EMPTY;
        for &field in fields {
            mask.set(field);
        }
        mask
    }

    /// Sets a field bit.
    pub fn set(&mut self, field: FieldId) {
        debug_assert!(field.0 < Self::MAX_FIELDS);
        self.0 |= 1u128 << field.0;
    }

    /// Clears a field bit.
    pub fn clear(&mut self, field: FieldId) {
        self.0 &= !(1u128 << field.0);
    }

    /// Returns true if the field bit is set.
    #[must_use]
    pub const fn contains(self, field: FieldId) -> bool {
        self.0 & (1u128 << field.0) != 0
    }

    /// Returns true if no bits are set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns the number of set bits.
    #[must_use]
    pub const fn pop_count(self) -> u32 {
        self.0.count_ones()
    }

    /// Returns the intersection of two masks.
    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Returns the union of two masks.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns the fields in `self` but not in `other`.
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Returns true if the two masks share any field.
    #[must_use]
    pub const fn overlaps(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns true if every field of `other` is also in `self`.
    #[must_use]
    pub const fn dominates(self, other: Self) -> bool {
        other.0 & !self.0 == 0
    }

    /// Iterates over the set fields in ascending order.
    pub fn iter(self) -> impl Iterator<Item = FieldId> {
        (0..Self::MAX_FIELDS).filter_map(move |bit| {
            if self.0 & (1u128 << bit) != 0 {
                Some(FieldId(bit))
            } else {
                None
            }
        })
    }
}

impl fmt::Debug for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldMask[")?;
        let mut first = true;
        for field in self.iter() {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", field.0)?;
            first = false;
        }
        write!(f, "]")
    }
}

impl core::ops::BitAnd for FieldMask {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        self.intersection(rhs)
    }
}

impl core::ops::BitOr for FieldMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl core::ops::BitOrAssign for FieldMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_masks_do_not_overlap() {
        let a = FieldMask::from_fields(&[FieldId(0), FieldId(2)]);
        let b = FieldMask::from_fields(&[FieldId(1), FieldId(3)]);
        assert!(!a.overlaps(b));
        assert!(a.intersection(b).is_empty());
    }

    #[test]
    fn overlap_and_domination() {
        let a = FieldMask::from_fields(&[FieldId(0), FieldId(1), FieldId(2)]);
        let b = FieldMask::from_fields(&[FieldId(1)]);
        assert!(a.overlaps(b));
        assert!(a.dominates(b));
        assert!(!b.dominates(a));
        assert_eq!(a.intersection(b), b);
    }

    #[test]
    fn set_clear_iter() {
        let mut mask = FieldMask::EMPTY;
        mask.set(FieldId(5));
        mask.set(FieldId(90));
        assert!(mask.contains(FieldId(5)));
        assert_eq!(mask.pop_count(), 2);
        let fields: Vec<_> = mask.iter().collect();
        assert_eq!(fields, vec![FieldId(5), FieldId(90)]);
        mask.clear(FieldId(5));
        assert!(!mask.contains(FieldId(5)));
    }
}
