//! The universal value representation.
//!
//! An [`Item`] is a small `Copy` tagged value: immediate payloads live
//! inline, while deep and user values are [`ObjRef`] handles into the
//! collector's slot arena. The tag and the payload are a single enum, so
//! they cannot disagree.

use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Opaque handle to a slot in the collector's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) u32);

impl ObjRef {
    #[must_use]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// A shared, mutable variable slot. Module globals, closure captures and
/// dynamic binds all resolve to cells of this shape.
pub type VarCell = Arc<RwLock<Item>>;

/// Creates a fresh cell holding `value`.
#[must_use]
pub fn new_cell(value: Item) -> VarCell {
    Arc::new(RwLock::new(value))
}

/// A language-level value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Item {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Engine-structured heap value (string, array, function, module...).
    Deep(ObjRef),
    /// Script-defined object instance.
    User(ObjRef),
}

impl Item {
    /// Truthiness under the language's rules: nil and zero are false,
    /// everything else (including every heap value) is true.
    #[must_use]
    pub fn is_true(&self) -> bool {
        match self {
            Item::Nil => false,
            Item::Bool(b) => *b,
            Item::Int(i) => *i != 0,
            Item::Float(f) => *f != 0.0,
            Item::Deep(_) | Item::User(_) => true,
        }
    }

    /// Name of the flat type tag. Heap values refine this through
    /// `HeapObject::type_name`.
    #[must_use]
    pub fn tag_name(&self) -> &'static str {
        match self {
            Item::Nil => "Nil",
            Item::Bool(_) => "Bool",
            Item::Int(_) => "Int",
            Item::Float(_) => "Float",
            Item::Deep(_) => "Deep",
            Item::User(_) => "User",
        }
    }

    /// Rank used to order values of different types; within a type, values
    /// order by payload.
    fn type_rank(&self) -> u8 {
        match self {
            Item::Nil => 0,
            Item::Bool(_) => 1,
            Item::Int(_) | Item::Float(_) => 2,
            Item::Deep(_) => 3,
            Item::User(_) => 4,
        }
    }

    /// Total order over flat values. Numeric pairs compare by value across
    /// int/float; deep/user pairs fall back to handle identity, which the
    /// evaluator overrides when the object carries a comparison slot.
    #[must_use]
    pub fn flat_compare(&self, other: &Item) -> Ordering {
        let (ra, rb) = (self.type_rank(), other.type_rank());
        if ra != rb {
            return ra.cmp(&rb);
        }
        match (self, other) {
            (Item::Nil, Item::Nil) => Ordering::Equal,
            (Item::Bool(a), Item::Bool(b)) => a.cmp(b),
            (Item::Int(a), Item::Int(b)) => a.cmp(b),
            (Item::Int(a), Item::Float(b)) => cmp_f64(*a as f64, *b),
            (Item::Float(a), Item::Int(b)) => cmp_f64(*a, *b as f64),
            (Item::Float(a), Item::Float(b)) => cmp_f64(*a, *b),
            (Item::Deep(a), Item::Deep(b)) | (Item::User(a), Item::User(b)) => a.0.cmp(&b.0),
            _ => Ordering::Equal,
        }
    }

    /// The referenced arena slot, if this is a heap value.
    #[must_use]
    pub fn obj_ref(&self) -> Option<ObjRef> {
        match self {
            Item::Deep(r) | Item::User(r) => Some(*r),
            _ => None,
        }
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    // NaN sorts last so the order stays total.
    a.partial_cmp(&b).unwrap_or(Ordering::Greater)
}

impl Default for Item {
    fn default() -> Self {
        Item::Nil
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Item::Nil => write!(f, "nil"),
            Item::Bool(b) => write!(f, "{b}"),
            Item::Int(i) => write!(f, "{i}"),
            Item::Float(x) => {
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{x:.1}")
                } else {
                    write!(f, "{x}")
                }
            }
            Item::Deep(r) => write!(f, "<deep #{}>", r.0),
            Item::User(r) => write!(f, "<object #{}>", r.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Item::Nil.is_true());
        assert!(!Item::Bool(false).is_true());
        assert!(!Item::Int(0).is_true());
        assert!(!Item::Float(0.0).is_true());
        assert!(Item::Bool(true).is_true());
        assert!(Item::Int(-3).is_true());
        assert!(Item::Deep(ObjRef(0)).is_true());
    }

    #[test]
    fn test_numeric_cross_compare() {
        assert_eq!(Item::Int(2).flat_compare(&Item::Float(2.0)), Ordering::Equal);
        assert_eq!(Item::Int(1).flat_compare(&Item::Float(1.5)), Ordering::Less);
        assert_eq!(
            Item::Float(3.5).flat_compare(&Item::Int(3)),
            Ordering::Greater
        );
    }

    #[test]
    fn test_type_rank_ordering() {
        assert_eq!(Item::Nil.flat_compare(&Item::Bool(false)), Ordering::Less);
        assert_eq!(
            Item::Int(99).flat_compare(&Item::Deep(ObjRef(0))),
            Ordering::Less
        );
    }

    #[test]
    fn test_display_floats_keep_point() {
        assert_eq!(Item::Float(2.0).to_string(), "2.0");
        assert_eq!(Item::Float(2.25).to_string(), "2.25");
    }
}
