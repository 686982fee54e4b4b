//! Client-defined dynamic data identifiers
//!
//! Definitions accumulate: defining the same identifier twice appends, and a
//! read resolves every matching segment in registration order. Entries only
//! disappear through an explicit clear.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DefineError {
    /// A definition may not name the identifier being defined as its source.
    /// This keeps resolution cycle-free for anything defined through the
    /// service interface.
    #[error("identifier cannot source itself")]
    SelfReference,
}

/// One resolved-at-read-time indirection segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// Slice of another identifier's resolved output. `position` is 1-based;
    /// `size == 0` means "everything from position".
    ByIdentifier { source: u16, position: u8, size: u8 },
    /// Checked read of a raw memory span
    ByMemory { address: u64, length: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    id: u16,
    segment: Segment,
}

/// Registry of dynamically defined identifiers, in registration order
#[derive(Debug, Default)]
pub struct DynamicIdRegistry {
    entries: Vec<Entry>,
}

impl DynamicIdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one segment under `id`.
    pub fn define(&mut self, id: u16, segment: Segment) -> Result<(), DefineError> {
        if let Segment::ByIdentifier { source, .. } = segment {
            if source == id {
                return Err(DefineError::SelfReference);
            }
        }
        self.entries.push(Entry { id, segment });
        Ok(())
    }

    /// Remove every entry under `id`, returning how many were removed.
    pub fn clear(&mut self, id: u16) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        before - self.entries.len()
    }

    pub fn is_defined(&self, id: u16) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    /// Matching segments in registration order.
    pub fn segments(&self, id: u16) -> impl Iterator<Item = &Segment> {
        self.entries
            .iter()
            .filter(move |e| e.id == id)
            .map(|e| &e.segment)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definitions_accumulate_in_order() {
        let mut reg = DynamicIdRegistry::new();
        reg.define(
            0xF300,
            Segment::ByMemory {
                address: 0x20,
                length: 0x10,
            },
        )
        .unwrap();
        reg.define(
            0xF301,
            Segment::ByMemory {
                address: 0,
                length: 1,
            },
        )
        .unwrap();
        reg.define(
            0xF300,
            Segment::ByIdentifier {
                source: 0xF190,
                position: 1,
                size: 0,
            },
        )
        .unwrap();

        let segs: Vec<_> = reg.segments(0xF300).copied().collect();
        assert_eq!(segs.len(), 2);
        assert!(matches!(segs[0], Segment::ByMemory { address: 0x20, .. }));
        assert!(matches!(
            segs[1],
            Segment::ByIdentifier { source: 0xF190, .. }
        ));
    }

    #[test]
    fn clear_removes_all_matching() {
        let mut reg = DynamicIdRegistry::new();
        for _ in 0..3 {
            reg.define(
                0xF300,
                Segment::ByMemory {
                    address: 0,
                    length: 1,
                },
            )
            .unwrap();
        }
        reg.define(
            0xF301,
            Segment::ByMemory {
                address: 0,
                length: 1,
            },
        )
        .unwrap();

        assert_eq!(reg.clear(0xF300), 3);
        assert_eq!(reg.clear(0xF300), 0);
        assert!(!reg.is_defined(0xF300));
        assert!(reg.is_defined(0xF301));
    }

    #[test]
    fn self_reference_rejected() {
        let mut reg = DynamicIdRegistry::new();
        assert_eq!(
            reg.define(
                0xF300,
                Segment::ByIdentifier {
                    source: 0xF300,
                    position: 1,
                    size: 0,
                }
            ),
            Err(DefineError::SelfReference)
        );
        assert!(reg.is_empty());
    }
}
