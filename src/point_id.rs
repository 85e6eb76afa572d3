//! Fixed-width `BBBCCCPPPP` identifiers that join records across stages.
//!
//! The allocator is stateless. A stage that appends records scans the tail
//! of the artifact it extends ([`next_after`]) and keeps counting from there,
//! so losing an intermediate file never desynchronises a stored counter.

use crate::error::PipelineError;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Largest book or chapter id that fits in three digits.
pub const MAX_BOOK_OR_CHAPTER: u16 = 999;
/// Largest sequence number that fits in four digits.
pub const MAX_SEQUENCE: u16 = 9999;

/// A parsed PointId.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PointId {
    pub book: u16,
    pub chapter: u16,
    pub sequence: u16,
}

impl PointId {
    pub fn new(book: u16, chapter: u16, sequence: u16) -> Self {
        Self {
            book,
            chapter,
            sequence,
        }
    }

    /// The `BBBCCC` prefix used in artifact file names.
    pub fn book_chapter(&self) -> String {
        format!("{:03}{:03}", self.book, self.chapter)
    }

    /// The id `offset` places after this one in the same chapter.
    pub fn advance(&self, offset: usize) -> Result<Self, PipelineError> {
        let seq = self.sequence as usize + offset;
        if seq > MAX_SEQUENCE as usize {
            return Err(PipelineError::InvalidPointId {
                value: format!("{}{:04}", self.book_chapter(), seq),
            });
        }
        Ok(Self {
            sequence: seq as u16,
            ..*self
        })
    }
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}{:03}{:04}", self.book, self.chapter, self.sequence)
    }
}

impl FromStr for PointId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PipelineError::InvalidPointId {
            value: s.to_string(),
        };
        if s.len() != 10 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        // All ten bytes are ASCII digits, so the slices land on char boundaries.
        let book = s[0..3].parse().map_err(|_| invalid())?;
        let chapter = s[3..6].parse().map_err(|_| invalid())?;
        let sequence = s[6..10].parse().map_err(|_| invalid())?;
        Ok(Self {
            book,
            chapter,
            sequence,
        })
    }
}

/// Format `(book, chapter, sequence)` as a PointId string.
///
/// Fails when any part does not fit its fixed width.
pub fn allocate(book: u16, chapter: u16, sequence: u16) -> Result<String, PipelineError> {
    let id = PointId::new(book, chapter, sequence);
    if book > MAX_BOOK_OR_CHAPTER || chapter > MAX_BOOK_OR_CHAPTER || sequence > MAX_SEQUENCE {
        return Err(PipelineError::InvalidPointId {
            value: id.to_string(),
        });
    }
    Ok(id.to_string())
}

/// Extract `(book, chapter)` from a PointId string.
pub fn parse(point_id: &str) -> Result<(u16, u16), PipelineError> {
    let id: PointId = point_id.parse()?;
    Ok((id.book, id.chapter))
}

/// Scan records from the tail and return the id following the last valid
/// `PointId`, or `None` when no record carries one.
///
/// A last id already at sequence 9999 has no successor and is an error.
pub fn next_after(records: &[serde_json::Map<String, Value>]) -> Result<Option<PointId>, PipelineError> {
    let last = records
        .iter()
        .rev()
        .filter_map(|r| r.get("PointId").and_then(|v| v.as_str()))
        .find_map(|s| s.parse::<PointId>().ok());
    match last {
        Some(id) => id.advance(1).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn allocate_zero_pads() {
        assert_eq!(allocate(105, 3, 1).unwrap(), "1050030001");
        assert_eq!(allocate(1, 2, 30).unwrap(), "0010020030");
    }

    #[test]
    fn allocate_rejects_parts_wider_than_their_field() {
        for (book, chapter, seq) in [(1000, 3, 1), (105, 1000, 1), (105, 3, 10000)] {
            let err = allocate(book, chapter, seq).unwrap_err();
            assert!(matches!(err, PipelineError::InvalidPointId { .. }), "{err}");
        }
        assert_eq!(allocate(999, 999, 9999).unwrap(), "9999999999");
    }

    #[test]
    fn rejects_wrong_shapes() {
        for bad in ["12345", "12345678901", "12a4567890", "", "１２３４５６７８９０"] {
            let err = parse(bad).unwrap_err();
            assert!(
                matches!(err, PipelineError::InvalidPointId { .. }),
                "{bad}: {err}"
            );
        }
    }

    #[test]
    fn advance_overflow_is_an_error() {
        let id = PointId::new(1, 1, 9999);
        assert!(id.advance(1).is_err());
        assert_eq!(id.advance(0).unwrap().sequence, 9999);
    }

    #[test]
    fn next_after_skips_records_without_ids() {
        let records: Vec<_> = [
            json!({"PointId": "1050030001"}),
            json!({"PointId": "1050030007"}),
            json!({"Points": "no id"}),
            json!({"PointId": "garbage"}),
        ]
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect();
        assert_eq!(next_after(&records).unwrap().unwrap().to_string(), "1050030008");
        assert!(next_after(&[]).unwrap().is_none());
    }

    #[test]
    fn next_after_the_last_sequence_is_an_error() {
        let records = vec![json!({"PointId": "1050039999"}).as_object().cloned().unwrap()];
        let err = next_after(&records).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidPointId { .. }), "{err}");
    }

    proptest! {
        #[test]
        fn round_trip(book in 0u16..=999, chapter in 0u16..=999, seq in 0u16..=9999) {
            let s = allocate(book, chapter, seq).unwrap();
            prop_assert_eq!(s.len(), 10);
            prop_assert_eq!(parse(&s).unwrap(), (book, chapter));
            prop_assert_eq!(s.parse::<PointId>().unwrap().sequence, seq);
        }
    }
}
