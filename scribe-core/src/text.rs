//! Plain-text reference engine.
//!
//! Content is UTF-8 text. Operations are JSON:
//! ```text
//! {"insert":{"pos":0,"text":"Hello"}}
//! {"delete":{"pos":2,"len":3}}
//! ```
//! Positions count Unicode scalar values, not bytes.
//!
//! Transform rules (a delete beats an insert that lands strictly inside it):
//!
//! | op \ against   | Insert(q, u)                       | Delete(q, m)                      |
//! |----------------|------------------------------------|-----------------------------------|
//! | Insert(p, t)   | shift by len(u) if q < p, or tie and `against` first | p ≤ q: keep; p ≥ q+m: p−m; inside: absorbed |
//! | Delete(p, l)   | q ≤ p: shift; q ≥ p+l: keep; inside: grow by len(u) | remove the overlap |

use serde::{Deserialize, Serialize};

use crate::engine::{EngineError, OperationEngine, Side};
use crate::types::Operation;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextOp {
    Insert { pos: usize, text: String },
    Delete { pos: usize, len: usize },
}

impl TextOp {
    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        Self::Insert {
            pos,
            text: text.into(),
        }
    }

    pub fn delete(pos: usize, len: usize) -> Self {
        Self::Delete { pos, len }
    }

    /// Encode as an opaque operation.
    pub fn to_operation(&self) -> Operation {
        Operation::from_bytes(serde_json::to_vec(self).unwrap_or_default())
    }

    /// Decode an opaque operation.
    pub fn decode(op: &Operation) -> Result<Self, EngineError> {
        serde_json::from_slice(op.as_bytes()).map_err(|e| EngineError::Malformed(e.to_string()))
    }
}

/// Byte offset of the `pos`-th char, or `None` past the end.
fn byte_offset(s: &str, pos: usize) -> Option<usize> {
    if pos == 0 {
        return Some(0);
    }
    match s.char_indices().nth(pos) {
        Some((idx, _)) => Some(idx),
        None if s.chars().count() == pos => Some(s.len()),
        None => None,
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Reference engine for plain text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextEngine;

impl TextEngine {
    pub fn new() -> Self {
        Self
    }

    fn apply_one(text: &mut String, op: &TextOp) -> Result<(), EngineError> {
        match op {
            TextOp::Insert { pos, text: inserted } => {
                if inserted.is_empty() {
                    return Err(EngineError::Malformed("empty insert".into()));
                }
                let at = byte_offset(text, *pos).ok_or_else(|| {
                    EngineError::OutOfRange(format!(
                        "insert at {pos} in text of length {}",
                        char_len(text)
                    ))
                })?;
                text.insert_str(at, inserted);
            }
            TextOp::Delete { pos, len } => {
                if *len == 0 {
                    return Err(EngineError::Malformed("empty delete".into()));
                }
                let out_of_range = || {
                    EngineError::OutOfRange(format!(
                        "delete {pos}..{} in text of length {}",
                        pos.saturating_add(*len),
                        char_len(text)
                    ))
                };
                let end_pos = pos.checked_add(*len).ok_or_else(out_of_range)?;
                let start = byte_offset(text, *pos).ok_or_else(out_of_range)?;
                let end = byte_offset(text, end_pos).ok_or_else(out_of_range)?;
                text.replace_range(start..end, "");
            }
        }
        Ok(())
    }

    fn transform_ops(op: &TextOp, against: &TextOp, side: Side) -> Option<TextOp> {
        match (op, against) {
            (TextOp::Insert { pos, text }, TextOp::Insert { pos: q, text: u }) => {
                let shift = *q < *pos || (*q == *pos && side == Side::Right);
                let pos = if shift { pos + char_len(u) } else { *pos };
                Some(TextOp::Insert {
                    pos,
                    text: text.clone(),
                })
            }
            (TextOp::Insert { pos, text }, TextOp::Delete { pos: q, len: m }) => {
                if *pos <= *q {
                    Some(op.clone())
                } else if *pos >= q + m {
                    Some(TextOp::Insert {
                        pos: pos - m,
                        text: text.clone(),
                    })
                } else {
                    None
                }
            }
            (TextOp::Delete { pos, len }, TextOp::Insert { pos: q, text: u }) => {
                let n = char_len(u);
                if *q <= *pos {
                    Some(TextOp::Delete {
                        pos: pos + n,
                        len: *len,
                    })
                } else if *q >= pos + len {
                    Some(op.clone())
                } else {
                    Some(TextOp::Delete {
                        pos: *pos,
                        len: len + n,
                    })
                }
            }
            (TextOp::Delete { pos, len }, TextOp::Delete { pos: q, len: m }) => {
                if q + m <= *pos {
                    Some(TextOp::Delete {
                        pos: pos - m,
                        len: *len,
                    })
                } else if *q >= pos + len {
                    Some(op.clone())
                } else {
                    let overlap = (pos + len).min(q + m) - (*pos).max(*q);
                    let remaining = len - overlap;
                    (remaining > 0).then(|| TextOp::Delete {
                        pos: (*pos).min(*q),
                        len: remaining,
                    })
                }
            }
        }
    }
}

impl OperationEngine for TextEngine {
    fn name(&self) -> &'static str {
        "text"
    }

    fn empty_document(&self) -> Vec<u8> {
        Vec::new()
    }

    fn apply(&self, content: &[u8], operations: &[Operation]) -> Result<Vec<u8>, EngineError> {
        let mut text = std::str::from_utf8(content)
            .map_err(|e| EngineError::CorruptContent(e.to_string()))?
            .to_string();
        for op in operations {
            Self::apply_one(&mut text, &TextOp::decode(op)?)?;
        }
        Ok(text.into_bytes())
    }

    fn transform(
        &self,
        op: &Operation,
        against: &Operation,
        side: Side,
    ) -> Result<Option<Operation>, EngineError> {
        let op = TextOp::decode(op)?;
        let against = TextOp::decode(against)?;
        Ok(Self::transform_ops(&op, &against, side).map(|t| t.to_operation()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(content: &str, ops: &[TextOp]) -> Result<String, EngineError> {
        let ops: Vec<Operation> = ops.iter().map(TextOp::to_operation).collect();
        TextEngine
            .apply(content.as_bytes(), &ops)
            .map(|b| String::from_utf8(b).unwrap())
    }

    fn transform(op: TextOp, against: TextOp, side: Side) -> Option<TextOp> {
        TextEngine
            .transform(&op.to_operation(), &against.to_operation(), side)
            .unwrap()
            .map(|o| TextOp::decode(&o).unwrap())
    }

    #[test]
    fn test_operation_json_format() {
        let op = TextOp::insert(0, "Hello").to_operation();
        assert_eq!(
            std::str::from_utf8(op.as_bytes()).unwrap(),
            r#"{"insert":{"pos":0,"text":"Hello"}}"#
        );
    }

    #[test]
    fn test_insert_and_delete() {
        let out = apply("", &[TextOp::insert(0, "Hello"), TextOp::insert(5, " World")]).unwrap();
        assert_eq!(out, "Hello World");
        let out = apply(&out, &[TextOp::delete(5, 6)]).unwrap();
        assert_eq!(out, "Hello");
    }

    #[test]
    fn test_positions_count_chars() {
        let out = apply("héllo", &[TextOp::insert(2, "—")]).unwrap();
        assert_eq!(out, "hé—llo");
        let out = apply(&out, &[TextOp::delete(1, 2)]).unwrap();
        assert_eq!(out, "hllo");
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(matches!(
            apply("abc", &[TextOp::insert(4, "x")]),
            Err(EngineError::OutOfRange(_))
        ));
        assert!(matches!(
            apply("abc", &[TextOp::delete(2, 2)]),
            Err(EngineError::OutOfRange(_))
        ));
        assert!(matches!(
            apply("abc", &[TextOp::delete(usize::MAX, 2)]),
            Err(EngineError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_empty_edits_rejected() {
        assert!(matches!(
            apply("abc", &[TextOp::insert(0, "")]),
            Err(EngineError::Malformed(_))
        ));
        assert!(matches!(
            apply("abc", &[TextOp::delete(0, 0)]),
            Err(EngineError::Malformed(_))
        ));
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let garbage = Operation::from_bytes(b"{\"splice\":1}".to_vec());
        assert!(matches!(
            TextEngine.apply(b"abc", &[garbage]),
            Err(EngineError::Malformed(_))
        ));
    }

    #[test]
    fn test_corrupt_content_rejected() {
        let op = TextOp::insert(0, "x").to_operation();
        assert!(matches!(
            TextEngine.apply(&[0xFF, 0xFE], &[op]),
            Err(EngineError::CorruptContent(_))
        ));
    }

    #[test]
    fn test_failed_batch_is_all_or_nothing() {
        let ops = [TextOp::insert(0, "ok"), TextOp::delete(10, 1)];
        assert!(apply("", &ops).is_err());
    }

    #[test]
    fn test_insert_tie_break() {
        let op = TextOp::insert(2, "B");
        let against = TextOp::insert(2, "AA");
        assert_eq!(
            transform(op.clone(), against.clone(), Side::Right),
            Some(TextOp::insert(4, "B"))
        );
        assert_eq!(transform(op, against, Side::Left), Some(TextOp::insert(2, "B")));
    }

    #[test]
    fn test_insert_inside_deleted_range_absorbed() {
        assert_eq!(
            transform(TextOp::insert(3, "x"), TextOp::delete(1, 4), Side::Right),
            None
        );
        assert_eq!(
            transform(TextOp::insert(5, "x"), TextOp::delete(1, 4), Side::Right),
            Some(TextOp::insert(1, "x"))
        );
        assert_eq!(
            transform(TextOp::insert(1, "x"), TextOp::delete(1, 4), Side::Right),
            Some(TextOp::insert(1, "x"))
        );
    }

    #[test]
    fn test_delete_grows_over_inner_insert() {
        assert_eq!(
            transform(TextOp::delete(1, 4), TextOp::insert(3, "xy"), Side::Right),
            Some(TextOp::delete(1, 6))
        );
    }

    #[test]
    fn test_overlapping_deletes() {
        assert_eq!(
            transform(TextOp::delete(2, 4), TextOp::delete(4, 4), Side::Right),
            Some(TextOp::delete(2, 2))
        );
        assert_eq!(
            transform(TextOp::delete(4, 4), TextOp::delete(2, 4), Side::Right),
            Some(TextOp::delete(2, 2))
        );
        assert_eq!(
            transform(TextOp::delete(3, 2), TextOp::delete(1, 6), Side::Right),
            None
        );
    }

    /// Applying `a` then `b'` must equal applying `b` then `a'`.
    fn assert_commutes(base: &str, a: TextOp, b: TextOp) {
        let b_over_a = transform(b.clone(), a.clone(), Side::Right);
        let a_over_b = transform(a.clone(), b.clone(), Side::Left);

        let mut left = vec![a];
        left.extend(b_over_a);
        let mut right = vec![b];
        right.extend(a_over_b);

        assert_eq!(apply(base, &left).unwrap(), apply(base, &right).unwrap());
    }

    #[test]
    fn test_transform_commutes() {
        let base = "0123456789";
        assert_commutes(base, TextOp::insert(3, "ab"), TextOp::insert(3, "XY"));
        assert_commutes(base, TextOp::insert(3, "ab"), TextOp::delete(1, 5));
        assert_commutes(base, TextOp::delete(1, 5), TextOp::insert(3, "ab"));
        assert_commutes(base, TextOp::delete(2, 5), TextOp::delete(4, 5));
        assert_commutes(base, TextOp::delete(0, 10), TextOp::insert(10, "z"));
    }
}
