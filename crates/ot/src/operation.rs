use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Server-assigned identifier of a connected editing session.
///
/// Lower ids win positional ties and overlapping edits.
pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Delete,
    Replace,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Insert => f.write_str("insert"),
            OpKind::Delete => f.write_str("delete"),
            OpKind::Replace => f.write_str("replace"),
        }
    }
}

/// A single contiguous edit: remove `length` characters at `position`, then
/// insert `text` there.
///
/// `position` and `length` count `char`s of the content at `base_version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub position: usize,
    #[serde(default)]
    pub length: usize,
    #[serde(default)]
    pub text: String,
    pub author: SessionId,
    pub base_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("position must not be negative (got {0})")]
    NegativePosition(i64),

    #[error("length must not be negative (got {0})")]
    NegativeLength(i64),

    #[error("insert must carry text")]
    EmptyInsert,

    #[error("insert must not remove characters (length {0})")]
    InsertWithLength(usize),

    #[error("delete must not carry text")]
    DeleteWithText,

    #[error("{0} must remove at least one character")]
    EmptyRange(OpKind),

    #[error("range {position}..{end} is outside a document of {len} characters")]
    OutOfBounds {
        position: usize,
        end: usize,
        len: usize,
    },
}

impl Operation {
    /// Build an operation from its shape; the kind follows from it.
    pub fn new(
        position: usize,
        length: usize,
        text: impl Into<String>,
        author: SessionId,
        base_version: u64,
    ) -> Self {
        let text = text.into();
        Operation {
            kind: kind_for(length, &text),
            position,
            length,
            text,
            author,
            base_version,
        }
    }

    pub fn insert(
        position: usize,
        text: impl Into<String>,
        author: SessionId,
        base_version: u64,
    ) -> Self {
        Operation {
            kind: OpKind::Insert,
            position,
            length: 0,
            text: text.into(),
            author,
            base_version,
        }
    }

    pub fn delete(position: usize, length: usize, author: SessionId, base_version: u64) -> Self {
        Operation {
            kind: OpKind::Delete,
            position,
            length,
            text: String::new(),
            author,
            base_version,
        }
    }

    pub fn replace(
        position: usize,
        length: usize,
        text: impl Into<String>,
        author: SessionId,
        base_version: u64,
    ) -> Self {
        Operation {
            kind: OpKind::Replace,
            position,
            length,
            text: text.into(),
            author,
            base_version,
        }
    }

    /// Validate an unchecked, client-submitted shape.
    ///
    /// Signed inputs because that is what arrives on the wire; range checks
    /// against the content happen when the operation is applied.
    pub fn from_parts(
        kind: OpKind,
        position: i64,
        length: i64,
        text: String,
        author: SessionId,
        base_version: u64,
    ) -> Result<Self, OperationError> {
        let position =
            usize::try_from(position).map_err(|_| OperationError::NegativePosition(position))?;
        let length = usize::try_from(length).map_err(|_| OperationError::NegativeLength(length))?;

        match kind {
            OpKind::Insert if text.is_empty() => return Err(OperationError::EmptyInsert),
            OpKind::Insert if length > 0 => return Err(OperationError::InsertWithLength(length)),
            OpKind::Delete if !text.is_empty() => return Err(OperationError::DeleteWithText),
            OpKind::Delete if length == 0 => return Err(OperationError::EmptyRange(kind)),
            OpKind::Replace if length == 0 && text.is_empty() => {
                return Err(OperationError::EmptyRange(kind))
            }
            _ => {}
        }

        Ok(Operation {
            kind,
            position,
            length,
            text,
            author,
            base_version,
        })
    }

    /// End of the removed range (exclusive).
    pub fn end(&self) -> usize {
        self.position + self.length
    }

    /// Number of characters this operation inserts.
    pub fn inserted_len(&self) -> usize {
        self.text.chars().count()
    }

    /// Change in document length once applied.
    pub fn net_delta(&self) -> i64 {
        self.inserted_len() as i64 - self.length as i64
    }

    /// Removes nothing and inserts nothing.
    pub fn is_noop(&self) -> bool {
        self.length == 0 && self.text.is_empty()
    }

    pub(crate) fn moved_to(&self, position: usize) -> Self {
        Operation {
            position,
            ..self.clone()
        }
    }

    pub(crate) fn reshaped(&self, position: usize, length: usize, text: String) -> Self {
        Operation::new(position, length, text, self.author, self.base_version)
    }
}

fn kind_for(length: usize, text: &str) -> OpKind {
    match (length, text.is_empty()) {
        (0, false) => OpKind::Insert,
        (_, true) => OpKind::Delete,
        _ => OpKind::Replace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_position_rejected() {
        let err = Operation::from_parts(OpKind::Insert, -1, 0, "x".into(), 1, 0).unwrap_err();
        assert_eq!(err, OperationError::NegativePosition(-1));
    }

    #[test]
    fn test_negative_length_rejected() {
        let err = Operation::from_parts(OpKind::Delete, 0, -3, String::new(), 1, 0).unwrap_err();
        assert_eq!(err, OperationError::NegativeLength(-3));
    }

    #[test]
    fn test_shape_checks() {
        assert_eq!(
            Operation::from_parts(OpKind::Insert, 0, 0, String::new(), 1, 0),
            Err(OperationError::EmptyInsert)
        );
        assert_eq!(
            Operation::from_parts(OpKind::Insert, 0, 2, "ab".into(), 1, 0),
            Err(OperationError::InsertWithLength(2))
        );
        assert_eq!(
            Operation::from_parts(OpKind::Delete, 0, 2, "ab".into(), 1, 0),
            Err(OperationError::DeleteWithText)
        );

        assert_eq!(
            Operation::from_parts(OpKind::Delete, 4, 0, String::new(), 1, 0),
            Err(OperationError::EmptyRange(OpKind::Delete))
        );
        assert_eq!(
            Operation::from_parts(OpKind::Replace, 0, 0, String::new(), 1, 0),
            Err(OperationError::EmptyRange(OpKind::Replace))
        );

        let op = Operation::from_parts(OpKind::Replace, 2, 1, "xy".into(), 7, 4).unwrap();
        assert_eq!(op, Operation::replace(2, 1, "xy", 7, 4));
    }

    #[test]
    fn test_kind_follows_shape() {
        assert_eq!(Operation::new(0, 0, "a", 1, 0).kind, OpKind::Insert);
        assert_eq!(Operation::new(0, 2, "", 1, 0).kind, OpKind::Delete);
        assert_eq!(Operation::new(0, 2, "a", 1, 0).kind, OpKind::Replace);
        assert!(Operation::new(3, 0, "", 1, 0).is_noop());
    }

    #[test]
    fn test_net_delta_counts_chars() {
        assert_eq!(Operation::insert(0, "héllo", 1, 0).net_delta(), 5);
        assert_eq!(Operation::delete(0, 4, 1, 0).net_delta(), -4);
        assert_eq!(Operation::replace(0, 4, "ab", 1, 0).net_delta(), -2);
    }

    #[test]
    fn test_wire_format() {
        let op = Operation::delete(3, 2, 9, 12);
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "delete");
        assert_eq!(json["position"], 3);

        let parsed: Operation = serde_json::from_str(
            r#"{"kind":"insert","position":1,"text":"B","author":1,"base_version":0}"#,
        )
        .unwrap();
        assert_eq!(parsed, Operation::insert(1, "B", 1, 0));
    }
}
