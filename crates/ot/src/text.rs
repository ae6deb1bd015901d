// Character-offset splicing over UTF-8 strings

use crate::operation::{Operation, OperationError};

/// Length of `s` in characters, the unit every position is counted in.
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte index of the `pos`-th character; `pos == char_len(s)` maps to the end.
fn byte_index(s: &str, pos: usize) -> Option<usize> {
    s.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(s.len()))
        .nth(pos)
}

fn splice(
    content: &mut String,
    position: usize,
    length: usize,
    text: &str,
) -> Result<String, OperationError> {
    let end = position + length;
    let out_of_bounds = || OperationError::OutOfBounds {
        position,
        end,
        len: char_len(content),
    };

    let start = byte_index(content, position).ok_or_else(out_of_bounds)?;
    let stop = byte_index(content, end).ok_or_else(out_of_bounds)?;

    let removed = content[start..stop].to_string();
    content.replace_range(start..stop, text);
    Ok(removed)
}

/// Apply `op` to `content` and return the text it removed.
///
/// Leaves `content` untouched when the range does not fit.
pub fn apply(content: &mut String, op: &Operation) -> Result<String, OperationError> {
    splice(content, op.position, op.length, &op.text)
}

/// Undo a previous `apply` of `op`, given the text it removed.
pub fn revert(content: &mut String, op: &Operation, removed: &str) -> Result<(), OperationError> {
    splice(content, op.position, op.inserted_len(), removed).map(|_| ())
}
