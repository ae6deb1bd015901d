// Positional operational transform for plain-text documents
//
// Operations address the document by character offset at the version they
// were written against. `transform` moves an operation over one that was
// accepted concurrently; `rebase` folds that over a whole run of them.

pub mod operation;
pub mod text;
pub mod transform;

pub use {
    operation::{OpKind, Operation, OperationError, SessionId},
    text::{apply, char_len, revert},
    transform::{rebase, transform},
};
