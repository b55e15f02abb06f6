use thiserror::Error;

use crate::value::Key;

/// Failures reported by the interception layer.
///
/// Every other operation on a live target succeeds by contract; calling a
/// handle whose target was disposed is a caller bug and is answered with
/// neutral values rather than an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactiveError {
    /// A write or delete went through a read-only wrapper, or tried to
    /// overwrite a read-only wrapper stored under `key`.
    #[error("cannot write key `{key}`: target is read-only")]
    ReadOnly {
        /// The key the write was aimed at.
        key: Key,
    },

    /// Prototypes can never be reassigned on a wrapped target.
    #[error("setting the prototype of a reactive target is not allowed")]
    PrototypeLocked,
}
