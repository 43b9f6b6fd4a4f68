//! Error taxonomy and the annotated-error boundary.

use thiserror::Error;

use crate::runtime::script::ScriptOrigin;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of cross-context operations.
///
/// Context-local exceptions never cross a context boundary raw; they are
/// captured, annotated where an origin is known, and delivered through the
/// caller's own channel (`Err` in blocking mode, a rejected [`Deferred`] in
/// non-blocking mode).
///
/// [`Deferred`]: crate::runtime::runner::Deferred
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Compilation failed. The message carries the annotated source
    /// location (`… at <filename>:<line>:<column>`).
    #[error("compile error: {0}")]
    Compile(String),

    /// The reference handle was released, or its slot already freed.
    #[error("reference has been released")]
    ReferenceReleased,

    /// The owning context was disposed or torn down.
    #[error("context has been disposed")]
    ContextDisposed,

    /// The operation does not apply to the referenced value's
    /// classification, or the value cannot be copied.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A context-local exception propagated out of a dispatched task.
    #[error("uncaught exception: {0}")]
    Uncaught(String),

    /// A blocking call gave up waiting. The dispatched task still runs to
    /// completion on the target context.
    #[error("call timed out after {0}ms")]
    Timeout(u64),

    /// Rejected configuration detected at spawn time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An internal protocol invariant was violated. Never retried; the
    /// unit of work that hit it is abandoned.
    #[error("internal protocol violation: {0}")]
    Logic(String),
}

/// A context-local exception value, as thrown by native functions and
/// posted into a context's pending-exception channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrownError {
    message: String,
}

impl ThrownError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ThrownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Outcome of catching at a compile boundary.
///
/// This replaces marker-exception control flow with an explicit result
/// tag: a compiler reports either a diagnostic with a position, or the
/// `AlreadyPosted` tag meaning an exception was posted without a message
/// available. The latter is a protocol defect on the compiler's side, not
/// a user-recoverable condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caught {
    Message {
        message: String,
        /// 1-based line as reported by the compiler, before origin offsets.
        line: u32,
        /// 0-based start column as reported by the compiler.
        column: u32,
    },
    AlreadyPosted,
}

impl Caught {
    pub fn message(message: impl Into<String>, line: u32, column: u32) -> Self {
        Caught::Message {
            message: message.into(),
            line,
            column,
        }
    }
}

/// Pure annotation step: turn a caught compile failure into an [`Error`],
/// applying the origin's offsets and appending the source location.
///
/// Line offsets shift every reported line; the column offset applies only
/// to the first line of the snippet. The appended suffix is
/// `<filename>:<line>:<column + 1>` so that the reported column is 1-based.
pub fn annotate_caught(caught: Caught, origin: &ScriptOrigin) -> Error {
    match caught {
        Caught::AlreadyPosted => {
            Error::Logic("exception posted without a diagnostic message".to_string())
        }
        Caught::Message {
            message,
            line,
            column,
        } => {
            let column = if line == 1 {
                column.saturating_add(origin.column_offset())
            } else {
                column
            };
            let line = line.saturating_add(origin.line_offset());
            Error::Compile(format!(
                "{} at {}:{}:{}",
                message,
                origin.filename(),
                line,
                column.saturating_add(1)
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::script::ScriptOrigin;

    #[test]
    fn annotation_appends_location_suffix() {
        let origin = ScriptOrigin::new("test.js", 0, 0, false);
        let err = annotate_caught(Caught::message("unexpected token '}'", 1, 21), &origin);
        match err {
            Error::Compile(message) => {
                assert!(message.ends_with("test.js:1:22"), "got: {message}");
                assert!(message.starts_with("unexpected token '}'"));
            }
            other => panic!("expected compile error, got {other:?}"),
        }
    }

    #[test]
    fn annotation_applies_offsets() {
        let origin = ScriptOrigin::new("embedded.js", 10, 4, false);
        // First line: both offsets apply.
        let err = annotate_caught(Caught::message("bad", 1, 2), &origin);
        assert_eq!(
            err,
            Error::Compile("bad at embedded.js:11:7".to_string())
        );
        // Later lines: only the line offset applies.
        let err = annotate_caught(Caught::message("bad", 3, 2), &origin);
        assert_eq!(
            err,
            Error::Compile("bad at embedded.js:13:3".to_string())
        );
    }

    #[test]
    fn already_posted_is_a_logic_defect() {
        let origin = ScriptOrigin::default();
        assert!(matches!(
            annotate_caught(Caught::AlreadyPosted, &origin),
            Error::Logic(_)
        ));
    }
}
