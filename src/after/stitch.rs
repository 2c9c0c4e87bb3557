//! Stitching a failed task's error onto the call sites that scheduled it.
//!
//! The composite stack reads top to bottom:
//!
//! ```text
//! <error message>
//!     caused by: <source>              the error's own frames
//!     at <after boundary>              marker: everything below is reconstructed
//!     <innermost nested call site>
//!     ...
//!     <root call site>
//!     <root owner frames>
//! ```

use std::fmt::Write as _;

use thiserror::Error;

use super::chain::{CallerChainRecord, CallerStack};
use super::report::TaskError;

/// Marker frame separating genuine frames from reconstructed ones.
pub const BOUNDARY_FRAME: &str = "at <after boundary>";

/// Why a caller chain could not be stitched onto an error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StitchError {
    #[error("caller chain has no root frames")]
    MissingRootFrames,

    #[error("caller chain nests {depth} levels deep, more than the {max} that can be stitched")]
    TooDeep { depth: usize, max: usize },
}

/// An error decorated with the call sites that scheduled the failing task.
///
/// Displays exactly like the original error, which stays reachable through
/// [`source`](std::error::Error::source).
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StitchedError {
    message: String,
    stack: String,
    #[source]
    source: TaskError,
}

impl StitchedError {
    /// The composite stack.
    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// Unwraps the original error.
    pub fn into_inner(self) -> TaskError {
        self.source
    }
}

/// Stitches `chain` onto `error`.
///
/// # Errors
///
/// - [`StitchError::MissingRootFrames`] — the root caller stack is empty, so
///   there is nothing to anchor the reconstructed frames to.
/// - [`StitchError::TooDeep`] — the chain nests more than `max_depth` levels.
pub fn stitch(
    error: TaskError,
    chain: &CallerChainRecord,
    max_depth: usize,
) -> Result<StitchedError, (StitchError, TaskError)> {
    if chain.root_caller_stack().is_empty() {
        return Err((StitchError::MissingRootFrames, error));
    }
    if chain.depth() > max_depth {
        return Err((
            StitchError::TooDeep {
                depth: chain.depth(),
                max: max_depth,
            },
            error,
        ));
    }

    let message = error.to_string();
    let mut stack = message.clone();
    let mut cause = error.source();
    while let Some(inner) = cause {
        let _ = write!(stack, "\n    caused by: {inner}");
        cause = inner.source();
    }

    let _ = write!(stack, "\n    {BOUNDARY_FRAME}");
    for nested in chain.nested_caller_stacks().unwrap_or_default() {
        push_frames(&mut stack, nested);
    }
    push_frames(&mut stack, chain.root_caller_stack());
    if let Some(owner) = chain.root_owner_stack() {
        push_frames(&mut stack, owner);
    }

    Ok(StitchedError {
        message,
        stack,
        source: error,
    })
}

fn push_frames(stack: &mut String, frames: &CallerStack) {
    if !frames.is_empty() {
        let _ = write!(stack, "\n{frames}");
    }
}
