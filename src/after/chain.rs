//! Caller chains — where a deferred task was scheduled from, across nesting.
//!
//! Once a deferred task runs, the code that scheduled it has long returned, so
//! its call site has to be recorded up front. A [`CallerChainRecord`] keeps the
//! outermost scheduling site (the *root*) plus every nested site reached by
//! tasks that schedule further tasks, innermost first.

use std::fmt;
use std::panic::Location;

use serde::Serialize;

use crate::context::Phase;

/// An ordered list of frames describing one call site, most specific first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CallerStack {
    frames: Vec<String>,
}

impl CallerStack {
    /// Creates a stack from pre-rendered frames.
    pub fn new<I, S>(frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            frames: frames.into_iter().map(Into::into).collect(),
        }
    }

    /// Records the location of the caller.
    ///
    /// Through `#[track_caller]` this resolves to the first caller up the
    /// stack that is not itself annotated.
    #[track_caller]
    pub fn capture() -> Self {
        Self::from_location(Location::caller())
    }

    /// Creates a single-frame stack pointing at `location`.
    pub fn from_location(location: &Location<'_>) -> Self {
        Self {
            frames: vec![format!(
                "at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            )],
        }
    }

    /// Returns the frames, most specific first.
    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    /// Returns `true` if no frame was recorded.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Display for CallerStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.frames.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "    {frame}")?;
        }
        Ok(())
    }
}

/// Diagnostic context captured once per call to the scheduling entry point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerInfo {
    caller_stack: CallerStack,
    owner_stack: Option<CallerStack>,
}

impl CallerInfo {
    pub fn new(caller_stack: CallerStack) -> Self {
        Self {
            caller_stack,
            owner_stack: None,
        }
    }

    /// Captures the caller's location as the caller stack.
    #[track_caller]
    pub fn capture() -> Self {
        Self::new(CallerStack::capture())
    }

    /// Attaches the trace of the logical owner of the call site, for example
    /// the handler or component that issued it.
    #[must_use]
    pub fn with_owner(mut self, owner_stack: CallerStack) -> Self {
        self.owner_stack = Some(owner_stack);
        self
    }

    pub fn caller_stack(&self) -> &CallerStack {
        &self.caller_stack
    }

    pub fn owner_stack(&self) -> Option<&CallerStack> {
        self.owner_stack.as_ref()
    }
}

/// The chain of call sites that led to one deferred task.
///
/// Root fields are shared by every task descended from the same outermost
/// call; nesting only ever prepends to `nested_caller_stacks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallerChainRecord {
    root_caller_stack: CallerStack,
    root_owner_stack: Option<CallerStack>,
    root_spawn_phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nested_caller_stacks: Option<Vec<CallerStack>>,
}

impl CallerChainRecord {
    /// Starts a chain at the outermost scheduling point.
    pub fn root(caller: CallerInfo, spawn_phase: Option<Phase>) -> Self {
        Self {
            root_caller_stack: caller.caller_stack,
            root_owner_stack: caller.owner_stack,
            root_spawn_phase: spawn_phase,
            nested_caller_stacks: None,
        }
    }

    /// Extends this chain with a call made from inside one of its tasks.
    ///
    /// The nested caller's owner stack is not kept; only the root owner is
    /// reported.
    #[must_use]
    pub fn nested(&self, caller_stack: CallerStack) -> Self {
        let mut nested = Vec::with_capacity(self.depth() + 1);
        nested.push(caller_stack);
        if let Some(outer) = &self.nested_caller_stacks {
            nested.extend(outer.iter().cloned());
        }
        Self {
            root_caller_stack: self.root_caller_stack.clone(),
            root_owner_stack: self.root_owner_stack.clone(),
            root_spawn_phase: self.root_spawn_phase,
            nested_caller_stacks: Some(nested),
        }
    }

    /// Builds the record for a new scheduling call: a root when `enclosing`
    /// is `None`, a nested extension of `enclosing` otherwise.
    pub fn for_call(
        enclosing: Option<&CallerChainRecord>,
        caller: CallerInfo,
        spawn_phase: Option<Phase>,
    ) -> Self {
        match enclosing {
            Some(outer) => outer.nested(caller.caller_stack),
            None => Self::root(caller, spawn_phase),
        }
    }

    pub fn root_caller_stack(&self) -> &CallerStack {
        &self.root_caller_stack
    }

    pub fn root_owner_stack(&self) -> Option<&CallerStack> {
        self.root_owner_stack.as_ref()
    }

    pub fn root_spawn_phase(&self) -> Option<Phase> {
        self.root_spawn_phase
    }

    /// Nested caller stacks, innermost first. `None` for a root record.
    pub fn nested_caller_stacks(&self) -> Option<&[CallerStack]> {
        self.nested_caller_stacks.as_deref()
    }

    /// Number of nested scheduling levels below the root.
    pub fn depth(&self) -> usize {
        self.nested_caller_stacks.as_ref().map_or(0, Vec::len)
    }

    pub fn is_root(&self) -> bool {
        self.nested_caller_stacks.is_none()
    }
}
