//! Shared model of the actuator sequence notation.
//!
//! A sequence such as `A+,B+,(A-,B-),[C+,C-]^3` is lexed into comma separated
//! fragments, each fragment is checked against the token grammar, and the
//! bracket structure is folded into a recursive tree of steps and repeat
//! regions. Both the compiler and the live interpreter consume the resulting
//! [`Sequence`], so region and wrap resolution happen in exactly one place.

/// Syntax tree for parsed sequences.
pub mod ast;
/// Anchored token grammar (actuations, timers, pressure thresholds, repeat specs).
pub mod grammar;
/// Component inventory and numbering derived from a sequence.
pub mod inventory;
/// Fragment lexer and input normalisation.
pub mod lexer;
/// Structural parser that checks brackets and builds the tree.
pub mod parser;
/// Validation entry point returning user-facing messages.
pub mod validator;

pub use ast::{
    Actuation, Direction, Node, PressureThreshold, RepeatBound, RepeatRegion, Sequence, Step,
    TimerDelay, Token,
};
pub use inventory::{Component, ComponentId, ComponentKind, Numbering, inventory};
pub use lexer::{Bracket, Close, Fragment, lex, normalize};
pub use parser::parse_sequence;
pub use validator::validate;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience result alias for sequence parsing.
pub type ParseResult<T> = std::result::Result<T, Diagnostics>;

/// Ordered, duplicate-free list of grammar and structural problems.
///
/// Offending fragments are recorded verbatim so callers can point users at
/// the exact text they typed; structural messages precede the fragments they
/// refer to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("invalid sequence: {}", .0.join("; "))]
pub struct Diagnostics(Vec<String>);

impl Diagnostics {
    /// Record a message unless it was already recorded.
    pub fn push(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !self.0.contains(&message) {
            self.0.push(message);
        }
    }

    /// Record a structural message followed by the fragments that violate it.
    pub fn push_structural<'a>(
        &mut self,
        message: &str,
        fragments: impl IntoIterator<Item = &'a Fragment>,
    ) {
        self.push(message);
        for fragment in fragments {
            if !fragment.text.is_empty() {
                self.push(fragment.text.clone());
            }
        }
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of recorded messages.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Borrow the messages in first-seen order.
    pub fn messages(&self) -> &[String] {
        &self.0
    }

    /// Consume into the message list.
    pub fn into_messages(self) -> Vec<String> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_suppress_duplicates_and_keep_order() {
        let mut diags = Diagnostics::default();
        diags.push("second");
        diags.push("first");
        diags.push("second");
        assert_eq!(diags.messages(), &["second".to_string(), "first".to_string()]);
    }

    #[test]
    fn diagnostics_render_as_error() {
        let mut diags = Diagnostics::default();
        diags.push("A+A-");
        diags.push("B");
        assert_eq!(diags.to_string(), "invalid sequence: A+A-; B");
    }
}
