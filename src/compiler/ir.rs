use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::tags::TagKind;

/// Compiled state-machine program ready for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledProgram {
    /// One-time instructions driving every component to rest. Also the body of case 0.
    pub setup: Vec<Instruction>,
    /// Cases in ascending order, starting with case 0.
    pub cases: Vec<Case>,
    /// Timer function-block calls placed after the case block.
    pub components: Vec<Instruction>,
    /// Address-allocated signal table.
    pub tag_table: Vec<TagTableEntry>,
    /// Whether tag names came from a project configuration.
    pub configured: bool,
}

impl CompiledProgram {
    /// Look up a case by number.
    pub fn case(&self, number: u32) -> Option<&Case> {
        self.cases.iter().find(|case| case.number == number)
    }

    /// Tag-table entry for a signal name.
    pub fn tag(&self, name: &str) -> Option<&TagTableEntry> {
        self.tag_table.iter().find(|entry| entry.physical == name)
    }
}

/// One numbered step of the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    /// Case label, a multiple of 10.
    pub number: u32,
    /// Condition that must hold before leaving the case; `None` leaves immediately.
    pub guard: Option<Condition>,
    /// Outputs written every scan while the case is active.
    pub body: Vec<Instruction>,
    /// Outputs written once the guard holds, before jumping.
    pub on_exit: Vec<Instruction>,
    /// Where to go once the guard holds.
    pub next: NextCase,
}

impl Case {
    pub(crate) fn new(number: u32) -> Self {
        Self {
            number,
            guard: None,
            body: Vec::new(),
            on_exit: Vec::new(),
            next: NextCase::Jump(number + 10),
        }
    }
}

/// Transition out of a case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NextCase {
    /// `#NEXT := n;`
    Jump(u32),
    /// Counted loop back to `start`, otherwise continue with `otherwise`.
    Repeat {
        /// Counter tag.
        counter: String,
        /// Total passes.
        bound: BoundExpr,
        /// First case of the region.
        start: u32,
        /// Transition once the region is exhausted.
        otherwise: Box<NextCase>,
    },
    /// Unconditional loop back to `start`.
    Loop {
        /// First case of the region.
        start: u32,
    },
}

impl NextCase {
    /// Jump targets reachable from this transition.
    pub fn targets(&self) -> Vec<u32> {
        match self {
            NextCase::Jump(n) => vec![*n],
            NextCase::Loop { start } => vec![*start],
            NextCase::Repeat {
                start, otherwise, ..
            } => {
                let mut targets = vec![*start];
                targets.extend(otherwise.targets());
                targets
            }
        }
    }
}

/// Repeat bound as emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundExpr {
    /// Literal pass count.
    Literal(u32),
    /// Runtime variable plus offset.
    Runtime {
        /// Variable tag.
        variable: String,
        /// Literal offset.
        offset: u32,
    },
}

/// Conjunction of boolean signals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Signals that must all be TRUE.
    pub terms: Vec<String>,
}

impl Condition {
    /// Add a signal unless already present.
    pub fn and(&mut self, term: impl Into<String>) {
        let term = term.into();
        if !self.terms.contains(&term) {
            self.terms.push(term);
        }
    }

    /// Whether there is nothing to wait for.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// Timer preset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preset {
    /// Literal duration.
    Fixed(Duration),
    /// Runtime variable in seconds plus a literal offset.
    Runtime {
        /// Variable tag.
        variable: String,
        /// Literal offset.
        offset: Option<Duration>,
    },
}

/// Statements emitted into case bodies, setup and the component block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// Boolean assignment.
    SetBool {
        /// Target signal.
        tag: String,
        /// Assigned value.
        value: bool,
    },
    /// Integer assignment.
    SetInt {
        /// Target signal.
        tag: String,
        /// Assigned value.
        value: i64,
    },
    /// On-delay timer call.
    Timer {
        /// Function-block instance name.
        instance: String,
        /// Enable input.
        power: String,
        /// Done output.
        done: String,
        /// Elapsed-time output.
        elapsed: String,
        /// Preset time.
        preset: Preset,
    },
}

/// Addressed signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagTableEntry {
    /// Signal name.
    pub physical: String,
    /// Data type.
    pub kind: TagKind,
    /// Memory address (`%M0.0`, `%MW100`, `%MD200`).
    pub address: String,
}
