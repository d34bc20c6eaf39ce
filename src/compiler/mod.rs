//! Sequence compiler.
//!
//! Walks a parsed [`Sequence`](crate::sequence::Sequence) and emits a
//! case-numbered state machine in structured-text form: a setup case that
//! drives every actuator to rest, one case per step guarded by the sensor or
//! timer condition proving the step finished, counter branches for repeat
//! regions, a block of timer function-block calls and an address-allocated
//! tag table. The fault injector turns the rendered body into a deliberately
//! broken training variant.

/// Case builder that walks the sequence.
pub mod builder;
/// Randomised corruption of rendered programs.
pub mod faults;
/// Program intermediate representation.
pub mod ir;
/// Structured-text rendering.
pub mod render;
/// Address allocation and tag-table XML.
pub mod tag_table;

pub use builder::compile;
pub use faults::{AppliedFault, FaultInjector, FaultKind, FaultedProgram, Tier};
pub use ir::{
    BoundExpr, Case, CompiledProgram, Condition, Instruction, NextCase, Preset, TagTableEntry,
};
pub use tag_table::{TagTable, to_xml};

use thiserror::Error;

use crate::sequence::{Diagnostics, parse_sequence};
use crate::tags::{ProjectConfig, TagError};

/// Convenience result alias for compilation.
pub type CompileResult<T> = std::result::Result<T, CompileError>;

/// Errors surfaced by the compiler.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// Grammar or structural problems; the sequence must not be compiled.
    #[error(transparent)]
    Invalid(#[from] Diagnostics),

    /// The first actuation retracts an actuator that never extended.
    #[error("sequence starts by retracting {label}; actuators must start from the retracted position")]
    UnsupportedStart {
        /// Offending actuator.
        label: char,
    },

    /// Project configuration lacks components the sequence needs.
    #[error("configuration incomplete: missing {}", .missing.join(", "))]
    ConfigurationIncomplete {
        /// Labels of unconfigured components.
        missing: Vec<String>,
    },

    /// Token accepted by validation but not executable.
    #[error("pressure sensors are not supported yet: {token}")]
    UnsupportedToken {
        /// Offending token text.
        token: String,
    },

    /// Tag resolution failed.
    #[error(transparent)]
    Tag(#[from] TagError),
}

impl CompileError {
    /// Whether the caller should show start-position guidance.
    pub fn is_retraction(&self) -> bool {
        matches!(self, CompileError::UnsupportedStart { .. })
    }
}

/// Parse and compile raw sequence text.
pub fn compile_source(
    source: &str,
    config: Option<&ProjectConfig>,
) -> CompileResult<CompiledProgram> {
    let sequence = parse_sequence(source)?;
    compile(&sequence, config)
}
