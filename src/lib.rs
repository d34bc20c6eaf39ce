//! seqctl – sequence notation tooling for pneumatic actuator benches
//!
//! This crate provides:
//! - A validator and structural parser for the actuator sequence notation
//!   (`A+,(B+,C+),2S,[A-,B-]^3`)
//! - A compiler that emits a case-numbered structured-text state machine and
//!   an address-allocated tag table, with optional project tag bindings
//! - A seedable fault injector producing broken variants for training
//! - A live interpreter that runs sequences on controllers over a field
//!   protocol, with a device registry and cooperative stop
//! - An NDJSON request service and command-line front end

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Compiler from parsed sequences to structured text
pub mod compiler;
/// Live execution against controllers
pub mod runtime;
/// Shared sequence grammar and structural parser
pub mod sequence;
/// Request dispatcher
pub mod service;
/// Tag naming and project configuration
pub mod tags;

// Re-export key types for convenience
pub use compiler::{CompileError, CompiledProgram, FaultInjector, Tier, compile, compile_source};
pub use runtime::{Engine, RuntimeConfig};
pub use sequence::{Diagnostics, Sequence, parse_sequence, validate};
pub use tags::ProjectConfig;

/// Current version of seqctl
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version for the request service
pub const PROTOCOL_VERSION: &str = "1.0.0";
