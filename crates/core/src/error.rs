//! Shared error plumbing. Each crate boundary (`ember-compiler`,
//! `ember-vm`) defines its own richer error enum; this module holds only
//! the pieces common to both, in small hand-written error types rather
//! than a blanket `anyhow::Error`.

use std::fmt;

/// The three outcomes `interpret()` can report to an embedder, per the
/// host-embedding surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

impl fmt::Display for InterpretResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpretResult::Ok => write!(f, "ok"),
            InterpretResult::CompileError => write!(f, "compile error"),
            InterpretResult::RuntimeError => write!(f, "runtime error"),
        }
    }
}
