//! Ember Compiler: hand-written scanner plus a single-pass Pratt parser
//! that emits bytecode directly, with no intermediate AST.
//!
//! # Modules
//!
//! - `scanner`: tokenizes raw source bytes on demand.
//! - `precedence`: the Pratt precedence ladder, low to high.
//! - `config`: the one build-time knob (the initializer method name).
//! - `diagnostics`: collected compile errors, surfaced rather than printed.
//! - `compiler`: the parser/codegen proper.

pub mod compiler;
pub mod config;
pub mod diagnostics;
pub mod precedence;
pub mod scanner;

pub use compiler::Compiler;
pub use config::CompilerConfig;
pub use diagnostics::{CompileError, Diagnostic};

use std::ptr::NonNull;

use ember_core::heap::Heap;
use ember_core::object::Obj;

/// Compiles `source` against `heap` into the implicit top-level script
/// function. Convenience wrapper around `Compiler::new(..).compile()` for
/// embedders that don't need to hold a `Compiler` value themselves.
pub fn compile(source: &[u8], heap: &Heap, config: &CompilerConfig) -> Result<NonNull<Obj>, CompileError> {
    Compiler::new(source, heap, config).compile()
}
